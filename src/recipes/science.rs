// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Science recipes: extraction, telluric correction, stellar templates and
//! radial velocities. Every input exposure is reduced on its own; the
//! products of one exposure are named after its raw basename.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use ndarray::prelude::*;
use strum::IntoEnumIterator;

use super::{
    kinds, LoadedFrame, Provenance, RecipeContext, RecipeError, RecipeInputs, RecipeKind,
    RecipeOutcome,
};
use crate::{
    calib::{thermal::subtract_thermal, wave::WaveSolution},
    ccf::{ccf_product, compute_ccf, fit_ccf, photon_noise_rv, CcfError},
    config::DrsConfig,
    extract::{
        extract_orders, flat_field, normalise_blaze,
        s1d::{make_s1d, S1dGrid},
        ExtractParams,
    },
    io::{
        header::Header,
        product::Product,
        tables::{
            read_ccf_mask, read_line_mask, read_transmission_template, TransmissionTemplate,
            WeightedLine,
        },
    },
    keywords::Keyword,
    qc::QcResult,
    telluric::{
        fit_telluric, make_template, preclean, AtmosphereInputs, StellarTemplate, TelluricPca,
        TemplateFrame,
    },
};

/// The fibre group science spectra are taken from.
fn science_fibre(config: &DrsConfig) -> &str {
    config
        .loc
        .fibre_layout
        .first()
        .map(|f| f.as_str())
        .unwrap_or("AB")
}

/// The header key holding the SNR of order `order` (counting from 0).
pub(crate) fn snr_key(order: usize) -> String {
    format!("EXTSN{:03}", order + 1)
}

/// The barycentric Earth velocity of a frame \[km/s\]. Zero when the header
/// doesn't say.
fn berv_of(config: &DrsConfig, header: &Header) -> f64 {
    match config.keywords.get_float(header, Keyword::Berv) {
        Ok(berv) => berv,
        Err(e) => {
            debug!("No BERV ({e}); assuming 0");
            0.0
        }
    }
}

/// Load the exposures of a single-role science recipe one at a time.
fn each_frame<F>(
    config: &DrsConfig,
    ctx: &RecipeContext,
    recipe: RecipeKind,
    inputs: &RecipeInputs,
    mut f: F,
) -> Result<RecipeOutcome, RecipeError>
where
    F: FnMut(LoadedFrame, Provenance) -> Result<RecipeOutcome, RecipeError>,
{
    let role = recipe.spec().inputs[0];
    let files = inputs.role(0);
    if files.is_empty() {
        return Err(RecipeError::NoInputs {
            recipe,
            role: role.name,
        });
    }
    let mut outcome = RecipeOutcome::default();
    for file in files {
        let mut prov = Provenance::new(recipe);
        let mut frames = ctx.load_role(config, recipe, role, std::slice::from_ref(file), &mut prov)?;
        let Some(frame) = frames.pop() else {
            continue;
        };
        config.check_mode(&frame.mode)?;
        outcome.merge(f(frame, prov)?);
    }
    Ok(outcome)
}

pub(super) fn extract(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    each_frame(config, ctx, RecipeKind::Extract, inputs, |frame, mut prov| {
        extract_frame(config, ctx, frame, &mut prov)
    })
}

fn extract_frame(
    config: &DrsConfig,
    ctx: &RecipeContext,
    frame: LoadedFrame,
    prov: &mut Provenance,
) -> Result<RecipeOutcome, RecipeError> {
    let (mode, mjd) = (frame.mode.as_str(), frame.mjd);
    let mut image = frame.image;
    ctx.calibrate(&mut image, mode, mjd, frame.exptime, prov)?;
    let image = ctx.straighten(image.view(), mode, mjd, prov)?;
    let locs = ctx.loc_models(config, mode, mjd, prov)?;
    let params = ExtractParams::from_config(config);

    let mut outcome = RecipeOutcome::default();
    for loc in &locs {
        let fibre = &loc.fibre;
        let extraction = extract_orders(image.view(), loc, &params);
        let mut e2ds = extraction.e2ds.clone();
        let shape = e2ds.dim();
        let qc = extraction.qc(config.detector.saturation);

        if config.thermal.enabled {
            match ctx.fetch_optional(&kinds::thermal(fibre), mode, mjd, prov)? {
                Some(thermal) => subtract_thermal(&mut e2ds, thermal.image(shape)?, frame.exptime),
                None => warn!("No thermal background for fibre {fibre}; not subtracted"),
            }
        }
        let flat = ctx.fetch(&kinds::flat(fibre), mode, mjd, prov)?;
        let blaze = ctx.fetch(&kinds::blaze(fibre), mode, mjd, prov)?;
        let wave_calib = ctx.fetch(&kinds::wave(fibre), mode, mjd, prov)?;
        let wave = wave_calib.parse(WaveSolution::from_product)?.wave_map();
        if wave.dim() != shape {
            return Err(wave_calib.malformed(format!(
                "covers {:?} orders and pixels, the extraction {shape:?}",
                wave.dim()
            )));
        }

        let mut header = prov.header(&frame.header);
        qc.write_header(&mut header);
        header.set("FIBER", fibre.as_str());
        header.set("EXTNCOS", extraction.n_cosmics);
        for (order, snr) in extraction.snr.iter().enumerate() {
            header.set(&snr_key(order), *snr);
        }
        info!(
            "{} fibre {fibre}: {} orders, {} cosmics, median SNR {:.1}",
            frame.basename,
            shape.0,
            extraction.n_cosmics,
            crate::math::nanmedian(&extraction.snr)
        );

        let name = format!("{}_pp_e2ds_{fibre}.fits", frame.basename);
        outcome
            .outputs
            .push(ctx.write_product(&Product::new(e2ds.clone(), header.clone()), &name)?);

        let flat_image = if config.extract.use_flat {
            Some(flat.image(shape)?)
        } else {
            None
        };
        let blaze_image = blaze.image(shape)?;
        let e2dsff = flat_field(e2ds.view(), flat_image, blaze_image);
        let blaze_norm = normalise_blaze(blaze_image);
        for grid in S1dGrid::iter() {
            let s1d = make_s1d(e2dsff.view(), wave.view(), blaze_norm.view(), grid, &config.s1d);
            let name = format!("{}_pp_s1d_{grid}_{fibre}.fits", frame.basename);
            outcome
                .outputs
                .push(ctx.write_product(&s1d.to_product(header.clone()), &name)?);
        }
        let product = Product::new(e2dsff, header)
            .with_extension("WAVE", wave)
            .with_extension("BLAZE", blaze_norm);
        let name = format!("{}_pp_e2dsff_{fibre}.fits", frame.basename);
        outcome.outputs.push(ctx.write_product(&product, &name)?);
        outcome.qc.merge(qc);
    }
    Ok(outcome)
}

/// An extracted, flat-fielded spectrum read back from disk.
struct Spectrum {
    path: PathBuf,
    product: Product,
    wave: Array2<f64>,
    blaze: Array2<f64>,
    snr: Vec<f64>,
}

impl Spectrum {
    fn read(path: &Path, needs: RecipeKind) -> Result<Spectrum, RecipeError> {
        if !path.exists() {
            return Err(RecipeError::MissingProduct {
                what: "Extracted spectrum",
                path: path.to_path_buf(),
                needs,
            });
        }
        let product = Product::read_all(path)?;
        let malformed = |message: &str| RecipeError::BadCalibration {
            kind: "E2DSFF".to_string(),
            file: path.to_path_buf(),
            message: message.to_string(),
        };
        let wave = product
            .extension("WAVE")
            .ok_or_else(|| malformed("no WAVE extension"))?
            .clone();
        let blaze = product
            .extension("BLAZE")
            .ok_or_else(|| malformed("no BLAZE extension"))?
            .clone();
        if wave.dim() != product.image.dim() || blaze.dim() != product.image.dim() {
            return Err(malformed("extensions don't match the spectrum"));
        }
        let snr = (0..product.image.nrows())
            .map(|order| {
                product
                    .header
                    .get_float_opt(&snr_key(order))
                    .ok()
                    .flatten()
                    .unwrap_or(f64::NAN)
            })
            .collect();
        Ok(Spectrum {
            path: path.to_path_buf(),
            product,
            wave,
            blaze,
            snr,
        })
    }
}

/// The atmospheric model inputs shared by both telluric recipes.
struct AtmosphereTables {
    template: TransmissionTemplate,
    water: Vec<WeightedLine>,
    dry: Vec<WeightedLine>,
}

impl AtmosphereTables {
    fn read(config: &DrsConfig) -> Result<AtmosphereTables, RecipeError> {
        let paths = &config.paths;
        Ok(AtmosphereTables {
            template: read_transmission_template(&paths.asset(&config.telluric.template))?,
            water: read_line_mask(&paths.asset(&config.telluric.water_mask))?,
            dry: read_line_mask(&paths.asset(&config.telluric.dry_mask))?,
        })
    }

    fn inputs(&self) -> AtmosphereInputs<'_> {
        AtmosphereInputs {
            template: &self.template,
            water_mask: &self.water,
            dry_mask: &self.dry,
        }
    }
}

pub(super) fn mk_tellu(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    if !config.telluric.enabled {
        info!("Telluric correction is disabled; nothing to do");
        return Ok(RecipeOutcome::default());
    }
    let tables = AtmosphereTables::read(config)?;
    let fibre = science_fibre(config);
    each_frame(config, ctx, RecipeKind::MkTellu, inputs, |frame, prov| {
        let path = ctx.product_path(&format!("{}_pp_e2dsff_{fibre}.fits", frame.basename));
        let spectrum = Spectrum::read(&path, RecipeKind::Extract)?;
        let pre = preclean(
            spectrum.product.image.view(),
            spectrum.wave.view(),
            &spectrum.snr,
            &tables.template,
            &tables.water,
            &tables.dry,
            &config.telluric.hot_star_bounds,
            None,
            &config.telluric,
        )?;
        info!(
            "{}: water exponent {:.3}, others {:.3} after {} iterations",
            frame.basename, pre.expo_water, pre.expo_others, pre.iterations
        );

        let mut header = prov.header(&spectrum.product.header);
        pre.write_header(&mut header);
        pre.qc.write_header(&mut header);
        let product = Product::new(pre.transmission, header).with_extension("WAVE", spectrum.wave);
        let name = format!("{}_pp_tellu_trans_{fibre}.fits", frame.basename);
        let out = ctx.write_product(&product, &name)?;

        let mut outcome = RecipeOutcome::default();
        if pre.qc.passed() {
            let entry = ctx.publish(&ctx.telludb, kinds::TELL_MAP, &frame.mode, frame.mjd, &out)?;
            outcome.published.push(entry);
        } else {
            warn!(
                "{name} failed quality control ({}); not added to the telluric database",
                pre.qc.failed_names().join(", ")
            );
        }
        outcome.outputs.push(out);
        outcome.qc = pre.qc;
        Ok(outcome)
    })
}

pub(super) fn fit_tellu(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    if !config.telluric.enabled {
        info!("Telluric correction is disabled; nothing to do");
        return Ok(RecipeOutcome::default());
    }
    let tables = AtmosphereTables::read(config)?;
    let fibre = science_fibre(config);
    each_frame(config, ctx, RecipeKind::FitTellu, inputs, |frame, mut prov| {
        let path = ctx.product_path(&format!("{}_pp_e2dsff_{fibre}.fits", frame.basename));
        let spectrum = Spectrum::read(&path, RecipeKind::Extract)?;

        let maps: Vec<Array2<f64>> = ctx
            .transmission_maps(&frame.mode)?
            .into_iter()
            .map(|(_, p)| p.image)
            .collect();
        let pca = if maps.is_empty() {
            None
        } else {
            match TelluricPca::new(&maps, config.telluric.n_components, config.telluric.fit_derivatives) {
                Ok(pca) => Some(pca),
                Err(e) => {
                    warn!("Ignoring the telluric maps: {e}");
                    None
                }
            }
        };
        debug!("{} transmission maps for mode {}", maps.len(), frame.mode);

        let stellar = match ctx.stellar_template(&frame.object, &frame.mode, frame.mjd, &mut prov)? {
            Some(calib) => {
                let template = calib.parse(StellarTemplate::from_product)?;
                let berv = berv_of(config, &spectrum.product.header);
                match template.on_grid(spectrum.wave.view(), berv) {
                    Ok(on_grid) => Some(on_grid),
                    Err(e) => {
                        warn!("Not using the template of {}: {e}", frame.object);
                        None
                    }
                }
            }
            None => None,
        };

        let fit = fit_telluric(
            spectrum.product.image.view(),
            spectrum.wave.view(),
            &spectrum.snr,
            pca.as_ref(),
            stellar.as_ref().map(|s| s.view()),
            tables.inputs(),
            &config.telluric,
        )?;
        info!(
            "{}: corrected with {}{}",
            frame.basename,
            if fit.used_pca {
                format!("{} principal components", fit.amplitudes.len())
            } else {
                "the atmospheric model".to_string()
            },
            if fit.used_template {
                " and the stellar template"
            } else {
                ""
            }
        );

        let mut header = prov.header(&spectrum.product.header);
        header.set("TLFNMAP", maps.len());
        fit.write_header(&mut header);
        fit.qc.write_header(&mut header);

        let mut outcome = RecipeOutcome::default();
        let tcorr = Product::new(fit.corrected, header.clone())
            .with_extension("WAVE", spectrum.wave.clone())
            .with_extension("BLAZE", spectrum.blaze);
        let name = format!("{}_pp_tcorr_{fibre}.fits", frame.basename);
        outcome.outputs.push(ctx.write_product(&tcorr, &name)?);
        let recon = Product::new(fit.recon, header).with_extension("WAVE", spectrum.wave);
        let name = format!("{}_pp_recon_{fibre}.fits", frame.basename);
        outcome.outputs.push(ctx.write_product(&recon, &name)?);
        outcome.qc = fit.qc;
        Ok(outcome)
    })
}

/// Combine the telluric-corrected spectra of one object into its template
/// and add it to the telluric database.
pub(super) fn mk_template(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    if !config.telluric.enabled {
        info!("Telluric correction is disabled; nothing to do");
        return Ok(RecipeOutcome::default());
    }
    let recipe = RecipeKind::MkTemplate;
    let fibre = science_fibre(config);
    let mut prov = Provenance::new(recipe);
    let frames = ctx.load_role(config, recipe, recipe.spec().inputs[0], inputs.role(0), &mut prov)?;
    let Some(first) = frames.first() else {
        return Err(RecipeError::NoInputs {
            recipe,
            role: "files",
        });
    };
    config.check_mode(&first.mode)?;
    let object = kinds::sanitise_object(&first.object);

    let mut spectra = vec![];
    for frame in &frames {
        if kinds::sanitise_object(&frame.object) != object {
            warn!(
                "{} is of {}, not {}; left out of the template",
                frame.basename, frame.object, first.object
            );
            continue;
        }
        let path = ctx.product_path(&format!("{}_pp_tcorr_{fibre}.fits", frame.basename));
        if !path.exists() {
            warn!("{} has no telluric-corrected spectrum; left out of the template", frame.basename);
            continue;
        }
        let spectrum = Spectrum::read(&path, RecipeKind::FitTellu)?;
        let berv = berv_of(config, &spectrum.product.header);
        spectra.push((spectrum, berv, frame.mjd));
    }
    if spectra.is_empty() {
        return Err(RecipeError::MissingProduct {
            what: "Telluric-corrected spectrum",
            path: ctx.product_path(&format!("{}_pp_tcorr_{fibre}.fits", first.basename)),
            needs: RecipeKind::FitTellu,
        });
    }

    let template_frames: Vec<TemplateFrame> = spectra
        .iter()
        .map(|(s, berv, _)| TemplateFrame {
            flux: s.product.image.view(),
            wave: s.wave.view(),
            berv: *berv,
        })
        .collect();
    let template = make_template(&template_frames)?;
    let mjd = spectra.iter().map(|s| s.2).fold(f64::NEG_INFINITY, f64::max);
    let mut qc = QcResult::new();
    qc.check_min(
        "TEMPLATE_NFRAMES",
        template.n_frames as f64,
        config.telluric.template_min_frames as f64,
    );
    info!("{}: template from {} spectra", first.object, template.n_frames);

    let mut header = prov.header(&first.header);
    qc.write_header(&mut header);
    let name = format!("{}_{object}_template_{fibre}.fits", ctx.night);
    let out = ctx.write_product(&template.to_product(header), &name)?;

    let mut outcome = RecipeOutcome::default();
    if qc.passed() {
        let entry = ctx.publish(&ctx.telludb, &kinds::template(&object), &first.mode, mjd, &out)?;
        outcome.published.push(entry);
    } else {
        warn!(
            "{name} failed quality control ({}); not added to the telluric database",
            qc.failed_names().join(", ")
        );
    }
    outcome.outputs.push(out);
    outcome.qc = qc;
    Ok(outcome)
}

pub(super) fn ccf(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    let mask_path = config.paths.asset(&config.ccf.mask);
    let mask = read_ccf_mask(&mask_path)?;
    let mask_name = mask_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mask".to_string());
    let fibre = science_fibre(config);

    each_frame(config, ctx, RecipeKind::Ccf, inputs, |frame, prov| {
        let tcorr = ctx.product_path(&format!("{}_pp_tcorr_{fibre}.fits", frame.basename));
        let path = if config.telluric.enabled && tcorr.exists() {
            tcorr
        } else {
            if config.telluric.enabled {
                warn!(
                    "{} has no telluric-corrected spectrum; using the uncorrected one",
                    frame.basename
                );
            }
            ctx.product_path(&format!("{}_pp_e2dsff_{fibre}.fits", frame.basename))
        };
        let spectrum = Spectrum::read(&path, RecipeKind::Extract)?;
        debug!("Cross-correlating {}", spectrum.path.display());

        let image = spectrum.product.image.view();
        let ccf = compute_ccf(image, spectrum.wave.view(), spectrum.blaze.view(), &mask, &config.ccf)?;
        let mut qc = QcResult::new();
        let fit = match fit_ccf(&ccf, &config.ccf) {
            Ok(fit) => {
                qc.check("CCFCONV", 1.0, "== 1", true);
                Some(fit)
            }
            Err(CcfError::NotConverged { reason, at_edge }) => {
                warn!("{}: the CCF fit didn't converge: {reason}", frame.basename);
                if at_edge {
                    qc.check("CCF_EDGE", 1.0, "== 0", false);
                } else {
                    qc.check("CCFCONV", 0.0, "== 1", false);
                }
                None
            }
            Err(e) => return Err(e.into()),
        };
        let counts = &image * &spectrum.blaze;
        let dvrms = photon_noise_rv(
            counts.view(),
            spectrum.wave.view(),
            config.detector.read_noise,
            config.ccf.n_ord_max,
        );
        if let Some(fit) = &fit {
            info!(
                "{}: RV {:.4} km/s, contrast {:.3}, FWHM {:.3} km/s, photon noise {:.2} m/s",
                frame.basename, fit.rv, fit.contrast, fit.fwhm, dvrms
            );
        }

        let mut header: Header = prov.header(&spectrum.product.header);
        header.set("CCFMASK", mask_name.as_str());
        qc.write_header(&mut header);
        let product = ccf_product(&ccf, fit.as_ref(), dvrms, header);
        let name = format!("{}_pp_ccf_{mask_name}_{fibre}.fits", frame.basename);

        let mut outcome = RecipeOutcome::default();
        outcome.outputs.push(ctx.write_product(&product, &name)?);
        outcome.qc = qc;
        Ok(outcome)
    })
}
