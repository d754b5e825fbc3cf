// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The calibration chain: preprocessing, then dark, bad pixels, order
//! localisation, slit shape, flat and blaze, thermal background, wavelength
//! solutions and FP drifts.

use log::{debug, info, warn};
use ndarray::prelude::*;

use super::{
    context::{stack_frames, Stack},
    kinds, Provenance, RecipeContext, RecipeError, RecipeInputs, RecipeKind, RecipeOutcome,
};
use crate::{
    calib::{
        badpix::make_badpix,
        dark::make_dark,
        drift::measure_drift,
        flat::make_flat,
        loc::localise,
        shape::measure_shape,
        thermal::make_thermal,
        wave::{solve_wave, FpReference, WaveSolution},
    },
    config::DrsConfig,
    extract::{extract_orders, ExtractParams},
    io::{
        header::Header,
        product::{mask_to_image, Product},
        tables::{read_hc_catalogue, read_initial_wave},
    },
    math::{nanmax, nanmedian_iter, nanmin, nanstd},
    qc::QcResult,
};

/// Write a calibration product and publish it under `kind` if its quality
/// control passed.
fn write_calibration(
    ctx: &RecipeContext,
    outcome: &mut RecipeOutcome,
    product: &Product,
    name: &str,
    kind: &str,
    stack: &Stack,
    qc: &QcResult,
) -> Result<(), RecipeError> {
    let path = ctx.write_product(product, name)?;
    if qc.passed() {
        let entry = ctx.publish(&ctx.calibdb, kind, &stack.mode, stack.mjd, &path)?;
        outcome.published.push(entry);
    } else {
        warn!(
            "{name} failed quality control ({}); {kind} not published",
            qc.failed_names().join(", ")
        );
    }
    outcome.outputs.push(path);
    Ok(())
}

/// The header of a product made from `stack`.
fn product_header(stack: &Stack, prov: &Provenance, qc: &QcResult) -> Header {
    let mut header = prov.header(&stack.header);
    qc.write_header(&mut header);
    header
}

pub(super) fn preprocess(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    let files = inputs.role(0);
    if files.is_empty() {
        return Err(RecipeError::NoInputs {
            recipe: RecipeKind::Preprocess,
            role: "files",
        });
    }
    let mut outcome = RecipeOutcome::default();
    for input in files {
        let raw = ctx.store.resolve_input(&ctx.night, input)?;
        let (path, prepped) = ctx.preprocess_raw(config, &raw)?;
        info!(
            "{} is {}: {} hot pixels, {:.2}% NaN",
            path.display(),
            prepped.dprtype,
            prepped.hot_pixels.n_flagged,
            prepped.nan_fraction * 100.0
        );
        outcome.outputs.push(path);
        outcome.qc.merge(prepped.qc);
    }
    Ok(outcome)
}

pub(super) fn dark(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    let spec = RecipeKind::Dark.spec();
    let mut prov = Provenance::new(RecipeKind::Dark);
    let frames = ctx.load_role(config, spec.kind, spec.inputs[0], inputs.role(0), &mut prov)?;
    let stack = stack_frames(&frames)?;
    config.check_mode(&stack.mode)?;

    let (dark, stats) = make_dark(stack.image.view(), stack.exptime);
    info!(
        "Dark from {} frames: median {:.4} ADU/s, {:.2}% dead",
        frames.len(),
        stats.median,
        stats.dead_fraction * 100.0
    );
    let qc = stats.qc(&config.dark);
    let mut header = product_header(&stack, &prov, &qc);
    stats.write_header(&mut header);

    let mut outcome = RecipeOutcome::default();
    let product = Product::new(dark, header);
    let name = format!("{}_pp_dark.fits", stack.first);
    write_calibration(ctx, &mut outcome, &product, &name, kinds::DARK, &stack, &qc)?;
    outcome.qc = qc;
    Ok(outcome)
}

pub(super) fn badpix(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    let spec = RecipeKind::Badpix.spec();
    let mut prov = Provenance::new(RecipeKind::Badpix);
    let flats = ctx.load_role(config, spec.kind, spec.inputs[0], inputs.role(0), &mut prov)?;
    let stack = stack_frames(&flats)?;
    config.check_mode(&stack.mode)?;
    let shape = stack.image.dim();

    // Without darks of its own, the recipe uses the published dark.
    let dark = if inputs.role(1).is_empty() {
        debug!("No darks given; using the dark calibration");
        ctx.fetch(kinds::DARK, &stack.mode, stack.mjd, &mut prov)?
            .image(shape)?
            .to_owned()
    } else {
        let darks = ctx.load_role(config, spec.kind, spec.inputs[1], inputs.role(1), &mut prov)?;
        let dark_stack = stack_frames(&darks)?;
        if dark_stack.image.dim() != shape {
            return Err(RecipeError::StackShape {
                first: shape,
                other: dark_stack.image.dim(),
            });
        }
        make_dark(dark_stack.image.view(), dark_stack.exptime).0
    };

    let maps = make_badpix(stack.image.view(), dark.view(), &config.badpix);
    info!(
        "{:.3}% of pixels are bad, {:.1}% unilluminated",
        maps.stats.bad * 100.0,
        maps.stats.unilluminated * 100.0
    );
    let qc = maps.stats.qc(&config.badpix);
    let mut header = product_header(&stack, &prov, &qc);
    maps.stats.write_header(&mut header);

    let mut outcome = RecipeOutcome::default();
    let badpix = Product::new(mask_to_image(maps.badpix.view()), header.clone());
    let name = format!("{}_pp_badpix.fits", stack.first);
    write_calibration(ctx, &mut outcome, &badpix, &name, kinds::BADPIX, &stack, &qc)?;
    let bmap = Product::new(mask_to_image(maps.background.view()), header);
    let name = format!("{}_pp_bmap.fits", stack.first);
    write_calibration(ctx, &mut outcome, &bmap, &name, kinds::BKGRD_MAP, &stack, &qc)?;
    outcome.qc = qc;
    Ok(outcome)
}

pub(super) fn loc(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    let spec = RecipeKind::Loc.spec();
    let mut prov = Provenance::new(RecipeKind::Loc);
    let frames = ctx.load_role(config, spec.kind, spec.inputs[0], inputs.role(0), &mut prov)?;
    let mut stack = stack_frames(&frames)?;
    config.check_mode(&stack.mode)?;
    let badpix = ctx.calibrate(&mut stack.image, &stack.mode, stack.mjd, stack.exptime, &mut prov)?;

    let loc = localise(
        stack.image.view(),
        Some(badpix.view()),
        &config.detector,
        &config.loc,
    )?;
    info!(
        "Localised {} fibre groups ({}), {} points clipped, {} orders dropped, worst RMS {:.3} pixels",
        loc.models.len(),
        loc.models
            .iter()
            .map(|m| format!("{}: {} orders", m.fibre, m.n_orders()))
            .collect::<Vec<_>>()
            .join(", "),
        loc.n_removed,
        loc.n_dropped_orders,
        loc.max_rms
    );

    let mut outcome = RecipeOutcome::default();
    let header = product_header(&stack, &prov, &loc.qc);
    for model in &loc.models {
        let product = model.to_product(header.clone());
        let name = format!("{}_pp_loco_{}.fits", stack.first, model.fibre);
        let kind = kinds::loc(&model.fibre);
        write_calibration(ctx, &mut outcome, &product, &name, &kind, &stack, &loc.qc)?;
    }
    outcome.qc = loc.qc;
    Ok(outcome)
}

pub(super) fn shape(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    let spec = RecipeKind::Shape.spec();
    let mut prov = Provenance::new(RecipeKind::Shape);
    let fps = ctx.load_role(config, spec.kind, spec.inputs[0], inputs.role(0), &mut prov)?;
    // The HC exposures only vouch for the lamp sequence; the shape comes
    // from the FP alone.
    if !inputs.role(1).is_empty() {
        ctx.load_role(config, spec.kind, spec.inputs[1], inputs.role(1), &mut prov)?;
    }
    let mut stack = stack_frames(&fps)?;
    config.check_mode(&stack.mode)?;
    ctx.calibrate(&mut stack.image, &stack.mode, stack.mjd, stack.exptime, &mut prov)?;
    let locs = ctx.loc_models(config, &stack.mode, stack.mjd, &mut prov)?;

    let (map, qc) = measure_shape(stack.image.view(), &locs, &config.shape)?;
    info!("Measured the slit shape of {} traces", map.slopes.nrows());

    let mut outcome = RecipeOutcome::default();
    let product = map.to_product(product_header(&stack, &prov, &qc));
    let name = format!("{}_pp_shape.fits", stack.first);
    write_calibration(ctx, &mut outcome, &product, &name, kinds::SHAPE, &stack, &qc)?;
    outcome.qc = qc;
    Ok(outcome)
}

/// Stack frames, then dark-correct and straighten the result.
fn straightened_stack(
    config: &DrsConfig,
    ctx: &RecipeContext,
    recipe: RecipeKind,
    role: usize,
    inputs: &RecipeInputs,
    prov: &mut Provenance,
) -> Result<Stack, RecipeError> {
    let spec = recipe.spec();
    let frames = ctx.load_role(config, recipe, spec.inputs[role], inputs.role(role), prov)?;
    let mut stack = stack_frames(&frames)?;
    config.check_mode(&stack.mode)?;
    ctx.calibrate(&mut stack.image, &stack.mode, stack.mjd, stack.exptime, prov)?;
    stack.image = ctx.straighten(stack.image.view(), &stack.mode, stack.mjd, prov)?;
    Ok(stack)
}

pub(super) fn flat(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    let mut prov = Provenance::new(RecipeKind::Flat);
    let stack = straightened_stack(config, ctx, RecipeKind::Flat, 0, inputs, &mut prov)?;
    let locs = ctx.loc_models(config, &stack.mode, stack.mjd, &mut prov)?;
    let params = ExtractParams::from_config(config);

    let mut outcome = RecipeOutcome::default();
    for loc in &locs {
        let extraction = extract_orders(stack.image.view(), loc, &params);
        let mut qc = extraction.qc(config.detector.saturation);
        let fb = make_flat(extraction.e2ds.view(), &config.flat)?;
        qc.merge(fb.qc);
        let worst = fb.rms.iter().copied().filter(|r| r.is_finite()).fold(0.0, f64::max);
        info!(
            "Fibre {}: blaze fitted in {} orders, worst flat RMS {worst:.4}",
            loc.fibre,
            fb.rms.iter().filter(|r| r.is_finite()).count()
        );

        let header = product_header(&stack, &prov, &qc);
        let flat = Product::new(fb.flat, header.clone()).with_vector("RMS", &fb.rms);
        let name = format!("{}_pp_flat_{}.fits", stack.first, loc.fibre);
        write_calibration(ctx, &mut outcome, &flat, &name, &kinds::flat(&loc.fibre), &stack, &qc)?;
        let blaze = Product::new(fb.blaze, header);
        let name = format!("{}_pp_blaze_{}.fits", stack.first, loc.fibre);
        write_calibration(ctx, &mut outcome, &blaze, &name, &kinds::blaze(&loc.fibre), &stack, &qc)?;
        outcome.qc.merge(qc);
    }
    Ok(outcome)
}

pub(super) fn thermal(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    let mut prov = Provenance::new(RecipeKind::Thermal);
    let stack = straightened_stack(config, ctx, RecipeKind::Thermal, 0, inputs, &mut prov)?;
    let locs = ctx.loc_models(config, &stack.mode, stack.mjd, &mut prov)?;
    let params = ExtractParams::from_config(config);

    let mut outcome = RecipeOutcome::default();
    for loc in &locs {
        let thermal = make_thermal(stack.image.view(), stack.exptime, loc, &params);
        let n_finite = thermal.iter().filter(|v| v.is_finite()).count();
        let mut qc = QcResult::new();
        qc.check("THERMFIN", n_finite as f64, "> 0", n_finite > 0);
        debug!(
            "Fibre {}: median thermal {:.4} ADU/s",
            loc.fibre,
            nanmedian_iter(thermal.iter().copied())
        );

        let product = Product::new(thermal, product_header(&stack, &prov, &qc));
        let name = format!("{}_pp_thermal_{}.fits", stack.first, loc.fibre);
        write_calibration(ctx, &mut outcome, &product, &name, &kinds::thermal(&loc.fibre), &stack, &qc)?;
        outcome.qc.merge(qc);
    }
    Ok(outcome)
}

pub(super) fn wave_master(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    wavelength_solution(config, ctx, inputs, RecipeKind::WaveMaster)
}

pub(super) fn wave(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    wavelength_solution(config, ctx, inputs, RecipeKind::Wave)
}

/// A master solution numbers the FP peaks itself and publishes them as the
/// reference FP; a nightly solution numbers them from that reference.
fn wavelength_solution(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
    recipe: RecipeKind,
) -> Result<RecipeOutcome, RecipeError> {
    let master = recipe == RecipeKind::WaveMaster;
    let mut prov = Provenance::new(recipe);
    let mut hc = straightened_stack(config, ctx, recipe, 0, inputs, &mut prov)?;
    let fp = straightened_stack(config, ctx, recipe, 1, inputs, &mut prov)?;
    if fp.image.dim() != hc.image.dim() {
        return Err(RecipeError::StackShape {
            first: hc.image.dim(),
            other: fp.image.dim(),
        });
    }
    // The solution is dated by the later of the two sequences.
    hc.mjd = hc.mjd.max(fp.mjd);
    let (mode, mjd) = (hc.mode.clone(), hc.mjd);

    let locs = ctx.loc_models(config, &mode, mjd, &mut prov)?;
    let params = ExtractParams::from_config(config);
    let catalogue = read_hc_catalogue(&config.paths.asset(&config.wave.hc_catalogue))?;
    let mut initial = None;

    let mut outcome = RecipeOutcome::default();
    for loc in &locs {
        let fibre = &loc.fibre;
        let flat_calib = ctx.fetch(&kinds::flat(fibre), &mode, mjd, &mut prov)?;
        ctx.fetch(&kinds::blaze(fibre), &mode, mjd, &mut prov)?;
        let hc_e2ds = extract_orders(hc.image.view(), loc, &params).e2ds;
        let fp_e2ds = extract_orders(fp.image.view(), loc, &params).e2ds;
        let flat = flat_calib.image(hc_e2ds.dim())?;
        let hc_e2ds = &hc_e2ds / &flat;
        let fp_e2ds = &fp_e2ds / &flat;

        let nx = hc_e2ds.ncols();
        let prior = match ctx.fetch_optional(&kinds::wave(fibre), &mode, mjd, &mut prov)? {
            Some(previous) => {
                debug!("Fibre {fibre}: starting from {}", previous.path.display());
                previous.parse(WaveSolution::from_product)?
            }
            None => {
                if initial.is_none() {
                    initial = Some(read_initial_wave(
                        &config.paths.asset(&config.wave.initial_solution),
                    )?);
                }
                let initial = initial.as_deref().unwrap_or_default();
                debug!("Fibre {fibre}: starting from the instrument's initial solution");
                WaveSolution::from_initial(initial, fibre, nx)?
            }
        };
        let reference = if master {
            None
        } else {
            let calib = ctx.fetch(&kinds::fp_ref(fibre), &mode, mjd, &mut prov)?;
            debug!("Fibre {fibre}: numbering FP peaks from {}", calib.path.display());
            Some(calib.parse(FpReference::from_product)?)
        };

        let result = solve_wave(
            hc_e2ds.view(),
            fp_e2ds.view(),
            &prior,
            &catalogue,
            reference.as_ref(),
            &config.wave,
        )?;
        info!(
            "Fibre {fibre}: {} HC lines and {} FP peaks, RMS {:.2} m/s, FP drift {:.2} m/s",
            result.stats.n_hc_lines, result.stats.n_fp_lines, result.stats.rms, result.stats.drift_mean
        );
        let mut header = product_header(&hc, &prov, &result.qc);
        result.stats.write_header(&mut header);
        let product = result.solution.to_product(header.clone());
        let name = format!("{}_pp_wave_{fibre}.fits", hc.first);
        write_calibration(ctx, &mut outcome, &product, &name, &kinds::wave(fibre), &hc, &result.qc)?;
        if master {
            let product = result.fp_lines.to_product(fp_e2ds, header);
            let name = format!("{}_pp_fpref_{fibre}.fits", hc.first);
            write_calibration(ctx, &mut outcome, &product, &name, &kinds::fp_ref(fibre), &hc, &result.qc)?;
        }
        outcome.qc.merge(result.qc);
    }
    Ok(outcome)
}

/// Every FP exposure is measured on its own against the reference FP. The
/// product holds the drift of every order of every exposure, and a table of
/// `(MJD, drift, uncertainty, cosmics)` per exposure.
pub(super) fn drift(
    config: &DrsConfig,
    ctx: &RecipeContext,
    inputs: &RecipeInputs,
) -> Result<RecipeOutcome, RecipeError> {
    let files = inputs.role(0);
    let mut prov = Provenance::new(RecipeKind::Drift);
    let stacks = files
        .iter()
        .map(|file| {
            let one = RecipeInputs::single(vec![file.clone()]);
            straightened_stack(config, ctx, RecipeKind::Drift, 0, &one, &mut prov)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let Some(first) = stacks.first() else {
        return Err(RecipeError::NoInputs {
            recipe: RecipeKind::Drift,
            role: "files",
        });
    };
    let (mode, mjd) = (first.mode.clone(), first.mjd);
    let locs = ctx.loc_models(config, &mode, mjd, &mut prov)?;
    let params = ExtractParams::from_config(config);

    let mut outcome = RecipeOutcome::default();
    for loc in &locs {
        let fibre = &loc.fibre;
        let flat_calib = ctx.fetch(&kinds::flat(fibre), &mode, mjd, &mut prov)?;
        ctx.fetch(&kinds::blaze(fibre), &mode, mjd, &mut prov)?;
        let wave_calib = ctx.fetch(&kinds::wave(fibre), &mode, mjd, &mut prov)?;
        let wave = wave_calib.parse(WaveSolution::from_product)?.wave_map();
        let reference = ctx.fetch(&kinds::fp_ref(fibre), &mode, mjd, &mut prov)?;

        let mut per_order = Array2::from_elem((stacks.len(), wave.nrows()), f64::NAN);
        let mut table = Array2::from_elem((stacks.len(), 4), f64::NAN);
        let mut qc = QcResult::new();
        for (i, stack) in stacks.iter().enumerate() {
            let e2ds = extract_orders(stack.image.view(), loc, &params).e2ds;
            let shape = e2ds.dim();
            if wave.dim() != shape {
                return Err(wave_calib.malformed(format!(
                    "covers {:?} orders and pixels, the extraction {shape:?}",
                    wave.dim()
                )));
            }
            let e2ds = &e2ds / &flat_calib.image(shape)?;
            let m = measure_drift(reference.image(shape)?, e2ds.view(), wave.view(), &config.drift);
            info!(
                "{} fibre {fibre}: drift {:.2} ± {:.2} m/s, {} cosmics",
                stack.first, m.mean, m.error, m.n_cosmics
            );
            per_order.row_mut(i).assign(&Array1::from(m.per_order));
            table
                .row_mut(i)
                .assign(&array![stack.mjd, m.mean, m.error, m.n_cosmics as f64]);
            qc.merge(m.qc);
        }

        let means: Vec<f64> = table.column(1).to_vec();
        let ptp = nanmax(&means) - nanmin(&means);
        let rms = nanstd(&means);
        info!("Fibre {fibre}: drift peak-to-peak {ptp:.2} m/s, RMS {rms:.2} m/s");
        let mut header = product_header(first, &prov, &qc);
        header.set("DRIFTNF", stacks.len());
        header.set("DRIFTPTP", ptp);
        header.set("DRIFTRMS", rms);
        let product = Product::new(per_order, header).with_extension("DRIFTS", table);
        let name = format!("{}_pp_drift_{fibre}.fits", first.first);
        outcome.outputs.push(ctx.write_product(&product, &name)?);
        outcome.qc.merge(qc);
    }
    Ok(outcome)
}
