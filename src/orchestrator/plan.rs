// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Turning a night of raw frames into work items and their dependencies.

use std::{collections::HashMap, path::PathBuf};

use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, info, warn};

use super::dag::{levels, DagError};
use crate::{
    config::DrsConfig,
    dprtype::DprType,
    io::store::{NightIndex, RawFrame},
    recipes::{kinds, RecipeInputs, RecipeKind},
    sequence::{classify, Sequence},
};

/// One invocation of a recipe.
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub(crate) id: String,
    pub(crate) recipe: RecipeKind,
    pub(crate) inputs: RecipeInputs,
    /// The preprocess item of each input frame.
    pub(crate) frame_deps: Vec<(usize, PathBuf)>,
    /// Items whose products this one reads directly. If any of them left
    /// nothing behind, this item is skipped.
    pub(crate) requires: Vec<usize>,
    /// Items that only need to finish first.
    pub(crate) after: Vec<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub(crate) items: Vec<WorkItem>,
    /// Every item of a level only depends on items of earlier levels.
    pub(crate) levels: Vec<Vec<usize>>,
}

impl Plan {
    /// Without a reference FP in the database, the night's first HC/FP pair
    /// makes a master wavelength solution and the others are measured
    /// against it.
    pub(crate) fn build(
        config: &DrsConfig,
        index: &NightIndex,
        has_fp_reference: bool,
    ) -> Result<Plan, DagError> {
        let classification = classify(&index.frames, config.orchestrator.abort_fraction);
        if !classification.aborted.is_empty() {
            info!(
                "Ignoring {} aborted exposures: {}",
                classification.aborted.len(),
                classification.aborted.iter().map(|f| &f.basename).join(", ")
            );
        }
        for rejected in &classification.rejected {
            warn!("Not reducing a sequence: {rejected}");
        }

        let mut builder = Builder::default();
        for seq in &classification.sequences {
            for frame in &seq.frames {
                builder.preprocess(frame);
            }
        }

        let sequences = &classification.sequences;
        let mut need_master = !has_fp_reference;
        for seq in sequences {
            let paths = seq_paths(seq);
            let id = seq.id();
            match seq.dprtype {
                t if t == DprType::DARK_DARK => {
                    builder.add(id, RecipeKind::Dark, RecipeInputs::single(paths.clone()));
                    builder.add(id, RecipeKind::Thermal, RecipeInputs::single(paths));
                }
                t if t == DprType::FLAT_FLAT => {
                    // The bad-pixel map uses the dark from the database.
                    builder.add(id, RecipeKind::Badpix, RecipeInputs::pair(paths.clone(), vec![]));
                    builder.add(id, RecipeKind::Loc, RecipeInputs::single(paths.clone()));
                    builder.add(id, RecipeKind::Flat, RecipeInputs::single(paths));
                }
                t if t == DprType::FP_FP => {
                    let hc = closest(sequences, DprType::HC_HC, seq.mjd())
                        .map(seq_paths)
                        .unwrap_or_default();
                    builder.add(id, RecipeKind::Shape, RecipeInputs::pair(paths.clone(), hc));
                    builder.add(id, RecipeKind::Drift, RecipeInputs::single(paths));
                }
                t if t == DprType::HC_HC => match closest(sequences, DprType::FP_FP, seq.mjd()) {
                    Some(fp) => {
                        let kind = if need_master {
                            need_master = false;
                            RecipeKind::WaveMaster
                        } else {
                            RecipeKind::Wave
                        };
                        builder.add(id, kind, RecipeInputs::pair(paths, seq_paths(fp)));
                    }
                    None => warn!("No FP sequence to pair with the HC sequence {id}; no wavelength solution from it"),
                },
                t if t.is_science() => {
                    for frame in &seq.frames {
                        builder.science(config, frame);
                    }
                }
                other => debug!("Nothing reduces {other} sequences ({id})"),
            }
        }
        if config.telluric.enabled && config.telluric.make_templates {
            builder.templates();
        }

        builder.finish()
    }

    /// Log what would run, level by level.
    pub(crate) fn describe(&self) {
        info!(
            "{} work items in {} levels",
            self.items.len(),
            self.levels.len()
        );
        for (i, level) in self.levels.iter().enumerate() {
            info!("Level {i}:");
            for &item in level {
                let item = &self.items[item];
                info!(
                    "    {:<32} {}",
                    item.id,
                    item.inputs
                        .files
                        .iter()
                        .map(|role| role.len().to_string())
                        .join("+")
                );
            }
        }
    }
}

fn seq_paths(seq: &Sequence) -> Vec<PathBuf> {
    seq.frames.iter().map(|f| f.path.clone()).collect()
}

/// The sequence of the given type closest in time to `mjd`.
fn closest(sequences: &[Sequence], dprtype: DprType, mjd: f64) -> Option<&Sequence> {
    sequences
        .iter()
        .filter(|s| s.dprtype == dprtype)
        .min_by(|a, b| (a.mjd() - mjd).abs().total_cmp(&(b.mjd() - mjd).abs()))
}

#[derive(Default)]
struct Builder {
    items: Vec<WorkItem>,
    /// Raw path to its preprocess item.
    pp_of: HashMap<PathBuf, usize>,
    /// Object name to the fit-tellu items of its frames, in the order the
    /// objects were first seen.
    corrected: IndexMap<String, Vec<usize>>,
}

impl Builder {
    fn preprocess(&mut self, frame: &RawFrame) {
        if self.pp_of.contains_key(&frame.path) {
            return;
        }
        let index = self.items.len();
        self.items.push(WorkItem {
            id: format!("{}:{}", RecipeKind::Preprocess, frame.basename),
            recipe: RecipeKind::Preprocess,
            inputs: RecipeInputs::single(vec![frame.path.clone()]),
            frame_deps: vec![],
            requires: vec![],
            after: vec![],
        });
        self.pp_of.insert(frame.path.clone(), index);
    }

    fn add(&mut self, id: &str, recipe: RecipeKind, inputs: RecipeInputs) -> usize {
        let frame_deps = inputs
            .all()
            .filter_map(|p| self.pp_of.get(p).map(|&i| (i, p.clone())))
            .collect();
        self.items.push(WorkItem {
            id: format!("{recipe}:{id}"),
            recipe,
            inputs,
            frame_deps,
            requires: vec![],
            after: vec![],
        });
        self.items.len() - 1
    }

    fn science(&mut self, config: &DrsConfig, frame: &RawFrame) {
        let id = frame.basename.as_str();
        let inputs = RecipeInputs::single(vec![frame.path.clone()]);
        let extract = self.add(id, RecipeKind::Extract, inputs.clone());

        let is_hot_star = config
            .telluric
            .hot_stars
            .iter()
            .any(|s| s.trim().eq_ignore_ascii_case(frame.object.trim()));
        let tellu_kind = if is_hot_star {
            RecipeKind::MkTellu
        } else {
            RecipeKind::FitTellu
        };
        let tellu = self.add(id, tellu_kind, inputs.clone());
        self.items[tellu].requires.push(extract);
        if !is_hot_star {
            self.corrected
                .entry(frame.object.trim().to_string())
                .or_default()
                .push(tellu);
        }

        let ccf = self.add(id, RecipeKind::Ccf, inputs);
        self.items[ccf].requires.push(extract);
        // The CCF falls back to the uncorrected spectrum.
        self.items[ccf].after.push(tellu);
    }

    /// One template per corrected object, from all of its frames.
    fn templates(&mut self) {
        let corrected = std::mem::take(&mut self.corrected);
        for (object, tellu) in corrected {
            let files: Vec<PathBuf> = tellu
                .iter()
                .flat_map(|&i| self.items[i].inputs.all().cloned().collect::<Vec<_>>())
                .collect();
            let template = self.add(
                &kinds::sanitise_object(&object),
                RecipeKind::MkTemplate,
                RecipeInputs::single(files),
            );
            self.items[template].requires.extend(tellu);
        }
    }

    /// Order the items: frame and product dependencies, then the calibration
    /// chain, where each rank waits for everything of the previous rank.
    fn finish(self) -> Result<Plan, DagError> {
        let mut items = self.items;
        let mut edges = vec![];
        for (i, item) in items.iter().enumerate() {
            edges.extend(item.frame_deps.iter().map(|&(j, _)| (j, i)));
            edges.extend(item.requires.iter().map(|&j| (j, i)));
            edges.extend(item.after.iter().map(|&j| (j, i)));
        }

        let ranks: Vec<usize> = items
            .iter()
            .map(|item| item.recipe.spec().rank)
            .unique()
            .sorted()
            .collect();
        for pair in ranks.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            let below: Vec<usize> = (0..items.len())
                .filter(|&i| items[i].recipe.spec().rank == lower)
                .collect();
            for (i, item) in items.iter_mut().enumerate() {
                if item.recipe.spec().rank == upper {
                    edges.extend(below.iter().map(|&j| (j, i)));
                    item.after.extend(below.iter().copied());
                }
            }
        }

        let levels = levels(items.len(), &edges)?;
        Ok(Plan { items, levels })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{io::header::Header, keywords::KeywordSet};

    fn frame(name: &str, mjd: f64, index: i64, total: i64, sci: &str, reference: &str) -> RawFrame {
        let mut h = Header::new();
        h.set("MJD-OBS", mjd);
        h.set("EXPTIME", 10.0);
        h.set("EXPREQ", 10.0);
        h.set("CMPLTEXP", index);
        h.set("NEXP", total);
        h.set("OBSTYPE", "OBJECT");
        h.set("SCIFIB", sci);
        h.set("REFFIB", reference);
        RawFrame::from_header(
            "n",
            Path::new(&format!("{name}.fits")),
            h,
            &KeywordSet::default(),
        )
        .unwrap()
    }

    fn sequence(prefix: &str, start: f64, n: i64, sci: &str, reference: &str) -> Vec<RawFrame> {
        (1..=n)
            .map(|i| frame(&format!("{prefix}{i}"), start + i as f64 * 0.001, i, n, sci, reference))
            .collect()
    }

    fn night() -> NightIndex {
        let mut frames = vec![];
        frames.extend(sequence("d", 60000.00, 2, "DARK", "DARK"));
        frames.extend(sequence("f", 60000.01, 2, "FLAT", "FLAT"));
        frames.extend(sequence("fpa", 60000.02, 1, "FP", "FP"));
        frames.extend(sequence("hca", 60000.03, 1, "HC", "HC"));
        frames.extend(sequence("fpb", 60000.50, 1, "FP", "FP"));
        frames.extend(sequence("hcb", 60000.51, 1, "HC", "HC"));
        let mut hot = sequence("h", 60000.2, 1, "OBJ", "FP");
        hot[0].object = "HR 1234".to_string();
        frames.extend(hot);
        let mut star = sequence("s", 60000.3, 2, "OBJ", "FP");
        for f in star.iter_mut() {
            f.object = "Gl 699".to_string();
        }
        frames.extend(star);
        frames.sort_by(|a, b| a.mjd.total_cmp(&b.mjd));
        NightIndex {
            frames,
            unreadable: vec![],
        }
    }

    fn config() -> DrsConfig {
        let mut config = DrsConfig::default();
        config.telluric.hot_stars = vec!["hr 1234 ".to_string()];
        config
    }

    fn find<'a>(plan: &'a Plan, id: &str) -> (usize, &'a WorkItem) {
        plan.items
            .iter()
            .enumerate()
            .find(|(_, item)| item.id == id)
            .unwrap_or_else(|| panic!("no item {id}"))
    }

    fn level_of(plan: &Plan, item: usize) -> usize {
        plan.levels.iter().position(|l| l.contains(&item)).unwrap()
    }

    #[test]
    fn test_items_per_sequence() {
        let plan = Plan::build(&config(), &night(), false).unwrap();
        let count = |kind: RecipeKind| plan.items.iter().filter(|i| i.recipe == kind).count();
        assert_eq!(count(RecipeKind::Preprocess), 11);
        assert_eq!(count(RecipeKind::Dark), 1);
        assert_eq!(count(RecipeKind::Thermal), 1);
        assert_eq!(count(RecipeKind::Badpix), 1);
        assert_eq!(count(RecipeKind::Loc), 1);
        assert_eq!(count(RecipeKind::Flat), 1);
        assert_eq!(count(RecipeKind::Shape), 2);
        assert_eq!(count(RecipeKind::WaveMaster), 1);
        assert_eq!(count(RecipeKind::Wave), 1);
        assert_eq!(count(RecipeKind::Drift), 2);
        assert_eq!(count(RecipeKind::Extract), 3);
        assert_eq!(count(RecipeKind::MkTellu), 1);
        assert_eq!(count(RecipeKind::FitTellu), 2);
        assert_eq!(count(RecipeKind::MkTemplate), 1);
        assert_eq!(count(RecipeKind::Ccf), 3);
    }

    #[test]
    fn test_an_existing_reference_means_no_master() {
        let plan = Plan::build(&config(), &night(), true).unwrap();
        let count = |kind: RecipeKind| plan.items.iter().filter(|i| i.recipe == kind).count();
        assert_eq!(count(RecipeKind::WaveMaster), 0);
        assert_eq!(count(RecipeKind::Wave), 2);
    }

    #[test]
    fn test_drifts_follow_the_nightly_solutions() {
        let plan = Plan::build(&config(), &night(), false).unwrap();
        let (master, _) = find(&plan, "wave-master:hca1");
        let (nightly, _) = find(&plan, "wave:hcb1");
        let (drift, item) = find(&plan, "drift:fpb1");
        assert_eq!(item.inputs.role(0), [PathBuf::from("fpb1.fits")]);
        assert!(level_of(&plan, master) < level_of(&plan, nightly));
        assert!(level_of(&plan, nightly) < level_of(&plan, drift));
    }

    #[test]
    fn test_one_template_per_corrected_object() {
        let plan = Plan::build(&config(), &night(), false).unwrap();
        let (template, item) = find(&plan, "mk-template:GL699");
        assert_eq!(item.inputs.role(0).len(), 2);
        let fits: Vec<usize> = ["fit-tellu:s1", "fit-tellu:s2"]
            .iter()
            .map(|id| find(&plan, id).0)
            .collect();
        assert_eq!(item.requires, fits);
        assert!(fits.iter().all(|&f| level_of(&plan, f) < level_of(&plan, template)));

        let mut config = config();
        config.telluric.make_templates = false;
        let plan = Plan::build(&config, &night(), false).unwrap();
        assert!(plan.items.iter().all(|i| i.recipe != RecipeKind::MkTemplate));
    }

    #[test]
    fn test_arc_sequences_pair_with_the_closest() {
        let plan = Plan::build(&config(), &night(), false).unwrap();
        let (_, wave) = find(&plan, "wave:hcb1");
        assert_eq!(wave.inputs.role(0), [PathBuf::from("hcb1.fits")]);
        assert_eq!(wave.inputs.role(1), [PathBuf::from("fpb1.fits")]);
        let (_, shape) = find(&plan, "shape:fpa1");
        assert_eq!(shape.inputs.role(1), [PathBuf::from("hca1.fits")]);
    }

    #[test]
    fn test_hot_stars_make_transmission_maps() {
        let plan = Plan::build(&config(), &night(), false).unwrap();
        let (mk, _) = find(&plan, "mk-tellu:h1");
        let (fit, _) = find(&plan, "fit-tellu:s1");
        assert!(level_of(&plan, mk) < level_of(&plan, fit));
        let (extract, _) = find(&plan, "extract:s2");
        let (ccf, ccf_item) = find(&plan, "ccf:s2");
        assert_eq!(ccf_item.requires, vec![extract]);
        assert!(level_of(&plan, extract) < level_of(&plan, ccf));
    }

    #[test]
    fn test_calibration_chain_order() {
        let plan = Plan::build(&config(), &night(), false).unwrap();
        let order = [
            "preprocess:d1",
            "dark:d1",
            "badpix:f1",
            "loc:f1",
            "shape:fpa1",
            "flat:f1",
            "thermal:d1",
            "wave-master:hca1",
            "wave:hcb1",
            "drift:fpa1",
            "extract:h1",
            "fit-tellu:s1",
            "mk-template:GL699",
            "ccf:s1",
        ];
        let levels: Vec<usize> = order
            .iter()
            .map(|id| level_of(&plan, find(&plan, id).0))
            .collect();
        assert!(levels.windows(2).all(|w| w[0] < w[1]), "{levels:?}");
    }

    #[test]
    fn test_frame_deps_point_at_preprocessing() {
        let plan = Plan::build(&config(), &night(), false).unwrap();
        let (_, dark) = find(&plan, "dark:d1");
        let deps: Vec<&str> = dark
            .frame_deps
            .iter()
            .map(|&(i, _)| plan.items[i].id.as_str())
            .collect();
        assert_eq!(deps, ["preprocess:d1", "preprocess:d2"]);
    }

    #[test]
    fn test_lonely_hc_makes_no_wave_item() {
        let index = NightIndex {
            frames: sequence("hc", 60000.0, 1, "HC", "HC"),
            unreadable: vec![],
        };
        let plan = Plan::build(&config(), &index, false).unwrap();
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].recipe, RecipeKind::Preprocess);
    }
}
