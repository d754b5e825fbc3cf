// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The catalogues, masks and templates that go with a synthetic night.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use super::{
    instrument::{hc_columns, hc_strength, wave_coeffs, wavelength, Sky, FIBRES, NX, N_ORDERS},
    SimError,
};
use crate::{config::DrsConfig, constants::SPEED_OF_LIGHT_KMS};

/// Offset of the initial wavelength solution from the truth \[nm\].
const INITIAL_WAVE_OFFSET: f64 = 0.002;
/// Sampling of the transmission template \[nm\].
const TEMPLATE_STEP: f64 = 0.002;

fn create(path: &Path) -> Result<BufWriter<File>, SimError> {
    File::create(path).map(BufWriter::new).map_err(|source| SimError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write the lines produced by `f` to `path`.
fn write_table<F>(path: &Path, f: F) -> Result<(), SimError>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let mut w = create(path)?;
    f(&mut w)
        .and_then(|_| w.flush())
        .map_err(|source| SimError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Write every table named by `config` into its assets directory. The CCF
/// mask is shifted by `mask_shift` km/s.
pub(super) fn write_assets(config: &DrsConfig, sky: &Sky, mask_shift: f64) -> Result<Vec<PathBuf>, SimError> {
    let paths = &config.paths;
    let mut written = vec![];

    let path = paths.asset(&config.wave.hc_catalogue);
    write_table(&path, |w| {
        writeln!(w, "# wavelength[nm] strength")?;
        for order in 0..N_ORDERS {
            for (j, x) in hc_columns(order).into_iter().enumerate() {
                writeln!(w, "{:.6} {:.3}", wavelength(order, x), hc_strength(j))?;
            }
        }
        Ok(())
    })?;
    written.push(path);

    let path = paths.asset(&config.wave.initial_solution);
    write_table(&path, |w| {
        writeln!(w, "# fibre order c0 c1 c2")?;
        for fibre in FIBRES {
            for order in 0..N_ORDERS {
                let [c0, c1, c2] = wave_coeffs(order);
                writeln!(w, "{fibre} {order} {:.6} {c1:e} {c2:e}", c0 + INITIAL_WAVE_OFFSET)?;
            }
        }
        Ok(())
    })?;
    written.push(path);

    let path = paths.asset(&config.ccf.mask);
    let shift = 1.0 + mask_shift / SPEED_OF_LIGHT_KMS;
    write_table(&path, |w| {
        writeln!(w, "# line_start[nm] line_end[nm] weight")?;
        for line in &sky.star {
            let centre = line.wavelength * shift;
            writeln!(w, "{:.6} {:.6} {:.3}", centre - 1e-5, centre + 1e-5, line.depth)?;
        }
        Ok(())
    })?;
    written.push(path);

    let path = paths.asset(&config.telluric.template);
    let (start, end) = (wavelength(0, 0.0) - 5.0, wavelength(N_ORDERS - 1, NX as f64) + 5.0);
    let n = ((end - start) / TEMPLATE_STEP).ceil() as usize;
    write_table(&path, |w| {
        writeln!(w, "# wavelength[nm] water others")?;
        for i in 0..=n {
            let lambda = start + i as f64 * TEMPLATE_STEP;
            let (water, others) = sky.template(lambda);
            writeln!(w, "{lambda:.4} {water:.6} {others:.6}")?;
        }
        Ok(())
    })?;
    written.push(path);

    for (file, lines) in [
        (&config.telluric.water_mask, &sky.water),
        (&config.telluric.dry_mask, &sky.others),
    ] {
        let path = paths.asset(file);
        write_table(&path, |w| {
            writeln!(w, "# wavelength[nm] weight")?;
            for line in lines {
                writeln!(w, "{:.6} {:.4}", line.wavelength, line.depth)?;
            }
            Ok(())
        })?;
        written.push(path);
    }
    Ok(written)
}
