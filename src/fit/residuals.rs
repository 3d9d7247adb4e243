//! Residual evaluation tiers.
//!
//! The residual of model `g` at pixel `(y, x)` is the population standard
//! deviation over channels of `observed - model`. Each tier below computes the
//! minimum-residual model per pixel; they differ only in memory footprint.
//! All three accumulate with the same running-variance recurrence, so their
//! results agree bit for bit.

use ndarray::{Array2, Array4, ArrayView1, ArrayView2, ArrayView3, Axis, Zip, s};

use crate::error::CubeError;
use crate::fit::memory::ResidualStrategy;
use crate::progress::ProgressSink;

/// Per-pixel winner of a residual pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualPick {
    /// Index into the model grid, `None` for masked or undefined pixels.
    pub best: Array2<Option<usize>>,
    /// Residual of the winning model, NaN where `best` is `None`.
    pub min: Array2<f64>,
}

impl ResidualPick {
    fn undefined(ny: usize, nx: usize) -> Self {
        Self {
            best: Array2::from_elem((ny, nx), None),
            min: Array2::from_elem((ny, nx), f64::NAN),
        }
    }

    fn set(&mut self, y: usize, x: usize, winner: Option<(usize, f64)>) {
        if let Some((g, r)) = winner {
            self.best[[y, x]] = Some(g);
            self.min[[y, x]] = r;
        }
    }
}

/// Run the requested tier.
pub fn compute_residuals(
    strategy: ResidualStrategy,
    cube: ArrayView3<'_, f64>,
    models: ArrayView2<'_, f64>,
    mask: Option<ArrayView2<'_, bool>>,
    progress: &mut dyn ProgressSink,
) -> Result<ResidualPick, CubeError> {
    match strategy {
        ResidualStrategy::Broadcast => residuals_broadcast(cube, models, mask),
        ResidualStrategy::PerPixel => residuals_per_pixel(cube, models, mask, progress),
        ResidualStrategy::Nested => residuals_nested(cube, models, mask, progress),
    }
}

/// Broadcast the whole model grid against the cube in one pass.
///
/// Materialises a `G × C × Y × X` difference array. If that allocation cannot
/// be satisfied the call fails with [`CubeError::ResourceExhausted`] so the
/// caller can drop to a slower tier.
pub fn residuals_broadcast(
    cube: ArrayView3<'_, f64>,
    models: ArrayView2<'_, f64>,
    mask: Option<ArrayView2<'_, bool>>,
) -> Result<ResidualPick, CubeError> {
    let (n_channels, ny, nx) = cube.dim();
    check_inputs(n_channels, (ny, nx), models, mask)?;
    let n_models = models.nrows();

    let len = [n_models, n_channels, ny, nx]
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| CubeError::ResourceExhausted("broadcast array size overflows".into()))?;
    let mut buf: Vec<f64> = Vec::new();
    buf.try_reserve_exact(len).map_err(|e| {
        CubeError::ResourceExhausted(format!(
            "cannot allocate {len} residual values for broadcasting: {e}"
        ))
    })?;
    buf.resize(len, 0.0);
    let mut diff = Array4::from_shape_vec((n_models, n_channels, ny, nx), buf)
        .map_err(|e| CubeError::InvalidShape(format!("Broadcast residuals: {e}")))?;

    let observed = cube.insert_axis(Axis(0));
    let synthetic = models.insert_axis(Axis(2)).insert_axis(Axis(3));
    Zip::from(&mut diff)
        .and_broadcast(&observed)
        .and_broadcast(&synthetic)
        .for_each(|d, &o, &m| *d = o - m);

    // (G, Y, X)
    let residuals = diff.std_axis(Axis(1), 0.0);
    drop(diff);

    let mut pick = ResidualPick::undefined(ny, nx);
    for y in 0..ny {
        for x in 0..nx {
            if is_masked(mask, y, x) {
                continue;
            }
            let winner = argmin_first(residuals.slice(s![.., y, x]).iter().copied());
            pick.set(y, x, winner);
        }
    }
    Ok(pick)
}

/// One pixel at a time, vectorised across the model grid.
pub fn residuals_per_pixel(
    cube: ArrayView3<'_, f64>,
    models: ArrayView2<'_, f64>,
    mask: Option<ArrayView2<'_, bool>>,
    progress: &mut dyn ProgressSink,
) -> Result<ResidualPick, CubeError> {
    let (n_channels, ny, nx) = cube.dim();
    check_inputs(n_channels, (ny, nx), models, mask)?;

    let mut pick = ResidualPick::undefined(ny, nx);
    progress.start("Computing residuals per pixel", (ny * nx) as u64);
    for y in 0..ny {
        for x in 0..nx {
            if !is_masked(mask, y, x) {
                let spectrum = cube.slice(s![.., y, x]);
                let diff = &spectrum.insert_axis(Axis(0)) - &models;
                let residuals = diff.std_axis(Axis(1), 0.0);
                pick.set(y, x, argmin_first(residuals.iter().copied()));
            }
            progress.advance(1);
        }
    }
    progress.finish();
    Ok(pick)
}

/// One (pixel, model) residual at a time. Works with model grids that never
/// leave disk.
pub fn residuals_nested(
    cube: ArrayView3<'_, f64>,
    models: ArrayView2<'_, f64>,
    mask: Option<ArrayView2<'_, bool>>,
    progress: &mut dyn ProgressSink,
) -> Result<ResidualPick, CubeError> {
    let (n_channels, ny, nx) = cube.dim();
    check_inputs(n_channels, (ny, nx), models, mask)?;
    let n_models = models.nrows();

    let mut pick = ResidualPick::undefined(ny, nx);
    progress.start("Computing residuals", (ny * nx * n_models) as u64);
    for y in 0..ny {
        for x in 0..nx {
            if is_masked(mask, y, x) {
                progress.advance(n_models as u64);
                continue;
            }
            let spectrum = cube.slice(s![.., y, x]);
            let residuals = models.outer_iter().map(|model| {
                let r = single_residual(spectrum, model);
                progress.advance(1);
                r
            });
            let winner = argmin_first(residuals);
            pick.set(y, x, winner);
        }
    }
    progress.finish();
    Ok(pick)
}

fn single_residual(observed: ArrayView1<'_, f64>, model: ArrayView1<'_, f64>) -> f64 {
    (&observed - &model).std(0.0)
}

fn check_inputs(
    n_channels: usize,
    spatial: (usize, usize),
    models: ArrayView2<'_, f64>,
    mask: Option<ArrayView2<'_, bool>>,
) -> Result<(), CubeError> {
    if models.nrows() == 0 {
        return Err(CubeError::InvalidShape("The model grid holds no models.".into()));
    }
    if models.ncols() != n_channels {
        return Err(CubeError::InvalidShape(format!(
            "Model grid has {} channels but the cube has {n_channels}.",
            models.ncols()
        )));
    }
    if let Some(mask) = mask {
        if mask.dim() != spatial {
            return Err(CubeError::InvalidShape(format!(
                "Pixel mask {:?} does not match the cube's spatial shape {spatial:?}.",
                mask.dim()
            )));
        }
    }
    Ok(())
}

/// `true` when the pixel is excluded from selection.
fn is_masked(mask: Option<ArrayView2<'_, bool>>, y: usize, x: usize) -> bool {
    mask.is_some_and(|m| !m[[y, x]])
}

/// Index and value of the smallest non-NaN value; ties go to the lowest index.
pub fn argmin_first(values: impl IntoIterator<Item = f64>) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, v) in values.into_iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v >= b => {}
            _ => best = Some((i, v)),
        }
    }
    best
}
