//! Per-pixel nonlinear fitting from prepared guesses.
//!
//! Given:
//! - a cube (C × Y × X) and its spectral axis
//! - a spectral model
//! - initial guesses, either one vector for the whole cube or a P × Y × X field
//! - per-parameter limits (bounds, fixed / limited flags)
//!
//! we run a small Levenberg–Marquardt fit at every pixel and return a
//! parameter cube and a parameter-error cube. Pixels are independent, so they
//! are fitted in parallel on a dedicated rayon pool.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array3, ArrayView1, ArrayView3};
use rayon::prelude::*;

use crate::error::CubeError;
use crate::grid::FitLimits;
use crate::math::solve_damped;
use crate::models::SpectralModel;

/// Initial guesses for a cube fit.
#[derive(Debug, Clone, Copy)]
pub enum PixelGuesses<'a> {
    /// The same vector everywhere (e.g. the overall best guess).
    Uniform(&'a [f64]),
    /// One vector per pixel, P × Y × X (e.g. the best-guess field).
    /// Pixels holding NaN are not fitted.
    PerPixel(ArrayView3<'a, f64>),
}

impl PixelGuesses<'_> {
    fn npars(&self) -> usize {
        match self {
            PixelGuesses::Uniform(v) => v.len(),
            PixelGuesses::PerPixel(field) => field.dim().0,
        }
    }

    fn at(&self, y: usize, x: usize) -> Vec<f64> {
        match self {
            PixelGuesses::Uniform(v) => v.to_vec(),
            PixelGuesses::PerPixel(field) => field.slice(ndarray::s![.., y, x]).to_vec(),
        }
    }
}

/// Fitted parameters and their 1σ errors, both P × Y × X.
#[derive(Debug, Clone)]
pub struct CubeFit {
    pub parcube: Array3<f64>,
    pub errcube: Array3<f64>,
    pub fitted_pixels: usize,
    pub failed_pixels: usize,
}

/// The fitting capability consumed by a session.
pub trait CubeFitter {
    fn fit_cube(
        &self,
        cube: ArrayView3<'_, f64>,
        xarr: &[f64],
        model: &dyn SpectralModel,
        guesses: PixelGuesses<'_>,
        limits: &FitLimits,
    ) -> Result<CubeFit, CubeError>;
}

/// Levenberg–Marquardt with a forward-difference Jacobian.
#[derive(Debug, Clone)]
pub struct LeastSquaresFitter {
    /// Worker threads; `None` lets rayon decide.
    pub threads: Option<usize>,
    pub max_iterations: usize,
    /// Relative SSE improvement below which a fit has converged.
    pub tolerance: f64,
}

impl Default for LeastSquaresFitter {
    fn default() -> Self {
        Self {
            threads: None,
            max_iterations: 200,
            tolerance: 1e-10,
        }
    }
}

impl LeastSquaresFitter {
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads: Some(threads.max(1)),
            ..Self::default()
        }
    }
}

impl CubeFitter for LeastSquaresFitter {
    fn fit_cube(
        &self,
        cube: ArrayView3<'_, f64>,
        xarr: &[f64],
        model: &dyn SpectralModel,
        guesses: PixelGuesses<'_>,
        limits: &FitLimits,
    ) -> Result<CubeFit, CubeError> {
        let (n_channels, ny, nx) = cube.dim();
        let npars = guesses.npars();
        validate(n_channels, (ny, nx), xarr, model, &guesses, limits)?;
        limits.check()?;

        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = self.threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| CubeError::Fit(format!("cannot start fitting workers: {e}")))?;

        log::info!(
            "Fitting {} pixels with '{}' ({} parameters) on {} threads",
            ny * nx,
            model.name(),
            npars,
            pool.current_num_threads()
        );

        let pixels: Vec<(usize, usize)> = (0..ny).flat_map(|y| (0..nx).map(move |x| (y, x))).collect();
        let results: Vec<Option<PixelFit>> = pool.install(|| {
            pixels
                .par_iter()
                .map(|&(y, x)| {
                    let guess = guesses.at(y, x);
                    self.fit_pixel(cube.slice(ndarray::s![.., y, x]), xarr, model, &guess, limits)
                })
                .collect()
        });

        let mut parcube = Array3::from_elem((npars, ny, nx), f64::NAN);
        let mut errcube = Array3::from_elem((npars, ny, nx), f64::NAN);
        let mut fitted_pixels = 0;
        let mut failed_pixels = 0;
        for (&(y, x), result) in pixels.iter().zip(results) {
            match result {
                Some(fit) => {
                    fitted_pixels += 1;
                    for p in 0..npars {
                        parcube[[p, y, x]] = fit.params[p];
                        errcube[[p, y, x]] = fit.errors[p];
                    }
                }
                None => failed_pixels += 1,
            }
        }
        if failed_pixels > 0 {
            log::warn!("{failed_pixels} pixel(s) were not fitted (undefined guess or data).");
        }
        log::info!("Fitted {fitted_pixels} pixels");

        Ok(CubeFit {
            parcube,
            errcube,
            fitted_pixels,
            failed_pixels,
        })
    }
}

#[derive(Debug, Clone)]
struct PixelFit {
    params: Vec<f64>,
    errors: Vec<f64>,
}

impl LeastSquaresFitter {
    fn fit_pixel(
        &self,
        spectrum: ArrayView1<'_, f64>,
        xarr: &[f64],
        model: &dyn SpectralModel,
        guess: &[f64],
        limits: &FitLimits,
    ) -> Option<PixelFit> {
        if guess.iter().any(|v| !v.is_finite()) || spectrum.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let observed: Vec<f64> = spectrum.to_vec();
        let free: Vec<usize> = (0..guess.len()).filter(|&i| !limits.fixed[i]).collect();

        let mut params: Vec<f64> = guess
            .iter()
            .enumerate()
            .map(|(i, &v)| if limits.fixed[i] { v } else { limits.clamp(i, v) })
            .collect();
        let mut residuals = residual_vector(model, xarr, &observed, &params)?;
        let mut sse = residuals.norm_squared();
        if free.is_empty() {
            return Some(PixelFit {
                errors: vec![0.0; params.len()],
                params,
            });
        }

        let mut lambda = 1e-3;
        for _ in 0..self.max_iterations {
            let jacobian = numeric_jacobian(model, xarr, &params, &free)?;
            let Some(delta) = solve_damped(&jacobian, &residuals, lambda) else {
                break;
            };

            let mut trial = params.clone();
            for (k, &i) in free.iter().enumerate() {
                trial[i] = limits.clamp(i, params[i] + delta[k]);
            }
            let trial_residuals = residual_vector(model, xarr, &observed, &trial)?;
            let trial_sse = trial_residuals.norm_squared();

            if trial_sse.is_finite() && trial_sse < sse {
                let improvement = sse - trial_sse;
                params = trial;
                residuals = trial_residuals;
                sse = trial_sse;
                lambda = (lambda / 10.0).max(1e-12);
                if improvement <= self.tolerance * sse.max(f64::MIN_POSITIVE) {
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    break;
                }
            }
        }

        let errors = parameter_errors(model, xarr, &params, &free, sse, observed.len())?;
        Some(PixelFit { params, errors })
    }
}

fn validate(
    n_channels: usize,
    spatial: (usize, usize),
    xarr: &[f64],
    model: &dyn SpectralModel,
    guesses: &PixelGuesses<'_>,
    limits: &FitLimits,
) -> Result<(), CubeError> {
    let npars = guesses.npars();
    if xarr.len() != n_channels {
        return Err(CubeError::InvalidShape(format!(
            "Spectral axis has {} channels but the cube has {n_channels}.",
            xarr.len()
        )));
    }
    if npars == 0 || npars % model.npars() != 0 {
        return Err(CubeError::InvalidShape(format!(
            "Guesses hold {npars} values; model '{}' takes multiples of {}.",
            model.name(),
            model.npars()
        )));
    }
    if limits.npars() != npars {
        return Err(CubeError::InvalidShape(format!(
            "Fit limits cover {} parameters but guesses hold {npars}.",
            limits.npars()
        )));
    }
    if let PixelGuesses::PerPixel(field) = guesses {
        let (_, gy, gx) = field.dim();
        if (gy, gx) != spatial {
            return Err(CubeError::InvalidShape(format!(
                "Guess field {:?} does not match the cube's spatial shape {spatial:?}.",
                (gy, gx)
            )));
        }
    }
    Ok(())
}

fn residual_vector(model: &dyn SpectralModel, xarr: &[f64], observed: &[f64], params: &[f64]) -> Option<DVector<f64>> {
    let synthetic = model.full_model(xarr, params).ok()?;
    let r = DVector::from_iterator(
        observed.len(),
        observed.iter().zip(&synthetic).map(|(o, m)| o - m),
    );
    r.iter().all(|v| v.is_finite()).then_some(r)
}

/// d(model)/d(param) for the free parameters, C × n_free.
fn numeric_jacobian(model: &dyn SpectralModel, xarr: &[f64], params: &[f64], free: &[usize]) -> Option<DMatrix<f64>> {
    let base = model.full_model(xarr, params).ok()?;
    let mut jacobian = DMatrix::<f64>::zeros(xarr.len(), free.len());
    let mut shifted = params.to_vec();
    for (k, &i) in free.iter().enumerate() {
        let h = 1e-7 * params[i].abs().max(1e-3);
        shifted[i] = params[i] + h;
        let bumped = model.full_model(xarr, &shifted).ok()?;
        shifted[i] = params[i];
        for (c, (b, f)) in bumped.iter().zip(&base).enumerate() {
            jacobian[(c, k)] = (b - f) / h;
        }
    }
    jacobian.iter().all(|v| v.is_finite()).then_some(jacobian)
}

/// 1σ errors from the covariance `s² (JᵀJ)⁻¹`, `s² = SSE / (C - n_free)`.
/// Fixed parameters get zero error.
fn parameter_errors(
    model: &dyn SpectralModel,
    xarr: &[f64],
    params: &[f64],
    free: &[usize],
    sse: f64,
    n_channels: usize,
) -> Option<Vec<f64>> {
    let mut errors = vec![0.0; params.len()];
    let dof = n_channels.saturating_sub(free.len());
    if dof == 0 {
        free.iter().for_each(|&i| errors[i] = f64::NAN);
        return Some(errors);
    }
    let jacobian = numeric_jacobian(model, xarr, params, free)?;
    let normal = jacobian.transpose() * &jacobian;
    let Ok(covariance) = normal.pseudo_inverse(1e-12) else {
        free.iter().for_each(|&i| errors[i] = f64::NAN);
        return Some(errors);
    };
    let s2 = sse / dof as f64;
    for (k, &i) in free.iter().enumerate() {
        errors[i] = (covariance[(k, k)] * s2).max(0.0).sqrt();
    }
    Some(errors)
}
