//! Goodness of fit for a fitted model cube.
//!
//! `chi² = Σ_channels (observed - model)² / sigma²` per pixel. The probability
//! map evaluates the chi-squared survival function with one degree of freedom
//! per channel. That is a rough proxy for fit quality, not a rigorous test:
//! the fitted parameters are not subtracted from the degrees of freedom.

use ndarray::{Array2, ArrayView2, ArrayView3, Axis, Zip};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::error::CubeError;

/// Probability below which a pixel is flagged as a bad fit.
pub const DEFAULT_BAD_FIT_CUT: f64 = 1e-20;

/// Per-pixel noise level.
#[derive(Debug, Clone, PartialEq)]
pub enum Sigma {
    Scalar(f64),
    Map(Array2<f64>),
}

impl Sigma {
    fn at(&self, y: usize, x: usize) -> f64 {
        match self {
            Sigma::Scalar(s) => *s,
            Sigma::Map(m) => m[[y, x]],
        }
    }

    fn check(&self, spatial: (usize, usize)) -> Result<(), CubeError> {
        match self {
            Sigma::Map(m) if m.dim() != spatial => Err(CubeError::InvalidShape(format!(
                "Sigma map {:?} does not match the cube's spatial shape {spatial:?}.",
                m.dim()
            ))),
            _ => Ok(()),
        }
    }
}

/// Chi-squared map. A zero sigma gives an infinite (or NaN, for a perfect
/// fit) value at that pixel.
pub fn chi_squared_map(
    cube: ArrayView3<'_, f64>,
    model_cube: ArrayView3<'_, f64>,
    sigma: &Sigma,
) -> Result<Array2<f64>, CubeError> {
    if cube.dim() != model_cube.dim() {
        return Err(CubeError::InvalidShape(format!(
            "Model cube {:?} does not match the data cube {:?}.",
            model_cube.dim(),
            cube.dim()
        )));
    }
    let (_, ny, nx) = cube.dim();
    sigma.check((ny, nx))?;

    let squared = (&cube - &model_cube).mapv(|r| r * r).sum_axis(Axis(0));
    Ok(Array2::from_shape_fn((ny, nx), |(y, x)| {
        let s = sigma.at(y, x);
        squared[[y, x]] / (s * s)
    }))
}

/// Survival-function probability of each chi-squared value with `dof`
/// degrees of freedom.
///
/// NaN stays NaN and infinity maps to 0. When `parcube` (P × Y × X) is given,
/// pixels with any undefined parameter are NaN.
pub fn chi_squared_probability(
    chi_squared: ArrayView2<'_, f64>,
    dof: usize,
    parcube: Option<ArrayView3<'_, f64>>,
) -> Result<Array2<f64>, CubeError> {
    let dist = ChiSquared::new(dof as f64)
        .map_err(|e| CubeError::InvalidInput(format!("chi-squared with {dof} degrees of freedom: {e}")))?;

    let mut prob = chi_squared.mapv(|chi| {
        if chi.is_nan() {
            f64::NAN
        } else if chi.is_infinite() {
            0.0
        } else {
            dist.sf(chi)
        }
    });

    if let Some(parcube) = parcube {
        let (_, py, px) = parcube.dim();
        if (py, px) != prob.dim() {
            return Err(CubeError::InvalidShape(format!(
                "Parameter cube spatial shape {:?} does not match the chi-squared map {:?}.",
                (py, px),
                prob.dim()
            )));
        }
        for ((y, x), p) in prob.indexed_iter_mut() {
            if parcube.slice(ndarray::s![.., y, x]).iter().any(|v| v.is_nan()) {
                *p = f64::NAN;
            }
        }
    }
    Ok(prob)
}

/// Gaussian log-likelihood `-chi²/2 - C·ln(sigma·√(2π))`, kept in log space.
pub fn log_likelihood_map(chi_squared: ArrayView2<'_, f64>, sigma: &Sigma, n_channels: usize) -> Result<Array2<f64>, CubeError> {
    sigma.check(chi_squared.dim())?;
    let norm = (2.0 * std::f64::consts::PI).sqrt();
    let c = n_channels as f64;
    let mut out = Array2::zeros(chi_squared.dim());
    Zip::indexed(&mut out)
        .and(&chi_squared)
        .for_each(|(y, x), l, &chi| {
            *l = -0.5 * chi - c * (sigma.at(y, x) * norm).ln();
        });
    Ok(out)
}

/// `probability < cut`; undefined pixels are not flagged.
pub fn bad_fit_mask(probability: ArrayView2<'_, f64>, cut: f64) -> Array2<bool> {
    probability.mapv(|p| p < cut)
}
