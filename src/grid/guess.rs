//! Guess grid generation.
//!
//! A guess grid enumerates candidate parameter vectors by subdividing every
//! parameter range linearly and taking the Cartesian product of the
//! subdivisions.
//!
//! Ordering is row-major: parameter 0 varies slowest and the last parameter
//! fastest. Model grids and selection maps index into the guess grid, so this
//! order must stay stable.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis, concatenate};
use serde::{Deserialize, Serialize};

use crate::error::CubeError;

/// Paired lower / upper parameter bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBounds {
    pub minpars: Vec<f64>,
    pub maxpars: Vec<f64>,
}

impl ParameterBounds {
    /// Bounds are not required to be ordered here; see [`ParameterBounds::check`].
    pub fn new(minpars: Vec<f64>, maxpars: Vec<f64>) -> Result<Self, CubeError> {
        if minpars.is_empty() {
            return Err(CubeError::InvalidShape("Parameter bounds are empty.".into()));
        }
        if minpars.len() != maxpars.len() {
            return Err(CubeError::InvalidShape(format!(
                "minpars has {} entries but maxpars has {}.",
                minpars.len(),
                maxpars.len()
            )));
        }
        if minpars.iter().chain(&maxpars).any(|v| !v.is_finite()) {
            return Err(CubeError::InvalidInput(
                "Parameter bounds must be finite.".into(),
            ));
        }
        Ok(Self { minpars, maxpars })
    }

    pub fn npars(&self) -> usize {
        self.minpars.len()
    }

    /// Parameter indices where `min > max`.
    pub fn inverted_dims(&self) -> Vec<usize> {
        self.minpars
            .iter()
            .zip(&self.maxpars)
            .enumerate()
            .filter(|(_, (lo, hi))| lo > hi)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn check(&self) -> Result<(), CubeError> {
        let dims = self.inverted_dims();
        if dims.is_empty() {
            Ok(())
        } else {
            Err(CubeError::InvalidBounds { dims })
        }
    }

    /// Element-wise `min(lower)` / `max(upper)`; never narrows.
    pub fn widen(&mut self, other: &ParameterBounds) {
        for (lo, o) in self.minpars.iter_mut().zip(&other.minpars) {
            *lo = lo.min(*o);
        }
        for (hi, o) in self.maxpars.iter_mut().zip(&other.maxpars) {
            *hi = hi.max(*o);
        }
    }
}

/// Number of grid cells per parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finesse {
    Uniform(usize),
    PerParameter(Vec<usize>),
}

impl From<usize> for Finesse {
    fn from(value: usize) -> Self {
        Finesse::Uniform(value)
    }
}

impl From<Vec<usize>> for Finesse {
    fn from(value: Vec<usize>) -> Self {
        if value.len() == 1 {
            Finesse::Uniform(value[0])
        } else {
            Finesse::PerParameter(value)
        }
    }
}

impl Finesse {
    /// Broadcast to one cell count per parameter.
    pub fn resolve(&self, npars: usize) -> Result<Vec<usize>, CubeError> {
        let cells = match self {
            Finesse::Uniform(n) => vec![*n; npars],
            Finesse::PerParameter(v) if v.len() == npars => v.clone(),
            Finesse::PerParameter(v) => {
                return Err(CubeError::InvalidShape(format!(
                    "finesse has {} entries for {npars} parameters.",
                    v.len()
                )));
            }
        };
        if cells.iter().any(|&n| n == 0) {
            return Err(CubeError::InvalidInput(
                "finesse must be a positive integer for every parameter.".into(),
            ));
        }
        Ok(cells)
    }
}

/// Per-parameter constraints handed to the fitting step together with the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitLimits {
    pub bounds: ParameterBounds,
    pub fixed: Vec<bool>,
    pub limited_min: Vec<bool>,
    pub limited_max: Vec<bool>,
}

impl FitLimits {
    /// Nothing fixed, both bounds enforced.
    pub fn new(bounds: ParameterBounds) -> Self {
        let n = bounds.npars();
        Self {
            bounds,
            fixed: vec![false; n],
            limited_min: vec![true; n],
            limited_max: vec![true; n],
        }
    }

    pub fn with_fixed(mut self, fixed: Vec<bool>) -> Result<Self, CubeError> {
        self.check_len("fixed", fixed.len())?;
        self.fixed = fixed;
        Ok(self)
    }

    pub fn with_limited(mut self, limited_min: Vec<bool>, limited_max: Vec<bool>) -> Result<Self, CubeError> {
        self.check_len("limited_min", limited_min.len())?;
        self.check_len("limited_max", limited_max.len())?;
        self.limited_min = limited_min;
        self.limited_max = limited_max;
        Ok(self)
    }

    pub fn npars(&self) -> usize {
        self.bounds.npars()
    }

    /// Inverted bounds only matter where both limits are enforced.
    pub fn check(&self) -> Result<(), CubeError> {
        let dims: Vec<usize> = self
            .bounds
            .inverted_dims()
            .into_iter()
            .filter(|&i| self.limited_min[i] && self.limited_max[i] && !self.fixed[i])
            .collect();
        if dims.is_empty() {
            Ok(())
        } else {
            Err(CubeError::InvalidBounds { dims })
        }
    }

    /// Clamp `value` of parameter `i` into its enforced bounds.
    pub fn clamp(&self, i: usize, value: f64) -> f64 {
        let mut v = value;
        if self.limited_min[i] {
            v = v.max(self.bounds.minpars[i]);
        }
        if self.limited_max[i] {
            v = v.min(self.bounds.maxpars[i]);
        }
        v
    }

    fn check_len(&self, what: &str, len: usize) -> Result<(), CubeError> {
        if len != self.npars() {
            return Err(CubeError::InvalidShape(format!(
                "{what} has {len} entries for {} parameters.",
                self.npars()
            )));
        }
        Ok(())
    }
}

/// Generate `n` equally spaced points between `min` and `max` (inclusive).
pub fn lin_space(min: f64, max: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let step = (max - min) / (n as f64 - 1.0);
            (0..n)
                .map(|i| if i == n - 1 { max } else { min + step * i as f64 })
                .collect()
        }
    }
}

/// Grid the parameter space into a `(Π finesse) × P` array.
///
/// With `clip_edges`, each parameter gets `finesse + 2` points of which the two
/// boundary values are dropped; otherwise `finesse` points span the bounds
/// inclusively.
pub fn grid_parspace(
    bounds: &ParameterBounds,
    finesse: &Finesse,
    clip_edges: bool,
) -> Result<Array2<f64>, CubeError> {
    let npars = bounds.npars();
    let cells = finesse.resolve(npars)?;

    let inverted = bounds.inverted_dims();
    if !inverted.is_empty() {
        // Reported, not fatal: the grid is still built and fitting will reject it.
        log::error!(
            "Some of the minimal parameters are larger than the maximal ones \
             (parameter(s) {inverted:?}). Normally this is not supposed to happen."
        );
    }

    log::info!(
        "Binning the {npars}-dimensional parameter space into a {cells:?}-shaped grid"
    );

    let axes: Vec<Vec<f64>> = cells
        .iter()
        .zip(bounds.minpars.iter().zip(&bounds.maxpars))
        .map(|(&n, (&lo, &hi))| {
            if clip_edges {
                let full = lin_space(lo, hi, n + 2);
                full[1..=n].to_vec()
            } else {
                lin_space(lo, hi, n)
            }
        })
        .collect();

    let nguesses = cells
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| CubeError::InvalidInput("Guess grid size overflows.".into()))?;

    // strides[p] = number of grid points spanned by one step of parameter p.
    let mut strides = vec![1usize; npars];
    for p in (0..npars.saturating_sub(1)).rev() {
        strides[p] = strides[p + 1] * cells[p + 1];
    }

    Ok(Array2::from_shape_fn((nguesses, npars), |(g, p)| {
        axes[p][(g / strides[p]) % cells[p]]
    }))
}

/// Candidate parameter vectors plus the limits recorded for fitting.
#[derive(Debug, Clone, PartialEq)]
pub struct GuessGrid {
    values: Array2<f64>,
    limits: FitLimits,
}

impl GuessGrid {
    /// Build a grid over `bounds` with default fit limits.
    pub fn make(bounds: ParameterBounds, finesse: &Finesse, clip_edges: bool) -> Result<Self, CubeError> {
        Self::make_with_limits(FitLimits::new(bounds), finesse, clip_edges)
    }

    pub fn make_with_limits(limits: FitLimits, finesse: &Finesse, clip_edges: bool) -> Result<Self, CubeError> {
        let values = grid_parspace(&limits.bounds, finesse, clip_edges)?;
        Ok(Self { values, limits })
    }

    /// Wrap an existing `G × P` array (e.g. one read back from disk).
    pub fn from_array(values: Array2<f64>, limits: FitLimits) -> Result<Self, CubeError> {
        if values.ncols() != limits.npars() {
            return Err(CubeError::InvalidShape(format!(
                "Guess grid has {} parameters, limits describe {}.",
                values.ncols(),
                limits.npars()
            )));
        }
        Ok(Self { values, limits })
    }

    /// Append a new sub-grid and widen the recorded bounds to cover it.
    ///
    /// On error the grid is left unchanged.
    pub fn expand(&mut self, bounds: &ParameterBounds, finesse: &Finesse, clip_edges: bool) -> Result<(), CubeError> {
        if bounds.npars() != self.npars() {
            return Err(CubeError::InvalidShape(format!(
                "Cannot expand a {}-parameter grid with {}-parameter bounds.",
                self.npars(),
                bounds.npars()
            )));
        }
        let extra = grid_parspace(bounds, finesse, clip_edges)?;
        let values = concatenate(Axis(0), &[self.values.view(), extra.view()])
            .map_err(|e| CubeError::InvalidShape(format!("Cannot append guesses: {e}")))?;

        self.values = values;
        self.limits.bounds.widen(bounds);
        log::info!("Guess grid expanded to {} guesses", self.len());
        Ok(())
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn guess(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    pub fn npars(&self) -> usize {
        self.values.ncols()
    }

    pub fn limits(&self) -> &FitLimits {
        &self.limits
    }

    pub fn bounds(&self) -> &ParameterBounds {
        &self.limits.bounds
    }
}
