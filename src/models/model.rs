//! Spectral model evaluation.
//!
//! The selection pipeline never needs to know what a model *is*; it only needs
//! "parameter vector → spectrum". That capability is the [`SpectralModel`]
//! trait. Built-in line profiles are provided by [`ModelKind`], and any closure
//! can be wrapped with [`FnModel`].
//!
//! A parameter vector may hold several components back to back: a vector of
//! length `k * npars()` evaluates as the sum of `k` profiles.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::CubeError;

pub trait SpectralModel: Send + Sync {
    fn name(&self) -> &str;

    /// Number of parameters of a single component.
    fn npars(&self) -> usize;

    /// Add one component (`pars.len() == npars()`) evaluated on `xarr` into `out`.
    fn add_component(&self, xarr: &[f64], pars: &[f64], out: &mut [f64]);

    fn parameter_names(&self) -> Vec<String> {
        (0..self.npars()).map(|i| format!("p{i}")).collect()
    }

    /// Evaluate a (possibly multi-component) parameter vector into `out`.
    fn full_model_into(&self, xarr: &[f64], pars: &[f64], out: &mut [f64]) -> Result<(), CubeError> {
        let npars = self.npars();
        if npars == 0 || pars.is_empty() || pars.len() % npars != 0 {
            return Err(CubeError::InvalidShape(format!(
                "Parameter vector of length {} does not fit model '{}' with {npars} parameters.",
                pars.len(),
                self.name()
            )));
        }
        if out.len() != xarr.len() {
            return Err(CubeError::InvalidShape(format!(
                "Output buffer has {} channels, spectral axis has {}.",
                out.len(),
                xarr.len()
            )));
        }
        out.iter_mut().for_each(|v| *v = 0.0);
        for component in pars.chunks_exact(npars) {
            self.add_component(xarr, component, out);
        }
        Ok(())
    }

    fn full_model(&self, xarr: &[f64], pars: &[f64]) -> Result<Vec<f64>, CubeError> {
        let mut out = vec![0.0; xarr.len()];
        self.full_model_into(xarr, pars, &mut out)?;
        Ok(out)
    }
}

/// Built-in line profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// `amplitude * exp(-(x - shift)^2 / (2 width^2))`
    Gaussian,
    /// `amplitude * width^2 / ((x - shift)^2 + width^2)`
    Lorentzian,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Gaussian, ModelKind::Lorentzian];

    /// Look up a model by name, listing the valid names on failure.
    pub fn from_name(name: &str) -> Result<Self, CubeError> {
        let lowered = name.to_ascii_lowercase();
        ModelKind::ALL
            .into_iter()
            .find(|k| k.display_name() == lowered)
            .ok_or_else(|| {
                let known: Vec<&str> = ModelKind::ALL.iter().map(|k| k.display_name()).collect();
                CubeError::InvalidInput(format!(
                    "Unsupported fit type: {name}. Choose one from {known:?}."
                ))
            })
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ModelKind::Gaussian => "gaussian",
            ModelKind::Lorentzian => "lorentzian",
        }
    }
}

impl SpectralModel for ModelKind {
    fn name(&self) -> &str {
        self.display_name()
    }

    fn npars(&self) -> usize {
        3
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["amplitude".into(), "shift".into(), "width".into()]
    }

    fn add_component(&self, xarr: &[f64], pars: &[f64], out: &mut [f64]) {
        let (amp, shift, width) = (pars[0], pars[1], pars[2]);
        match self {
            ModelKind::Gaussian => {
                let denom = 2.0 * width * width;
                for (o, &x) in out.iter_mut().zip(xarr) {
                    let dx = x - shift;
                    *o += amp * (-(dx * dx) / denom).exp();
                }
            }
            ModelKind::Lorentzian => {
                let w2 = width * width;
                for (o, &x) in out.iter_mut().zip(xarr) {
                    let dx = x - shift;
                    *o += amp * w2 / (dx * dx + w2);
                }
            }
        }
    }
}

/// A model backed by a closure `(xarr, pars, out)` that adds one component to `out`.
pub struct FnModel<F> {
    name: String,
    npars: usize,
    f: F,
}

impl<F> FnModel<F>
where
    F: Fn(&[f64], &[f64], &mut [f64]) + Send + Sync,
{
    pub fn new(name: impl Into<String>, npars: usize, f: F) -> Self {
        Self {
            name: name.into(),
            npars,
            f,
        }
    }
}

impl<F> SpectralModel for FnModel<F>
where
    F: Fn(&[f64], &[f64], &mut [f64]) + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn npars(&self) -> usize {
        self.npars
    }

    fn add_component(&self, xarr: &[f64], pars: &[f64], out: &mut [f64]) {
        (self.f)(xarr, pars, out)
    }
}
