//! Best-guess selection and per-pixel fitting.
//!
//! Responsibilities:
//!
//! - pick a residual strategy from the memory budget (`memory`)
//! - compute per-pixel residual minima with three interchangeable tiers (`residuals`)
//! - summarise winners into best guesses (`selection`)
//! - run the per-pixel nonlinear fit from those guesses (`fitter`)

pub mod fitter;
pub mod memory;
pub mod residuals;
pub mod selection;

pub use fitter::*;
pub use memory::*;
pub use residuals::*;
pub use selection::*;
