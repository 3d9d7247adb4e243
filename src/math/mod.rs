//! Numerical helpers: SVD least squares for the pixel fitter.

pub mod ols;

pub use ols::*;
