//! Spectral line models.
//!
//! Models are small, pure evaluators so that grid synthesis, fitting and
//! goodness-of-fit code can stay generic over them.

pub mod model;

pub use model::*;
