//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - spectral units, velocity conventions and the spectral axis (`types`)
//! - header cards (`CubeHeader`)
//! - the spectral cube itself (`cube`)

pub mod cube;
pub mod types;

pub use cube::*;
pub use types::*;
