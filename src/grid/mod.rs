//! Guess-space exploration.
//!
//! Responsibilities:
//!
//! - build guess grids from parameter bounds and finesse (`guess`)
//! - synthesize a model spectrum for every guess (`synth`)
//! - hold model grids in memory or memory-mapped from disk (`models`)

pub mod guess;
pub mod models;
pub mod synth;

pub use guess::*;
pub use models::*;
pub use synth::*;
