//! `multicube` library crate.
//!
//! Grid-based initial guesses for fitting spectral cubes: build a grid of
//! parameter vectors, synthesize a model spectrum for each, pick the
//! minimum-residual model per pixel under a memory budget, then fit and score.
//!
//! The binary (`multicube`) is a thin wrapper around this library so that the
//! pipeline stays testable without spawning processes.

pub mod app;
pub mod cli;
pub mod domain;
pub mod error;
pub mod fit;
pub mod grid;
pub mod io;
pub mod math;
pub mod models;
pub mod progress;
pub mod report;
pub mod session;
pub mod signal;
