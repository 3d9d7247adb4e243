//! Input/output helpers.
//!
//! - `.npy` array read/write and memory mapping (`npy`)
//! - cube files with a JSON header (`header`)
//! - JSON run reports (`export`)

pub mod export;
pub mod header;
pub mod npy;

pub use export::*;
pub use header::*;
pub use npy::*;
