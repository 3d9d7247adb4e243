//! Reporting utilities: goodness of fit and formatted terminal output.

pub mod format;
pub mod goodness;

pub use format::*;
pub use goodness::*;
