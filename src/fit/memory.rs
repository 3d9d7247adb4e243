//! Memory budgeting for residual computation.
//!
//! Broadcasting every model against the whole cube is by far the fastest way
//! to compute residuals, but it materialises `G × C × Y × X` values. The
//! budget decides up front which residual tier can run:
//!
//! 1. broadcast, when `cube_bytes × G × overhead` fits in memory
//! 2. per-pixel, when it does not but a `G × C` temporary still fits
//! 3. nested (pixel × model), for out-of-core model grids or when even the
//!    per-pixel temporary is too large

use serde::{Deserialize, Serialize};
use sysinfo::System;

const GIB: f64 = (1u64 << 30) as f64;

/// Multiplier on the estimated broadcast footprint (50% computational overhead).
pub const DEFAULT_OVERHEAD: f64 = 2.0;

/// Budget assumed when free memory cannot be queried.
pub const FALLBACK_MEMORY_BYTES: u64 = 8 << 30;

/// How residuals between the cube and the model grid are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ResidualStrategy {
    /// Every (model, y, x) residual in one vectorised pass.
    Broadcast,
    /// One pixel at a time, vectorised across models.
    PerPixel,
    /// One (pixel, model) pair at a time.
    Nested,
}

impl ResidualStrategy {
    pub fn display_name(self) -> &'static str {
        match self {
            ResidualStrategy::Broadcast => "broadcast",
            ResidualStrategy::PerPixel => "per-pixel",
            ResidualStrategy::Nested => "nested",
        }
    }
}

/// Where the budget figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetSource {
    /// Explicit limit from the caller or environment.
    Limit,
    /// Available memory reported by the OS.
    System,
    /// Query failed; conservative default.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBudget {
    pub available_bytes: u64,
    pub source: BudgetSource,
}

impl MemoryBudget {
    pub fn from_limit_gb(gb: f64) -> Self {
        Self {
            available_bytes: (gb.max(0.0) * GIB) as u64,
            source: BudgetSource::Limit,
        }
    }

    /// Use the explicit limit when given, otherwise ask the OS.
    pub fn resolve(limit_gb: Option<f64>) -> Self {
        match limit_gb {
            Some(gb) => Self::from_limit_gb(gb),
            None => Self::detect(),
        }
    }

    /// Query available memory, falling back to [`FALLBACK_MEMORY_BYTES`].
    pub fn detect() -> Self {
        Self::from_query(query_available_memory())
    }

    /// Budget from a memory query result; `None` means the query failed.
    pub fn from_query(available: Option<u64>) -> Self {
        match available {
            Some(bytes) => Self {
                available_bytes: bytes,
                source: BudgetSource::System,
            },
            None => {
                log::warn!(
                    "Can't get the free RAM size, assuming {} GB",
                    FALLBACK_MEMORY_BYTES >> 30
                );
                Self {
                    available_bytes: FALLBACK_MEMORY_BYTES,
                    source: BudgetSource::Fallback,
                }
            }
        }
    }

    pub fn available_gb(&self) -> f64 {
        self.available_bytes as f64 / GIB
    }
}

/// Available memory in bytes, if the platform reports it.
pub fn query_available_memory() -> Option<u64> {
    let mut sys = System::new();
    sys.refresh_memory();
    Some(sys.available_memory()).filter(|&b| b > 0)
}

/// Estimated bytes needed to broadcast `n_models` against the cube.
pub fn broadcast_footprint(cube_bytes: u64, n_models: usize, overhead: f64) -> f64 {
    cube_bytes as f64 * n_models as f64 * overhead
}

/// Estimated bytes of the `G × C` temporary used by the per-pixel tier.
pub fn per_pixel_footprint(n_models: usize, n_channels: usize, overhead: f64) -> f64 {
    (n_models * n_channels * std::mem::size_of::<f64>()) as f64 * overhead
}

/// Pick the fastest tier that fits the budget.
pub fn choose_strategy(
    cube_bytes: u64,
    n_models: usize,
    n_channels: usize,
    out_of_core: bool,
    budget: &MemoryBudget,
    overhead: f64,
) -> ResidualStrategy {
    let available = budget.available_bytes as f64;
    if available >= broadcast_footprint(cube_bytes, n_models, overhead) {
        return ResidualStrategy::Broadcast;
    }
    log::warn!(
        "The available free memory ({:.2} GB) might not be enough for broadcasting \
         the model grid to the spectral cube. Will iterate over all the XY pairs instead.",
        budget.available_gb()
    );
    if out_of_core || available < per_pixel_footprint(n_models, n_channels, overhead) {
        log::warn!(
            "Not enough memory to broadcast the model grid to a single pixel either \
             (or the grid is out of core). Falling back to one residual at a time; \
             the running time will be long."
        );
        return ResidualStrategy::Nested;
    }
    ResidualStrategy::PerPixel
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(bytes: u64) -> MemoryBudget {
        MemoryBudget {
            available_bytes: bytes,
            source: BudgetSource::Limit,
        }
    }

    #[test]
    fn broadcast_when_budget_suffices() {
        // 30×5×5 cube = 6000 bytes, 27 models, ×2 overhead = 324_000 bytes.
        let s = choose_strategy(6000, 27, 30, false, &budget(324_000), DEFAULT_OVERHEAD);
        assert_eq!(s, ResidualStrategy::Broadcast);
    }

    #[test]
    fn per_pixel_when_broadcast_does_not_fit() {
        let s = choose_strategy(6000, 27, 30, false, &budget(323_999), DEFAULT_OVERHEAD);
        assert_eq!(s, ResidualStrategy::PerPixel);
    }

    #[test]
    fn nested_for_out_of_core_or_tiny_budgets() {
        let s = choose_strategy(6000, 27, 30, true, &budget(100_000), DEFAULT_OVERHEAD);
        assert_eq!(s, ResidualStrategy::Nested);
        let s = choose_strategy(6000, 27, 30, false, &budget(1_000), DEFAULT_OVERHEAD);
        assert_eq!(s, ResidualStrategy::Nested);
    }

    #[test]
    fn overhead_is_tunable() {
        let s = choose_strategy(6000, 27, 30, false, &budget(200_000), 1.0);
        assert_eq!(s, ResidualStrategy::Broadcast);
    }

    #[test]
    fn explicit_limit_wins() {
        let b = MemoryBudget::resolve(Some(0.5));
        assert_eq!(b.source, BudgetSource::Limit);
        assert_eq!(b.available_bytes, 1 << 29);
    }

    #[test]
    fn failed_query_assumes_eight_gib() {
        let b = MemoryBudget::from_query(None);
        assert_eq!(b.source, BudgetSource::Fallback);
        assert_eq!(b.available_bytes, 8 << 30);
        assert_eq!(b.available_gb(), 8.0);

        let b = MemoryBudget::from_query(Some(1 << 20));
        assert_eq!(b.source, BudgetSource::System);
        assert_eq!(b.available_bytes, 1 << 20);
    }

    #[test]
    fn fallback_budget_still_picks_a_tier() {
        let b = MemoryBudget::from_query(None);
        let s = choose_strategy(6000, 27, 30, false, &b, DEFAULT_OVERHEAD);
        assert_eq!(s, ResidualStrategy::Broadcast);
    }

    #[test]
    fn detect_never_reports_zero() {
        assert!(MemoryBudget::detect().available_bytes > 0);
    }
}
