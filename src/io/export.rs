//! JSON reports for selection and fitting runs.
//!
//! Reports are meant to be easy to consume from downstream scripts: the
//! per-pixel arrays go to `.npy` files next to them, the report itself carries
//! the summary numbers and the chosen guesses.

use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::Serialize;

use crate::error::CubeError;
use crate::fit::{CubeFit, OverallBest, PeakSnrBest, ResidualStrategy, Selection};

const TOOL: &str = "multicube";

#[derive(Debug, Clone, Serialize)]
pub struct SelectionReport {
    pub tool: String,
    pub generated_at: DateTime<Utc>,
    pub model: String,
    /// `[channels, y, x]`
    pub cube_shape: [usize; 3],
    pub n_guesses: usize,
    pub strategy: ResidualStrategy,
    pub sn_cut: Option<f64>,
    pub unmasked_pixels: usize,
    pub selected_pixels: usize,
    pub overall_best: Option<OverallBest>,
    pub best_at_peak_snr: Option<PeakSnrBest>,
    pub low_confidence: bool,
    /// Row-major `Y × X` map, `null` where nothing was selected.
    pub best_model_index: Vec<Vec<Option<usize>>>,
}

impl SelectionReport {
    pub fn new(
        model: &str,
        cube_shape: [usize; 3],
        n_guesses: usize,
        sn_cut: Option<f64>,
        selection: &Selection,
    ) -> Self {
        Self {
            tool: TOOL.to_string(),
            generated_at: Utc::now(),
            model: model.to_string(),
            cube_shape,
            n_guesses,
            strategy: selection.strategy,
            sn_cut,
            unmasked_pixels: selection.unmasked_pixels,
            selected_pixels: selection.selected_pixels(),
            overall_best: selection.overall_best.clone(),
            best_at_peak_snr: selection.best_at_peak_snr.clone(),
            low_confidence: selection.low_confidence,
            best_model_index: rows(&selection.best_model_index),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub tool: String,
    pub generated_at: DateTime<Utc>,
    pub model: String,
    pub parameter_names: Vec<String>,
    pub fitted_pixels: usize,
    pub failed_pixels: usize,
    pub dof: usize,
    pub bad_fit_cut: f64,
    pub bad_fits: usize,
    /// Median chi-squared over defined pixels.
    pub median_chi_squared: Option<f64>,
}

impl FitReport {
    pub fn new(
        model: &str,
        parameter_names: Vec<String>,
        fit: &CubeFit,
        dof: usize,
        chi_squared: &Array2<f64>,
        bad_fit_cut: f64,
        bad_fits: &Array2<bool>,
    ) -> Self {
        Self {
            tool: TOOL.to_string(),
            generated_at: Utc::now(),
            model: model.to_string(),
            parameter_names,
            fitted_pixels: fit.fitted_pixels,
            failed_pixels: fit.failed_pixels,
            dof,
            bad_fit_cut,
            bad_fits: bad_fits.iter().filter(|&&b| b).count(),
            median_chi_squared: median(chi_squared.iter().copied().filter(|v| v.is_finite()).collect()),
        }
    }
}

/// Write any report as pretty JSON.
pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<(), CubeError> {
    let file = File::create(path).map_err(|e| CubeError::io(path, e))?;
    serde_json::to_writer_pretty(file, report)?;
    log::info!("Wrote report to {}", path.display());
    Ok(())
}

fn rows<T: Clone>(map: &Array2<T>) -> Vec<Vec<T>> {
    map.outer_iter().map(|row| row.to_vec()).collect()
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}
