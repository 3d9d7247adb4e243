//! Model synthesis: one spectrum per guess-grid entry.
//!
//! Accepted guess layouts (last axis always holds the parameters):
//!
//! - `(P,)`: a single parameter vector, giving a 1 × C model grid
//! - `(G, P)`: G parameter vectors, giving a G × C model grid
//! - `(Y, X, P)` / `(N, Y, X, P)`: spatial guess grids. These are validated
//!   against the cube but not implemented yet.

use std::path::PathBuf;

use ndarray::{Array2, ArrayView2, ArrayViewD, Axis, Ix2};

use crate::error::CubeError;
use crate::models::SpectralModel;
use crate::progress::ProgressSink;

#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    /// Write the grid to this `.npy` file instead of returning it.
    pub to_file: Option<PathBuf>,
    /// When `false` and `to_file` already exists, skip synthesis entirely.
    pub redo: bool,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            to_file: None,
            redo: true,
        }
    }
}

#[derive(Debug)]
pub enum SynthesisOutcome {
    Generated(Array2<f64>),
    Written(PathBuf),
    /// A persisted grid was already in place.
    Skipped(PathBuf),
}

/// Evaluate `model` for every guess.
pub fn generate_model(
    guesses: ArrayViewD<'_, f64>,
    model: &dyn SpectralModel,
    xarr: &[f64],
    spatial_shape: (usize, usize),
    opts: &SynthesisOptions,
    progress: &mut dyn ProgressSink,
) -> Result<SynthesisOutcome, CubeError> {
    if let Some(path) = opts.to_file.as_ref().filter(|p| !opts.redo && p.is_file()) {
        log::info!(
            "A file with generated models is already in place ({}). Skipping.",
            path.display()
        );
        return Ok(SynthesisOutcome::Skipped(path.clone()));
    }

    let grid = guess_rows(guesses, model.npars(), spatial_shape)?;
    let (n_models, n_channels) = (grid.nrows(), xarr.len());

    log::info!(
        "Generating {n_models} '{}' spectral models from the guess grid",
        model.name()
    );
    progress.start("Generating spectral models", n_models as u64);

    let mut flat = vec![0.0; n_models * n_channels];
    for (pars, out) in grid.outer_iter().zip(flat.chunks_exact_mut(n_channels.max(1))) {
        let pars = pars.to_vec();
        model.full_model_into(xarr, &pars, out)?;
        progress.advance(1);
    }
    progress.finish();

    let models = Array2::from_shape_vec((n_models, n_channels), flat)
        .map_err(|e| CubeError::InvalidShape(format!("Model grid: {e}")))?;

    match &opts.to_file {
        Some(path) => {
            crate::io::npy::save_array(path, models.view())?;
            Ok(SynthesisOutcome::Written(path.clone()))
        }
        None => Ok(SynthesisOutcome::Generated(models)),
    }
}

/// Validate a guess array and view it as `G × P`.
fn guess_rows<'a>(
    guesses: ArrayViewD<'a, f64>,
    npars: usize,
    spatial_shape: (usize, usize),
) -> Result<ArrayView2<'a, f64>, CubeError> {
    let shape = guesses.shape().to_vec();
    let ndim = shape.len();
    let Some(&trailing) = shape.last() else {
        return Err(CubeError::InvalidShape("Guess grid is a scalar.".into()));
    };
    if ndim > 4 || npars == 0 || trailing == 0 || trailing % npars != 0 {
        return Err(CubeError::InvalidShape(format!(
            "Guess grid of shape {shape:?} does not hold parameter vectors for a \
             {npars}-parameter model."
        )));
    }
    if ndim >= 3 {
        let spatial = (shape[ndim - 3], shape[ndim - 2]);
        if spatial != spatial_shape {
            return Err(CubeError::InvalidShape(format!(
                "Spatial guess grid {spatial:?} does not match the cube's {spatial_shape:?}."
            )));
        }
        return Err(CubeError::NotSupported(
            "spatially varying guess grids (Y × X × P, N × Y × X × P).".into(),
        ));
    }

    let rows = if ndim == 1 {
        guesses.insert_axis(Axis(0))
    } else {
        guesses
    };
    rows.into_dimensionality::<Ix2>()
        .map_err(|e| CubeError::InvalidShape(format!("Guess grid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelKind;
    use crate::progress::NoProgress;
    use crate::progress::testing::RecordingProgress;
    use ndarray::{Array3, Array4, array};

    fn xarr() -> Vec<f64> {
        (0..30).map(|i| i as f64 * 0.1).collect()
    }

    fn generated(outcome: SynthesisOutcome) -> Array2<f64> {
        match outcome {
            SynthesisOutcome::Generated(m) => m,
            other => panic!("expected in-memory grid, got {other:?}"),
        }
    }

    #[test]
    fn grid_of_guesses_gives_one_spectrum_each() {
        let guesses = array![[1.0, 1.0, 0.3], [2.0, 2.0, 0.5]];
        let mut progress = RecordingProgress::default();
        let models = generated(
            generate_model(
                guesses.view().into_dyn(),
                &ModelKind::Gaussian,
                &xarr(),
                (5, 5),
                &SynthesisOptions::default(),
                &mut progress,
            )
            .unwrap(),
        );
        assert_eq!(models.dim(), (2, 30));
        assert!((models[[1, 20]] - 2.0).abs() < 1e-12);
        assert_eq!(progress.advanced, 2);
        assert_eq!(progress.finished, 1);
    }

    #[test]
    fn single_vector_gives_single_spectrum() {
        let guess = array![1.0, 1.0, 0.3];
        let models = generated(
            generate_model(
                guess.view().into_dyn(),
                &ModelKind::Gaussian,
                &xarr(),
                (5, 5),
                &SynthesisOptions::default(),
                &mut NoProgress,
            )
            .unwrap(),
        );
        assert_eq!(models.dim(), (1, 30));
    }

    #[test]
    fn parameter_count_must_divide_trailing_axis() {
        let guesses = array![[1.0, 1.0], [2.0, 2.0]];
        let err = generate_model(
            guesses.view().into_dyn(),
            &ModelKind::Gaussian,
            &xarr(),
            (5, 5),
            &SynthesisOptions::default(),
            &mut NoProgress,
        )
        .unwrap_err();
        assert!(matches!(err, CubeError::InvalidShape(_)));
    }

    #[test]
    fn spatial_guess_grids_are_checked_then_unsupported() {
        let matching = Array3::<f64>::zeros((5, 5, 3));
        let err = generate_model(
            matching.view().into_dyn(),
            &ModelKind::Gaussian,
            &xarr(),
            (5, 5),
            &SynthesisOptions::default(),
            &mut NoProgress,
        )
        .unwrap_err();
        assert!(matches!(err, CubeError::NotSupported(_)));

        let mismatched = Array4::<f64>::zeros((2, 4, 5, 3));
        let err = generate_model(
            mismatched.view().into_dyn(),
            &ModelKind::Gaussian,
            &xarr(),
            (5, 5),
            &SynthesisOptions::default(),
            &mut NoProgress,
        )
        .unwrap_err();
        assert!(matches!(err, CubeError::InvalidShape(_)));
    }

    #[test]
    fn persisted_grid_is_skipped_unless_redo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.npy");
        let guesses = array![[1.0, 1.0, 0.3]];
        let opts = SynthesisOptions {
            to_file: Some(path.clone()),
            redo: false,
        };

        let first = generate_model(
            guesses.view().into_dyn(),
            &ModelKind::Gaussian,
            &xarr(),
            (5, 5),
            &opts,
            &mut NoProgress,
        )
        .unwrap();
        assert!(matches!(first, SynthesisOutcome::Written(_)));

        let mut progress = RecordingProgress::default();
        let second = generate_model(
            guesses.view().into_dyn(),
            &ModelKind::Gaussian,
            &xarr(),
            (5, 5),
            &opts,
            &mut progress,
        )
        .unwrap();
        assert!(matches!(second, SynthesisOutcome::Skipped(_)));
        assert!(progress.started.is_empty());
    }
}
