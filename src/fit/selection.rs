//! Best-guess selection over a model grid.
//!
//! For every spatial pixel the selector picks the model with the smallest
//! residual RMS, then summarises the per-pixel winners:
//!
//! - `best_guesses`: the winning parameter vector per pixel (P × Y × X)
//! - overall best: the model selected most often among unmasked pixels
//! - best at peak SNR: the model selected at the highest-SNR pixel
//!
//! Selection rules:
//! 1. Pixels with `snr <= sn_cut` are excluded and stay undefined.
//! 2. Minimum residual wins; ties go to the lowest grid index.
//! 3. The overall mode breaks ties by lowest grid index as well.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3};
use serde::Serialize;

use crate::error::CubeError;
use crate::fit::memory::{DEFAULT_OVERHEAD, MemoryBudget, ResidualStrategy, choose_strategy};
use crate::fit::residuals::{ResidualPick, compute_residuals};
use crate::grid::{GuessGrid, ModelGrid};
use crate::progress::{DEFAULT_PROGRESS_INCREMENT, ProgressSink};

/// Below this share of unmasked pixels the overall best is flagged as unreliable.
pub const LOW_CONFIDENCE_FRACTION: f64 = 0.05;

pub const ENV_MEMORY_LIMIT_GB: &str = "MULTICUBE_MEMORY_LIMIT_GB";
pub const ENV_MEMORY_OVERHEAD: &str = "MULTICUBE_MEMORY_OVERHEAD";
pub const ENV_PROGRESS_INC: &str = "MULTICUBE_PROGRESS_INC";

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOptions {
    /// Keep only pixels with `snr > sn_cut`.
    pub sn_cut: Option<f64>,
    /// Memory budget override in GB; queried from the OS when unset.
    pub memory_limit_gb: Option<f64>,
    /// Multiplier on the broadcast footprint estimate.
    pub overhead: f64,
    pub progress_increment: u64,
    /// Force a residual tier instead of picking one from the budget.
    pub strategy: Option<ResidualStrategy>,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            sn_cut: None,
            memory_limit_gb: None,
            overhead: DEFAULT_OVERHEAD,
            progress_increment: DEFAULT_PROGRESS_INCREMENT,
            strategy: None,
        }
    }
}

impl SelectionOptions {
    /// Defaults overridden by the environment (a `.env` file is honoured).
    pub fn from_env() -> Result<Self, CubeError> {
        dotenvy::dotenv().ok();
        let mut opts = Self::default();
        if let Some(gb) = env_number(ENV_MEMORY_LIMIT_GB)? {
            opts.memory_limit_gb = Some(gb);
        }
        if let Some(overhead) = env_number(ENV_MEMORY_OVERHEAD)? {
            opts.overhead = overhead;
        }
        if let Some(inc) = env_number(ENV_PROGRESS_INC)? {
            opts.progress_increment = inc.max(1.0) as u64;
        }
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<(), CubeError> {
        if !(self.overhead.is_finite() && self.overhead > 0.0) {
            return Err(CubeError::InvalidInput(format!(
                "Memory overhead must be a positive number, got {}.",
                self.overhead
            )));
        }
        if let Some(gb) = self.memory_limit_gb {
            if !(gb.is_finite() && gb >= 0.0) {
                return Err(CubeError::InvalidInput(format!(
                    "Memory limit must be a non-negative number of GB, got {gb}."
                )));
            }
        }
        if self.sn_cut.is_some_and(f64::is_nan) {
            return Err(CubeError::InvalidInput("SNR cut is NaN.".into()));
        }
        Ok(())
    }
}

fn env_number(key: &str) -> Result<Option<f64>, CubeError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| CubeError::InvalidInput(format!("{key}={raw} is not a number."))),
        Err(_) => Ok(None),
    }
}

/// Most frequently selected model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallBest {
    pub index: usize,
    pub guess: Vec<f64>,
    /// Pixels that selected this model.
    pub count: usize,
    /// `count` over the number of unmasked pixels.
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakSnrBest {
    pub index: usize,
    /// `(y, x)` of the highest-SNR pixel.
    pub pixel: (usize, usize),
    pub guess: Vec<f64>,
    pub snr: f64,
}

/// Output of one selection pass.
#[derive(Debug, Clone)]
pub struct Selection {
    pub strategy: ResidualStrategy,
    pub best_model_index: Array2<Option<usize>>,
    pub min_residual: Array2<f64>,
    /// P × Y × X, NaN where no model was selected.
    pub best_guesses: Array3<f64>,
    pub overall_best: Option<OverallBest>,
    pub best_at_peak_snr: Option<PeakSnrBest>,
    /// The overall best covers less than [`LOW_CONFIDENCE_FRACTION`] of unmasked pixels.
    pub low_confidence: bool,
    pub unmasked_pixels: usize,
}

impl Selection {
    pub fn selected_pixels(&self) -> usize {
        self.best_model_index.iter().filter(|b| b.is_some()).count()
    }
}

/// Select the minimum-residual guess for every pixel of `cube` (C × Y × X).
pub fn select_best_guess(
    cube: ArrayView3<'_, f64>,
    guesses: &GuessGrid,
    models: &ModelGrid,
    snr_map: Option<ArrayView2<'_, f64>>,
    opts: &SelectionOptions,
    progress: &mut dyn ProgressSink,
) -> Result<Selection, CubeError> {
    opts.validate()?;
    let model_view = models.view()?;
    let (n_models, n_channels) = model_view.dim();
    let (cube_channels, ny, nx) = cube.dim();

    if n_models != guesses.len() {
        return Err(CubeError::InvalidShape(format!(
            "Model grid holds {n_models} models but the guess grid has {} entries.",
            guesses.len()
        )));
    }
    if n_channels != cube_channels {
        return Err(CubeError::InvalidShape(format!(
            "Model grid has {n_channels} channels but the cube has {cube_channels}."
        )));
    }
    if let Some(snr) = snr_map {
        if snr.dim() != (ny, nx) {
            return Err(CubeError::InvalidShape(format!(
                "SNR map {:?} does not match the cube's spatial shape {:?}.",
                snr.dim(),
                (ny, nx)
            )));
        }
    }

    let mask = match (opts.sn_cut, snr_map) {
        (Some(cut), Some(snr)) => Some(snr.mapv(|s| s > cut)),
        (Some(_), None) => {
            return Err(CubeError::Precondition(
                "An SNR cut needs an SNR map; run get_snr_map() first.".into(),
            ));
        }
        (None, _) => None,
    };
    let unmasked_pixels = mask
        .as_ref()
        .map_or(ny * nx, |m| m.iter().filter(|&&keep| keep).count());

    log::info!("Calculating residuals for {n_models} generated models . . .");
    let strategy = match opts.strategy {
        Some(forced) => forced,
        None => {
            let budget = MemoryBudget::resolve(opts.memory_limit_gb);
            let cube_bytes = (cube.len() * std::mem::size_of::<f64>()) as u64;
            choose_strategy(
                cube_bytes,
                n_models,
                n_channels,
                models.is_out_of_core(),
                &budget,
                opts.overhead,
            )
        }
    };

    let mask_view = mask.as_ref().map(|m| m.view());
    let (strategy, pick) = run_with_fallback(strategy, |tier| {
        compute_residuals(tier, cube, model_view, mask_view, progress)
    })?;
    log::info!("Residuals computed with the {} strategy", strategy.display_name());

    Ok(summarise(strategy, pick, guesses, snr_map, unmasked_pixels))
}

/// Run `strategy`, dropping to the per-pixel tier if broadcasting runs out of memory.
fn run_with_fallback<F>(
    strategy: ResidualStrategy,
    mut run: F,
) -> Result<(ResidualStrategy, ResidualPick), CubeError>
where
    F: FnMut(ResidualStrategy) -> Result<ResidualPick, CubeError>,
{
    match run(strategy) {
        Err(CubeError::ResourceExhausted(reason)) if strategy == ResidualStrategy::Broadcast => {
            log::warn!("Broadcasting failed ({reason}); iterating over the XY pairs instead.");
            let pick = run(ResidualStrategy::PerPixel)?;
            Ok((ResidualStrategy::PerPixel, pick))
        }
        other => Ok((strategy, other?)),
    }
}

fn summarise(
    strategy: ResidualStrategy,
    pick: ResidualPick,
    guesses: &GuessGrid,
    snr_map: Option<ArrayView2<'_, f64>>,
    unmasked_pixels: usize,
) -> Selection {
    let (ny, nx) = pick.best.dim();
    let npars = guesses.npars();

    let mut best_guesses = Array3::from_elem((npars, ny, nx), f64::NAN);
    for ((y, x), best) in pick.best.indexed_iter() {
        if let Some(g) = *best {
            for (p, &v) in guesses.guess(g).iter().enumerate() {
                best_guesses[[p, y, x]] = v;
            }
        }
    }

    let overall_best = model_mode(&pick.best, guesses.len()).map(|(index, count)| OverallBest {
        index,
        guess: guesses.guess(index).to_vec(),
        count,
        fraction: count as f64 / unmasked_pixels.max(1) as f64,
    });
    let mut low_confidence = false;
    match &overall_best {
        Some(best) => {
            if best.fraction < LOW_CONFIDENCE_FRACTION {
                low_confidence = true;
                log::warn!(
                    "Selected model is best only for less than 5% of the cube \
                     ({:.1}%), consider using the map of guesses.",
                    best.fraction * 100.0
                );
            }
            log::info!(
                "Overall best model: selected #{} {}",
                best.index,
                format_guess(&best.guess)
            );
        }
        None => log::warn!("No pixel passed selection; there is no overall best model."),
    }

    let best_at_peak_snr = match snr_map {
        Some(snr) => peak_snr_best(&pick.best, snr, guesses),
        None => {
            log::warn!(
                "Can't find the SNR map, best guess at highest SNR pixel will not be stored."
            );
            None
        }
    };
    if let Some(peak) = &best_at_peak_snr {
        log::info!(
            "Best model @ highest SNR: #{} {}",
            peak.index,
            format_guess(&peak.guess)
        );
    }

    Selection {
        strategy,
        best_model_index: pick.best,
        min_residual: pick.min,
        best_guesses,
        overall_best,
        best_at_peak_snr,
        low_confidence,
        unmasked_pixels,
    }
}

/// Most frequent defined index with its count; ties go to the lowest index.
fn model_mode(best: &Array2<Option<usize>>, n_models: usize) -> Option<(usize, usize)> {
    let mut counts = vec![0usize; n_models];
    for &g in best.iter().flatten() {
        counts[g] += 1;
    }
    let mut mode: Option<(usize, usize)> = None;
    for (index, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        match mode {
            Some((_, c)) if count <= c => {}
            _ => mode = Some((index, count)),
        }
    }
    mode
}

fn peak_snr_best(
    best: &Array2<Option<usize>>,
    snr: ArrayView2<'_, f64>,
    guesses: &GuessGrid,
) -> Option<PeakSnrBest> {
    let mut peak: Option<((usize, usize), f64)> = None;
    for (pixel, &s) in snr.indexed_iter() {
        if s.is_nan() {
            continue;
        }
        match peak {
            Some((_, p)) if s <= p => {}
            _ => peak = Some((pixel, s)),
        }
    }
    let (pixel, peak_snr) = peak?;
    let index = best[[pixel.0, pixel.1]]?;
    Some(PeakSnrBest {
        index,
        pixel,
        guess: guesses.guess(index).to_vec(),
        snr: peak_snr,
    })
}

fn format_guess(guess: &[f64]) -> String {
    let parts: Vec<String> = guess.iter().map(|v| format!("{v:.2}")).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{Finesse, LoadMode, ParameterBounds};
    use crate::models::{ModelKind, SpectralModel};
    use crate::progress::NoProgress;
    use ndarray::Array3;

    fn xarr() -> Vec<f64> {
        (0..30).map(|i| -3.0 + i as f64 * 0.2).collect()
    }

    fn grids() -> (GuessGrid, Array2<f64>) {
        let bounds = ParameterBounds::new(vec![0.1, -1.0, 0.1], vec![2.0, 1.0, 2.0]).unwrap();
        let guesses = GuessGrid::make(bounds, &Finesse::Uniform(3), true).unwrap();
        let xs = xarr();
        let mut models = Array2::zeros((guesses.len(), xs.len()));
        for (g, mut row) in models.outer_iter_mut().enumerate() {
            let pars = guesses.guess(g).to_vec();
            let spectrum = ModelKind::Gaussian.full_model(&xs, &pars).unwrap();
            row.assign(&ndarray::ArrayView1::from(&spectrum));
        }
        (guesses, models)
    }

    /// 5 × 5 pixels, all built from grid model 13 except the first row (model 4).
    fn cube(models: &Array2<f64>) -> Array3<f64> {
        Array3::from_shape_fn((30, 5, 5), |(c, y, _)| {
            if y == 0 { models[[4, c]] } else { models[[13, c]] }
        })
    }

    fn forced(strategy: ResidualStrategy) -> SelectionOptions {
        SelectionOptions {
            strategy: Some(strategy),
            ..SelectionOptions::default()
        }
    }

    #[test]
    fn picks_generating_models_and_mode() {
        let (guesses, models) = grids();
        let cube = cube(&models);
        let grid = ModelGrid::from_array(models);
        let sel = select_best_guess(
            cube.view(),
            &guesses,
            &grid,
            None,
            &forced(ResidualStrategy::Broadcast),
            &mut NoProgress,
        )
        .unwrap();

        assert_eq!(sel.best_model_index.dim(), (5, 5));
        assert_eq!(sel.best_model_index[[0, 3]], Some(4));
        assert_eq!(sel.best_model_index[[2, 2]], Some(13));
        let overall = sel.overall_best.unwrap();
        assert_eq!(overall.index, 13);
        assert_eq!(overall.count, 20);
        approx::assert_relative_eq!(overall.fraction, 0.8);
        assert_eq!(sel.best_guesses.dim(), (3, 5, 5));
        assert_eq!(sel.best_guesses[[1, 0, 0]], guesses.guess(4)[1]);
        assert!(!sel.low_confidence);
        assert!(sel.best_at_peak_snr.is_none());
    }

    #[test]
    fn strategies_agree() {
        let (guesses, models) = grids();
        let cube = cube(&models);
        let grid = ModelGrid::from_array(models);
        let maps: Vec<_> = [
            ResidualStrategy::Broadcast,
            ResidualStrategy::PerPixel,
            ResidualStrategy::Nested,
        ]
        .into_iter()
        .map(|s| {
            select_best_guess(cube.view(), &guesses, &grid, None, &forced(s), &mut NoProgress)
                .unwrap()
                .best_model_index
        })
        .collect();
        assert_eq!(maps[0], maps[1]);
        assert_eq!(maps[0], maps[2]);
    }

    #[test]
    fn tiny_budget_still_selects() {
        let (guesses, models) = grids();
        let cube = cube(&models);
        let grid = ModelGrid::from_array(models);
        let opts = SelectionOptions {
            memory_limit_gb: Some(0.0),
            ..SelectionOptions::default()
        };
        let sel = select_best_guess(cube.view(), &guesses, &grid, None, &opts, &mut NoProgress)
            .unwrap();
        assert_eq!(sel.strategy, ResidualStrategy::Nested);
        assert_eq!(sel.overall_best.unwrap().index, 13);
    }

    #[test]
    fn failed_broadcast_drops_to_per_pixel() {
        let (_, models) = grids();
        let cube = cube(&models);
        let direct = compute_residuals(
            ResidualStrategy::Broadcast,
            cube.view(),
            models.view(),
            None,
            &mut NoProgress,
        )
        .unwrap();

        let mut tried = Vec::new();
        let (strategy, pick) = run_with_fallback(ResidualStrategy::Broadcast, |tier| {
            tried.push(tier);
            match tier {
                ResidualStrategy::Broadcast => {
                    Err(CubeError::ResourceExhausted("cannot allocate".into()))
                }
                _ => compute_residuals(tier, cube.view(), models.view(), None, &mut NoProgress),
            }
        })
        .unwrap();

        assert_eq!(strategy, ResidualStrategy::PerPixel);
        assert_eq!(tried, vec![ResidualStrategy::Broadcast, ResidualStrategy::PerPixel]);
        assert_eq!(pick.best, direct.best);
    }

    #[test]
    fn exhaustion_outside_broadcast_is_reported() {
        let result = run_with_fallback(ResidualStrategy::PerPixel, |_| {
            Err(CubeError::ResourceExhausted("cannot allocate".into()))
        });
        assert!(matches!(result, Err(CubeError::ResourceExhausted(_))));
    }

    #[test]
    fn mapped_grid_gives_identical_selection() {
        let (guesses, models) = grids();
        let cube = cube(&models);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.npy");
        ModelGrid::from_array(models.clone()).save(&path).unwrap();

        let in_memory = ModelGrid::from_array(models);
        let mapped = ModelGrid::open(&path, LoadMode::MemoryMap).unwrap();
        let opts = SelectionOptions::default();
        let a = select_best_guess(cube.view(), &guesses, &in_memory, None, &opts, &mut NoProgress)
            .unwrap();
        let b = select_best_guess(cube.view(), &guesses, &mapped, None, &opts, &mut NoProgress)
            .unwrap();
        assert_eq!(b.strategy, ResidualStrategy::Broadcast);
        assert_eq!(a.best_model_index, b.best_model_index);
        assert_eq!(a.overall_best, b.overall_best);
    }

    #[test]
    fn sn_cut_masks_pixels() {
        let (guesses, models) = grids();
        let cube = cube(&models);
        let grid = ModelGrid::from_array(models);
        let mut snr = Array2::from_elem((5, 5), 10.0);
        snr[[2, 2]] = 1.0;
        snr[[3, 1]] = 50.0;
        let opts = SelectionOptions {
            sn_cut: Some(3.0),
            ..SelectionOptions::default()
        };
        let sel = select_best_guess(
            cube.view(),
            &guesses,
            &grid,
            Some(snr.view()),
            &opts,
            &mut NoProgress,
        )
        .unwrap();
        assert_eq!(sel.best_model_index[[2, 2]], None);
        assert!(sel.best_guesses[[0, 2, 2]].is_nan());
        assert_eq!(sel.unmasked_pixels, 24);
        let peak = sel.best_at_peak_snr.unwrap();
        assert_eq!(peak.pixel, (3, 1));
        assert_eq!(peak.index, 13);
    }

    #[test]
    fn everything_below_cut_is_undefined_without_error() {
        let (guesses, models) = grids();
        let cube = cube(&models);
        let grid = ModelGrid::from_array(models);
        let snr = Array2::from_elem((5, 5), 10.0);
        let opts = SelectionOptions {
            sn_cut: Some(1e6),
            ..SelectionOptions::default()
        };
        let sel = select_best_guess(
            cube.view(),
            &guesses,
            &grid,
            Some(snr.view()),
            &opts,
            &mut NoProgress,
        )
        .unwrap();
        assert!(sel.best_model_index.iter().all(Option::is_none));
        assert!(sel.overall_best.is_none());
        assert!(sel.best_at_peak_snr.is_none());
    }

    #[test]
    fn sn_cut_without_snr_map_is_a_precondition_failure() {
        let (guesses, models) = grids();
        let cube = cube(&models);
        let grid = ModelGrid::from_array(models);
        let opts = SelectionOptions {
            sn_cut: Some(3.0),
            ..SelectionOptions::default()
        };
        let err = select_best_guess(cube.view(), &guesses, &grid, None, &opts, &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, CubeError::Precondition(_)));
    }

    #[test]
    fn mismatched_grids_are_rejected() {
        let (guesses, models) = grids();
        let cube = cube(&models);
        let short = ModelGrid::from_array(models.slice(ndarray::s![..5, ..]).to_owned());
        let err = select_best_guess(
            cube.view(),
            &guesses,
            &short,
            None,
            &SelectionOptions::default(),
            &mut NoProgress,
        )
        .unwrap_err();
        assert!(matches!(err, CubeError::InvalidShape(_)));

        let narrow = ModelGrid::from_array(models.slice(ndarray::s![.., ..29]).to_owned());
        let err = select_best_guess(
            cube.view(),
            &guesses,
            &narrow,
            None,
            &SelectionOptions::default(),
            &mut NoProgress,
        )
        .unwrap_err();
        assert!(matches!(err, CubeError::InvalidShape(_)));
    }

    #[test]
    fn mode_ties_go_to_the_lowest_index() {
        let best = ndarray::array![[Some(3), Some(1)], [None, Some(3)], [Some(1), Some(0)]];
        assert_eq!(model_mode(&best, 4), Some((1, 2)));
        let none = Array2::<Option<usize>>::from_elem((2, 2), None);
        assert_eq!(model_mode(&none, 4), None);
    }

    #[test]
    fn scattered_winners_are_low_confidence() {
        let bounds = ParameterBounds::new(vec![0.0], vec![1.0]).unwrap();
        let guesses = GuessGrid::make(bounds, &Finesse::Uniform(25), true).unwrap();
        let pick = ResidualPick {
            best: Array2::from_shape_fn((5, 5), |(y, x)| Some(y * 5 + x)),
            min: Array2::zeros((5, 5)),
        };
        let sel = summarise(ResidualStrategy::Nested, pick, &guesses, None, 25);
        assert!(sel.low_confidence);
        assert_eq!(sel.overall_best.unwrap().index, 0);
    }
}
