//! Analysis session over one (possibly stacked) cube.
//!
//! [`SubCube`] owns the cube and every derived product as an explicit
//! optional field. Each step checks that its inputs are present and fails with
//! [`CubeError::Precondition`] otherwise. A failed step leaves the existing
//! state as it was, so it can be retried with corrected inputs.

use std::path::Path;

use clap::ValueEnum;
use ndarray::{Array2, Array3, ArrayView1, ArrayView3, s};
use serde::Serialize;

use crate::domain::SpectralCube;
use crate::error::CubeError;
use crate::fit::{CubeFit, CubeFitter, PixelGuesses, Selection, SelectionOptions, select_best_guess};
use crate::grid::{
    FitLimits, Finesse, GuessGrid, LoadMode, ModelGrid, ParameterBounds, SynthesisOptions, SynthesisOutcome,
};
use crate::models::{ModelKind, SpectralModel};
use crate::progress::{DEFAULT_PROGRESS_INCREMENT, LogProgress};
use crate::report::{Sigma, bad_fit_mask, chi_squared_map, chi_squared_probability, log_likelihood_map};
use crate::signal::{SignalNoise, SnrRequest, estimate_snr};

/// Which initial guesses the fitting step starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum GuessSource {
    /// The most frequently selected guess, everywhere.
    #[default]
    OverallBest,
    /// The guess selected at the highest-SNR pixel, everywhere.
    PeakSnr,
    /// Each pixel's own best guess.
    PerPixel,
}

/// Probability and log-likelihood maps derived from the chi-squared map.
#[derive(Debug, Clone)]
pub struct ChiSquaredStats {
    pub dof: usize,
    pub probability: Array2<f64>,
    pub log_likelihood: Array2<f64>,
}

pub struct SubCube {
    cube: SpectralCube,
    model: Option<Box<dyn SpectralModel>>,
    guess_grid: Option<GuessGrid>,
    model_grid: Option<ModelGrid>,
    signal_noise: Option<SignalNoise>,
    selection: Option<Selection>,
    fit: Option<CubeFit>,
    model_cube: Option<Array3<f64>>,
    chi_squared: Option<(Array2<f64>, Sigma)>,
    stats: Option<ChiSquaredStats>,
    progress_increment: u64,
}

impl SubCube {
    pub fn new(cube: SpectralCube) -> Self {
        Self {
            cube,
            model: None,
            guess_grid: None,
            model_grid: None,
            signal_noise: None,
            selection: None,
            fit: None,
            model_cube: None,
            chi_squared: None,
            stats: None,
            progress_increment: DEFAULT_PROGRESS_INCREMENT,
        }
    }

    /// Concatenate several cubes along the spectral axis and open a session on the result.
    pub fn from_stack(cubes: Vec<SpectralCube>) -> Result<Self, CubeError> {
        Ok(Self::new(SpectralCube::stack(cubes)?))
    }

    pub fn with_progress_increment(mut self, increment: u64) -> Self {
        self.progress_increment = increment.max(1);
        self
    }

    pub fn cube(&self) -> &SpectralCube {
        &self.cube
    }

    pub fn model(&self) -> Option<&dyn SpectralModel> {
        self.model.as_deref()
    }

    pub fn guess_grid(&self) -> Option<&GuessGrid> {
        self.guess_grid.as_ref()
    }

    pub fn model_grid(&self) -> Option<&ModelGrid> {
        self.model_grid.as_ref()
    }

    pub fn signal_noise(&self) -> Option<&SignalNoise> {
        self.signal_noise.as_ref()
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn fit(&self) -> Option<&CubeFit> {
        self.fit.as_ref()
    }

    pub fn chi_squared(&self) -> Option<&Array2<f64>> {
        self.chi_squared.as_ref().map(|(chi, _)| chi)
    }

    pub fn stats(&self) -> Option<&ChiSquaredStats> {
        self.stats.as_ref()
    }

    /// Select a built-in model by name.
    pub fn update_model(&mut self, name: &str) -> Result<(), CubeError> {
        let kind = ModelKind::from_name(name)?;
        self.set_model(Box::new(kind));
        Ok(())
    }

    pub fn set_model(&mut self, model: Box<dyn SpectralModel>) {
        log::info!("Spectral model set to '{}'", model.name());
        self.model = Some(model);
    }

    pub fn make_guess_grid(
        &mut self,
        bounds: ParameterBounds,
        finesse: &Finesse,
        clip_edges: bool,
    ) -> Result<&GuessGrid, CubeError> {
        self.make_guess_grid_with_limits(FitLimits::new(bounds), finesse, clip_edges)
    }

    /// Build a fresh guess grid; any model grid and selection built on the old one are dropped.
    pub fn make_guess_grid_with_limits(
        &mut self,
        limits: FitLimits,
        finesse: &Finesse,
        clip_edges: bool,
    ) -> Result<&GuessGrid, CubeError> {
        if let Some(model) = self.model.as_deref() {
            let npars = limits.npars();
            if npars % model.npars() != 0 {
                return Err(CubeError::InvalidShape(format!(
                    "{npars} bounds do not describe components of model '{}' ({} parameters each).",
                    model.name(),
                    model.npars()
                )));
            }
        }
        let grid = GuessGrid::make_with_limits(limits, finesse, clip_edges)?;
        log::info!("Guess grid holds {} guesses of {} parameters", grid.len(), grid.npars());
        self.invalidate_models();
        Ok(self.guess_grid.insert(grid))
    }

    /// Adopt a guess grid built elsewhere (e.g. read back from disk).
    pub fn set_guess_grid(&mut self, grid: GuessGrid) -> Result<&GuessGrid, CubeError> {
        if let Some(model) = self.model.as_deref() {
            if grid.npars() % model.npars() != 0 {
                return Err(CubeError::InvalidShape(format!(
                    "Guesses of {} parameters do not fit model '{}'.",
                    grid.npars(),
                    model.name()
                )));
            }
        }
        self.invalidate_models();
        Ok(self.guess_grid.insert(grid))
    }

    /// Append a sub-grid to the current guess grid and widen its bounds.
    pub fn expand_guess_grid(
        &mut self,
        bounds: &ParameterBounds,
        finesse: &Finesse,
        clip_edges: bool,
    ) -> Result<&GuessGrid, CubeError> {
        let grid = self.guess_grid.as_mut().ok_or_else(no_guess_grid)?;
        grid.expand(bounds, finesse, clip_edges)?;
        self.invalidate_models();
        self.guess_grid.as_ref().ok_or_else(no_guess_grid)
    }

    /// Synthesize one spectrum per guess.
    ///
    /// A grid written to (or already present at) `opts.to_file` is memory-mapped
    /// back rather than held in memory.
    pub fn generate_model(&mut self, opts: &SynthesisOptions) -> Result<&ModelGrid, CubeError> {
        let model = self.model.as_deref().ok_or_else(no_model)?;
        let grid = self.guess_grid.as_ref().ok_or_else(no_guess_grid)?;
        let mut progress = LogProgress::new(self.progress_increment);
        let outcome = crate::grid::generate_model(
            grid.values().into_dyn(),
            model,
            self.cube.xarr().values(),
            self.cube.spatial_shape(),
            opts,
            &mut progress,
        )?;
        let models = match outcome {
            SynthesisOutcome::Generated(models) => ModelGrid::from_array(models),
            SynthesisOutcome::Written(path) | SynthesisOutcome::Skipped(path) => {
                ModelGrid::open(&path, LoadMode::MemoryMap)?
            }
        };
        self.selection = None;
        Ok(self.model_grid.insert(models))
    }

    /// Use a model grid persisted earlier instead of generating one.
    pub fn load_model_grid(&mut self, path: &Path, mode: LoadMode) -> Result<&ModelGrid, CubeError> {
        let models = ModelGrid::open(path, mode)?;
        self.selection = None;
        Ok(self.model_grid.insert(models))
    }

    /// Signal, noise and SNR maps; stored for later SNR cuts and sigma defaults.
    pub fn get_snr_map(&mut self, req: &SnrRequest) -> Result<&SignalNoise, CubeError> {
        let sn = estimate_snr(&self.cube, req)?;
        Ok(self.signal_noise.insert(sn))
    }

    /// Pick the minimum-residual guess for every pixel.
    pub fn best_guess(&mut self, opts: &SelectionOptions) -> Result<&Selection, CubeError> {
        let guesses = self.guess_grid.as_ref().ok_or_else(no_guess_grid)?;
        let models = self.model_grid.as_ref().ok_or_else(|| {
            CubeError::Precondition(
                "No model grid; run generate_model() or load a persisted grid first.".into(),
            )
        })?;
        let snr = self.signal_noise.as_ref().map(|sn| sn.snr_map.view());
        let mut progress = LogProgress::new(opts.progress_increment);
        let selection = select_best_guess(self.cube.data(), guesses, models, snr, opts, &mut progress)?;
        Ok(self.selection.insert(selection))
    }

    /// Fit every pixel starting from the selected guesses.
    pub fn fit_each(&mut self, fitter: &dyn CubeFitter, source: GuessSource) -> Result<&CubeFit, CubeError> {
        let model = self.model.as_deref().ok_or_else(no_model)?;
        let grid = self.guess_grid.as_ref().ok_or_else(no_guess_grid)?;
        let selection = self
            .selection
            .as_ref()
            .ok_or_else(|| CubeError::Precondition("No selection; run best_guess() first.".into()))?;

        let guesses = match source {
            GuessSource::OverallBest => {
                let best = selection.overall_best.as_ref().ok_or_else(|| {
                    CubeError::Precondition("No pixel passed selection; there is no overall best guess.".into())
                })?;
                PixelGuesses::Uniform(&best.guess)
            }
            GuessSource::PeakSnr => {
                let peak = selection.best_at_peak_snr.as_ref().ok_or_else(|| {
                    CubeError::Precondition(
                        "No best guess at peak SNR; run get_snr_map() before best_guess().".into(),
                    )
                })?;
                PixelGuesses::Uniform(&peak.guess)
            }
            GuessSource::PerPixel => PixelGuesses::PerPixel(selection.best_guesses.view()),
        };

        let fit = fitter.fit_cube(
            self.cube.data(),
            self.cube.xarr().values(),
            model,
            guesses,
            grid.limits(),
        )?;
        self.model_cube = None;
        self.chi_squared = None;
        self.stats = None;
        Ok(self.fit.insert(fit))
    }

    /// Evaluate the model from the fitted parameter cube.
    pub fn get_model_cube(&mut self) -> Result<&Array3<f64>, CubeError> {
        if self.model_cube.is_none() {
            let model = self.model.as_deref().ok_or_else(no_model)?;
            let fit = self.fit.as_ref().ok_or_else(no_fit)?;
            let cube = model_cube(model, self.cube.xarr().values(), fit.parcube.view())?;
            self.model_cube = Some(cube);
        }
        self.model_cube.as_ref().ok_or_else(no_fit)
    }

    /// Chi-squared of the fitted model cube against the data.
    ///
    /// Sigma is taken from the argument, else the header `RMSLVL` card, else
    /// the stored RMS map.
    pub fn get_chi_squared(&mut self, sigma: Option<Sigma>) -> Result<&Array2<f64>, CubeError> {
        let sigma = self.resolve_sigma(sigma)?;
        self.get_model_cube()?;
        let model_cube = self.model_cube.as_ref().ok_or_else(no_fit)?;
        let chi = chi_squared_map(self.cube.data(), model_cube.view(), &sigma)?;
        self.stats = None;
        let (chi, _) = self.chi_squared.insert((chi, sigma));
        Ok(chi)
    }

    /// Probability and log-likelihood maps. `dof` defaults to the channel count.
    pub fn chi_squared_stats(&mut self, dof: Option<usize>) -> Result<&ChiSquaredStats, CubeError> {
        let (chi, sigma) = self.chi_squared.as_ref().ok_or_else(|| {
            CubeError::Precondition("No chi-squared map; run get_chi_squared() first.".into())
        })?;
        let n_channels = self.cube.n_channels();
        let dof = dof.unwrap_or(n_channels);
        let parcube = self.fit.as_ref().map(|f| f.parcube.view());
        let probability = chi_squared_probability(chi.view(), dof, parcube)?;
        let log_likelihood = log_likelihood_map(chi.view(), sigma, n_channels)?;
        Ok(self.stats.insert(ChiSquaredStats {
            dof,
            probability,
            log_likelihood,
        }))
    }

    /// Pixels whose fit probability falls below `cut`.
    pub fn bad_fit_mask(&self, cut: f64) -> Result<Array2<bool>, CubeError> {
        let stats = self.stats.as_ref().ok_or_else(|| {
            CubeError::Precondition("No fit probabilities; run chi_squared_stats() first.".into())
        })?;
        let mask = bad_fit_mask(stats.probability.view(), cut);
        let n_bad = mask.iter().filter(|&&b| b).count();
        if n_bad > 0 {
            log::warn!("{n_bad} pixel(s) have fit probability below {cut:e}");
        }
        Ok(mask)
    }

    fn resolve_sigma(&self, sigma: Option<Sigma>) -> Result<Sigma, CubeError> {
        if let Some(sigma) = sigma {
            return Ok(sigma);
        }
        if let Some(rms) = self.cube.header().rms_level() {
            return Ok(Sigma::Scalar(rms));
        }
        if let Some(sn) = &self.signal_noise {
            log::info!("No RMS level in the header; using the RMS map as sigma");
            return Ok(Sigma::Map(sn.rms_map.clone()));
        }
        Err(CubeError::Precondition(
            "No sigma: pass one, set the RMSLVL header card, or run get_snr_map() first.".into(),
        ))
    }

    fn invalidate_models(&mut self) {
        if self.model_grid.take().is_some() {
            log::info!("Guess grid changed; the previous model grid was dropped");
        }
        self.selection = None;
    }
}

/// Spectrum of every pixel from a `P × Y × X` parameter cube. Pixels with any
/// undefined parameter stay NaN.
pub fn model_cube(
    model: &dyn SpectralModel,
    xarr: &[f64],
    parcube: ArrayView3<'_, f64>,
) -> Result<Array3<f64>, CubeError> {
    let (_, ny, nx) = parcube.dim();
    let mut out = Array3::from_elem((xarr.len(), ny, nx), f64::NAN);
    let mut spectrum = vec![0.0; xarr.len()];
    for y in 0..ny {
        for x in 0..nx {
            let pars = parcube.slice(s![.., y, x]).to_vec();
            if pars.iter().any(|v| v.is_nan()) {
                continue;
            }
            model.full_model_into(xarr, &pars, &mut spectrum)?;
            out.slice_mut(s![.., y, x]).assign(&ArrayView1::from(&spectrum[..]));
        }
    }
    Ok(out)
}

fn no_model() -> CubeError {
    CubeError::Precondition("No model selected; call update_model() first.".into())
}

fn no_guess_grid() -> CubeError {
    CubeError::Precondition("No guess grid; run make_guess_grid() first.".into())
}

fn no_fit() -> CubeError {
    CubeError::Precondition("No fit results; run fit_each() first.".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CubeHeader, SpectralAxis, SpectralUnit};
    use crate::fit::{LeastSquaresFitter, ResidualStrategy};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    const NOISE: f64 = 0.02;

    fn xarr() -> SpectralAxis {
        let values = (0..30).map(|i| -3.0 + i as f64 * 0.2).collect();
        SpectralAxis::new(values, SpectralUnit::KilometersPerSecond).unwrap()
    }

    /// 30 channels, 5 × 5 pixels of noisy Gaussians with drifting centroids.
    fn cube() -> SpectralCube {
        let axis = xarr();
        let xs = axis.values().to_vec();
        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0, NOISE).unwrap();
        let mut data = Array3::zeros((30, 5, 5));
        for y in 0..5 {
            for x in 0..5 {
                let pars = [1.0 + 0.1 * y as f64, -0.4 + 0.2 * x as f64, 0.6];
                let line = ModelKind::Gaussian.full_model(&xs, &pars).unwrap();
                for c in 0..30 {
                    data[[c, y, x]] = line[c] + noise.sample(&mut rng);
                }
            }
        }
        SpectralCube::new(data, axis, CubeHeader::default()).unwrap()
    }

    fn bounds() -> ParameterBounds {
        ParameterBounds::new(vec![0.1, -1.0, 0.1], vec![2.0, 1.0, 2.0]).unwrap()
    }

    fn prepared() -> SubCube {
        let mut sc = SubCube::new(cube());
        sc.update_model("gaussian").unwrap();
        sc.make_guess_grid(bounds(), &Finesse::Uniform(3), true).unwrap();
        sc.generate_model(&SynthesisOptions::default()).unwrap();
        sc
    }

    #[test]
    fn selects_a_grid_model_for_every_pixel() {
        let mut sc = prepared();
        assert_eq!(sc.guess_grid().unwrap().values().dim(), (27, 3));
        assert_eq!(sc.model_grid().unwrap().shape().unwrap(), (27, 30));

        let sel = sc.best_guess(&SelectionOptions::default()).unwrap();
        assert_eq!(sel.best_model_index.dim(), (5, 5));
        assert!(sel.best_model_index.iter().all(|b| matches!(b, Some(g) if *g < 27)));
        assert!(sel.overall_best.is_some());
    }

    #[test]
    fn snr_cut_above_every_pixel_leaves_selection_undefined() {
        let mut sc = prepared();
        sc.get_snr_map(&SnrRequest::default()).unwrap();
        let opts = SelectionOptions {
            sn_cut: Some(1e6),
            ..SelectionOptions::default()
        };
        let sel = sc.best_guess(&opts).unwrap();
        assert!(sel.best_model_index.iter().all(Option::is_none));
        assert!(sel.min_residual.iter().all(|v| v.is_nan()));
        assert!(sel.overall_best.is_none());
        assert_eq!(sel.unmasked_pixels, 0);
    }

    #[test]
    fn memory_mapped_grid_selects_identically() {
        let dir = tempfile::tempdir().unwrap();
        let mut in_memory = prepared();
        let expected = in_memory
            .best_guess(&SelectionOptions::default())
            .unwrap()
            .best_model_index
            .clone();

        let mut mapped = SubCube::new(cube());
        mapped.update_model("gaussian").unwrap();
        mapped.make_guess_grid(bounds(), &Finesse::Uniform(3), true).unwrap();
        let opts = SynthesisOptions {
            to_file: Some(dir.path().join("models.npy")),
            redo: true,
        };
        assert!(mapped.generate_model(&opts).unwrap().is_out_of_core());

        for strategy in [ResidualStrategy::Broadcast, ResidualStrategy::Nested] {
            let sel = mapped
                .best_guess(&SelectionOptions {
                    strategy: Some(strategy),
                    ..SelectionOptions::default()
                })
                .unwrap();
            assert_eq!(sel.best_model_index, expected);
        }
    }

    #[test]
    fn steps_out_of_order_are_preconditions() {
        let mut sc = SubCube::new(cube());
        assert!(matches!(
            sc.best_guess(&SelectionOptions::default()),
            Err(CubeError::Precondition(_))
        ));
        sc.make_guess_grid(bounds(), &Finesse::Uniform(2), true).unwrap();
        assert!(matches!(
            sc.generate_model(&SynthesisOptions::default()),
            Err(CubeError::Precondition(_))
        ));
        assert!(matches!(
            sc.fit_each(&LeastSquaresFitter::default(), GuessSource::OverallBest),
            Err(CubeError::Precondition(_))
        ));
        assert!(matches!(sc.get_chi_squared(None), Err(CubeError::Precondition(_))));
        assert!(matches!(sc.bad_fit_mask(1e-20), Err(CubeError::Precondition(_))));
    }

    #[test]
    fn failed_steps_keep_previous_state() {
        let mut sc = prepared();
        sc.best_guess(&SelectionOptions::default()).unwrap();

        assert!(sc.update_model("voigt").is_err());
        assert_eq!(sc.model().unwrap().name(), "gaussian");

        let wrong = ParameterBounds::new(vec![0.0, 0.0], vec![1.0, 1.0]).unwrap();
        assert!(sc.expand_guess_grid(&wrong, &Finesse::Uniform(2), true).is_err());
        assert_eq!(sc.guess_grid().unwrap().len(), 27);
        assert!(sc.model_grid().is_some());

        // An SNR cut without an SNR map fails and keeps the earlier selection.
        let opts = SelectionOptions {
            sn_cut: Some(3.0),
            ..SelectionOptions::default()
        };
        assert!(matches!(sc.best_guess(&opts), Err(CubeError::Precondition(_))));
        assert!(sc.selection().is_some());
    }

    #[test]
    fn expanding_the_grid_drops_stale_models() {
        let mut sc = prepared();
        let extra = ParameterBounds::new(vec![2.0, -2.0, 0.1], vec![3.0, 2.0, 3.0]).unwrap();
        let grid = sc.expand_guess_grid(&extra, &Finesse::Uniform(2), true).unwrap();
        assert_eq!(grid.len(), 35);
        assert_eq!(grid.bounds().maxpars, vec![3.0, 2.0, 3.0]);
        assert_eq!(grid.bounds().minpars, vec![0.1, -2.0, 0.1]);
        assert!(sc.model_grid().is_none());
        sc.generate_model(&SynthesisOptions::default()).unwrap();
        assert_eq!(sc.model_grid().unwrap().shape().unwrap(), (35, 30));
    }

    #[test]
    fn bounds_must_fit_the_model() {
        let mut sc = SubCube::new(cube());
        sc.update_model("lorentzian").unwrap();
        let two = ParameterBounds::new(vec![0.0, 0.0], vec![1.0, 1.0]).unwrap();
        assert!(matches!(
            sc.make_guess_grid(two, &Finesse::Uniform(2), true),
            Err(CubeError::InvalidShape(_))
        ));
        assert!(sc.guess_grid().is_none());
    }

    #[test]
    fn fit_then_score_goodness() {
        let mut sc = prepared();
        sc.get_snr_map(&SnrRequest::default()).unwrap();
        sc.best_guess(&SelectionOptions::default()).unwrap();
        let fit = sc
            .fit_each(&LeastSquaresFitter::with_threads(2), GuessSource::PerPixel)
            .unwrap();
        assert_eq!(fit.fitted_pixels, 25);
        approx::assert_abs_diff_eq!(fit.parcube[[1, 2, 4]], 0.4, epsilon = 0.05);

        let model_cube = sc.get_model_cube().unwrap();
        assert_eq!(model_cube.dim(), (30, 5, 5));

        let chi = sc.get_chi_squared(Some(Sigma::Scalar(NOISE))).unwrap();
        assert!(chi.iter().all(|v| v.is_finite() && *v > 0.0));

        let stats = sc.chi_squared_stats(None).unwrap();
        assert_eq!(stats.dof, 30);
        assert!(stats.probability.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(stats.log_likelihood.iter().all(|l| l.is_finite()));

        let bad = sc.bad_fit_mask(1e-20).unwrap();
        assert_eq!(bad.dim(), (5, 5));
        assert!(bad.iter().all(|b| !b));
    }

    #[test]
    fn sigma_defaults_to_header_rms_level() {
        let mut cube = cube();
        cube.header_mut().set_rms_level(NOISE);
        let mut sc = SubCube::new(cube);
        sc.update_model("gaussian").unwrap();
        sc.make_guess_grid(bounds(), &Finesse::Uniform(3), true).unwrap();
        sc.generate_model(&SynthesisOptions::default()).unwrap();
        sc.best_guess(&SelectionOptions::default()).unwrap();
        sc.fit_each(&LeastSquaresFitter::default(), GuessSource::OverallBest).unwrap();

        let from_header = sc.get_chi_squared(None).unwrap().clone();
        let explicit = sc.get_chi_squared(Some(Sigma::Scalar(NOISE))).unwrap();
        assert_eq!(&from_header, explicit);
    }

    #[test]
    fn zero_sigma_gives_non_finite_chi_squared() {
        let mut sc = prepared();
        sc.best_guess(&SelectionOptions::default()).unwrap();
        sc.fit_each(&LeastSquaresFitter::default(), GuessSource::OverallBest).unwrap();

        let mut sigma = Array2::from_elem((5, 5), NOISE);
        sigma[[0, 0]] = 0.0;
        let chi = sc.get_chi_squared(Some(Sigma::Map(sigma))).unwrap();
        assert!(!chi[[0, 0]].is_finite());
        assert!(chi[[1, 1]].is_finite());
    }

    #[test]
    fn peak_snr_guess_needs_an_snr_map() {
        let mut sc = prepared();
        sc.best_guess(&SelectionOptions::default()).unwrap();
        assert!(matches!(
            sc.fit_each(&LeastSquaresFitter::default(), GuessSource::PeakSnr),
            Err(CubeError::Precondition(_))
        ));
        assert!(sc.fit().is_none());
    }

    #[test]
    fn model_cube_skips_undefined_pixels() {
        let xs: Vec<f64> = (0..10).map(f64::from).collect();
        let mut parcube = Array3::from_elem((3, 1, 2), 1.0);
        parcube[[0, 0, 1]] = f64::NAN;
        let cube = model_cube(&ModelKind::Gaussian, &xs, parcube.view()).unwrap();
        approx::assert_relative_eq!(cube[[1, 0, 0]], 1.0);
        assert!(cube.slice(s![.., 0, 1]).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn stacked_session_spans_all_channels() {
        let sc = SubCube::from_stack(vec![cube(), cube()]).unwrap();
        assert_eq!(sc.cube().n_channels(), 60);
        assert_eq!(sc.cube().spatial_shape(), (5, 5));
    }
}
