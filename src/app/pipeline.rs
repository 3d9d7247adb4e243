//! Shared pipeline logic behind the `grid`, `select` and `fit` commands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! load cube -> guess grid -> model grid -> SNR -> selection -> fit -> goodness
//!
//! The command handlers in `app` then only deal with printing and exports.

use std::path::Path;

use ndarray::Axis;

use crate::cli::{CubeArgs, FitArgs, GridArgs, GridCommandArgs, SelectArgs};
use crate::error::CubeError;
use crate::fit::{LeastSquaresFitter, SelectionOptions};
use crate::grid::{FitLimits, Finesse, GuessGrid, LoadMode, ParameterBounds, SynthesisOptions};
use crate::io::export::{FitReport, SelectionReport};
use crate::io::header::load_stacked;
use crate::io::npy::{load_array2, save_array};
use crate::report::Sigma;
use crate::session::SubCube;
use crate::signal::SnrRequest;

/// Outputs of a `grid` run.
#[derive(Debug, Clone, PartialEq)]
pub struct GridOutput {
    pub n_guesses: usize,
    pub npars: usize,
    pub n_channels: usize,
}

/// Outputs of a `select` run; the session keeps every intermediate product.
pub struct SelectOutput {
    pub session: SubCube,
    pub report: SelectionReport,
}

pub struct FitOutput {
    pub session: SubCube,
    pub selection: SelectionReport,
    pub report: FitReport,
}

/// Load (and stack) the input cubes and select the model.
pub fn open_session(args: &CubeArgs) -> Result<SubCube, CubeError> {
    if args.cubes.len() != args.headers.len() {
        return Err(CubeError::InvalidInput(format!(
            "Got {} --cube file(s) but {} --header file(s); they must pair up.",
            args.cubes.len(),
            args.headers.len()
        )));
    }
    let pairs: Vec<(&Path, &Path)> = args
        .cubes
        .iter()
        .zip(&args.headers)
        .map(|(c, h)| (c.as_path(), h.as_path()))
        .collect();
    let mut session = SubCube::new(load_stacked(&pairs)?);
    session.update_model(args.model.display_name())?;
    Ok(session)
}

/// Build or load the guess grid, then synthesize or load the model grid.
pub fn prepare_grids(session: &mut SubCube, args: &GridArgs, synthesis: &SynthesisOptions) -> Result<(), CubeError> {
    match &args.guesses {
        Some(path) => {
            let values = load_array2(path)?;
            let limits = with_fixed(FitLimits::new(column_bounds(&values)?), &args.fixed)?;
            session.set_guess_grid(GuessGrid::from_array(values, limits)?)?;
        }
        None => {
            let bounds = ParameterBounds::new(args.minpars.clone(), args.maxpars.clone())?;
            let limits = with_fixed(FitLimits::new(bounds), &args.fixed)?;
            let finesse = Finesse::from(args.finesse.clone());
            session.make_guess_grid_with_limits(limits, &finesse, !args.no_clip_edges)?;
        }
    }

    match &args.models {
        Some(path) => {
            let mode = if args.mmap { LoadMode::MemoryMap } else { LoadMode::Read };
            session.load_model_grid(path, mode)?;
        }
        None => {
            session.generate_model(synthesis)?;
        }
    }
    Ok(())
}

/// Environment defaults, overridden by whatever was given on the command line.
pub fn selection_options(args: &SelectArgs) -> Result<SelectionOptions, CubeError> {
    let mut opts = SelectionOptions::from_env()?;
    opts.sn_cut = args.sn_cut;
    if args.memory_limit_gb.is_some() {
        opts.memory_limit_gb = args.memory_limit_gb;
    }
    if let Some(overhead) = args.overhead {
        opts.overhead = overhead;
    }
    if let Some(inc) = args.progress_inc {
        opts.progress_increment = inc.max(1);
    }
    if args.strategy.is_some() {
        opts.strategy = args.strategy;
    }
    opts.validate()?;
    Ok(opts)
}

pub fn snr_request(args: &SelectArgs) -> SnrRequest {
    SnrRequest {
        signal: (!args.signal.is_empty()).then(|| args.signal.clone()),
        noise: (!args.noise.is_empty()).then(|| args.noise.clone()),
        unit: args.range_unit,
        ..SnrRequest::default()
    }
}

pub fn run_grid(args: &GridCommandArgs) -> Result<GridOutput, CubeError> {
    let mut session = open_session(&args.cube)?;
    let synthesis = SynthesisOptions {
        to_file: Some(args.models_out.clone()),
        redo: !args.no_redo,
    };
    prepare_grids(&mut session, &args.grid, &synthesis)?;

    let grid = session
        .guess_grid()
        .ok_or_else(|| CubeError::Precondition("Guess grid missing after preparation.".into()))?;
    save_array(&args.guesses_out, grid.values())?;
    log::info!("Wrote guess grid to {}", args.guesses_out.display());

    Ok(GridOutput {
        n_guesses: grid.len(),
        npars: grid.npars(),
        n_channels: session.cube().n_channels(),
    })
}

pub fn run_select(args: &SelectArgs) -> Result<SelectOutput, CubeError> {
    let opts = selection_options(args)?;
    let mut session = open_session(&args.cube)?.with_progress_increment(opts.progress_increment);
    prepare_grids(&mut session, &args.grid, &SynthesisOptions::default())?;
    session.get_snr_map(&snr_request(args))?;
    let (c, ny, nx) = session.cube().data().dim();
    let n_guesses = session.guess_grid().map_or(0, GuessGrid::len);
    let selection = session.best_guess(&opts)?;

    if let Some(path) = &args.best_guesses_out {
        save_array(path, selection.best_guesses.view())?;
        log::info!("Wrote best guesses to {}", path.display());
    }

    let report = SelectionReport::new(
        args.cube.model.display_name(),
        [c, ny, nx],
        n_guesses,
        opts.sn_cut,
        selection,
    );
    Ok(SelectOutput { session, report })
}

pub fn run_fit(args: &FitArgs) -> Result<FitOutput, CubeError> {
    let SelectOutput {
        mut session,
        report: selection,
    } = run_select(&args.select)?;

    let fitter = match args.threads {
        Some(n) => LeastSquaresFitter::with_threads(n),
        None => LeastSquaresFitter::default(),
    };
    session.fit_each(&fitter, args.guess_source)?;
    session.get_chi_squared(args.sigma.map(Sigma::Scalar))?;
    let dof = session.chi_squared_stats(None)?.dof;
    let bad = session.bad_fit_mask(args.bad_fit_cut)?;

    let fit = session
        .fit()
        .ok_or_else(|| CubeError::Precondition("Fit results missing after fitting.".into()))?;
    if let Some(path) = &args.parcube_out {
        save_array(path, fit.parcube.view())?;
    }
    if let Some(path) = &args.errcube_out {
        save_array(path, fit.errcube.view())?;
    }

    let names = parameter_names(&session, fit.parcube.len_of(Axis(0)));
    let chi = session
        .chi_squared()
        .ok_or_else(|| CubeError::Precondition("Chi-squared map missing after scoring.".into()))?;
    let report = FitReport::new(
        args.select.cube.model.display_name(),
        names,
        fit,
        dof,
        chi,
        args.bad_fit_cut,
        &bad,
    );
    Ok(FitOutput {
        session,
        selection,
        report,
    })
}

/// Component-suffixed names for multi-component parameter vectors.
fn parameter_names(session: &SubCube, npars: usize) -> Vec<String> {
    let Some(model) = session.model() else {
        return (0..npars).map(|i| format!("p{i}")).collect();
    };
    let base = model.parameter_names();
    if npars == base.len() {
        return base;
    }
    (0..npars)
        .map(|i| format!("{}_{}", base[i % base.len()], i / base.len()))
        .collect()
}

/// Per-column min/max of a `G × P` guess array.
fn column_bounds(values: &ndarray::Array2<f64>) -> Result<ParameterBounds, CubeError> {
    if values.nrows() == 0 {
        return Err(CubeError::InvalidShape("Guess grid file holds no guesses.".into()));
    }
    let minpars = values
        .axis_iter(Axis(1))
        .map(|col| col.iter().copied().fold(f64::INFINITY, f64::min))
        .collect();
    let maxpars = values
        .axis_iter(Axis(1))
        .map(|col| col.iter().copied().fold(f64::NEG_INFINITY, f64::max))
        .collect();
    ParameterBounds::new(minpars, maxpars)
}

fn with_fixed(limits: FitLimits, fixed: &[usize]) -> Result<FitLimits, CubeError> {
    if fixed.is_empty() {
        return Ok(limits);
    }
    let npars = limits.npars();
    if let Some(&bad) = fixed.iter().find(|&&i| i >= npars) {
        return Err(CubeError::InvalidInput(format!(
            "Cannot fix parameter {bad}; there are only {npars}."
        )));
    }
    let mask = (0..npars).map(|i| fixed.contains(&i)).collect();
    limits.with_fixed(mask)
}
