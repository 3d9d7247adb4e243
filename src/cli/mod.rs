//! Command-line parsing for the multicube guess-selection tool.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! grid, selection and fitting code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::SpectralUnit;
use crate::fit::ResidualStrategy;
use crate::models::ModelKind;
use crate::report::DEFAULT_BAD_FIT_CUT;
use crate::session::GuessSource;
use crate::signal::ChannelRange;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "multicube",
    version,
    about = "Grid-based initial guesses for spectral cube fitting"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build a guess grid and synthesize its model grid; write both as `.npy`.
    Grid(GridCommandArgs),
    /// Pick the best guess per pixel and report the overall winners.
    Select(SelectArgs),
    /// Select best guesses, fit every pixel from them and score the fit.
    Fit(FitArgs),
}

/// Input cube(s). Several `--cube`/`--header` pairs are stacked along the spectral axis.
#[derive(Debug, Args, Clone)]
pub struct CubeArgs {
    /// Flux cube as a 3D `.npy` file (channels × y × x).
    #[arg(long = "cube", value_name = "NPY", required = true)]
    pub cubes: Vec<PathBuf>,

    /// JSON header with the spectral axis WCS, one per `--cube`.
    #[arg(long = "header", value_name = "JSON", required = true)]
    pub headers: Vec<PathBuf>,

    /// Spectral model to evaluate.
    #[arg(long, value_enum, default_value_t = ModelKind::Gaussian)]
    pub model: ModelKind,
}

/// Guess grid definition.
#[derive(Debug, Args, Clone)]
pub struct GridArgs {
    /// Lower parameter bounds, comma separated.
    #[arg(long = "min", value_delimiter = ',', allow_hyphen_values = true)]
    pub minpars: Vec<f64>,

    /// Upper parameter bounds, comma separated.
    #[arg(long = "max", value_delimiter = ',', allow_hyphen_values = true)]
    pub maxpars: Vec<f64>,

    /// Grid cells per parameter: one value for all, or one per parameter.
    #[arg(long, value_delimiter = ',', default_value = "5")]
    pub finesse: Vec<usize>,

    /// Keep the boundary values of every parameter range.
    #[arg(long)]
    pub no_clip_edges: bool,

    /// Hold these parameter indices fixed during fitting.
    #[arg(long, value_delimiter = ',')]
    pub fixed: Vec<usize>,

    /// Read the guess grid from a `.npy` file instead of building one.
    #[arg(long, value_name = "NPY", conflicts_with_all = ["minpars", "maxpars"])]
    pub guesses: Option<PathBuf>,

    /// Read the model grid from a `.npy` file instead of synthesizing one.
    #[arg(long, value_name = "NPY")]
    pub models: Option<PathBuf>,

    /// Memory-map `--models` instead of reading it into memory.
    #[arg(long, requires = "models")]
    pub mmap: bool,
}

#[derive(Debug, Parser, Clone)]
pub struct GridCommandArgs {
    #[command(flatten)]
    pub cube: CubeArgs,

    #[command(flatten)]
    pub grid: GridArgs,

    /// Where to write the guess grid.
    #[arg(long, value_name = "NPY", default_value = "guesses.npy")]
    pub guesses_out: PathBuf,

    /// Where to write the model grid.
    #[arg(long, value_name = "NPY", default_value = "models.npy")]
    pub models_out: PathBuf,

    /// Keep an existing model grid file instead of regenerating it.
    #[arg(long)]
    pub no_redo: bool,
}

/// Options for best-guess selection.
#[derive(Debug, Parser, Clone)]
pub struct SelectArgs {
    #[command(flatten)]
    pub cube: CubeArgs,

    #[command(flatten)]
    pub grid: GridArgs,

    /// Exclude pixels with SNR at or below this value.
    #[arg(long)]
    pub sn_cut: Option<f64>,

    /// Signal range `low:high`, repeatable. Defaults to the inner third of the band.
    #[arg(long, value_parser = parse_range, allow_hyphen_values = true)]
    pub signal: Vec<ChannelRange>,

    /// Noise range `low:high`, repeatable. Defaults to the outer thirds of the band.
    #[arg(long, value_parser = parse_range, allow_hyphen_values = true)]
    pub noise: Vec<ChannelRange>,

    /// Unit of `--signal` / `--noise` ranges (channel, Hz, kHz, MHz, GHz, m/s, km/s).
    #[arg(long, value_enum, default_value_t = SpectralUnit::KilometersPerSecond)]
    pub range_unit: SpectralUnit,

    /// Memory budget in GB (overrides `MULTICUBE_MEMORY_LIMIT_GB` and the OS query).
    #[arg(long)]
    pub memory_limit_gb: Option<f64>,

    /// Multiplier on the broadcast memory estimate.
    #[arg(long)]
    pub overhead: Option<f64>,

    /// Force a residual strategy instead of choosing one from the budget.
    #[arg(long, value_enum)]
    pub strategy: Option<ResidualStrategy>,

    /// Log progress every N steps.
    #[arg(long)]
    pub progress_inc: Option<u64>,

    /// Write a JSON selection report.
    #[arg(long, value_name = "JSON")]
    pub report: Option<PathBuf>,

    /// Write the per-pixel best guesses (P × y × x) as `.npy`.
    #[arg(long, value_name = "NPY")]
    pub best_guesses_out: Option<PathBuf>,
}

/// Options for fitting from selected guesses.
#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Which selected guesses seed the fit.
    #[arg(long, value_enum, default_value_t = GuessSource::OverallBest)]
    pub guess_source: GuessSource,

    /// Fitting threads (defaults to all cores).
    #[arg(long)]
    pub threads: Option<usize>,

    /// Noise sigma for chi-squared; defaults to the RMSLVL card, then the RMS map.
    #[arg(long)]
    pub sigma: Option<f64>,

    /// Probability below which a fit is flagged as bad.
    #[arg(long, default_value_t = DEFAULT_BAD_FIT_CUT)]
    pub bad_fit_cut: f64,

    /// Write the fitted parameter cube as `.npy`.
    #[arg(long, value_name = "NPY")]
    pub parcube_out: Option<PathBuf>,

    /// Write the parameter error cube as `.npy`.
    #[arg(long, value_name = "NPY")]
    pub errcube_out: Option<PathBuf>,

    /// Write a JSON fit report.
    #[arg(long = "fit-report", value_name = "JSON")]
    pub fit_report: Option<PathBuf>,
}

/// Parse `low:high` into a [`ChannelRange`].
pub fn parse_range(s: &str) -> Result<ChannelRange, String> {
    let (lo, hi) = s
        .split_once(':')
        .ok_or_else(|| format!("expected 'low:high', got '{s}'"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|_| format!("'{v}' is not a number"))
    };
    Ok(ChannelRange::new(parse(lo)?, parse(hi)?))
}
