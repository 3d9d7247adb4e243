//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments
//! - runs the grid / select / fit pipeline
//! - prints summaries
//! - writes optional reports

use clap::Parser;

use crate::cli::{Command, FitArgs, GridCommandArgs, SelectArgs};
use crate::error::CubeError;
use crate::io::export::write_report;

pub mod pipeline;

/// Entry point for the `multicube` binary.
pub fn run() -> Result<(), CubeError> {
    let cli = crate::cli::Cli::parse();

    match cli.command {
        Command::Grid(args) => handle_grid(args),
        Command::Select(args) => handle_select(args),
        Command::Fit(args) => handle_fit(args),
    }
}

fn handle_grid(args: GridCommandArgs) -> Result<(), CubeError> {
    let out = pipeline::run_grid(&args)?;
    println!(
        "Wrote {} guesses ({} parameters) to {} and {}×{} models to {}",
        out.n_guesses,
        out.npars,
        args.guesses_out.display(),
        out.n_guesses,
        out.n_channels,
        args.models_out.display()
    );
    Ok(())
}

fn handle_select(args: SelectArgs) -> Result<(), CubeError> {
    let run = pipeline::run_select(&args)?;
    println!("{}", crate::report::format_selection_summary(&run.report));

    if let Some(path) = &args.report {
        write_report(path, &run.report)?;
    }
    Ok(())
}

fn handle_fit(args: FitArgs) -> Result<(), CubeError> {
    let run = pipeline::run_fit(&args)?;
    println!("{}", crate::report::format_selection_summary(&run.selection));

    if let Some(fit) = run.session.fit() {
        println!(
            "{}",
            crate::report::format_fit_summary(&run.report, fit.parcube.view())
        );
    }

    if let Some(path) = &args.select.report {
        write_report(path, &run.selection)?;
    }
    if let Some(path) = &args.fit_report {
        write_report(path, &run.report)?;
    }
    Ok(())
}
