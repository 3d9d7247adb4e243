//! Formatted terminal output.
//!
//! Formatting is kept apart from the selection and fitting code so output
//! changes stay local.

use ndarray::{ArrayView3, Axis};

use crate::io::export::{FitReport, SelectionReport};

/// Summary of a best-guess selection run.
pub fn format_selection_summary(report: &SelectionReport) -> String {
    let mut out = String::new();
    let [c, ny, nx] = report.cube_shape;

    out.push_str("=== multicube - best guess selection ===\n");
    out.push_str(&format!("Model: {}\n", report.model));
    out.push_str(&format!("Cube: {c} channels | {ny}×{nx} pixels\n"));
    out.push_str(&format!(
        "Guesses: {} | strategy: {}\n",
        report.n_guesses,
        report.strategy.display_name()
    ));
    match report.sn_cut {
        Some(cut) => out.push_str(&format!(
            "SNR cut: > {cut} | unmasked pixels: {}/{}\n",
            report.unmasked_pixels,
            ny * nx
        )),
        None => out.push_str("SNR cut: none\n"),
    }
    out.push_str(&format!("Selected pixels: {}\n", report.selected_pixels));

    out.push_str("\nOverall best:\n");
    match &report.overall_best {
        Some(best) => {
            let flag = if report.low_confidence { " (low confidence)" } else { "" };
            out.push_str(&format!(
                "- #{} {} | {} px ({:.1}%){flag}\n",
                best.index,
                fmt_vec(&best.guess),
                best.count,
                best.fraction * 100.0
            ));
        }
        None => out.push_str("- none\n"),
    }

    out.push_str("Best at peak SNR:\n");
    match &report.best_at_peak_snr {
        Some(peak) => out.push_str(&format!(
            "- #{} {} | pixel (y={}, x={}) snr={:.3}\n",
            peak.index,
            fmt_vec(&peak.guess),
            peak.pixel.0,
            peak.pixel.1,
            peak.snr
        )),
        None => out.push_str("- none\n"),
    }

    out
}

/// Summary of a cube fit, with the median of every fitted parameter.
pub fn format_fit_summary(report: &FitReport, parcube: ArrayView3<'_, f64>) -> String {
    let mut out = String::new();

    out.push_str("=== multicube - cube fit ===\n");
    out.push_str(&format!("Model: {}\n", report.model));
    out.push_str(&format!(
        "Pixels: fitted={} failed={}\n",
        report.fitted_pixels, report.failed_pixels
    ));
    out.push_str(&format!(
        "Chi-squared: dof={} median={}\n",
        report.dof,
        report
            .median_chi_squared
            .map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
    ));
    out.push_str(&format!(
        "Bad fits (p < {:e}): {}\n",
        report.bad_fit_cut, report.bad_fits
    ));

    out.push_str("\nParameters (median over fitted pixels):\n");
    out.push_str(&format!("{:<12} {:>14}\n", "name", "median"));
    out.push_str(&format!("{:-<12} {:-<14}\n", "", ""));
    for (p, plane) in parcube.axis_iter(Axis(0)).enumerate() {
        let name = report
            .parameter_names
            .get(p % report.parameter_names.len().max(1))
            .cloned()
            .unwrap_or_else(|| format!("p{p}"));
        let mut values: Vec<f64> = plane.iter().copied().filter(|v| v.is_finite()).collect();
        values.sort_by(f64::total_cmp);
        let median = match values.len() {
            0 => "n/a".to_string(),
            n => format!("{:.6}", values[n / 2]),
        };
        out.push_str(&format!("{:<12} {:>14}\n", truncate(&name, 12), median));
    }

    out
}

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.6}")).collect();
    format!("[{}]", parts.join(", "))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
