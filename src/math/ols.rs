//! Linear least squares for Levenberg–Marquardt steps.
//!
//! Each step of the pixel fitter solves
//!
//! ```text
//! minimize ‖J δ - r‖² + λ ‖D δ‖²
//! ```
//!
//! as one ordinary least squares problem on the stacked system `[J; √λ D]`.
//! The stacked matrix is always tall, so we solve through SVD, which also
//! copes with the nearly collinear Jacobian columns produced by narrow or
//! weak lines.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if strict solve fails.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Solve the damped system `[J; √λ D] δ = [r; 0]`, with `D` the diagonal of
/// Jacobian column norms.
pub fn solve_damped(jacobian: &DMatrix<f64>, residuals: &DVector<f64>, lambda: f64) -> Option<DVector<f64>> {
    let (rows, cols) = jacobian.shape();
    let mut stacked = DMatrix::<f64>::zeros(rows + cols, cols);
    stacked.rows_mut(0, rows).copy_from(jacobian);
    let damping = lambda.max(0.0).sqrt();
    for j in 0..cols {
        let norm = jacobian.column(j).norm().max(1e-12);
        stacked[(rows + j, j)] = damping * norm;
    }
    let mut rhs = DVector::<f64>::zeros(rows + cols);
    rhs.rows_mut(0, rows).copy_from(residuals);
    solve_least_squares(&stacked, &rhs)
}
