//! Post-measurement fits over completed series.
//!
//! Analysis runs after the main ramp and before finalize; a failed fit is
//! logged and skipped, it never blocks the ramp-down. Results are both kept
//! on the report and emitted as `AppendAnalysis` events, with fitted lines
//! replayed into an `xfit` reading series for plot overlays.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, MeasureError};

/// Fit kinds that can be registered on a measurement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    /// Least-squares straight line `y = a*x + b`.
    LinearFit,
    /// Least-squares parabola `y = a*x^2 + b*x + c`.
    QuadraticFit,
}

/// One registered analysis: which fit over which pair of series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisFunction {
    pub kind: AnalysisKind,
    /// X series name (e.g. "voltage").
    pub x: String,
    /// Y series name (e.g. "current" or "capacitance").
    pub y: String,
}

/// Result of one analysis function: named coefficients plus fitted points.
#[derive(Clone, Debug)]
pub struct AnalysisResult {
    /// Key reported to consumers (e.g. "linear_fit").
    pub key: String,
    /// Named fit coefficients and quality figures.
    pub values: Vec<(String, f64)>,
    /// Fitted `(x, y)` points for plot overlays.
    pub fitted: Vec<(f64, f64)>,
}

fn check_lengths(x: &[f64], y: &[f64], minimum: usize) -> AppResult<()> {
    if x.len() != y.len() {
        return Err(MeasureError::InvalidParameter(format!(
            "series length mismatch: {} vs {}",
            x.len(),
            y.len()
        )));
    }
    if x.len() < minimum {
        return Err(MeasureError::InvalidParameter(format!(
            "need at least {minimum} points, got {}",
            x.len()
        )));
    }
    Ok(())
}

/// Least-squares line through `(x, y)`; returns `(a, b)` for `y = a*x + b`.
pub fn linear_fit(x: &[f64], y: &[f64]) -> AppResult<(f64, f64)> {
    check_lengths(x, y, 2)?;
    let n = x.len() as f64;
    let sx: f64 = x.iter().sum();
    let sy: f64 = y.iter().sum();
    let sxx: f64 = x.iter().map(|v| v * v).sum();
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let det = n * sxx - sx * sx;
    if det == 0.0 {
        return Err(MeasureError::InvalidParameter(
            "degenerate x values for linear fit".to_string(),
        ));
    }
    let a = (n * sxy - sx * sy) / det;
    let b = (sy - a * sx) / n;
    Ok((a, b))
}

/// Least-squares parabola through `(x, y)`; returns `(a, b, c)` for
/// `y = a*x^2 + b*x + c`, solved from the 3x3 normal equations.
pub fn quadratic_fit(x: &[f64], y: &[f64]) -> AppResult<(f64, f64, f64)> {
    check_lengths(x, y, 3)?;
    let n = x.len() as f64;
    let s1: f64 = x.iter().sum();
    let s2: f64 = x.iter().map(|v| v.powi(2)).sum();
    let s3: f64 = x.iter().map(|v| v.powi(3)).sum();
    let s4: f64 = x.iter().map(|v| v.powi(4)).sum();
    let sy: f64 = y.iter().sum();
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let sxxy: f64 = x.iter().zip(y).map(|(a, b)| a * a * b).sum();

    // Cramer's rule on [[s4,s3,s2],[s3,s2,s1],[s2,s1,n]] * [a,b,c] = [sxxy,sxy,sy]
    let det3 = |m: [[f64; 3]; 3]| -> f64 {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };
    let m = [[s4, s3, s2], [s3, s2, s1], [s2, s1, n]];
    let det = det3(m);
    if det == 0.0 {
        return Err(MeasureError::InvalidParameter(
            "degenerate x values for quadratic fit".to_string(),
        ));
    }
    let ma = [[sxxy, s3, s2], [sxy, s2, s1], [sy, s1, n]];
    let mb = [[s4, sxxy, s2], [s3, sxy, s1], [s2, sy, n]];
    let mc = [[s4, s3, sxxy], [s3, s2, sxy], [s2, s1, sy]];
    Ok((det3(ma) / det, det3(mb) / det, det3(mc) / det))
}

/// Run one registered analysis over its series.
pub fn run_analysis(
    function: &AnalysisFunction,
    x: &[f64],
    y: &[f64],
) -> AppResult<AnalysisResult> {
    match function.kind {
        AnalysisKind::LinearFit => {
            let (a, b) = linear_fit(x, y)?;
            let fitted = x.iter().map(|&xi| (xi, a * xi + b)).collect();
            Ok(AnalysisResult {
                key: "linear_fit".to_string(),
                values: vec![("a".to_string(), a), ("b".to_string(), b)],
                fitted,
            })
        }
        AnalysisKind::QuadraticFit => {
            let (a, b, c) = quadratic_fit(x, y)?;
            let fitted = x.iter().map(|&xi| (xi, a * xi * xi + b * xi + c)).collect();
            Ok(AnalysisResult {
                key: "quadratic_fit".to_string(),
                values: vec![
                    ("a".to_string(), a),
                    ("b".to_string(), b),
                    ("c".to_string(), c),
                ],
                fitted,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_fit_recovers_line() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y: Vec<f64> = x.iter().map(|v| 2.5 * v - 1.0).collect();
        let (a, b) = linear_fit(&x, &y).unwrap();
        assert!((a - 2.5).abs() < 1e-12);
        assert!((b + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_quadratic_fit_recovers_parabola() {
        let x = [-2.0, -1.0, 0.0, 1.0, 2.0];
        let y: Vec<f64> = x.iter().map(|v| 0.5 * v * v - 3.0 * v + 2.0).collect();
        let (a, b, c) = quadratic_fit(&x, &y).unwrap();
        assert!((a - 0.5).abs() < 1e-9);
        assert!((b + 3.0).abs() < 1e-9);
        assert!((c - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_points_rejected() {
        assert!(linear_fit(&[1.0], &[1.0]).is_err());
        assert!(quadratic_fit(&[1.0, 2.0], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_degenerate_x_rejected() {
        assert!(linear_fit(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_run_analysis_emits_fitted_points() {
        let function = AnalysisFunction {
            kind: AnalysisKind::LinearFit,
            x: "voltage".to_string(),
            y: "current".to_string(),
        };
        let x = [0.0, 1.0, 2.0];
        let y = [0.0, 2.0, 4.0];
        let result = run_analysis(&function, &x, &y).unwrap();
        assert_eq!(result.key, "linear_fit");
        assert_eq!(result.fitted.len(), 3);
        assert!((result.fitted[2].1 - 4.0).abs() < 1e-12);
    }
}
