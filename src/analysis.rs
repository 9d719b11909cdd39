//! Correlation and summary statistics over persisted property rows.
//!
//! The analyzer branch answers questions like "which processing parameters
//! correlate with ionic conductivity" from rows already written by earlier
//! runs. Everything here is pure: rows in, rendered text and statistics out.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::AnalysisError;
use crate::storage::PropertyRow;

/// Minimum overlapping samples required before a correlation is reported.
const MIN_SAMPLES: usize = 3;

/// A single feature's correlation against the target property.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    /// Property name being correlated against the target.
    pub feature: String,
    /// Pearson correlation coefficient in [-1, 1].
    pub coefficient: f64,
    /// Two-sided p-value of the coefficient.
    pub p_value: f64,
    /// Number of overlapping samples used.
    pub samples: usize,
}

impl Correlation {
    /// Significance marker in the conventional star notation.
    pub fn significance(&self) -> &'static str {
        if self.p_value < 0.001 {
            "***"
        } else if self.p_value < 0.01 {
            "**"
        } else if self.p_value < 0.05 {
            "*"
        } else {
            ""
        }
    }
}

/// Pivots the flat row set into one map of property -> value per document.
///
/// When a document reports the same property more than once the first row
/// wins; rows are already uniquely keyed by (document, material, property) so
/// this only matters across materials within one paper.
fn wide_rows(rows: &[PropertyRow]) -> BTreeMap<String, BTreeMap<String, f64>> {
    let mut by_document: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for row in rows {
        by_document
            .entry(row.document_id.clone())
            .or_default()
            .entry(row.property.clone())
            .or_insert(row.value);
    }
    by_document
}

/// Computes the Pearson correlation coefficient and its two-sided p-value.
///
/// Returns `None` when fewer than [`MIN_SAMPLES`] pairs are given or when
/// either series has zero variance.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    let n = xs.len().min(ys.len());
    if n < MIN_SAMPLES {
        return None;
    }

    let nf = n as f64;
    let mean_x = xs[..n].iter().sum::<f64>() / nf;
    let mean_y = ys[..n].iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }

    let r = (cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0);

    // Two-sided p-value from the t distribution with n-2 degrees of freedom,
    // expressed through the regularized incomplete beta function.
    let df = nf - 2.0;
    let denom = 1.0 - r * r;
    let p = if denom <= f64::EPSILON {
        0.0
    } else {
        let t2 = r * r * df / denom;
        incomplete_beta(df / 2.0, 0.5, df / (df + t2))
    };

    Some((r, p.clamp(0.0, 1.0)))
}

/// Correlates every numeric property against `target`, sorted by absolute
/// coefficient, strongest first.
pub fn correlations(
    rows: &[PropertyRow],
    target: &str,
) -> Result<Vec<Correlation>, AnalysisError> {
    if rows.is_empty() {
        return Err(AnalysisError::NoData);
    }

    let wide = wide_rows(rows);
    let mut properties: BTreeSet<&str> = BTreeSet::new();
    for columns in wide.values() {
        properties.extend(columns.keys().map(String::as_str));
    }

    if !properties.contains(target) {
        return Err(AnalysisError::UnknownTarget(target.to_string()));
    }

    let mut results = Vec::new();
    for property in properties {
        if property == target {
            continue;
        }

        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for columns in wide.values() {
            if let (Some(x), Some(y)) = (columns.get(property), columns.get(target)) {
                xs.push(*x);
                ys.push(*y);
            }
        }

        if let Some((coefficient, p_value)) = pearson(&xs, &ys) {
            results.push(Correlation {
                feature: property.to_string(),
                coefficient,
                p_value,
                samples: xs.len(),
            });
        }
    }

    results.sort_by(|a, b| {
        b.coefficient
            .abs()
            .partial_cmp(&a.coefficient.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(results)
}

/// Renders the correlation results as a markdown table.
pub fn render_correlation_table(target: &str, correlations: &[Correlation]) -> String {
    if correlations.is_empty() {
        return format!("Not enough overlapping data to correlate against '{target}'.");
    }

    let mut out = format!("Correlation analysis with '{target}':\n\n");
    out.push_str("| Feature | Correlation | P-value | N | Significance |\n");
    out.push_str("|---------|-------------|---------|---|---------------|\n");
    for c in correlations {
        out.push_str(&format!(
            "| {} | {:.4} | {:.4} | {} | {} |\n",
            c.feature,
            c.coefficient,
            c.p_value,
            c.samples,
            c.significance()
        ));
    }
    out
}

/// Renders per-property count/mean/min/max over the persisted rows.
pub fn render_summary(rows: &[PropertyRow]) -> String {
    if rows.is_empty() {
        return "No persisted data found. Run extraction first.".to_string();
    }

    let documents: BTreeSet<&str> = rows.iter().map(|r| r.document_id.as_str()).collect();
    let mut by_property: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for row in rows {
        by_property.entry(&row.property).or_default().push(row.value);
    }

    let mut out = format!(
        "Data summary: {} rows across {} documents\n\n",
        rows.len(),
        documents.len()
    );
    out.push_str("| Property | Count | Mean | Min | Max |\n");
    out.push_str("|----------|-------|------|-----|-----|\n");
    for (property, values) in by_property {
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        out.push_str(&format!(
            "| {property} | {count} | {mean:.4} | {min:.4} | {max:.4} |\n"
        ));
    }
    out
}

/// Natural log of the gamma function (Lanczos approximation, g = 7).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if x < 0.5 {
        // Reflection formula.
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let mut acc = 0.999_999_999_999_809_93;
    for (i, c) in COEFFS.iter().enumerate() {
        acc += c / (x + (i + 1) as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

/// Continued-fraction evaluation for the incomplete beta function.
fn beta_cf(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 3.0e-14;
    const FPMIN: f64 = 1.0e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;

        if (del - 1.0).abs() < EPS {
            break;
        }
    }

    h
}

/// Regularized incomplete beta function I_x(a, b).
fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();

    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_cf(a, b, x) / a
    } else {
        1.0 - front * beta_cf(b, a, 1.0 - x) / b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(document: &str, property: &str, value: f64) -> PropertyRow {
        PropertyRow {
            document_id: document.to_string(),
            material_id: "Li6PS5Cl".to_string(),
            property: property.to_string(),
            value,
            unit: String::new(),
        }
    }

    #[test]
    fn test_pearson_perfect_positive() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = [2.0, 4.0, 6.0, 8.0, 10.0];
        let (r, p) = pearson(&xs, &ys).unwrap();
        assert!((r - 1.0).abs() < 1e-12);
        assert!(p < 1e-9);
    }

    #[test]
    fn test_pearson_perfect_negative() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [8.0, 6.0, 4.0, 2.0];
        let (r, _) = pearson(&xs, &ys).unwrap();
        assert!((r + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_known_value() {
        // Hand-checked: r = 0.9 for this series.
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = [1.0, 3.0, 2.0, 4.0, 5.0];
        let (r, p) = pearson(&xs, &ys).unwrap();
        assert!((r - 0.9).abs() < 1e-9);
        assert!(p > 0.0 && p < 0.05);
    }

    #[test]
    fn test_pearson_rejects_tiny_samples() {
        assert!(pearson(&[1.0, 2.0], &[3.0, 4.0]).is_none());
    }

    #[test]
    fn test_pearson_rejects_zero_variance() {
        assert!(pearson(&[1.0, 1.0, 1.0], &[2.0, 3.0, 4.0]).is_none());
    }

    #[test]
    fn test_incomplete_beta_bounds() {
        assert_eq!(incomplete_beta(2.0, 3.0, 0.0), 0.0);
        assert_eq!(incomplete_beta(2.0, 3.0, 1.0), 1.0);
        // I_x(1, 1) is the identity.
        assert!((incomplete_beta(1.0, 1.0, 0.42) - 0.42).abs() < 1e-9);
    }

    #[test]
    fn test_correlations_against_target() {
        let mut rows = Vec::new();
        for (i, doc) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let x = (i + 1) as f64;
            rows.push(row(doc, "sintering_temp_c", 100.0 * x));
            rows.push(row(doc, "ionic_conductivity_ms_cm", 2.0 * x));
        }

        let results = correlations(&rows, "ionic_conductivity_ms_cm").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].feature, "sintering_temp_c");
        assert!((results[0].coefficient - 1.0).abs() < 1e-9);
        assert_eq!(results[0].samples, 5);
    }

    #[test]
    fn test_correlations_unknown_target() {
        let rows = vec![row("a", "sintering_temp_c", 500.0)];
        let err = correlations(&rows, "no_such_column").unwrap_err();
        assert!(matches!(err, AnalysisError::UnknownTarget(_)));
    }

    #[test]
    fn test_correlations_empty_rows() {
        let err = correlations(&[], "ionic_conductivity_ms_cm").unwrap_err();
        assert!(matches!(err, AnalysisError::NoData));
    }

    #[test]
    fn test_render_summary_counts() {
        let rows = vec![
            row("a", "ionic_conductivity_ms_cm", 1.0),
            row("b", "ionic_conductivity_ms_cm", 3.0),
        ];
        let text = render_summary(&rows);
        assert!(text.contains("2 rows across 2 documents"));
        assert!(text.contains("ionic_conductivity_ms_cm"));
        assert!(text.contains("2.0000")); // mean
    }

    #[test]
    fn test_significance_stars() {
        let base = Correlation {
            feature: "f".to_string(),
            coefficient: 0.5,
            p_value: 0.0005,
            samples: 10,
        };
        assert_eq!(base.significance(), "***");
        assert_eq!(
            Correlation {
                p_value: 0.004,
                ..base.clone()
            }
            .significance(),
            "**"
        );
        assert_eq!(
            Correlation {
                p_value: 0.2,
                ..base
            }
            .significance(),
            ""
        );
    }
}
