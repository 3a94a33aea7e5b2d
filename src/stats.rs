// src/stats.rs
//! Descriptive statistics, robust outlier rejection and Welch's t-test.
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Scales a median absolute deviation to a standard deviation for normal data.
const MAD_TO_SIGMA: f64 = 1.4826;

pub fn mean(values: &[f64]) -> Option<f64> {
    ArrayView1::from(values).mean()
}

/// Unbiased sample variance (n - 1 denominator).
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    Some(ArrayView1::from(values).var(1.0))
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutlierSplit {
    pub kept: Vec<f64>,
    pub removed: usize,
    pub center: f64,
    pub scale: f64,
}

/// Drops values further than `threshold` robust deviations from the median.
///
/// The deviation scale is 1.4826 x MAD, or the standard deviation when the MAD
/// collapses to zero. A zero scale keeps everything.
pub fn remove_outliers(values: &[f64], threshold: f64) -> OutlierSplit {
    let Some(center) = median(values) else {
        return OutlierSplit {
            kept: Vec::new(),
            removed: 0,
            center: 0.0,
            scale: 0.0,
        };
    };
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    let mad = median(&deviations).unwrap_or(0.0);
    let scale = if mad > 0.0 {
        MAD_TO_SIGMA * mad
    } else {
        sample_variance(values).map(f64::sqrt).unwrap_or(0.0)
    };
    if !(scale > 0.0) || !threshold.is_finite() {
        return OutlierSplit {
            kept: values.to_vec(),
            removed: 0,
            center,
            scale,
        };
    }
    let limit = threshold * scale;
    let kept: Vec<f64> = values
        .iter()
        .copied()
        .filter(|v| (v - center).abs() <= limit)
        .collect();
    OutlierSplit {
        removed: values.len() - kept.len(),
        kept,
        center,
        scale,
    }
}

/// Natural log of the gamma function (Lanczos, g = 7).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
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
        return (pi / (pi * x).sin()).abs().ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = COEFFS[0];
    for (i, c) in COEFFS.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

/// Continued fraction for the incomplete beta function (modified Lentz).
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 1e-15;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function I_x(a, b).
pub fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Two-sided tail probability of Student's t with `df` degrees of freedom.
pub fn student_t_two_sided(t: f64, df: f64) -> f64 {
    if t.is_nan() || !(df > 0.0) {
        return f64::NAN;
    }
    if t.is_infinite() {
        return 0.0;
    }
    let x = df / (df + t * t);
    regularized_incomplete_beta(df / 2.0, 0.5, x).clamp(0.0, 1.0)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WelchTest {
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
}

/// Welch's unequal-variance t-test. `None` when either side has fewer than
/// two values.
pub fn welch_t_test(a: &[f64], b: &[f64]) -> Option<WelchTest> {
    let (mean_a, mean_b) = (mean(a)?, mean(b)?);
    let (var_a, var_b) = (sample_variance(a)?, sample_variance(b)?);
    let (n_a, n_b) = (a.len() as f64, b.len() as f64);
    let se_a = var_a / n_a;
    let se_b = var_b / n_b;
    let se_sum = se_a + se_b;

    if se_sum == 0.0 {
        // Both samples are constant.
        let equal = mean_a == mean_b;
        return Some(WelchTest {
            t_statistic: if equal {
                0.0
            } else {
                (mean_a - mean_b).signum() * f64::INFINITY
            },
            degrees_of_freedom: n_a + n_b - 2.0,
            p_value: if equal { 1.0 } else { 0.0 },
        });
    }

    let t = (mean_a - mean_b) / se_sum.sqrt();
    let df = se_sum * se_sum / (se_a * se_a / (n_a - 1.0) + se_b * se_b / (n_b - 1.0));
    Some(WelchTest {
        t_statistic: t,
        degrees_of_freedom: df,
        p_value: student_t_two_sided(t, df),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_moments() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&values), Some(5.0));
        assert!((sample_variance(&values).unwrap() - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!(median(&values), Some(4.5));
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn ln_gamma_matches_factorials() {
        assert!(ln_gamma(1.0).abs() < 1e-12);
        assert!((ln_gamma(5.0) - 24f64.ln()).abs() < 1e-10);
        assert!((ln_gamma(0.5) - std::f64::consts::PI.sqrt().ln()).abs() < 1e-10);
    }

    #[test]
    fn student_t_reference_values() {
        // Cauchy: P(|T| > 1) = 0.5
        assert!((student_t_two_sided(1.0, 1.0) - 0.5).abs() < 1e-10);
        assert!((student_t_two_sided(2.0, 10.0) - 0.073_388).abs() < 1e-5);
        assert!((student_t_two_sided(2.228_139, 10.0) - 0.05).abs() < 1e-5);
        assert_eq!(student_t_two_sided(0.0, 7.0), 1.0);
        assert_eq!(student_t_two_sided(-2.0, 10.0), student_t_two_sided(2.0, 10.0));
    }

    #[test]
    fn welch_is_symmetric_and_handles_constant_samples() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [2.0, 4.0, 6.0, 8.0, 10.0, 12.0];
        let ab = welch_t_test(&a, &b).unwrap();
        let ba = welch_t_test(&b, &a).unwrap();
        assert_eq!(ab.p_value, ba.p_value);
        assert_eq!(ab.t_statistic, -ba.t_statistic);
        assert!(ab.p_value > 0.0 && ab.p_value < 1.0);

        let same = welch_t_test(&[3.0; 4], &[3.0; 6]).unwrap();
        assert_eq!(same.p_value, 1.0);
        let apart = welch_t_test(&[3.0; 4], &[4.0; 6]).unwrap();
        assert_eq!(apart.p_value, 0.0);
        assert!(welch_t_test(&[1.0], &b).is_none());
    }

    #[test]
    fn welch_identical_samples_give_p_one() {
        let a = [1.5, 2.5, 2.0, 3.0, 1.0];
        let test = welch_t_test(&a, &a).unwrap();
        assert_eq!(test.t_statistic, 0.0);
        assert!((test.p_value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn outliers_are_removed_around_the_median() {
        let mut values: Vec<f64> = (0..50).map(|i| 10.0 + (i % 5) as f64 * 0.1).collect();
        values.push(100.0);
        values.push(-50.0);
        let split = remove_outliers(&values, 3.0);
        assert_eq!(split.removed, 2);
        assert_eq!(split.kept.len(), 50);
        assert!(split.kept.iter().all(|v| (9.9..10.5).contains(v)));
    }

    #[test]
    fn zero_spread_keeps_every_value() {
        let split = remove_outliers(&[4.0; 10], 3.0);
        assert_eq!(split.removed, 0);
        assert_eq!(split.kept.len(), 10);
        assert_eq!(split.scale, 0.0);
    }

    #[test]
    fn mad_of_zero_falls_back_to_standard_deviation() {
        // More than half the values are identical, so the MAD is zero.
        let mut values = vec![1.0; 8];
        values.extend([2.0, 3.0]);
        let split = remove_outliers(&values, 3.0);
        assert!(split.scale > 0.0);
        assert_eq!(split.removed, 0);
    }
}
