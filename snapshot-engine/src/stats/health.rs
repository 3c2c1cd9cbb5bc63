//! Traffic health and sample-size statistics.

use serde_json::Value;

use super::distributions::{chi_square_cdf, normal_cdf, normal_quantile};
use super::{finite_or, finite_or_zero, StatsError};

/// Significance level used when a caller does not supply one.
pub const DEFAULT_ALPHA: f64 = 0.05;

/// Sample ratio mismatch test.
///
/// Pearson chi-square goodness-of-fit of observed users against the expected
/// traffic split. Variations with a non-positive weight or no users are left
/// out of the test. Returns 1.0 when fewer than two variations remain.
pub fn check_srm(users: &[f64], weights: &[f64]) -> f64 {
    let valid: Vec<(f64, f64)> = users
        .iter()
        .zip(weights.iter())
        .filter(|(u, w)| u.is_finite() && w.is_finite() && **u > 0.0 && **w > 0.0)
        .map(|(u, w)| (*u, *w))
        .collect();

    if valid.len() < 2 {
        return 1.0;
    }

    let total_users: f64 = valid.iter().map(|(u, _)| u).sum();
    let total_weight: f64 = valid.iter().map(|(_, w)| w).sum();

    let statistic: f64 = valid
        .iter()
        .map(|(observed, weight)| {
            let expected = weight / total_weight * total_users;
            finite_or_zero((observed - expected).powi(2) / expected)
        })
        .sum();

    let degrees_of_freedom = (valid.len() - 1) as f64;
    let p_value = 1.0 - chi_square_cdf(statistic, degrees_of_freedom);

    finite_or(p_value, 1.0).clamp(0.0, 1.0)
}

/// Recover the sum of squares from a mean-style summary.
///
/// Returns 0 when `n <= 1`, where the sample variance is undefined.
pub fn sum_squares_from_stats(sum: f64, variance: f64, n: f64) -> f64 {
    if n <= 1.0 {
        return 0.0;
    }
    finite_or_zero(variance * (n - 1.0) + sum * sum / n)
}

/// Sample variance from running sums.
pub fn mean_variance_from_sums(sum: f64, sum_squares: f64, n: f64) -> f64 {
    finite_or_zero((sum_squares - sum * sum / n) / (n - 1.0))
}

/// Probability of detecting a relative effect of `effect_size` on a metric
/// with the given mean and variance, with `n` users split across
/// `n_variations` arms.
pub fn power_estimate(
    effect_size: f64,
    mean: f64,
    variance: f64,
    n: f64,
    n_variations: f64,
    alpha: f64,
    two_tailed: bool,
) -> f64 {
    let z_critical = if two_tailed {
        normal_quantile(1.0 - alpha / 2.0)
    } else {
        normal_quantile(1.0 - alpha)
    };

    let standard_error = (2.0 * variance * n_variations / n).sqrt();
    let standardized_effect = effect_size * mean / standard_error;

    let mut power = 1.0 - normal_cdf(z_critical - standardized_effect);
    if two_tailed {
        power += normal_cdf(-z_critical - standardized_effect);
    }

    finite_or_zero(power).clamp(0.0, 1.0)
}

/// Power estimate parameters as they arrive from untyped callers.
///
/// Field names are camelCase to match the JSON payloads accepted by the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerEstimateInput {
    pub effect_size: f64,
    pub mean: f64,
    pub variance: f64,
    pub n: f64,
    pub n_variations: f64,
    pub alpha: f64,
    pub two_tailed: bool,
}

impl PowerEstimateInput {
    /// Parse and type-check a JSON object.
    ///
    /// `alpha` defaults to 0.05 and `twoTailed` to `true`. A `twoTailed` value
    /// that is present but not a boolean is a domain error.
    pub fn from_value(value: &Value) -> Result<Self, StatsError> {
        let object = value
            .as_object()
            .ok_or_else(|| StatsError::Domain("power estimate input must be an object".to_string()))?;

        let number = |key: &str| -> Result<f64, StatsError> {
            object
                .get(key)
                .and_then(Value::as_f64)
                .ok_or_else(|| StatsError::Domain(format!("{} must be a number", key)))
        };

        let alpha = match object.get("alpha") {
            None | Some(Value::Null) => DEFAULT_ALPHA,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| StatsError::Domain("alpha must be a number".to_string()))?,
        };
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(StatsError::Domain(format!("alpha must be in (0, 1), got {}", alpha)));
        }

        let two_tailed = match object.get("twoTailed") {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(StatsError::Domain(format!(
                    "twoTailed must be a boolean, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            effect_size: number("effectSize")?,
            mean: number("mean")?,
            variance: number("variance")?,
            n: number("n")?,
            n_variations: number("nVariations")?,
            alpha,
            two_tailed,
        })
    }

    pub fn estimate(&self) -> f64 {
        power_estimate(
            self.effect_size,
            self.mean,
            self.variance,
            self.n,
            self.n_variations,
            self.alpha,
            self.two_tailed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_srm_balanced_traffic_is_healthy() {
        let p = check_srm(&[1000.0, 1000.0], &[0.5, 0.5]);
        assert!((p - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_srm_detects_mismatch() {
        let p = check_srm(&[1000.0, 1200.0], &[0.5, 0.5]);
        assert!(p < 0.001, "p = {p}");
        assert!(p >= 0.0);
    }

    #[test]
    fn test_srm_requires_two_valid_variations() {
        assert_eq!(check_srm(&[1000.0], &[1.0]), 1.0);
        assert_eq!(check_srm(&[1000.0, 0.0], &[0.5, 0.5]), 1.0);
        assert_eq!(check_srm(&[1000.0, 900.0], &[1.0, 0.0]), 1.0);
        assert_eq!(check_srm(&[], &[]), 1.0);
    }

    #[test]
    fn test_srm_scale_invariant_in_weights() {
        let users = [1000.0, 1050.0, 980.0];
        let a = check_srm(&users, &[1.0, 1.0, 1.0]);
        let b = check_srm(&users, &[0.2, 0.2, 0.2]);
        let c = check_srm(&users, &[50.0, 50.0, 50.0]);
        assert!((a - b).abs() < 1e-12);
        assert!((a - c).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&a));
    }

    #[test]
    fn test_srm_ignores_zero_weight_variation() {
        let with_disabled = check_srm(&[500.0, 500.0, 300.0], &[0.5, 0.5, 0.0]);
        let without = check_srm(&[500.0, 500.0], &[0.5, 0.5]);
        assert_eq!(with_disabled, without);
    }

    #[test]
    fn test_sum_squares_guards_single_observation() {
        assert_eq!(sum_squares_from_stats(10.0, 4.0, 1.0), 0.0);
        assert_eq!(sum_squares_from_stats(10.0, 4.0, 0.0), 0.0);
        // variance 4 over 5 observations with mean 2: 4 * 4 + 100 / 5
        assert!((sum_squares_from_stats(10.0, 4.0, 5.0) - 36.0).abs() < 1e-12);
    }

    #[test]
    fn test_mean_variance_from_sums() {
        // values 1, 2, 3, 4
        assert!((mean_variance_from_sums(10.0, 30.0, 4.0) - 5.0 / 3.0).abs() < 1e-12);
        assert_eq!(mean_variance_from_sums(5.0, 25.0, 1.0), 0.0);
        assert_eq!(mean_variance_from_sums(0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_sums_round_trip_through_variance() {
        let ss = sum_squares_from_stats(10.0, 5.0 / 3.0, 4.0);
        assert!((mean_variance_from_sums(10.0, ss, 4.0) - 5.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_power_zero_effect_equals_alpha() {
        let power = power_estimate(0.0, 10.0, 4.0, 1000.0, 2.0, 0.05, false);
        assert!((power - 0.05).abs() < 1e-4, "power = {power}");

        let two_sided = power_estimate(0.0, 10.0, 4.0, 1000.0, 2.0, 0.05, true);
        assert!((two_sided - 0.05).abs() < 1e-4, "power = {two_sided}");
    }

    #[test]
    fn test_power_grows_with_sample_size() {
        let small = power_estimate(0.05, 10.0, 25.0, 500.0, 2.0, 0.05, true);
        let large = power_estimate(0.05, 10.0, 25.0, 50_000.0, 2.0, 0.05, true);
        assert!(small < large);
        assert!(large <= 1.0);
    }

    #[test]
    fn test_power_degenerate_inputs() {
        assert_eq!(power_estimate(0.05, 10.0, 0.0, 0.0, 2.0, 0.05, true), 0.0);
    }

    #[test]
    fn test_power_input_rejects_non_boolean_two_tailed() {
        let input = json!({
            "effectSize": 0.05, "mean": 10.0, "variance": 4.0,
            "n": 1000, "nVariations": 2, "twoTailed": "yes"
        });
        let err = PowerEstimateInput::from_value(&input).unwrap_err();
        assert!(matches!(err, StatsError::Domain(_)));

        let input = json!({
            "effectSize": 0.05, "mean": 10.0, "variance": 4.0,
            "n": 1000, "nVariations": 2, "twoTailed": 1
        });
        assert!(PowerEstimateInput::from_value(&input).is_err());
    }

    #[test]
    fn test_power_input_defaults() {
        let input = json!({
            "effectSize": 0.0, "mean": 10.0, "variance": 4.0,
            "n": 1000, "nVariations": 2
        });
        let parsed = PowerEstimateInput::from_value(&input).unwrap();
        assert_eq!(parsed.alpha, DEFAULT_ALPHA);
        assert!(parsed.two_tailed);
        assert!((parsed.estimate() - 0.05).abs() < 1e-4);
    }

    #[test]
    fn test_power_input_requires_numbers() {
        let input = json!({ "effectSize": "big", "mean": 1, "variance": 1, "n": 1, "nVariations": 2 });
        assert!(PowerEstimateInput::from_value(&input).is_err());
        assert!(PowerEstimateInput::from_value(&json!([1, 2])).is_err());
    }
}
