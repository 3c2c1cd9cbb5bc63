//! Stats engines
//!
//! Both engines estimate the relative lift of a treatment over the control
//! with a delta-method standard error. The frequentist engine reports a
//! two-sided p-value, the bayesian engine a chance to win under a flat prior.

use serde::{Deserialize, Serialize};

use super::distributions::{normal_cdf, normal_quantile};
use super::finite_or;
use crate::contracts::StatsEngineKind;

/// Per-variation aggregates of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariationAggregate {
    pub users: f64,
    pub mean: f64,
    pub variance: f64,
}

/// Inputs shared by every comparison in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparisonSettings {
    pub confidence_level: f64,
    /// Lower values of the metric are better
    pub inverse: bool,
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            inverse: false,
        }
    }
}

/// Treatment versus control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariationComparison {
    pub expected_lift: f64,
    pub ci: [f64; 2],
    pub p_value: Option<f64>,
    pub chance_to_win: Option<f64>,
}

/// Pluggable strategy turning aggregates into intervals and significance.
pub trait StatsEngine: Send + Sync {
    fn kind(&self) -> StatsEngineKind;

    fn compare(
        &self,
        control: &VariationAggregate,
        treatment: &VariationAggregate,
        settings: &ComparisonSettings,
    ) -> VariationComparison;
}

/// Relative lift and its standard error, `None` when either is not finite.
fn relative_lift(control: &VariationAggregate, treatment: &VariationAggregate) -> Option<(f64, f64)> {
    let (mc, mt) = (control.mean, treatment.mean);
    let lift = mt / mc - 1.0;
    let variance = treatment.variance / (treatment.users * mc * mc)
        + control.variance * mt * mt / (control.users * mc.powi(4));
    let se = variance.sqrt();

    if lift.is_finite() && se.is_finite() && se > 0.0 {
        Some((lift, se))
    } else {
        None
    }
}

fn interval(lift: f64, se: f64, confidence_level: f64) -> [f64; 2] {
    let z = finite_or(normal_quantile(1.0 - (1.0 - confidence_level) / 2.0), 1.959964);
    [lift - z * se, lift + z * se]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrequentistEngine;

impl StatsEngine for FrequentistEngine {
    fn kind(&self) -> StatsEngineKind {
        StatsEngineKind::Frequentist
    }

    fn compare(
        &self,
        control: &VariationAggregate,
        treatment: &VariationAggregate,
        settings: &ComparisonSettings,
    ) -> VariationComparison {
        match relative_lift(control, treatment) {
            Some((lift, se)) => {
                let p_value = 2.0 * (1.0 - normal_cdf(lift.abs() / se));
                VariationComparison {
                    expected_lift: lift,
                    ci: interval(lift, se, settings.confidence_level),
                    p_value: Some(finite_or(p_value, 1.0).clamp(0.0, 1.0)),
                    chance_to_win: None,
                }
            }
            None => VariationComparison {
                expected_lift: 0.0,
                ci: [0.0, 0.0],
                p_value: Some(1.0),
                chance_to_win: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BayesianEngine;

impl StatsEngine for BayesianEngine {
    fn kind(&self) -> StatsEngineKind {
        StatsEngineKind::Bayesian
    }

    fn compare(
        &self,
        control: &VariationAggregate,
        treatment: &VariationAggregate,
        settings: &ComparisonSettings,
    ) -> VariationComparison {
        match relative_lift(control, treatment) {
            Some((lift, se)) => {
                let better = normal_cdf(lift / se);
                let chance_to_win = if settings.inverse { 1.0 - better } else { better };
                VariationComparison {
                    expected_lift: lift,
                    ci: interval(lift, se, settings.confidence_level),
                    p_value: None,
                    chance_to_win: Some(finite_or(chance_to_win, 0.5).clamp(0.0, 1.0)),
                }
            }
            None => VariationComparison {
                expected_lift: 0.0,
                ci: [0.0, 0.0],
                p_value: None,
                chance_to_win: Some(0.5),
            },
        }
    }
}

/// Engine configured for an organization.
pub fn engine_for(kind: StatsEngineKind) -> Box<dyn StatsEngine> {
    match kind {
        StatsEngineKind::Frequentist => Box::new(FrequentistEngine),
        StatsEngineKind::Bayesian => Box::new(BayesianEngine),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate(users: f64, mean: f64, variance: f64) -> VariationAggregate {
        VariationAggregate { users, mean, variance }
    }

    #[test]
    fn test_frequentist_detects_clear_lift() {
        let control = aggregate(10_000.0, 10.0, 4.0);
        let treatment = aggregate(10_000.0, 11.0, 4.0);
        let result = FrequentistEngine.compare(&control, &treatment, &ComparisonSettings::default());

        assert!((result.expected_lift - 0.1).abs() < 1e-12);
        assert!(result.ci[0] > 0.0 && result.ci[1] > result.expected_lift);
        assert!(result.p_value.unwrap() < 0.001);
        assert!(result.chance_to_win.is_none());
    }

    #[test]
    fn test_frequentist_no_difference() {
        let control = aggregate(1_000.0, 10.0, 4.0);
        let result = FrequentistEngine.compare(&control, &control, &ComparisonSettings::default());

        assert_eq!(result.expected_lift, 0.0);
        assert!((result.p_value.unwrap() - 1.0).abs() < 1e-6);
        assert!(result.ci[0] < 0.0 && result.ci[1] > 0.0);
    }

    #[test]
    fn test_bayesian_chance_to_win_respects_inverse() {
        let control = aggregate(10_000.0, 10.0, 4.0);
        let treatment = aggregate(10_000.0, 11.0, 4.0);

        let normal = BayesianEngine.compare(&control, &treatment, &ComparisonSettings::default());
        let inverse = BayesianEngine.compare(
            &control,
            &treatment,
            &ComparisonSettings {
                inverse: true,
                ..Default::default()
            },
        );

        assert!(normal.chance_to_win.unwrap() > 0.99);
        assert!(inverse.chance_to_win.unwrap() < 0.01);
        assert!(normal.p_value.is_none());
    }

    #[test]
    fn test_degenerate_inputs_are_not_significant() {
        let control = aggregate(0.0, 0.0, 0.0);
        let treatment = aggregate(100.0, 1.0, 1.0);

        let freq = FrequentistEngine.compare(&control, &treatment, &ComparisonSettings::default());
        assert_eq!(freq.expected_lift, 0.0);
        assert_eq!(freq.ci, [0.0, 0.0]);
        assert_eq!(freq.p_value, Some(1.0));

        let bayes = BayesianEngine.compare(&control, &treatment, &ComparisonSettings::default());
        assert_eq!(bayes.chance_to_win, Some(0.5));
    }

    #[test]
    fn test_engine_for_kind() {
        assert_eq!(engine_for(StatsEngineKind::Frequentist).kind(), StatsEngineKind::Frequentist);
        assert_eq!(engine_for(StatsEngineKind::Bayesian).kind(), StatsEngineKind::Bayesian);
    }
}
