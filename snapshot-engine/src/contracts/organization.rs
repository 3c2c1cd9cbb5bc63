//! Organization-level analysis settings.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Which statistics engine turns aggregates into intervals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatsEngineKind {
    #[default]
    Bayesian,
    Frequentist,
}

impl std::fmt::Display for StatsEngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bayesian => write!(f, "bayesian"),
            Self::Frequentist => write!(f, "frequentist"),
        }
    }
}

/// Statistical settings an organization configures once for all experiments.
///
/// Values are stored as decimals because they are user-entered configuration;
/// they are converted to `f64` only when statistics are computed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrganizationSettings {
    /// Organization identifier
    pub organization: String,

    /// Engine used for lift intervals and significance
    #[serde(default)]
    pub stats_engine: StatsEngineKind,

    /// Confidence (frequentist) or credible (bayesian) interval level
    #[serde(default = "default_confidence_level")]
    pub confidence_level: Decimal,

    /// SRM p-values below this threshold flag the snapshot as unhealthy
    #[serde(default = "default_srm_threshold")]
    pub srm_threshold: Decimal,

    /// Relative effect used for the per-variation power estimate
    #[serde(default = "default_minimum_detectable_effect")]
    pub minimum_detectable_effect: Decimal,
}

fn default_confidence_level() -> Decimal {
    dec!(0.95)
}

fn default_srm_threshold() -> Decimal {
    dec!(0.001)
}

fn default_minimum_detectable_effect() -> Decimal {
    dec!(0.05)
}

impl OrganizationSettings {
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            stats_engine: StatsEngineKind::default(),
            confidence_level: default_confidence_level(),
            srm_threshold: default_srm_threshold(),
            minimum_detectable_effect: default_minimum_detectable_effect(),
        }
    }

    pub fn confidence_level_f64(&self) -> f64 {
        self.confidence_level.try_into().unwrap_or(0.95)
    }

    pub fn srm_threshold_f64(&self) -> f64 {
        self.srm_threshold.try_into().unwrap_or(0.001)
    }

    pub fn minimum_detectable_effect_f64(&self) -> f64 {
        self.minimum_detectable_effect.try_into().unwrap_or(0.05)
    }
}
