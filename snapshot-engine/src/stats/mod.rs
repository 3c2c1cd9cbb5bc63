//! Statistics Library
//!
//! Pure, deterministic functions used to turn warehouse aggregates into
//! experiment health and significance figures. Nothing in this module does
//! I/O or keeps state.
//!
//! Numeric failures never surface as errors: non-finite intermediate results
//! are coerced to a neutral value so a snapshot always renders. The only error
//! is [`StatsError::Domain`], raised for malformed untyped input.

pub mod distributions;
pub mod engine;
pub mod health;

pub use distributions::{chi_square_cdf, ln_gamma, normal_cdf, normal_quantile};
pub use engine::{
    engine_for, BayesianEngine, ComparisonSettings, FrequentistEngine, StatsEngine, VariationAggregate,
    VariationComparison,
};
pub use health::{
    check_srm, mean_variance_from_sums, power_estimate, sum_squares_from_stats, PowerEstimateInput, DEFAULT_ALPHA,
};

use thiserror::Error;

/// Errors raised by the statistics library.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StatsError {
    #[error("Domain error: {0}")]
    Domain(String),
}

/// Replace NaN and infinities with zero.
pub(crate) fn finite_or_zero(value: f64) -> f64 {
    finite_or(value, 0.0)
}

pub(crate) fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}
