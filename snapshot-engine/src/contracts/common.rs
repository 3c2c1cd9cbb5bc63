//! Common Contract Types
//!
//! Shared identity types used across snapshot, query and job contracts.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Kind of entity that can be analysed into a snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    /// A regular A/B experiment.
    Experiment,
    /// A feature rollout guarded by metrics.
    SafeRollout,
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Experiment => write!(f, "experiment"),
            Self::SafeRollout => write!(f, "safe_rollout"),
        }
    }
}

/// Reference to an experiment or rollout owned by an organization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Validate)]
pub struct EntityRef {
    pub kind: AnalysisKind,

    #[validate(length(min = 1, max = 128))]
    pub id: String,

    #[validate(length(min = 1, max = 128))]
    pub organization: String,
}

impl EntityRef {
    pub fn experiment(id: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            kind: AnalysisKind::Experiment,
            id: id.into(),
            organization: organization.into(),
        }
    }

    pub fn safe_rollout(id: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            kind: AnalysisKind::SafeRollout,
            id: id.into(),
            organization: organization.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.organization, self.id)
    }
}
