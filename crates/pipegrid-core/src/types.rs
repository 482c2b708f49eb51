//! Policy and backend enums shared by configuration and persisted state.

use serde::{Deserialize, Serialize};

/// Which execution backend runs a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Subprocess on the scheduler host.
    #[default]
    Local,
    /// Managed container job (Kubernetes-style job API).
    Container,
    /// Managed cluster job (EMR/Dataproc-style step API).
    Cluster,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Container => "container",
            Self::Cluster => "cluster",
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to the rest of a run when a block fails permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop starting new blocks; the run fails once running blocks finish.
    #[default]
    FailFast,
    /// Only descendants of the failed block are abandoned.
    BestEffort,
}

/// Whether a trigger may have more than one active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    #[default]
    AllowOverlap,
    SkipIfRunning,
}
