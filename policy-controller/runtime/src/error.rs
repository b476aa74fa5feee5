use crate::{cluster::ClusterError, validation::ValidationError};
use intent_policy_controller_core::{ConversionError, GenerateError};
use intent_policy_controller_k8s_cluster::TopologyError;
use std::time::Duration;

/// Why a reconciliation pass stopped short of enforcement.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to classify intent: {0:#}")]
    Classification(anyhow::Error),

    #[error("ambiguous pod name: {0}")]
    AmbiguousPod(String),

    #[error("pod not found: {0}")]
    PodNotFound(String),

    #[error("no service found for pod {0}")]
    ServiceNotFound(String),

    #[error("policy generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("policy generator broke its output contract: {0}")]
    GenerationContractViolation(String),

    #[error("policy generation failed: {0}")]
    GenerationFailed(String),

    #[error("none of {} generated policies could be converted", .0.len())]
    Conversion(Vec<ConversionError>),

    #[error("{} validation errors", .0.len())]
    Validation(Vec<ValidationError>),

    #[error("failed to enforce {policy}: {source}")]
    Enforcement {
        policy: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to read cluster state: {0}")]
    Fetch(#[source] ClusterError),
}

// === impl Error ===

impl Error {
    /// Only cluster read failures are worth retrying the pass for.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }

    /// A stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Classification(_) => "classification",
            Self::AmbiguousPod(_) => "ambiguous_pod",
            Self::PodNotFound(_) => "pod_not_found",
            Self::ServiceNotFound(_) => "service_not_found",
            Self::GenerationTimeout(_) => "generation_timeout",
            Self::GenerationContractViolation(_) => "generation_contract_violation",
            Self::GenerationFailed(_) => "generation_failed",
            Self::Conversion(_) => "conversion",
            Self::Validation(_) => "validation",
            Self::Enforcement { .. } => "enforcement",
            Self::Fetch(_) => "fetch",
        }
    }
}

impl From<TopologyError> for Error {
    fn from(error: TopologyError) -> Self {
        match error {
            TopologyError::PodNotFound { namespace, name } => {
                Self::PodNotFound(format!("{namespace}/{name}"))
            }
            TopologyError::AmbiguousPod {
                namespace,
                name,
                count,
            } => Self::AmbiguousPod(format!("{name:?} matches {count} pods in {namespace}")),
            TopologyError::ServiceNotFound { namespace, name } => {
                Self::ServiceNotFound(format!("{namespace}/{name}"))
            }
            TopologyError::Cluster(error) => Self::Fetch(error),
        }
    }
}

impl From<GenerateError> for Error {
    fn from(error: GenerateError) -> Self {
        match error {
            GenerateError::ContractViolation(output) => Self::GenerationContractViolation(output),
            error @ GenerateError::Failed(_) => Self::GenerationFailed(error.to_string()),
        }
    }
}
