use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("NodeReadinessRule {rule} has an invalid nodeSelector: {message}")]
    InvalidSelector { rule: String, message: String },

    #[error("Invalid NodeReadinessRule configuration: {0}")]
    InvalidRuleConfig(String),

    #[error("Node {node} kept changing underneath us; gave up after {attempts} attempts")]
    ConflictRetriesExhausted { node: String, attempts: u32 },

    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::FinalizerError(_) => "FinalizerError",
            Error::InvalidSelector { .. } => "InvalidSelector",
            Error::InvalidRuleConfig(_) => "InvalidRuleConfig",
            Error::ConflictRetriesExhausted { .. } => "ConflictRetriesExhausted",
            Error::MissingObjectKey(_) => "MissingObjectKey",
        }
    }

    /// A write lost an optimistic-concurrency race and can be retried against a fresh read.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::KubeError(kube::Error::Api(kube::error::ErrorResponse { code: 409, reason, .. }))
                if reason == "Conflict"
        )
    }

    /// The object was deleted underneath the reconciliation.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::KubeError(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. }))
        )
    }
}

pub mod controllers;

/// Selector matching, condition evaluation, taint and marker handling
pub mod readiness;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

pub mod resources;

pub mod retry;

/// Access to nodes, rules and evaluation records
pub mod store;

pub use controllers::{run, Settings, State};
