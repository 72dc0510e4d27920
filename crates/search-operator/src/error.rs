use std::fmt;

use thiserror::Error;

/// Coarse classification that drives requeue and condition reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Transient,
    FatalConfig,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Transient => "TransientAPIError",
            ErrorKind::FatalConfig => "FatalConfigError",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("{kind} {name}: immutable field {field} differs from desired state")]
    ImmutableField {
        kind: String,
        name: String,
        field: &'static str,
    },
    #[error("cluster call exceeded deadline of {0:?}")]
    DeadlineExceeded(std::time::Duration),
    #[error("transient cluster error: {0}")]
    Transient(String),
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
    #[error(transparent)]
    Build(#[from] BuildError),
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::NotFound { .. } => ErrorKind::NotFound,
            ReconcileError::Conflict { .. } => ErrorKind::Conflict,
            ReconcileError::Validation(_) | ReconcileError::ImmutableField { .. } => {
                ErrorKind::Validation
            }
            ReconcileError::DeadlineExceeded(_) | ReconcileError::Transient(_) => {
                ErrorKind::Transient
            }
            ReconcileError::Kube(e) => classify_kube(e),
            ReconcileError::FatalConfig(_)
            | ReconcileError::Build(_)
            | ReconcileError::Serialization(_)
            | ReconcileError::Anyhow(_) => ErrorKind::FatalConfig,
        }
    }

    /// Errors worth retrying sooner than the periodic resync.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Transient)
    }
}

fn classify_kube(err: &kube::Error) -> ErrorKind {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ErrorKind::NotFound,
        kube::Error::Api(ae) if ae.code == 409 => ErrorKind::Conflict,
        kube::Error::Api(ae) if ae.code == 422 || ae.code == 400 => ErrorKind::Validation,
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => ErrorKind::FatalConfig,
        _ => ErrorKind::Transient,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("owner {0} is empty")]
    MissingIdentity(&'static str),
    #[error("cannot encode generated configuration: {0}")]
    Encode(String),
}
