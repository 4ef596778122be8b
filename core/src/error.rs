use std::fmt;

/// Error taxonomy shared by every fence crate. Library code returns this type;
/// the binaries convert it into `anyhow::Error` at the wiring boundary.
#[derive(Debug, thiserror::Error)]
pub enum FenceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict updating {0}")]
    Conflict(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl FenceError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Marker so call sites can render a short, stable classification for metrics
/// labels without matching on the full error.
impl FenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient",
            Self::Validation(_) => "validation",
            Self::Fatal(_) => "fatal",
        }
    }
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A lightweight error for the pure resolver functions, which never touch
/// Kubernetes and so never need the full `FenceError` taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyError(pub String);

impl std::error::Error for ClassifyError {}
