//! Error taxonomy shared by the engine and its collaborators.
//!
//! Background loops log these and keep going. Direct user actions get them
//! back as `Err` values.

/// Engine-level error returned by every front-end operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Name resolution failed for a blocked domain. Transient.
    #[error("failed to resolve {domain}: {reason}")]
    Resolution { domain: String, reason: String },

    /// The packet interception driver failed. Fatal for the filter loop only.
    #[error("packet interception failed: {0}")]
    Interception(String),

    /// A process could not be terminated.
    #[error("cannot terminate process {pid}: {reason}")]
    ProcessAccess { pid: u32, reason: String },

    /// Loading or saving persisted state failed.
    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("credential does not match")]
    CredentialMismatch,

    #[error("{0}")]
    InvalidInput(String),

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("profile already exists: {0}")]
    ProfileExists(String),

    /// A session could not be started.
    #[error("session rejected: {0}")]
    SessionRejected(String),

    /// Something that runs once at a time was started again.
    #[error("{0} is already running")]
    AlreadyRunning(String),
}

impl EngineError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Resolution { .. } => "Resolution",
            EngineError::Interception(_) => "Interception",
            EngineError::ProcessAccess { .. } => "ProcessAccess",
            EngineError::Persistence(_) => "Persistence",
            EngineError::CredentialMismatch => "CredentialMismatch",
            EngineError::InvalidInput(_) => "InvalidInput",
            EngineError::ProfileNotFound(_) => "ProfileNotFound",
            EngineError::ProfileExists(_) => "ProfileExists",
            EngineError::SessionRejected(_) => "SessionRejected",
            EngineError::AlreadyRunning(_) => "AlreadyRunning",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Resolution { .. } | EngineError::ProcessAccess { .. }
        )
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Persistence(format!("{err:#}"))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant_name() {
        assert_eq!(EngineError::CredentialMismatch.kind(), "CredentialMismatch");
        assert_eq!(
            EngineError::AlreadyRunning("packet filter".into()).kind(),
            "AlreadyRunning"
        );
        assert_eq!(
            EngineError::ProfileNotFound("kid".into()).kind(),
            "ProfileNotFound"
        );
    }

    #[test]
    fn display_includes_context() {
        let err = EngineError::Resolution {
            domain: "example.com".into(),
            reason: "no such host".into(),
        };
        assert_eq!(err.to_string(), "failed to resolve example.com: no such host");
        assert_eq!(
            EngineError::AlreadyRunning("packet filter".into()).to_string(),
            "packet filter is already running"
        );
    }

    #[test]
    fn transient_errors() {
        assert!(
            EngineError::ProcessAccess {
                pid: 4,
                reason: "denied".into()
            }
            .is_transient()
        );
        assert!(!EngineError::CredentialMismatch.is_transient());
    }

    #[test]
    fn from_anyhow_is_persistence() {
        let err: EngineError = anyhow::anyhow!("disk full").context("saving state").into();
        assert_eq!(err.kind(), "Persistence");
        assert!(err.to_string().contains("disk full"));
    }
}
