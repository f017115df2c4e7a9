use thiserror::Error;

/// Failures surfaced to callers of the supervisor. Each one affects a single session.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("unknown session '{0}'")]
    UnknownSession(String),

    #[error("failed to spawn process for session '{session_id}': {source:#}")]
    Spawn {
        session_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("session '{0}' has no live process")]
    ProcessGone(String),

    #[error("could not deliver command to session '{session_id}' after {attempts} attempts")]
    CommandDelivery { session_id: String, attempts: u32 },
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
