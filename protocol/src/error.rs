use thiserror::Error;

/// Outcome kinds of realm, vlob and maintenance operations.
///
/// None of these are retried inside the engine.
#[derive(Debug, Error)]
pub enum RealmError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("already exists")]
    AlreadyExists,
    /// Deliberately carries no detail about the caller's role.
    #[error("access denied")]
    AccessDenied,
    /// Optimistic concurrency conflict: re-read the latest version and retry.
    #[error("version conflict")]
    Version,
    #[error("realm is under maintenance")]
    InMaintenance,
    #[error("realm is not under maintenance")]
    NotInMaintenance,
    #[error("invalid encryption revision")]
    EncryptionRevision,
    #[error("realm participants and message recipients mismatch")]
    ParticipantsMismatch,
    #[error("maintenance error: {0}")]
    Maintenance(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RealmError {
    #[inline]
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

/// Outcome kinds of the blockstore capability.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block not found")]
    NotFound,
    #[error("block already exists")]
    AlreadyExists,
    #[error("block operation timed out")]
    Timeout,
    #[error("access denied")]
    AccessDenied,
    #[error("realm is under maintenance")]
    InMaintenance,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
