use proven_bus::{TransportError, TransportErrorKind};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the in-memory broker.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The link has been closed.
    #[error("link closed")]
    Closed,

    /// An entity with this path already exists.
    #[error("entity `{0}` already exists")]
    EntityAlreadyExists(String),

    /// No entity with this path exists.
    #[error("entity `{0}` not found")]
    EntityNotFound(String),

    /// The path could not be formed.
    #[error("invalid entity path: {0}")]
    InvalidEntityPath(String),

    /// The lock token is unknown or its lock has expired.
    #[error("lock `{0}` is unknown or has expired")]
    LockLost(Uuid),

    /// No scheduled message has this sequence number.
    #[error("no scheduled message with sequence number {0}")]
    MessageNotFound(i64),

    /// A rule with this name already exists on the subscription.
    #[error("rule `{0}` already exists")]
    RuleAlreadyExists(String),

    /// No rule with this name exists on the subscription.
    #[error("rule `{0}` not found")]
    RuleNotFound(String),

    /// The session is locked by another receiver.
    #[error("session `{0}` is locked by another receiver")]
    SessionCannotBeLocked(String),

    /// This receiver no longer holds the session lock.
    #[error("lock on session `{0}` has been lost")]
    SessionLockLost(String),
}

impl TransportError for Error {
    fn kind(&self) -> TransportErrorKind {
        match self {
            Self::Closed => TransportErrorKind::Closed,
            Self::EntityNotFound(_) => TransportErrorKind::EntityNotFound,
            Self::LockLost(_) => TransportErrorKind::LockLost,
            Self::SessionCannotBeLocked(_) => TransportErrorKind::SessionCannotBeLocked,
            Self::SessionLockLost(_) => TransportErrorKind::SessionLockLost,
            Self::EntityAlreadyExists(_)
            | Self::InvalidEntityPath(_)
            | Self::MessageNotFound(_)
            | Self::RuleAlreadyExists(_)
            | Self::RuleNotFound(_) => TransportErrorKind::Other,
        }
    }
}
