use std::error::Error as StdError;
use std::fmt::Debug;

use thiserror::Error;

/// Broad classification of a transport failure.
///
/// Coordinators use the kind to lift conditions they have a dedicated error
/// for (lost locks, closed links) out of the opaque transport error. Every
/// other kind is surfaced to the caller unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The lock token is unknown to the broker or the lock has expired.
    LockLost,

    /// The session lock held by a session receiver has expired.
    SessionLockLost,

    /// The requested session is locked by another receiver.
    SessionCannotBeLocked,

    /// The addressed entity does not exist.
    EntityNotFound,

    /// The link or connection has been closed.
    Closed,

    /// The operation did not complete within its timeout.
    Timeout,

    /// Anything else.
    Other,
}

/// Marker trait for transport errors.
pub trait TransportError: Debug + StdError + Send + Sync + 'static {
    /// Classifies the error.
    fn kind(&self) -> TransportErrorKind;
}

/// Errors raised by pure, local validation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required argument was empty or out of range.
    #[error("invalid argument `{argument}`: {reason}")]
    InvalidArgument {
        /// Name of the offending argument.
        argument: &'static str,

        /// Why it was rejected.
        reason: String,
    },

    /// The arguments are well-formed but the operation is not allowed.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl ValidationError {
    pub(crate) fn invalid_argument(argument: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument,
            reason: reason.into(),
        }
    }
}

/// Raised by operations attempted after close has started.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("entity `{0}` has been closed")]
pub struct EntityClosedError(pub String);

/// Errors returned by the coordinators.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: TransportError,
{
    /// The coordinator has been closed.
    #[error("entity `{0}` has been closed")]
    EntityClosed(String),

    /// A required argument was empty or out of range.
    #[error("invalid argument `{argument}`: {reason}")]
    InvalidArgument {
        /// Name of the offending argument.
        argument: &'static str,

        /// Why it was rejected.
        reason: String,
    },

    /// The arguments are well-formed but the operation is not allowed.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Settlement or renewal was attempted on an expired or unknown lock.
    #[error("lock lost: {0}")]
    LockLost(#[source] E),

    /// Any other transport failure, unchanged.
    #[error(transparent)]
    Transport(E),
}

impl<E> Error<E>
where
    E: TransportError,
{
    /// Wraps a transport error, lifting lost locks and closed links into
    /// their dedicated variants.
    pub fn from_transport(error: E, entity_path: &str) -> Self {
        match error.kind() {
            TransportErrorKind::LockLost | TransportErrorKind::SessionLockLost => {
                Self::LockLost(error)
            }
            TransportErrorKind::Closed => Self::EntityClosed(entity_path.to_string()),
            _ => Self::Transport(error),
        }
    }

    /// Whether a caller may legitimately retry, e.g. with a fresh receive.
    ///
    /// Invalid arguments and operations are programming errors and never
    /// transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LockLost(_) => true,
            Self::Transport(e) => matches!(
                e.kind(),
                TransportErrorKind::Timeout | TransportErrorKind::SessionCannotBeLocked
            ),
            Self::EntityClosed(_) | Self::InvalidArgument { .. } | Self::InvalidOperation(_) => {
                false
            }
        }
    }
}

impl<E> From<ValidationError> for Error<E>
where
    E: TransportError,
{
    fn from(error: ValidationError) -> Self {
        match error {
            ValidationError::InvalidArgument { argument, reason } => {
                Self::InvalidArgument { argument, reason }
            }
            ValidationError::InvalidOperation(reason) => Self::InvalidOperation(reason),
        }
    }
}

impl<E> From<EntityClosedError> for Error<E>
where
    E: TransportError,
{
    fn from(error: EntityClosedError) -> Self {
        Self::EntityClosed(error.0)
    }
}

/// Shorthand for results carrying a coordinator error.
pub type Result<T, E> = std::result::Result<T, Error<E>>;

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[derive(Debug, Error)]
    #[error("{0:?}")]
    struct KindError(TransportErrorKind);

    impl TransportError for KindError {
        fn kind(&self) -> TransportErrorKind {
            self.0
        }
    }

    #[test]
    fn test_from_transport_lifts_known_kinds() {
        assert_matches!(
            Error::from_transport(KindError(TransportErrorKind::LockLost), "q"),
            Error::LockLost(_)
        );
        assert_matches!(
            Error::from_transport(KindError(TransportErrorKind::SessionLockLost), "q"),
            Error::LockLost(_)
        );
        assert_matches!(
            Error::from_transport(KindError(TransportErrorKind::Closed), "q"),
            Error::EntityClosed(path) if path == "q"
        );
        assert_matches!(
            Error::from_transport(KindError(TransportErrorKind::EntityNotFound), "q"),
            Error::Transport(KindError(TransportErrorKind::EntityNotFound))
        );
    }

    #[test]
    fn test_transient_classification() {
        let lock_lost: Error<KindError> =
            Error::from_transport(KindError(TransportErrorKind::LockLost), "q");
        let timeout: Error<KindError> =
            Error::from_transport(KindError(TransportErrorKind::Timeout), "q");
        let invalid: Error<KindError> =
            ValidationError::invalid_argument("rule_name", "empty").into();

        assert!(lock_lost.is_transient());
        assert!(timeout.is_transient());
        assert!(!invalid.is_transient());
        assert_matches!(invalid, Error::InvalidArgument { argument: "rule_name", .. });
    }
}
