use crate::delivery;
use crate::entity::{ClientEntity, LifecycleState};
use crate::error::{Error, Result};
use crate::message::{Message, Properties};
use crate::transport::{MessageReceiver, SessionReceiver};

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

/// A locked session accepted from a subscription.
///
/// Messages of the session are only delivered through this handle until it
/// is closed or its session lock expires.
#[derive(Debug)]
pub struct MessageSession<S>
where
    S: SessionReceiver,
{
    entity: ClientEntity,
    receiver: S,
    operation_timeout: Duration,
}

impl<S> MessageSession<S>
where
    S: SessionReceiver,
{
    pub(crate) fn new(
        entity: ClientEntity,
        receiver: S,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            entity,
            receiver,
            operation_timeout,
        }
    }

    /// Identifier used in diagnostics.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.entity.client_id()
    }

    /// Path of the entity the session belongs to.
    #[must_use]
    pub fn entity_path(&self) -> &str {
        self.entity.entity_path()
    }

    /// Id of the locked session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        self.receiver.session_id()
    }

    /// When the session lock expires.
    #[must_use]
    pub fn locked_until_utc(&self) -> DateTime<Utc> {
        self.receiver.locked_until_utc()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.entity.state()
    }

    /// Receives the next message of the session, if one arrives within the
    /// operation timeout.
    ///
    /// # Errors
    ///
    /// Returns `EntityClosed` after close or the transport error.
    pub async fn receive(&self) -> Result<Option<Message>, S::Error> {
        Ok(self.receive_batch(1).await?.into_iter().next())
    }

    /// Receives up to `max_count` messages of the session.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero count, `EntityClosed` after close
    /// or the transport error.
    pub async fn receive_batch(&self, max_count: usize) -> Result<Vec<Message>, S::Error> {
        self.receive_batch_with_timeout(max_count, self.operation_timeout)
            .await
    }

    /// Receives up to `max_count` messages of the session, waiting at most
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Self::receive_batch`].
    pub async fn receive_batch_with_timeout(
        &self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, S::Error> {
        delivery::receive(&self.entity, &self.receiver, max_count, timeout).await
    }

    /// Receives deferred messages of the session by sequence number.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty set, `EntityClosed` after close
    /// or the transport error.
    pub async fn receive_deferred_batch(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<Message>, S::Error> {
        delivery::receive_deferred(&self.entity, &self.receiver, sequence_numbers).await
    }

    /// Completes a message of the session.
    ///
    /// # Errors
    ///
    /// Returns `LockLost` for an unknown or expired lock, the validation
    /// errors for a nil token or a non peek-lock session, `EntityClosed`
    /// after close, or the transport error.
    pub async fn complete(&self, lock_token: Uuid) -> Result<(), S::Error> {
        delivery::complete(&self.entity, &self.receiver, &[lock_token]).await
    }

    /// Completes several messages of the session.
    ///
    /// # Errors
    ///
    /// See [`Self::complete`].
    pub async fn complete_batch(&self, lock_tokens: &[Uuid]) -> Result<(), S::Error> {
        delivery::complete(&self.entity, &self.receiver, lock_tokens).await
    }

    /// Abandons a message of the session.
    ///
    /// # Errors
    ///
    /// See [`Self::complete`].
    pub async fn abandon(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), S::Error> {
        delivery::abandon(&self.entity, &self.receiver, lock_token, properties_to_modify).await
    }

    /// Defers a message of the session.
    ///
    /// # Errors
    ///
    /// See [`Self::complete`].
    pub async fn defer(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), S::Error> {
        delivery::defer(&self.entity, &self.receiver, lock_token, properties_to_modify).await
    }

    /// Dead-letters a message of the session.
    ///
    /// # Errors
    ///
    /// See [`Self::complete`].
    pub async fn dead_letter(
        &self,
        lock_token: Uuid,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<(), S::Error> {
        delivery::dead_letter(&self.entity, &self.receiver, lock_token, reason, description).await
    }

    /// Extends the session lock and returns its new expiry.
    ///
    /// # Errors
    ///
    /// Returns `LockLost` if the session lock expired, `EntityClosed` after
    /// close, or the transport error.
    pub async fn renew_session_lock(&self) -> Result<DateTime<Utc>, S::Error> {
        self.entity.ensure_open()?;

        let locked_until = self.receiver.renew_session_lock().await.map_err(|e| {
            warn!(
                "{} failed to renew lock of session {}: {e}",
                self.client_id(),
                self.session_id()
            );
            Error::from_transport(e, self.entity_path())
        })?;

        debug!(
            "{} renewed session {} until {locked_until}",
            self.client_id(),
            self.session_id()
        );

        Ok(locked_until)
    }

    /// Reads the opaque session state.
    ///
    /// # Errors
    ///
    /// Returns `EntityClosed` after close or the transport error.
    pub async fn get_state(&self) -> Result<Option<Bytes>, S::Error> {
        self.entity.ensure_open()?;

        self.receiver
            .get_state()
            .await
            .map_err(|e| Error::from_transport(e, self.entity_path()))
    }

    /// Replaces the opaque session state.
    ///
    /// # Errors
    ///
    /// Returns `EntityClosed` after close or the transport error.
    pub async fn set_state(&self, state: Option<Bytes>) -> Result<(), S::Error> {
        self.entity.ensure_open()?;

        self.receiver
            .set_state(state)
            .await
            .map_err(|e| Error::from_transport(e, self.entity_path()))
    }

    /// Releases the session lock. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns the transport error raised while detaching the link.
    pub async fn close(&self) -> Result<(), S::Error> {
        self.entity
            .close(|| MessageReceiver::close(&self.receiver))
            .await
            .map_err(Error::Transport)
    }
}
