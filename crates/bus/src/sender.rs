use crate::connection_string::ConnectionString;
use crate::entity::{ClientEntity, LifecycleState};
use crate::error::{Error, Result, ValidationError};
use crate::message::Message;
use crate::transport::{Connection, Sender};
use crate::validation;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

/// Sends and schedules messages to a queue or topic.
///
/// Every message is validated before any of them is handed to the
/// transport, and transport failures are returned as they are. Nothing is
/// retried here.
#[derive(Debug)]
pub struct MessageSender<C>
where
    C: Connection,
{
    entity: ClientEntity,
    sender: C::Sender,
}

impl<C> MessageSender<C>
where
    C: Connection,
{
    /// Creates a sender for `entity_path` over an existing connection.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty or oversized path, or the
    /// transport error if the link cannot be created.
    pub async fn new(connection: &C, entity_path: impl Into<String>) -> Result<Self, C::Error> {
        let entity = ClientEntity::new("sender", entity_path)?;

        let sender = connection
            .create_sender(entity.entity_path())
            .await
            .map_err(|e| {
                error!(
                    "{} failed to create sender for {}: {e}",
                    entity.client_id(),
                    entity.entity_path()
                );
                Error::from_transport(e, entity.entity_path())
            })?;

        Ok(Self { entity, sender })
    }

    /// Connects using a connection string and creates a sender.
    ///
    /// `entity_path` overrides the `EntityPath` of the connection string; one
    /// of the two must be present.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a malformed connection string or a
    /// missing path, or the transport error if connecting fails.
    pub async fn from_connection_string(
        connection_string: &str,
        entity_path: Option<&str>,
    ) -> Result<Self, C::Error> {
        let parsed = ConnectionString::parse(connection_string)?;

        let entity_path = entity_path
            .or(parsed.entity_path.as_deref())
            .ok_or_else(|| ValidationError::InvalidArgument {
                argument: "entity_path",
                reason: "not given and not present in the connection string".to_string(),
            })?
            .to_string();

        let connection = C::from_connection_string(&parsed).map_err(Error::Transport)?;

        Self::new(&connection, entity_path).await
    }

    /// Identifier used in diagnostics.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.entity.client_id()
    }

    /// Path of the entity messages are sent to.
    #[must_use]
    pub fn entity_path(&self) -> &str {
        self.entity.entity_path()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.entity.state()
    }

    /// Sends a single message.
    ///
    /// # Errors
    ///
    /// See [`Self::send_batch`].
    pub async fn send(&self, message: Message) -> Result<(), C::Error> {
        self.send_batch(vec![message]).await.map(|_| ())
    }

    /// Sends a batch of messages and returns how many were sent.
    ///
    /// The whole batch is validated first; one invalid message aborts the
    /// batch with nothing sent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty batch or a malformed message,
    /// `InvalidOperation` if a message was received from the broker,
    /// `EntityClosed` after close, or the transport error.
    pub async fn send_batch(&self, messages: Vec<Message>) -> Result<usize, C::Error> {
        self.entity.ensure_open()?;
        let count = validation::validate_batch(&messages)?;

        debug!(
            "{} sending {count} message(s) to {}",
            self.client_id(),
            self.entity_path()
        );

        match self.sender.send(messages).await {
            Ok(()) => {
                debug!("{} sent {count} message(s)", self.client_id());
                Ok(count)
            }
            Err(e) => {
                error!("{} failed to send {count} message(s): {e}", self.client_id());
                Err(Error::from_transport(e, self.entity_path()))
            }
        }
    }

    /// Schedules a message to become visible at `scheduled_enqueue_time_utc`
    /// and returns the sequence number to cancel it with.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the time is in the past, the validation
    /// errors of [`Self::send_batch`], `EntityClosed` after close, or the
    /// transport error.
    pub async fn schedule_message(
        &self,
        mut message: Message,
        scheduled_enqueue_time_utc: DateTime<Utc>,
    ) -> Result<i64, C::Error> {
        self.entity.ensure_open()?;
        validation::validate_schedule_time(scheduled_enqueue_time_utc, Utc::now())?;
        validation::validate(&message)?;

        message.scheduled_enqueue_time_utc = Some(scheduled_enqueue_time_utc);

        debug!(
            "{} scheduling message for {scheduled_enqueue_time_utc}",
            self.client_id()
        );

        match self.sender.schedule(message).await {
            Ok(sequence_number) => {
                info!(
                    "{} scheduled message {sequence_number} on {}",
                    self.client_id(),
                    self.entity_path()
                );
                Ok(sequence_number)
            }
            Err(e) => {
                error!("{} failed to schedule message: {e}", self.client_id());
                Err(Error::from_transport(e, self.entity_path()))
            }
        }
    }

    /// Cancels a scheduled message.
    ///
    /// # Errors
    ///
    /// Returns `EntityClosed` after close or the transport error.
    pub async fn cancel_scheduled_message(&self, sequence_number: i64) -> Result<(), C::Error> {
        self.entity.ensure_open()?;

        debug!(
            "{} cancelling scheduled message {sequence_number}",
            self.client_id()
        );

        self.sender
            .cancel_scheduled(sequence_number)
            .await
            .map_err(|e| {
                error!(
                    "{} failed to cancel scheduled message {sequence_number}: {e}",
                    self.client_id()
                );
                Error::from_transport(e, self.entity_path())
            })
    }

    /// Closes the sender. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns the transport error raised while detaching the link.
    pub async fn close(&self) -> Result<(), C::Error> {
        self.entity
            .close(|| self.sender.close())
            .await
            .map_err(Error::Transport)
    }
}
