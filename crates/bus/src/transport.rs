//! Capabilities consumed from the link layer.
//!
//! Implementations perform the network operation and nothing else: every
//! argument has already been validated by the coordinator calling them.

use crate::connection_string::ConnectionString;
use crate::error::TransportError;
use crate::message::{Message, Properties};
use crate::rule::RuleDescription;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// How received messages are settled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Messages are locked on receive and settled explicitly.
    #[default]
    PeekLock,

    /// Messages are removed from the entity as they are received.
    ReceiveAndDelete,
}

/// Receive, peek and settlement operations shared by plain and session
/// receivers.
#[async_trait]
pub trait MessageReceiver: Debug + Send + Sync + 'static {
    /// The error type for the receiver.
    type Error: TransportError;

    /// Path of the entity the receiver is attached to.
    fn entity_path(&self) -> &str;

    /// Mode the receiver was created with.
    fn receive_mode(&self) -> ReceiveMode;

    /// Number of messages eagerly buffered by the link.
    fn prefetch_count(&self) -> u32;

    /// Changes the number of messages eagerly buffered by the link.
    fn set_prefetch_count(&self, prefetch_count: u32);

    /// Receives up to `max_count` messages, waiting at most `timeout` for the
    /// first one. Returns an empty batch on timeout.
    async fn receive(&self, max_count: usize, timeout: Duration)
    -> Result<Vec<Message>, Self::Error>;

    /// Receives deferred messages by sequence number. Unknown sequence
    /// numbers are skipped.
    async fn receive_deferred(&self, sequence_numbers: &[i64])
    -> Result<Vec<Message>, Self::Error>;

    /// Reads up to `max_count` messages starting at `from_sequence_number`
    /// without locking them.
    async fn peek(
        &self,
        from_sequence_number: i64,
        max_count: usize,
    ) -> Result<Vec<Message>, Self::Error>;

    /// Completes the deliveries identified by `lock_tokens`.
    async fn complete(&self, lock_tokens: &[Uuid]) -> Result<(), Self::Error>;

    /// Releases the lock so the message can be received again.
    async fn abandon(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), Self::Error>;

    /// Sets the message aside for retrieval by sequence number.
    async fn defer(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), Self::Error>;

    /// Moves the message to the dead-letter queue.
    async fn dead_letter(
        &self,
        lock_token: Uuid,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<(), Self::Error>;

    /// Extends the lock and returns its new expiry.
    async fn renew_lock(&self, lock_token: Uuid) -> Result<DateTime<Utc>, Self::Error>;

    /// Detaches the link.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// A receiver attached to a queue or subscription.
#[async_trait]
pub trait Receiver: MessageReceiver {
    /// The session receiver type produced by `accept_session`.
    type Session: SessionReceiver<Error = Self::Error>;

    /// Locks a session and returns a receiver scoped to it.
    ///
    /// `None` accepts whichever session next has messages available. Returns
    /// `Ok(None)` if no session becomes available within `timeout`.
    async fn accept_session(
        &self,
        session_id: Option<String>,
        timeout: Duration,
    ) -> Result<Option<Self::Session>, Self::Error>;
}

/// A receiver scoped to one locked session.
#[async_trait]
pub trait SessionReceiver: MessageReceiver {
    /// Id of the locked session.
    fn session_id(&self) -> &str;

    /// When the session lock expires.
    fn locked_until_utc(&self) -> DateTime<Utc>;

    /// Extends the session lock and returns its new expiry.
    async fn renew_session_lock(&self) -> Result<DateTime<Utc>, Self::Error>;

    /// Reads the opaque session state.
    async fn get_state(&self) -> Result<Option<Bytes>, Self::Error>;

    /// Replaces the opaque session state.
    async fn set_state(&self, state: Option<Bytes>) -> Result<(), Self::Error>;
}

/// A sender attached to a queue or topic.
#[async_trait]
pub trait Sender: Debug + Send + Sync + 'static {
    /// The error type for the sender.
    type Error: TransportError;

    /// Path of the entity the sender is attached to.
    fn entity_path(&self) -> &str;

    /// Sends the messages as one batch.
    async fn send(&self, messages: Vec<Message>) -> Result<(), Self::Error>;

    /// Schedules a message stamped with its enqueue time and returns the
    /// sequence number identifying it.
    async fn schedule(&self, message: Message) -> Result<i64, Self::Error>;

    /// Cancels a scheduled message.
    async fn cancel_scheduled(&self, sequence_number: i64) -> Result<(), Self::Error>;

    /// Detaches the link.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// Management of the filter rules of one subscription.
#[async_trait]
pub trait RuleManager: Debug + Send + Sync + 'static {
    /// The error type for the rule manager.
    type Error: TransportError;

    /// Adds a rule. The broker rejects duplicate names.
    async fn add_rule(&self, rule: RuleDescription) -> Result<(), Self::Error>;

    /// Removes a rule. The broker rejects unknown names.
    async fn remove_rule(&self, name: &str) -> Result<(), Self::Error>;

    /// Lists the rules of the subscription.
    async fn get_rules(&self) -> Result<Vec<RuleDescription>, Self::Error>;

    /// Detaches the link.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// A connection to a broker namespace, the factory for every link.
#[async_trait]
pub trait Connection: Clone + Debug + Send + Sync + 'static {
    /// The error type for the connection and its links.
    type Error: TransportError;

    /// The receiver type.
    type Receiver: Receiver<Error = Self::Error>;

    /// The sender type.
    type Sender: Sender<Error = Self::Error>;

    /// The rule manager type.
    type RuleManager: RuleManager<Error = Self::Error>;

    /// Connects using a parsed connection string.
    fn from_connection_string(connection_string: &ConnectionString) -> Result<Self, Self::Error>;

    /// Creates a receiver for a queue or subscription.
    async fn create_receiver(
        &self,
        entity_path: &str,
        receive_mode: ReceiveMode,
    ) -> Result<Self::Receiver, Self::Error>;

    /// Creates a sender for a queue or topic.
    async fn create_sender(&self, entity_path: &str) -> Result<Self::Sender, Self::Error>;

    /// Creates a rule manager for a subscription.
    async fn create_rule_manager(
        &self,
        subscription_path: &str,
    ) -> Result<Self::RuleManager, Self::Error>;
}
