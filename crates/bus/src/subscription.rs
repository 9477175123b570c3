use crate::connection_string::ConnectionString;
use crate::constants::DEFAULT_OPERATION_TIMEOUT;
use crate::delivery;
use crate::entity::{ClientEntity, LifecycleState, subscription_path};
use crate::error::{Error, Result, ValidationError};
use crate::lazy::LazyHandle;
use crate::message::{Message, Properties};
use crate::rule::{Filter, RuleDescription};
use crate::session::MessageSession;
use crate::transport::{
    Connection, MessageReceiver, ReceiveMode, Receiver, RuleManager, SessionReceiver,
};
use crate::validation;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Options for a subscription client.
#[derive(Clone, Debug)]
pub struct SubscriptionClientOptions {
    /// How received messages are settled.
    pub receive_mode: ReceiveMode,

    /// Messages the receiver link buffers eagerly.
    pub prefetch_count: u32,

    /// How long receives and session accepts wait when no timeout is given.
    pub operation_timeout: Duration,
}

impl Default for SubscriptionClientOptions {
    fn default() -> Self {
        Self {
            receive_mode: ReceiveMode::PeekLock,
            prefetch_count: 0,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// Session receiver type produced by a connection's receivers.
pub type SessionOf<C> = <<C as Connection>::Receiver as Receiver>::Session;

/// Receives, peeks and settles messages of one topic subscription, accepts
/// its sessions and manages its rules.
///
/// The receiver link is created on first use and shared by every operation
/// afterwards; concurrent first uses create it once.
#[derive(Debug)]
pub struct SubscriptionClient<C>
where
    C: Connection,
{
    connection: C,
    entity: ClientEntity,
    topic_path: String,
    subscription_name: String,
    options: SubscriptionClientOptions,
    prefetch_count: AtomicU32,
    last_peeked_sequence_number: AtomicI64,
    receiver: LazyHandle<C::Receiver>,
    rule_manager: LazyHandle<C::RuleManager>,
}

impl<C> SubscriptionClient<C>
where
    C: Connection,
{
    /// Creates a client for `{topic_path}/Subscriptions/{subscription_name}`.
    ///
    /// No link is opened until the first operation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if either name is empty or too long.
    pub fn new(
        connection: C,
        topic_path: impl Into<String>,
        subscription_name: impl Into<String>,
        options: SubscriptionClientOptions,
    ) -> Result<Self, C::Error> {
        let topic_path = topic_path.into();
        let subscription_name = subscription_name.into();
        let entity = ClientEntity::new(
            "subscription",
            subscription_path(&topic_path, &subscription_name)?,
        )?;

        Ok(Self {
            connection,
            entity,
            topic_path,
            subscription_name,
            prefetch_count: AtomicU32::new(options.prefetch_count),
            last_peeked_sequence_number: AtomicI64::new(0),
            options,
            receiver: LazyHandle::new(),
            rule_manager: LazyHandle::new(),
        })
    }

    /// Connects using a connection string and creates a client.
    ///
    /// `topic_path` overrides the `EntityPath` of the connection string; one
    /// of the two must be present.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a malformed connection string, missing
    /// topic path or invalid names, or the transport error if connecting
    /// fails.
    pub fn from_connection_string(
        connection_string: &str,
        topic_path: Option<&str>,
        subscription_name: &str,
        options: SubscriptionClientOptions,
    ) -> Result<Self, C::Error> {
        let parsed = ConnectionString::parse(connection_string)?;

        let topic_path = topic_path
            .or(parsed.entity_path.as_deref())
            .ok_or_else(|| ValidationError::InvalidArgument {
                argument: "topic_path",
                reason: "not given and not present in the connection string".to_string(),
            })?
            .to_string();

        let connection = C::from_connection_string(&parsed).map_err(Error::Transport)?;

        Self::new(connection, topic_path, subscription_name, options)
    }

    /// Identifier used in diagnostics.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.entity.client_id()
    }

    /// Full path of the subscription.
    #[must_use]
    pub fn path(&self) -> &str {
        self.entity.entity_path()
    }

    /// Path of the topic the subscription belongs to.
    #[must_use]
    pub fn topic_path(&self) -> &str {
        &self.topic_path
    }

    /// Name of the subscription.
    #[must_use]
    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    /// How received messages are settled.
    #[must_use]
    pub const fn receive_mode(&self) -> ReceiveMode {
        self.options.receive_mode
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.entity.state()
    }

    /// Sequence number of the last message returned by a peek.
    #[must_use]
    pub fn last_peeked_sequence_number(&self) -> i64 {
        self.last_peeked_sequence_number.load(Ordering::Acquire)
    }

    /// Messages the receiver link buffers eagerly.
    #[must_use]
    pub fn prefetch_count(&self) -> u32 {
        self.prefetch_count.load(Ordering::Acquire)
    }

    /// Changes how many messages the receiver link buffers eagerly. Applies
    /// to the live link if it has already been created.
    pub fn set_prefetch_count(&self, prefetch_count: u32) {
        self.prefetch_count.store(prefetch_count, Ordering::Release);

        if let Some(receiver) = self.receiver.get() {
            receiver.set_prefetch_count(prefetch_count);
        }
    }

    /// The receiver link, once the first receive or peek has created it.
    #[must_use]
    pub fn receiver_link(&self) -> Option<Arc<C::Receiver>> {
        self.receiver.get()
    }

    async fn receiver(&self) -> Result<Arc<C::Receiver>, C::Error> {
        self.entity.ensure_open()?;

        self.receiver
            .get_or_try_init(|| async {
                self.entity.ensure_open()?;

                debug!("{} creating receiver for {}", self.client_id(), self.path());

                let receiver = self
                    .connection
                    .create_receiver(self.path(), self.options.receive_mode)
                    .await
                    .map_err(|e| {
                        error!("{} failed to create receiver: {e}", self.client_id());
                        Error::from_transport(e, self.path())
                    })?;
                receiver.set_prefetch_count(self.prefetch_count());

                Ok::<_, Error<C::Error>>(receiver)
            })
            .await
    }

    async fn rule_manager(&self) -> Result<Arc<C::RuleManager>, C::Error> {
        self.entity.ensure_open()?;

        self.rule_manager
            .get_or_try_init(|| async {
                self.entity.ensure_open()?;

                let rule_manager = self
                    .connection
                    .create_rule_manager(self.path())
                    .await
                    .map_err(|e| {
                        error!("{} failed to create rule manager: {e}", self.client_id());
                        Error::from_transport(e, self.path())
                    })?;

                Ok::<_, Error<C::Error>>(rule_manager)
            })
            .await
    }

    /// Receives the next message, if one arrives within the operation
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns `EntityClosed` after close or the transport error.
    pub async fn receive(&self) -> Result<Option<Message>, C::Error> {
        Ok(self.receive_batch(1).await?.into_iter().next())
    }

    /// Receives up to `max_count` messages, returning an empty batch if none
    /// arrives within the operation timeout.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero count, `EntityClosed` after close
    /// or the transport error.
    pub async fn receive_batch(&self, max_count: usize) -> Result<Vec<Message>, C::Error> {
        self.receive_batch_with_timeout(max_count, self.options.operation_timeout)
            .await
    }

    /// Receives up to `max_count` messages, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Self::receive_batch`].
    pub async fn receive_batch_with_timeout(
        &self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, C::Error> {
        let receiver = self.receiver().await?;
        delivery::receive(&self.entity, receiver.as_ref(), max_count, timeout).await
    }

    /// Receives a deferred message by sequence number.
    ///
    /// # Errors
    ///
    /// Returns `EntityClosed` after close or the transport error.
    pub async fn receive_deferred(&self, sequence_number: i64) -> Result<Option<Message>, C::Error> {
        Ok(self
            .receive_deferred_batch(&[sequence_number])
            .await?
            .into_iter()
            .next())
    }

    /// Receives deferred messages by sequence number. Sequence numbers that
    /// match no deferred message are left out of the result.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty set, `EntityClosed` after close
    /// or the transport error.
    pub async fn receive_deferred_batch(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<Message>, C::Error> {
        let receiver = self.receiver().await?;
        delivery::receive_deferred(&self.entity, receiver.as_ref(), sequence_numbers).await
    }

    /// Peeks the message after the last peeked one.
    ///
    /// # Errors
    ///
    /// Returns `EntityClosed` after close or the transport error.
    pub async fn peek(&self) -> Result<Option<Message>, C::Error> {
        Ok(self.peek_batch(1).await?.into_iter().next())
    }

    /// Peeks up to `max_count` messages after the last peeked one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero count, `EntityClosed` after close
    /// or the transport error.
    pub async fn peek_batch(&self, max_count: usize) -> Result<Vec<Message>, C::Error> {
        let from_sequence_number = self.last_peeked_sequence_number() + 1;
        let messages = self.peek_from(from_sequence_number, max_count).await?;

        if let Some(sequence_number) = messages.last().and_then(Message::sequence_number) {
            self.last_peeked_sequence_number
                .fetch_max(sequence_number, Ordering::AcqRel);
        }

        Ok(messages)
    }

    /// Peeks up to `max_count` messages starting at `from_sequence_number`.
    ///
    /// Peeking never locks messages or moves other receivers. It does reset
    /// this client's peek cursor to the last message returned, even when that
    /// is behind the current cursor, so later [`Self::peek_batch`] calls
    /// continue from here.
    ///
    /// # Errors
    ///
    /// See [`Self::peek_batch`].
    pub async fn peek_by_sequence_number(
        &self,
        from_sequence_number: i64,
        max_count: usize,
    ) -> Result<Vec<Message>, C::Error> {
        let messages = self.peek_from(from_sequence_number, max_count).await?;

        if let Some(sequence_number) = messages.last().and_then(Message::sequence_number) {
            self.last_peeked_sequence_number
                .store(sequence_number, Ordering::Release);
        }

        Ok(messages)
    }

    async fn peek_from(
        &self,
        from_sequence_number: i64,
        max_count: usize,
    ) -> Result<Vec<Message>, C::Error> {
        let receiver = self.receiver().await?;
        delivery::peek(&self.entity, receiver.as_ref(), from_sequence_number, max_count).await
    }

    /// Completes a received message.
    ///
    /// # Errors
    ///
    /// Returns `LockLost` for an unknown, expired or already settled lock,
    /// `InvalidArgument` for a nil token, `InvalidOperation` in
    /// receive-and-delete mode, `EntityClosed` after close, or the transport
    /// error.
    pub async fn complete(&self, lock_token: Uuid) -> Result<(), C::Error> {
        self.complete_batch(&[lock_token]).await
    }

    /// Completes several received messages.
    ///
    /// # Errors
    ///
    /// See [`Self::complete`]; an empty set is `InvalidArgument`.
    pub async fn complete_batch(&self, lock_tokens: &[Uuid]) -> Result<(), C::Error> {
        let receiver = self.receiver().await?;
        delivery::complete(&self.entity, receiver.as_ref(), lock_tokens).await
    }

    /// Releases the lock on a received message so it can be received again.
    ///
    /// # Errors
    ///
    /// See [`Self::complete`].
    pub async fn abandon(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), C::Error> {
        let receiver = self.receiver().await?;
        delivery::abandon(&self.entity, receiver.as_ref(), lock_token, properties_to_modify).await
    }

    /// Sets a received message aside. It is then only returned by
    /// [`Self::receive_deferred_batch`].
    ///
    /// # Errors
    ///
    /// See [`Self::complete`].
    pub async fn defer(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), C::Error> {
        let receiver = self.receiver().await?;
        delivery::defer(&self.entity, receiver.as_ref(), lock_token, properties_to_modify).await
    }

    /// Moves a received message to the dead-letter queue.
    ///
    /// # Errors
    ///
    /// See [`Self::complete`].
    pub async fn dead_letter(
        &self,
        lock_token: Uuid,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<(), C::Error> {
        let receiver = self.receiver().await?;
        delivery::dead_letter(&self.entity, receiver.as_ref(), lock_token, reason, description)
            .await
    }

    /// Extends the lock on a received message and returns its new expiry.
    ///
    /// # Errors
    ///
    /// See [`Self::complete`].
    pub async fn renew_lock(&self, lock_token: Uuid) -> Result<DateTime<Utc>, C::Error> {
        let receiver = self.receiver().await?;
        delivery::renew_lock(&self.entity, receiver.as_ref(), lock_token).await
    }

    /// Accepts a session within the operation timeout.
    ///
    /// `None` accepts whichever session next has messages. Returns `Ok(None)`
    /// when no session becomes available in time.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an invalid session id, `EntityClosed`
    /// after close, or the transport error unchanged (for instance when the
    /// session is locked by another receiver).
    pub async fn accept_message_session(
        &self,
        session_id: Option<&str>,
    ) -> Result<Option<MessageSession<SessionOf<C>>>, C::Error> {
        self.accept_message_session_with_timeout(session_id, self.options.operation_timeout)
            .await
    }

    /// Accepts a session, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Self::accept_message_session`].
    pub async fn accept_message_session_with_timeout(
        &self,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<MessageSession<SessionOf<C>>>, C::Error> {
        self.entity.ensure_open()?;
        if let Some(session_id) = session_id {
            validation::validate_session_id(session_id)?;
        }

        let receiver = self.receiver().await?;

        info!(
            "{} accepting session {} on {}",
            self.client_id(),
            session_id.unwrap_or("<any>"),
            self.path()
        );

        let accepted = receiver
            .accept_session(session_id.map(ToString::to_string), timeout)
            .await
            .map_err(|e| {
                error!(
                    "{} failed to accept session {}: {e}",
                    self.client_id(),
                    session_id.unwrap_or("<any>")
                );
                Error::from_transport(e, self.path())
            })?;

        let Some(session_receiver) = accepted else {
            info!("{} found no available session", self.client_id());
            return Ok(None);
        };

        info!(
            "{} accepted session {}",
            self.client_id(),
            session_receiver.session_id()
        );

        let entity = ClientEntity::new("session", self.path())?;

        Ok(Some(MessageSession::new(
            entity,
            session_receiver,
            self.options.operation_timeout,
        )))
    }

    /// Adds a rule with the given name and filter.
    ///
    /// # Errors
    ///
    /// See [`Self::add_rule_description`].
    pub async fn add_rule(&self, name: &str, filter: Filter) -> Result<(), C::Error> {
        self.add_rule_description(RuleDescription::new(name, filter))
            .await
    }

    /// Adds a rule.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty or oversized name,
    /// `EntityClosed` after close, or the transport error (for instance when
    /// the name is already taken).
    pub async fn add_rule_description(&self, rule: RuleDescription) -> Result<(), C::Error> {
        self.entity.ensure_open()?;
        validation::validate_rule(&rule)?;

        let rule_manager = self.rule_manager().await?;
        let name = rule.name.clone();

        rule_manager.add_rule(rule).await.map_err(|e| {
            error!("{} failed to add rule {name}: {e}", self.client_id());
            Error::from_transport(e, self.path())
        })?;

        info!("{} added rule {name} to {}", self.client_id(), self.path());

        Ok(())
    }

    /// Removes a rule by name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty or whitespace name,
    /// `EntityClosed` after close, or the transport error (for instance when
    /// no rule has that name).
    pub async fn remove_rule(&self, name: &str) -> Result<(), C::Error> {
        self.entity.ensure_open()?;
        validation::require_non_empty("rule_name", name)?;

        let rule_manager = self.rule_manager().await?;

        rule_manager.remove_rule(name).await.map_err(|e| {
            error!("{} failed to remove rule {name}: {e}", self.client_id());
            Error::from_transport(e, self.path())
        })?;

        info!("{} removed rule {name} from {}", self.client_id(), self.path());

        Ok(())
    }

    /// Lists the rules of the subscription.
    ///
    /// # Errors
    ///
    /// Returns `EntityClosed` after close or the transport error.
    pub async fn get_rules(&self) -> Result<Vec<RuleDescription>, C::Error> {
        let rule_manager = self.rule_manager().await?;

        rule_manager
            .get_rules()
            .await
            .map_err(|e| Error::from_transport(e, self.path()))
    }

    /// Closes the client and any links it opened. Later calls are no-ops.
    ///
    /// Operations already in flight may fail with `EntityClosed`.
    ///
    /// # Errors
    ///
    /// Returns the first transport error raised while detaching the links.
    pub async fn close(&self) -> Result<(), C::Error> {
        self.entity
            .close(|| async {
                let receiver_result = match self.receiver.take().await {
                    Some(receiver) => MessageReceiver::close(receiver.as_ref()).await,
                    None => Ok(()),
                };

                let rule_manager_result = match self.rule_manager.take().await {
                    Some(rule_manager) => rule_manager.close().await,
                    None => Ok(()),
                };

                receiver_result.and(rule_manager_result)
            })
            .await
            .map_err(Error::Transport)
    }
}
