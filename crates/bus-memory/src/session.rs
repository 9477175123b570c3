use crate::error::Error;
use crate::namespace::{Namespace, Scope};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use proven_bus::{Message, MessageReceiver, Properties, ReceiveMode, SessionReceiver};
use tracing::debug;
use uuid::Uuid;

/// A receiver holding the lock of one in-memory session.
#[derive(Debug)]
pub struct MemorySessionReceiver {
    namespace: Arc<Namespace>,
    entity_path: String,
    receive_mode: ReceiveMode,
    session_id: String,
    owner: Uuid,
    locked_until: Mutex<DateTime<Utc>>,
    prefetch_count: AtomicU32,
    closed: AtomicBool,
}

impl MemorySessionReceiver {
    pub(crate) fn new(
        namespace: Arc<Namespace>,
        entity_path: String,
        receive_mode: ReceiveMode,
        session_id: String,
        owner: Uuid,
        locked_until: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace,
            entity_path,
            receive_mode,
            session_id,
            owner,
            locked_until: Mutex::new(locked_until),
            prefetch_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn scope(&self) -> Scope<'_> {
        Scope::Session {
            id: self.session_id.as_str(),
            owner: self.owner,
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        Ok(())
    }
}

#[async_trait]
impl MessageReceiver for MemorySessionReceiver {
    type Error = Error;

    fn entity_path(&self) -> &str {
        &self.entity_path
    }

    fn receive_mode(&self) -> ReceiveMode {
        self.receive_mode
    }

    fn prefetch_count(&self) -> u32 {
        self.prefetch_count.load(Ordering::Relaxed)
    }

    fn set_prefetch_count(&self, prefetch_count: u32) {
        self.prefetch_count.store(prefetch_count, Ordering::Relaxed);
    }

    async fn receive(&self, max_count: usize, timeout: Duration) -> Result<Vec<Message>, Error> {
        self.ensure_open()?;

        let messages = self
            .namespace
            .poll_until(timeout, || {
                self.ensure_open()?;

                let messages = self.namespace.receive(
                    &self.entity_path,
                    self.scope(),
                    self.receive_mode,
                    max_count,
                )?;
                Ok((!messages.is_empty()).then_some(messages))
            })
            .await?;

        Ok(messages.unwrap_or_default())
    }

    async fn receive_deferred(&self, sequence_numbers: &[i64]) -> Result<Vec<Message>, Error> {
        self.ensure_open()?;

        self.namespace.receive_deferred(
            &self.entity_path,
            self.scope(),
            self.receive_mode,
            sequence_numbers,
        )
    }

    async fn peek(&self, from_sequence_number: i64, max_count: usize) -> Result<Vec<Message>, Error> {
        self.ensure_open()?;

        self.namespace
            .peek(&self.entity_path, self.scope(), from_sequence_number, max_count)
    }

    async fn complete(&self, lock_tokens: &[Uuid]) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace
            .complete(&self.entity_path, self.scope(), lock_tokens)
    }

    async fn abandon(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace.abandon(
            &self.entity_path,
            self.scope(),
            lock_token,
            properties_to_modify,
        )
    }

    async fn defer(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace.defer(
            &self.entity_path,
            self.scope(),
            lock_token,
            properties_to_modify,
        )
    }

    async fn dead_letter(
        &self,
        lock_token: Uuid,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace.dead_letter(
            &self.entity_path,
            self.scope(),
            lock_token,
            reason,
            description,
        )
    }

    async fn renew_lock(&self, lock_token: Uuid) -> Result<DateTime<Utc>, Error> {
        self.ensure_open()?;

        self.namespace
            .renew_lock(&self.entity_path, self.scope(), lock_token)
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!(
            "releasing session {} on {}",
            self.session_id, self.entity_path
        );

        self.namespace
            .release_session(&self.entity_path, &self.session_id, self.owner)
    }
}

#[async_trait]
impl SessionReceiver for MemorySessionReceiver {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn locked_until_utc(&self) -> DateTime<Utc> {
        *self.locked_until.lock()
    }

    async fn renew_session_lock(&self) -> Result<DateTime<Utc>, Error> {
        self.ensure_open()?;

        let locked_until =
            self.namespace
                .renew_session_lock(&self.entity_path, &self.session_id, self.owner)?;
        *self.locked_until.lock() = locked_until;

        Ok(locked_until)
    }

    async fn get_state(&self) -> Result<Option<Bytes>, Error> {
        self.ensure_open()?;

        self.namespace
            .session_state(&self.entity_path, &self.session_id, self.owner)
    }

    async fn set_state(&self, state: Option<Bytes>) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace
            .set_session_state(&self.entity_path, &self.session_id, self.owner, state)
    }
}
