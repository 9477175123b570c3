use crate::error::Error;
use crate::namespace::{Namespace, Scope};
use crate::session::MemorySessionReceiver;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use proven_bus::{Message, MessageReceiver, Properties, ReceiveMode, Receiver};
use tracing::debug;
use uuid::Uuid;

/// A receiver attached to an in-memory queue, subscription or dead-letter
/// queue.
#[derive(Debug)]
pub struct MemoryReceiver {
    namespace: Arc<Namespace>,
    entity_path: String,
    receive_mode: ReceiveMode,
    prefetch_count: AtomicU32,
    closed: AtomicBool,
}

impl MemoryReceiver {
    pub(crate) const fn new(
        namespace: Arc<Namespace>,
        entity_path: String,
        receive_mode: ReceiveMode,
    ) -> Self {
        Self {
            namespace,
            entity_path,
            receive_mode,
            prefetch_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
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
impl MessageReceiver for MemoryReceiver {
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
                    Scope::Entity,
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
            Scope::Entity,
            self.receive_mode,
            sequence_numbers,
        )
    }

    async fn peek(&self, from_sequence_number: i64, max_count: usize) -> Result<Vec<Message>, Error> {
        self.ensure_open()?;

        self.namespace
            .peek(&self.entity_path, Scope::Entity, from_sequence_number, max_count)
    }

    async fn complete(&self, lock_tokens: &[Uuid]) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace
            .complete(&self.entity_path, Scope::Entity, lock_tokens)
    }

    async fn abandon(
        &self,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace.abandon(
            &self.entity_path,
            Scope::Entity,
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
            Scope::Entity,
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
            Scope::Entity,
            lock_token,
            reason,
            description,
        )
    }

    async fn renew_lock(&self, lock_token: Uuid) -> Result<DateTime<Utc>, Error> {
        self.ensure_open()?;

        self.namespace
            .renew_lock(&self.entity_path, Scope::Entity, lock_token)
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("detached receiver from {}", self.entity_path);
        }

        Ok(())
    }
}

#[async_trait]
impl Receiver for MemoryReceiver {
    type Session = MemorySessionReceiver;

    async fn accept_session(
        &self,
        session_id: Option<String>,
        timeout: Duration,
    ) -> Result<Option<MemorySessionReceiver>, Error> {
        self.ensure_open()?;

        let owner = Uuid::new_v4();
        let accepted = self
            .namespace
            .poll_until(timeout, || {
                self.ensure_open()?;

                self.namespace
                    .accept_session(&self.entity_path, session_id.as_deref(), owner)
            })
            .await?;

        Ok(accepted.map(|(session_id, locked_until)| {
            MemorySessionReceiver::new(
                Arc::clone(&self.namespace),
                self.entity_path.clone(),
                self.receive_mode,
                session_id,
                owner,
                locked_until,
            )
        }))
    }
}
