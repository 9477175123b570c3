use crate::error::Error;
use crate::namespace::Namespace;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use proven_bus::{Message, Sender};
use tracing::debug;

/// A sender attached to an in-memory queue or topic.
#[derive(Debug)]
pub struct MemorySender {
    namespace: Arc<Namespace>,
    entity_path: String,
    closed: AtomicBool,
}

impl MemorySender {
    pub(crate) const fn new(namespace: Arc<Namespace>, entity_path: String) -> Self {
        Self {
            namespace,
            entity_path,
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
impl Sender for MemorySender {
    type Error = Error;

    fn entity_path(&self) -> &str {
        &self.entity_path
    }

    async fn send(&self, messages: Vec<Message>) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace.send(&self.entity_path, messages)
    }

    async fn schedule(&self, message: Message) -> Result<i64, Error> {
        self.ensure_open()?;

        self.namespace.schedule(&self.entity_path, message)
    }

    async fn cancel_scheduled(&self, sequence_number: i64) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace
            .cancel_scheduled(&self.entity_path, sequence_number)
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("detached sender from {}", self.entity_path);
        }

        Ok(())
    }
}
