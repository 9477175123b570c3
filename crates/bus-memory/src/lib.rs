//! In-memory implementation of the bus transport.
//!
//! Connections to the same endpoint share one namespace, so a sender and a
//! subscription client created from the same connection string see the same
//! entities.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod namespace;
mod receiver;
mod rule_manager;
mod sender;
mod session;

pub use error::Error;
pub use namespace::{MAX_DELIVERY_COUNT_EXCEEDED, MemoryConnectionOptions};
pub use receiver::MemoryReceiver;
pub use rule_manager::MemoryRuleManager;
pub use sender::MemorySender;
pub use session::MemorySessionReceiver;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use namespace::Namespace;
use parking_lot::Mutex;
use proven_bus::{Connection, ConnectionString, ReceiveMode};
use tracing::debug;

static GLOBAL_NAMESPACES: LazyLock<Mutex<HashMap<String, Arc<Namespace>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// A connection to an in-memory namespace.
///
/// Clones share the namespace. Entities must be created through the
/// connection before links can attach to them.
#[derive(Clone, Debug)]
pub struct MemoryConnection {
    namespace: Arc<Namespace>,
}

impl MemoryConnection {
    /// Creates a connection to a fresh, private namespace.
    #[must_use]
    pub fn new(options: MemoryConnectionOptions) -> Self {
        Self {
            namespace: Arc::new(Namespace::new(options)),
        }
    }

    /// Connects to the shared namespace registered for `endpoint`, creating
    /// it with `options` on first use.
    #[must_use]
    pub fn shared(endpoint: &str, options: MemoryConnectionOptions) -> Self {
        let namespace = Arc::clone(
            GLOBAL_NAMESPACES
                .lock()
                .entry(endpoint.to_string())
                .or_insert_with(|| {
                    debug!("creating shared namespace for {endpoint}");
                    Arc::new(Namespace::new(options))
                }),
        );

        Self { namespace }
    }

    /// Options the namespace was created with.
    #[must_use]
    pub fn options(&self) -> &MemoryConnectionOptions {
        self.namespace.options()
    }

    /// Creates a queue and its dead-letter queue.
    ///
    /// # Errors
    ///
    /// Returns `EntityAlreadyExists` if the path is taken.
    pub fn create_queue(&self, path: &str) -> Result<(), Error> {
        self.namespace.create_queue(path)
    }

    /// Creates a topic.
    ///
    /// # Errors
    ///
    /// Returns `EntityAlreadyExists` if the path is taken.
    pub fn create_topic(&self, path: &str) -> Result<(), Error> {
        self.namespace.create_topic(path)
    }

    /// Creates a subscription with the default match-all rule and returns its
    /// path.
    ///
    /// # Errors
    ///
    /// Returns `EntityNotFound` if the topic does not exist,
    /// `EntityAlreadyExists` if the subscription does, or
    /// `InvalidEntityPath` if no path can be formed from the arguments.
    pub fn create_subscription(&self, topic_path: &str, name: &str) -> Result<String, Error> {
        self.namespace.create_subscription(topic_path, name)
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new(MemoryConnectionOptions::default())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Error = Error;
    type Receiver = MemoryReceiver;
    type Sender = MemorySender;
    type RuleManager = MemoryRuleManager;

    fn from_connection_string(connection_string: &ConnectionString) -> Result<Self, Error> {
        Ok(Self::shared(
            &connection_string.endpoint,
            MemoryConnectionOptions::default(),
        ))
    }

    async fn create_receiver(
        &self,
        entity_path: &str,
        receive_mode: ReceiveMode,
    ) -> Result<MemoryReceiver, Error> {
        if !self.namespace.has_queue(entity_path) {
            return Err(Error::EntityNotFound(entity_path.to_string()));
        }

        debug!("attached {receive_mode:?} receiver to {entity_path}");

        Ok(MemoryReceiver::new(
            Arc::clone(&self.namespace),
            entity_path.to_string(),
            receive_mode,
        ))
    }

    async fn create_sender(&self, entity_path: &str) -> Result<MemorySender, Error> {
        if !self.namespace.has_target(entity_path) {
            return Err(Error::EntityNotFound(entity_path.to_string()));
        }

        debug!("attached sender to {entity_path}");

        Ok(MemorySender::new(
            Arc::clone(&self.namespace),
            entity_path.to_string(),
        ))
    }

    async fn create_rule_manager(&self, subscription_path: &str) -> Result<MemoryRuleManager, Error> {
        if !self.namespace.has_rules(subscription_path) {
            return Err(Error::EntityNotFound(subscription_path.to_string()));
        }

        Ok(MemoryRuleManager::new(
            Arc::clone(&self.namespace),
            subscription_path.to_string(),
        ))
    }
}
