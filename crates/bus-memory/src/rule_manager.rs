use crate::error::Error;
use crate::namespace::Namespace;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use proven_bus::{RuleDescription, RuleManager};

/// Manages the rules of one in-memory subscription.
#[derive(Debug)]
pub struct MemoryRuleManager {
    namespace: Arc<Namespace>,
    subscription_path: String,
    closed: AtomicBool,
}

impl MemoryRuleManager {
    pub(crate) const fn new(namespace: Arc<Namespace>, subscription_path: String) -> Self {
        Self {
            namespace,
            subscription_path,
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
impl RuleManager for MemoryRuleManager {
    type Error = Error;

    async fn add_rule(&self, rule: RuleDescription) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace.add_rule(&self.subscription_path, rule)
    }

    async fn remove_rule(&self, name: &str) -> Result<(), Error> {
        self.ensure_open()?;

        self.namespace.remove_rule(&self.subscription_path, name)
    }

    async fn get_rules(&self) -> Result<Vec<RuleDescription>, Error> {
        self.ensure_open()?;

        self.namespace.rules(&self.subscription_path)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);

        Ok(())
    }
}
