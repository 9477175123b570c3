use crate::constants::{
    DEAD_LETTER_QUEUE_SEGMENT, MAX_ENTITY_PATH_LENGTH, MAX_SUBSCRIPTION_NAME_LENGTH,
    PATH_DELIMITER, SUBSCRIPTIONS_SEGMENT,
};
use crate::error::{EntityClosedError, ValidationError};
use crate::validation::{require_max_len, require_non_empty};

use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tracing::debug;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Checks an entity path is non-empty and within the length limit.
pub fn validate_entity_path(entity_path: &str) -> Result<(), ValidationError> {
    require_non_empty("entity_path", entity_path)?;
    require_max_len("entity_path", entity_path, MAX_ENTITY_PATH_LENGTH)
}

/// Formats the path of a subscription: `{topic_path}/Subscriptions/{name}`.
pub fn subscription_path(topic_path: &str, subscription_name: &str) -> Result<String, ValidationError> {
    require_non_empty("topic_path", topic_path)?;
    require_non_empty("subscription_name", subscription_name)?;
    require_max_len(
        "subscription_name",
        subscription_name,
        MAX_SUBSCRIPTION_NAME_LENGTH,
    )?;

    let path = format!(
        "{topic_path}{PATH_DELIMITER}{SUBSCRIPTIONS_SEGMENT}{PATH_DELIMITER}{subscription_name}"
    );
    validate_entity_path(&path)?;

    Ok(path)
}

/// Formats the path of an entity's dead-letter queue.
#[must_use]
pub fn dead_letter_path(entity_path: &str) -> String {
    format!("{entity_path}{PATH_DELIMITER}{DEAD_LETTER_QUEUE_SEGMENT}")
}

/// Lifecycle of a client entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Operations are accepted.
    Open = 0,

    /// Teardown is in progress.
    Closing = 1,

    /// Teardown has finished.
    Closed = 2,
}

impl From<u8> for LifecycleState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Identity and lifecycle shared by every coordinator.
#[derive(Debug)]
pub struct ClientEntity {
    client_id: String,
    entity_path: String,
    state: AtomicU8,
}

impl ClientEntity {
    /// Creates an open entity with a process-unique client id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the entity path is empty or too long.
    pub fn new(kind: &str, entity_path: impl Into<String>) -> Result<Self, ValidationError> {
        let entity_path = entity_path.into();
        validate_entity_path(&entity_path)?;

        let client_id = format!("{kind}-{}", NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
        debug!("created {client_id} for {entity_path}");

        Ok(Self {
            client_id,
            entity_path,
            state: AtomicU8::new(LifecycleState::Open as u8),
        })
    }

    /// Identifier used in diagnostics.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Logical address of the entity.
    #[must_use]
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Whether the entity has started or finished closing.
    #[must_use]
    pub fn is_closed_or_closing(&self) -> bool {
        self.state() != LifecycleState::Open
    }

    /// Fails with `EntityClosed` unless the entity is open.
    ///
    /// # Errors
    ///
    /// Returns `EntityClosed` once `close` has started.
    pub fn ensure_open(&self) -> Result<(), EntityClosedError> {
        if self.is_closed_or_closing() {
            return Err(EntityClosedError(self.entity_path.clone()));
        }

        Ok(())
    }

    /// Runs `teardown` exactly once and leaves the entity `Closed`.
    ///
    /// Only the caller that moves the entity out of `Open` runs the teardown;
    /// every other call returns `Ok(())` immediately without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns the teardown's error. The entity is `Closed` regardless.
    pub async fn close<F, Fut, E>(&self, teardown: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), E>> + Send,
    {
        if self
            .state
            .compare_exchange(
                LifecycleState::Open as u8,
                LifecycleState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("{} already closed", self.client_id);
            return Ok(());
        }

        let result = teardown().await;
        self.state
            .store(LifecycleState::Closed as u8, Ordering::Release);
        debug!("{} closed", self.client_id);

        result
    }
}
