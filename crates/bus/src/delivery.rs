//! Receive, peek and settlement through any `MessageReceiver`, shared by the
//! subscription and session coordinators.

use crate::entity::ClientEntity;
use crate::error::{Error, Result, TransportError, ValidationError};
use crate::message::{Message, Properties};
use crate::transport::{MessageReceiver, ReceiveMode};
use crate::validation;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

fn transport_error<E>(entity: &ClientEntity, operation: &str, error: E) -> Error<E>
where
    E: TransportError,
{
    warn!(
        "{} {operation} on {} failed: {error}",
        entity.client_id(),
        entity.entity_path()
    );
    Error::from_transport(error, entity.entity_path())
}

fn require_peek_lock<R>(receiver: &R, operation: &str) -> std::result::Result<(), ValidationError>
where
    R: MessageReceiver,
{
    if receiver.receive_mode() != ReceiveMode::PeekLock {
        return Err(ValidationError::InvalidOperation(format!(
            "{operation} requires the PeekLock receive mode"
        )));
    }

    Ok(())
}

pub async fn receive<R>(
    entity: &ClientEntity,
    receiver: &R,
    max_count: usize,
    timeout: Duration,
) -> Result<Vec<Message>, R::Error>
where
    R: MessageReceiver,
{
    entity.ensure_open()?;
    validation::validate_max_count(max_count)?;

    debug!(
        "{} receiving up to {max_count} message(s) within {timeout:?}",
        entity.client_id()
    );

    let messages = receiver
        .receive(max_count, timeout)
        .await
        .map_err(|e| transport_error(entity, "receive", e))?;

    debug!("{} received {} message(s)", entity.client_id(), messages.len());

    Ok(messages)
}

pub async fn receive_deferred<R>(
    entity: &ClientEntity,
    receiver: &R,
    sequence_numbers: &[i64],
) -> Result<Vec<Message>, R::Error>
where
    R: MessageReceiver,
{
    entity.ensure_open()?;
    validation::validate_sequence_numbers(sequence_numbers)?;

    debug!(
        "{} receiving deferred messages {sequence_numbers:?}",
        entity.client_id()
    );

    receiver
        .receive_deferred(sequence_numbers)
        .await
        .map_err(|e| transport_error(entity, "receive deferred", e))
}

pub async fn peek<R>(
    entity: &ClientEntity,
    receiver: &R,
    from_sequence_number: i64,
    max_count: usize,
) -> Result<Vec<Message>, R::Error>
where
    R: MessageReceiver,
{
    entity.ensure_open()?;
    validation::validate_max_count(max_count)?;

    receiver
        .peek(from_sequence_number, max_count)
        .await
        .map_err(|e| transport_error(entity, "peek", e))
}

pub async fn complete<R>(
    entity: &ClientEntity,
    receiver: &R,
    lock_tokens: &[Uuid],
) -> Result<(), R::Error>
where
    R: MessageReceiver,
{
    entity.ensure_open()?;
    require_peek_lock(receiver, "complete")?;
    validation::validate_lock_tokens(lock_tokens)?;

    debug!(
        "{} completing {} message(s)",
        entity.client_id(),
        lock_tokens.len()
    );

    receiver
        .complete(lock_tokens)
        .await
        .map_err(|e| transport_error(entity, "complete", e))
}

pub async fn abandon<R>(
    entity: &ClientEntity,
    receiver: &R,
    lock_token: Uuid,
    properties_to_modify: Option<Properties>,
) -> Result<(), R::Error>
where
    R: MessageReceiver,
{
    entity.ensure_open()?;
    require_peek_lock(receiver, "abandon")?;
    validation::validate_lock_token(lock_token)?;

    debug!("{} abandoning {lock_token}", entity.client_id());

    receiver
        .abandon(lock_token, properties_to_modify)
        .await
        .map_err(|e| transport_error(entity, "abandon", e))
}

pub async fn defer<R>(
    entity: &ClientEntity,
    receiver: &R,
    lock_token: Uuid,
    properties_to_modify: Option<Properties>,
) -> Result<(), R::Error>
where
    R: MessageReceiver,
{
    entity.ensure_open()?;
    require_peek_lock(receiver, "defer")?;
    validation::validate_lock_token(lock_token)?;

    debug!("{} deferring {lock_token}", entity.client_id());

    receiver
        .defer(lock_token, properties_to_modify)
        .await
        .map_err(|e| transport_error(entity, "defer", e))
}

pub async fn dead_letter<R>(
    entity: &ClientEntity,
    receiver: &R,
    lock_token: Uuid,
    reason: Option<String>,
    description: Option<String>,
) -> Result<(), R::Error>
where
    R: MessageReceiver,
{
    entity.ensure_open()?;
    require_peek_lock(receiver, "dead-letter")?;
    validation::validate_lock_token(lock_token)?;

    debug!(
        "{} dead-lettering {lock_token} ({})",
        entity.client_id(),
        reason.as_deref().unwrap_or("no reason")
    );

    receiver
        .dead_letter(lock_token, reason, description)
        .await
        .map_err(|e| transport_error(entity, "dead-letter", e))
}

pub async fn renew_lock<R>(
    entity: &ClientEntity,
    receiver: &R,
    lock_token: Uuid,
) -> Result<DateTime<Utc>, R::Error>
where
    R: MessageReceiver,
{
    entity.ensure_open()?;
    require_peek_lock(receiver, "renew lock")?;
    validation::validate_lock_token(lock_token)?;

    let locked_until = receiver
        .renew_lock(lock_token)
        .await
        .map_err(|e| transport_error(entity, "renew lock", e))?;

    debug!(
        "{} renewed {lock_token} until {locked_until}",
        entity.client_id()
    );

    Ok(locked_until)
}
