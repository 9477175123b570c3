use crate::constants::{
    MAX_MESSAGE_ID_LENGTH, MAX_PROPERTY_BLOCK_SIZE, MAX_RULE_NAME_LENGTH, MAX_SESSION_ID_LENGTH,
};
use crate::error::ValidationError;
use crate::message::{Message, property_block_len};
use crate::rule::RuleDescription;

use chrono::{DateTime, Utc};
use uuid::Uuid;

type Result<T> = std::result::Result<T, ValidationError>;

/// Rejects empty or whitespace-only values.
pub fn require_non_empty(argument: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::invalid_argument(
            argument,
            "must not be empty or whitespace",
        ));
    }

    Ok(())
}

/// Rejects values longer than `max` characters.
pub fn require_max_len(argument: &'static str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(ValidationError::invalid_argument(
            argument,
            format!("must be at most {max} characters"),
        ));
    }

    Ok(())
}

/// Checks a single outbound message.
///
/// A message that still carries a lock token was received from the broker
/// and may not be sent again.
pub fn validate(message: &Message) -> Result<()> {
    if let Some(lock_token) = message.lock_token() {
        return Err(ValidationError::InvalidOperation(format!(
            "message was received with lock token {lock_token} and cannot be sent"
        )));
    }

    if let Some(message_id) = &message.message_id {
        require_non_empty("message_id", message_id)?;
        require_max_len("message_id", message_id, MAX_MESSAGE_ID_LENGTH)?;
    }

    if let Some(session_id) = &message.session_id {
        validate_session_id(session_id)?;
    }

    let block_len = property_block_len(&message.properties);
    if block_len > MAX_PROPERTY_BLOCK_SIZE {
        return Err(ValidationError::invalid_argument(
            "properties",
            format!("block of {block_len} bytes exceeds {MAX_PROPERTY_BLOCK_SIZE} bytes"),
        ));
    }

    Ok(())
}

/// Checks every message of a batch and returns the batch size.
///
/// Runs the same checks as [`validate`] on each element, so a batch fails
/// exactly when one of its messages would fail on its own.
pub fn validate_batch(messages: &[Message]) -> Result<usize> {
    if messages.is_empty() {
        return Err(ValidationError::invalid_argument(
            "messages",
            "must contain at least one message",
        ));
    }

    for message in messages {
        validate(message)?;
    }

    Ok(messages.len())
}

/// Rejects schedule times strictly before `now`.
pub fn validate_schedule_time(
    scheduled_enqueue_time_utc: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    if scheduled_enqueue_time_utc < now {
        return Err(ValidationError::invalid_argument(
            "scheduled_enqueue_time_utc",
            format!("{scheduled_enqueue_time_utc} is in the past"),
        ));
    }

    Ok(())
}

/// Checks a rule name is non-empty and within the length limit.
pub fn validate_rule_name(name: &str) -> Result<()> {
    require_non_empty("rule_name", name)?;
    require_max_len("rule_name", name, MAX_RULE_NAME_LENGTH)
}

/// Checks a rule description before it is added.
pub fn validate_rule(rule: &RuleDescription) -> Result<()> {
    validate_rule_name(&rule.name)
}

/// Checks a session id is non-empty and within the length limit.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    require_non_empty("session_id", session_id)?;
    require_max_len("session_id", session_id, MAX_SESSION_ID_LENGTH)
}

/// Rejects the nil lock token.
pub fn validate_lock_token(lock_token: Uuid) -> Result<()> {
    if lock_token.is_nil() {
        return Err(ValidationError::invalid_argument(
            "lock_token",
            "must not be the nil uuid",
        ));
    }

    Ok(())
}

/// Rejects an empty set of lock tokens or any nil token within it.
pub fn validate_lock_tokens(lock_tokens: &[Uuid]) -> Result<()> {
    if lock_tokens.is_empty() {
        return Err(ValidationError::invalid_argument(
            "lock_tokens",
            "must contain at least one lock token",
        ));
    }

    lock_tokens.iter().copied().try_for_each(validate_lock_token)
}

/// Rejects an empty set of sequence numbers.
pub fn validate_sequence_numbers(sequence_numbers: &[i64]) -> Result<()> {
    if sequence_numbers.is_empty() {
        return Err(ValidationError::invalid_argument(
            "sequence_numbers",
            "must contain at least one sequence number",
        ));
    }

    Ok(())
}

/// Rejects a zero message count.
pub fn validate_max_count(max_count: usize) -> Result<()> {
    if max_count == 0 {
        return Err(ValidationError::invalid_argument(
            "max_count",
            "must be greater than zero",
        ));
    }

    Ok(())
}
