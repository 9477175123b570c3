use std::time::Duration;

/// Delimiter between the segments of an entity path.
pub const PATH_DELIMITER: &str = "/";

/// Segment separating a topic path from its subscription names.
pub const SUBSCRIPTIONS_SEGMENT: &str = "Subscriptions";

/// Segment appended to an entity path to address its dead-letter queue.
pub const DEAD_LETTER_QUEUE_SEGMENT: &str = "$DeadLetterQueue";

/// Name of the rule every subscription is created with.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Maximum length of a message id.
pub const MAX_MESSAGE_ID_LENGTH: usize = 128;

/// Maximum length of a session id.
pub const MAX_SESSION_ID_LENGTH: usize = 128;

/// Maximum length of a rule name.
pub const MAX_RULE_NAME_LENGTH: usize = 50;

/// Maximum length of a subscription name.
pub const MAX_SUBSCRIPTION_NAME_LENGTH: usize = 50;

/// Maximum length of an entity path.
pub const MAX_ENTITY_PATH_LENGTH: usize = 260;

/// Maximum encoded size of the user property block of a message, in bytes.
pub const MAX_PROPERTY_BLOCK_SIZE: usize = 64 * 1024;

/// Timeout applied to operations when the caller does not supply one.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a peek-lock delivery stays locked before the broker reclaims it.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

/// Deliveries after which an abandoned message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// Property stamped on dead-lettered messages with the caller's reason.
pub const DEAD_LETTER_REASON_HEADER: &str = "DeadLetterReason";

/// Property stamped on dead-lettered messages with the caller's description.
pub const DEAD_LETTER_ERROR_DESCRIPTION_HEADER: &str = "DeadLetterErrorDescription";
