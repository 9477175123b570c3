//! Client-side coordination for topic/subscription message brokers.
//!
//! The coordinators here validate every request locally and then delegate to
//! an abstract transport (see [`transport`]) which performs the network
//! operation. Nothing is retried at this layer.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod delivery;

/// Parsing of namespace connection strings.
pub mod connection_string;

/// Fixed limits and well-known names.
pub mod constants;

/// Entity identity, paths and lifecycle.
pub mod entity;

/// Error types.
pub mod error;

/// Create-once transport handles.
pub mod lazy;

/// The message envelope.
pub mod message;

/// Subscription filter rules.
pub mod rule;

/// Sending and scheduling messages.
pub mod sender;

/// Session-scoped receiving.
pub mod session;

/// Receiving from subscriptions.
pub mod subscription;

/// Capabilities consumed from the link layer.
pub mod transport;

/// Pure checks run before anything crosses the transport boundary.
pub mod validation;

pub use connection_string::ConnectionString;
pub use entity::{ClientEntity, LifecycleState, dead_letter_path, subscription_path};
pub use error::{
    EntityClosedError, Error, Result, TransportError, TransportErrorKind, ValidationError,
};
pub use message::{Message, Properties, PropertyValue, SystemProperties};
pub use rule::{CorrelationFilter, Filter, RuleAction, RuleDescription};
pub use sender::MessageSender;
pub use session::MessageSession;
pub use subscription::{SessionOf, SubscriptionClient, SubscriptionClientOptions};
pub use transport::{
    Connection, MessageReceiver, ReceiveMode, Receiver, RuleManager, Sender, SessionReceiver,
};
