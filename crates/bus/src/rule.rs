use crate::constants::DEFAULT_RULE_NAME;
use crate::message::Properties;

use serde::{Deserialize, Serialize};

/// Matches messages on their system and user properties by equality.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationFilter {
    /// Required correlation id.
    pub correlation_id: Option<String>,

    /// Required label.
    pub label: Option<String>,

    /// Required user properties.
    pub properties: Properties,
}

/// Server-side filter deciding which topic messages a subscription receives.
///
/// The expression language itself is evaluated by the broker; the client
/// only carries it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Matches every message.
    True,

    /// Matches no message.
    False,

    /// SQL-like filter expression.
    Sql(String),

    /// Property equality filter.
    Correlation(CorrelationFilter),
}

/// Action applied to messages matched by a rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    /// SQL-like action expression.
    Sql(String),
}

/// A named filter rule on a subscription.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleDescription {
    /// Rule name, unique per subscription.
    pub name: String,

    /// The filter.
    pub filter: Filter,

    /// Optional action.
    pub action: Option<RuleAction>,
}

impl RuleDescription {
    /// Creates a rule without an action.
    pub fn new(name: impl Into<String>, filter: Filter) -> Self {
        Self {
            name: name.into(),
            filter,
            action: None,
        }
    }

    /// Attaches an action.
    #[must_use]
    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.action = Some(action);
        self
    }
}

impl Default for RuleDescription {
    /// The rule every subscription starts with.
    fn default() -> Self {
        Self::new(DEFAULT_RULE_NAME, Filter::True)
    }
}
