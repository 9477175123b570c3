use crate::error::ValidationError;
use crate::validation::require_non_empty;

use std::fmt::{self, Debug};
use std::str::FromStr;

const ENDPOINT_KEY: &str = "endpoint";
const SHARED_ACCESS_KEY_NAME_KEY: &str = "sharedaccesskeyname";
const SHARED_ACCESS_KEY_KEY: &str = "sharedaccesskey";
const ENTITY_PATH_KEY: &str = "entitypath";

/// Parsed `Endpoint=...;SharedAccessKeyName=...;SharedAccessKey=...;EntityPath=...`
/// connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// Namespace endpoint, e.g. `sb://example.servicebus.windows.net/`.
    pub endpoint: String,

    /// Name of the shared access policy.
    pub shared_access_key_name: Option<String>,

    /// Shared access key.
    pub shared_access_key: Option<String>,

    /// Entity the string is scoped to.
    pub entity_path: Option<String>,
}

impl ConnectionString {
    /// Parses a connection string.
    ///
    /// Keys are case-insensitive and empty segments are ignored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the string is empty, a segment is
    /// malformed or unknown, the endpoint is missing, or only one of the
    /// shared access key name and key is supplied.
    pub fn parse(connection_string: &str) -> Result<Self, ValidationError> {
        require_non_empty("connection_string", connection_string)?;

        let mut endpoint = None;
        let mut shared_access_key_name = None;
        let mut shared_access_key = None;
        let mut entity_path = None;

        for segment in connection_string.split(';').map(str::trim) {
            if segment.is_empty() {
                continue;
            }

            let (key, value) = segment.split_once('=').ok_or_else(|| {
                ValidationError::invalid_argument(
                    "connection_string",
                    format!("segment `{segment}` is not a key=value pair"),
                )
            })?;
            let value = value.trim();
            require_non_empty("connection_string", value)?;

            let slot = match key.trim().to_ascii_lowercase().as_str() {
                ENDPOINT_KEY => &mut endpoint,
                SHARED_ACCESS_KEY_NAME_KEY => &mut shared_access_key_name,
                SHARED_ACCESS_KEY_KEY => &mut shared_access_key,
                ENTITY_PATH_KEY => &mut entity_path,
                _ => {
                    return Err(ValidationError::invalid_argument(
                        "connection_string",
                        format!("unknown key `{}`", key.trim()),
                    ));
                }
            };
            *slot = Some(value.to_string());
        }

        let endpoint = endpoint.ok_or_else(|| {
            ValidationError::invalid_argument("connection_string", "missing Endpoint")
        })?;

        if shared_access_key_name.is_some() != shared_access_key.is_some() {
            return Err(ValidationError::invalid_argument(
                "connection_string",
                "SharedAccessKeyName and SharedAccessKey must be supplied together",
            ));
        }

        Ok(Self {
            endpoint,
            shared_access_key_name,
            shared_access_key,
            entity_path,
        })
    }
}

impl FromStr for ConnectionString {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field(
                "shared_access_key",
                &self.shared_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("entity_path", &self.entity_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_parse_full() {
        let parsed = ConnectionString::parse(
            "Endpoint=sb://example.local/;SharedAccessKeyName=root;SharedAccessKey=c2VjcmV0;EntityPath=orders",
        )
        .unwrap();

        assert_eq!(parsed.endpoint, "sb://example.local/");
        assert_eq!(parsed.shared_access_key_name.as_deref(), Some("root"));
        assert_eq!(parsed.shared_access_key.as_deref(), Some("c2VjcmV0"));
        assert_eq!(parsed.entity_path.as_deref(), Some("orders"));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let parsed: ConnectionString = "endpoint=sb://example.local/;".parse().unwrap();

        assert_eq!(parsed.endpoint, "sb://example.local/");
        assert_eq!(parsed.entity_path, None);
    }

    #[test]
    fn test_rejects_malformed() {
        assert_matches!(
            ConnectionString::parse("  "),
            Err(ValidationError::InvalidArgument { .. })
        );
        assert!(ConnectionString::parse("EntityPath=orders").is_err());
        assert!(ConnectionString::parse("Endpoint").is_err());
        assert!(ConnectionString::parse("Endpoint=sb://x/;Colour=blue").is_err());
        assert!(ConnectionString::parse("Endpoint=sb://x/;SharedAccessKeyName=root").is_err());
        assert!(ConnectionString::parse("Endpoint=").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let parsed = ConnectionString::parse(
            "Endpoint=sb://x/;SharedAccessKeyName=root;SharedAccessKey=topsecret",
        )
        .unwrap();

        assert!(!format!("{parsed:?}").contains("topsecret"));
    }
}
