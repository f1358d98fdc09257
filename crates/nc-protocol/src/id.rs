//! Identifier types for nodes, deployments and executions

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create an identifier from any string-like value
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the raw ID string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id! {
    /// Identifier of a compute node, as reported by the backend
    NodeId
}

string_id! {
    /// Identifier of a deployment, generated by the connector
    DeploymentId
}

string_id! {
    /// Identifier of an execution.
    ///
    /// Usually supplied by the orchestrator so that retries of the same
    /// request land on the same record.
    ExecutionId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let id = NodeId::new("node-1");
        assert_eq!(format!("{}", id), "node-1");
        assert_eq!(id.as_str(), "node-1");
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = ExecutionId::from("e1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""e1""#);

        let parsed: DeploymentId = serde_json::from_str(r#""d-42""#).unwrap();
        assert_eq!(parsed, DeploymentId::new("d-42"));
    }
}
