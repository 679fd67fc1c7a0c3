use serde::{Deserialize, Serialize};

/// Who may call into locally hosted nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccessPolicy {
    /// Only callers presenting this process's environment id
    #[default]
    #[serde(rename = "local")]
    LocalOnly,
    /// Anyone who can reach the endpoint
    #[serde(rename = "open")]
    Open,
}

impl AccessPolicy {
    pub fn permits(&self, token: &str, environment_id: &str) -> bool {
        match self {
            AccessPolicy::LocalOnly => token == environment_id,
            AccessPolicy::Open => true,
        }
    }
}
