//! Runtime configuration
//!
//! A static TOML file supplies the context name, database location, RPC
//! endpoint and housekeeping intervals. It is loaded once at process start and
//! handed to [`crate::Context`]; nothing reads configuration ambiently.

use crate::error::{NodeError, NodeResult};
use crate::rpc::policy::AccessPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top level configuration for one process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Application context; names the SQL schema holding every node table
    #[serde(default = "default_context")]
    pub context: String,
    /// Environment id shared by cooperating processes; used as the RPC auth token
    #[serde(default = "default_environment_id")]
    pub environment_id: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,
}

/// Location of the backing store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the database files; `None` keeps everything in memory
    pub directory: Option<PathBuf>,
}

/// RPC endpoint and discovery timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Address the router binds to
    pub listen_address: String,
    /// Who may call into locally hosted nodes
    pub access: AccessPolicy,
    /// Interval between heartbeat refreshes of a discoverable registration
    pub heartbeat_interval_ms: u64,
    /// Age after which a discoverable registration is considered stale
    pub discovery_timeout_ms: Option<u64>,
    /// How long an outbound request waits for its reply
    pub request_timeout_ms: u64,
}

/// Background housekeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    /// Maximum number of pending deferred de-registrations
    pub deferred_queue_capacity: usize,
    /// Interval of the task draining the deferred queue
    pub sweep_interval_ms: u64,
}

fn default_context() -> String {
    "app".to_string()
}

fn default_environment_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:0".to_string(),
            access: AccessPolicy::LocalOnly,
            heartbeat_interval_ms: 1_000,
            discovery_timeout_ms: Some(10_000),
            request_timeout_ms: 5_000,
        }
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            deferred_queue_capacity: 1024,
            sweep_interval_ms: 250,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            context: default_context(),
            environment_id: default_environment_id(),
            database: DatabaseConfig::default(),
            rpc: RpcConfig::default(),
            housekeeping: HousekeepingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NodeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> NodeResult<Self> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would otherwise fail late
    pub fn validate(&self) -> NodeResult<()> {
        if !crate::schema::naming::is_identifier(&self.context) {
            return Err(NodeError::Config(format!(
                "context '{}' is not a valid schema name",
                self.context
            )));
        }
        if self.environment_id.is_empty() {
            return Err(NodeError::Config("environment_id must not be empty".into()));
        }
        if self.rpc.heartbeat_interval_ms == 0 {
            return Err(NodeError::Config("heartbeat_interval_ms must be positive".into()));
        }
        if let Some(timeout) = self.rpc.discovery_timeout_ms {
            if timeout <= self.rpc.heartbeat_interval_ms {
                return Err(NodeError::Config(
                    "discovery_timeout_ms must exceed heartbeat_interval_ms".into(),
                ));
            }
        }
        if self.rpc.request_timeout_ms == 0 {
            return Err(NodeError::Config("request_timeout_ms must be positive".into()));
        }
        if self.housekeeping.sweep_interval_ms == 0 {
            return Err(NodeError::Config("sweep_interval_ms must be positive".into()));
        }
        if self.housekeeping.deferred_queue_capacity == 0 {
            return Err(NodeError::Config("deferred_queue_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Set the application context
    pub fn with_context(mut self, context: &str) -> Self {
        self.context = context.to_string();
        self
    }

    /// Set the environment id
    pub fn with_environment_id(mut self, environment_id: &str) -> Self {
        self.environment_id = environment_id.to_string();
        self
    }

    /// Keep database files in `directory`
    pub fn with_directory(mut self, directory: &Path) -> Self {
        self.database.directory = Some(directory.to_path_buf());
        self
    }

    /// Set the access policy of the router
    pub fn with_access(mut self, access: AccessPolicy) -> Self {
        self.rpc.access = access;
        self
    }

    /// Set heartbeat interval and staleness timeout in milliseconds
    pub fn with_discovery_timing(mut self, heartbeat_ms: u64, timeout_ms: Option<u64>) -> Self {
        self.rpc.heartbeat_interval_ms = heartbeat_ms;
        self.rpc.discovery_timeout_ms = timeout_ms;
        self
    }

    /// Set how long outbound requests wait for a reply
    pub fn with_request_timeout(mut self, timeout_ms: u64) -> Self {
        self.rpc.request_timeout_ms = timeout_ms;
        self
    }

    /// Set the sweep interval of the deferred-removal queue
    pub fn with_sweep_interval(mut self, interval_ms: u64) -> Self {
        self.housekeeping.sweep_interval_ms = interval_ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.rpc.heartbeat_interval_ms)
    }

    pub fn discovery_timeout(&self) -> Option<Duration> {
        self.rpc.discovery_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping.sweep_interval_ms)
    }

    /// Path of the file backing the context schema, `None` for in-memory
    pub fn schema_file(&self) -> Option<PathBuf> {
        self.database
            .directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.sqlite", self.context)))
    }

    /// Path of the main database file, `None` for in-memory
    pub fn main_file(&self) -> Option<PathBuf> {
        self.database.directory.as_ref().map(|dir| dir.join("main.sqlite"))
    }
}
