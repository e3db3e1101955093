//! Endpoint configuration: the agent's bind to a single pod.
//!
//! The on-disk file (`~/.kash_stash_config.json`) is shared with the desktop
//! front-end, which can rewrite it at any time. The engine therefore never
//! holds an endpoint: it asks an [`EndpointProvider`] for the current one on
//! every controller tick. Field names mirror the file's keys verbatim.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_config_tags() -> String {
    "agent-config".to_string()
}

fn default_cache_minutes() -> i64 {
    5
}

/// One pod binding from the endpoint configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Human label for the endpoint, set by the front-end.
    #[serde(default)]
    pub name: String,

    /// Device label attached to published digests and lock tags.
    #[serde(default, rename = "DEVICE")]
    pub device: String,

    /// Pod base URL for the tag query API.
    #[serde(default, rename = "POD_URL")]
    pub pod_url: String,

    /// API key sent as `X-POD-KEY` on pod reads.
    #[serde(default, rename = "POD_KEY")]
    pub pod_key: String,

    /// Node name of the ingest route (`probes-{node}.xyzpulseinfra.com`).
    #[serde(default, rename = "NODE_NAME")]
    pub node_name: String,

    /// Probe identifier of the ingest route.
    #[serde(default, rename = "PROBE_ID")]
    pub probe_id: String,

    /// Key sent as `X-PROBE-KEY` on pod writes.
    #[serde(default, rename = "PROBE_KEY")]
    pub probe_key: String,

    /// Digest id of the YAML job configuration blob.
    #[serde(default, rename = "CONFIG_DIGEST_ID")]
    pub config_digest_id: String,

    /// Tag set searched for the configuration digest (and logic scripts).
    #[serde(default = "default_config_tags", rename = "CONFIG_DIGEST_TAGS")]
    pub config_digest_tags: String,

    /// Configuration cache TTL in minutes. `0` never caches, `-1` caches
    /// permanently.
    #[serde(default = "default_cache_minutes", rename = "CONFIG_CACHE_MINUTES")]
    pub config_cache_minutes: i64,
}

impl EndpointConfig {
    /// Whether the read side of the pod is configured.
    pub fn has_pod(&self) -> bool {
        !self.pod_url.trim().is_empty() && !self.pod_key.trim().is_empty()
    }
}

/// Source of the current endpoint, consulted on every controller tick.
pub trait EndpointProvider: Send + Sync {
    /// The endpoint the agent should bind to right now, if any is configured.
    fn current(&self) -> Option<EndpointConfig>;
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    last_used_endpoint: usize,
}

/// [`EndpointProvider`] backed by the shared configuration file.
#[derive(Debug, Clone)]
pub struct FileEndpointProvider {
    path: PathBuf,
}

impl FileEndpointProvider {
    /// Provider reading from `path` on every call.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The conventional configuration path, `~/.kash_stash_config.json`.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
        let home = PathBuf::from(home);
        if home.as_os_str().is_empty() {
            anyhow::bail!("HOME is set but empty");
        }
        Ok(home.join(".kash_stash_config.json"))
    }

    fn load(&self) -> anyhow::Result<Option<EndpointConfig>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let file: ConfigFile = serde_json::from_str(&raw)?;
        Ok(file.endpoints.get(file.last_used_endpoint).cloned())
    }
}

impl EndpointProvider for FileEndpointProvider {
    fn current(&self) -> Option<EndpointConfig> {
        match self.load() {
            Ok(endpoint) => endpoint,
            Err(_) => None,
        }
    }
}
