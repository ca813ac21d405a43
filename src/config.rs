//! Client configuration.
//!
//! Loaded from an optional JSON file; every field has a default and the
//! identifiers and relay URL can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::ClientIdentity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub relay_url: String,
    pub client_id: String,
    pub target_id: String,
    /// Connectivity-assist servers handed to the transport as-is.
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    pub probe_interval_ms: u64,
    pub stats_interval_ms: u64,
    /// Chance that a received frame is counted as lost.
    pub loss_probability: f64,
    pub relay_keepalive_secs: u64,
    /// Where to keep the latest received frame, if anywhere.
    pub frames_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:7860/ws".to_string(),
            client_id: "browser-client".to_string(),
            target_id: "device".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            channel_label: "video-streaming".to_string(),
            probe_interval_ms: 1000,
            stats_interval_ms: 5000,
            loss_probability: 0.05,
            relay_keepalive_secs: 20,
            frames_dir: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Applies `RELAY_URL`, `CLIENT_ID` and `TARGET_ID` when set.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = var("RELAY_URL") {
            self.relay_url = url;
        }
        if let Some(id) = var("CLIENT_ID") {
            self.client_id = id;
        }
        if let Some(id) = var("TARGET_ID") {
            self.target_id = id;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() || self.target_id.is_empty() {
            bail!("clientId and targetId must not be empty");
        }
        if self.relay_url.is_empty() {
            bail!("relayUrl must not be empty");
        }
        if self.probe_interval_ms == 0 || self.stats_interval_ms == 0 {
            bail!("probe and stats intervals must be positive");
        }
        if !(0.0..=1.0).contains(&self.loss_probability) {
            bail!(
                "lossProbability must be within [0, 1], got {}",
                self.loss_probability
            );
        }
        Ok(())
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(&self.client_id, &self.target_id)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn relay_keepalive(&self) -> Duration {
        Duration::from_secs(self.relay_keepalive_secs.max(1))
    }
}
