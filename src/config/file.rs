//! TOML configuration file loading
//!
//! Supports `~/.config/sovren/voice/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top
//! of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::LocalCommandConfig;
use crate::Result;
use crate::persona::PersonaProfile;
use crate::router::RoutingRule;
use crate::synthesis::AudioFormat;
use crate::tier::TierConfig;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Subscription tier (e.g. "basic", "tier2")
    #[serde(default)]
    pub tier: Option<String>,

    /// Persona catalog (empty = built-in catalog)
    #[serde(default)]
    pub personas: Vec<PersonaProfile>,

    /// Tier layout (empty = built-in tiers)
    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    /// Routing rules (absent = built-in rules, empty list = no rules)
    #[serde(default)]
    pub rules: Option<Vec<RoutingRule>>,

    /// Call router configuration
    #[serde(default)]
    pub router: RouterFileConfig,

    /// Synthesis configuration
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Session/history configuration
    #[serde(default)]
    pub sessions: SessionsFileConfig,

    /// Manager configuration
    #[serde(default)]
    pub manager: ManagerFileConfig,
}

/// Call router configuration
#[derive(Debug, Default, Deserialize)]
pub struct RouterFileConfig {
    /// Always-on fallback persona id
    pub fallback_persona: Option<String>,
}

/// Synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    /// Enable synthesis
    pub enabled: Option<bool>,

    /// Remote inference endpoint
    pub remote_url: Option<String>,

    /// Remote endpoint bearer token
    pub remote_api_key: Option<String>,

    /// Timeout per remote attempt in seconds
    pub remote_timeout_secs: Option<f64>,

    /// Remote retries after the first attempt
    pub max_retries: Option<u32>,

    /// Base backoff before a remote retry
    pub retry_base_delay_ms: Option<u64>,

    /// Cached results kept
    pub cache_capacity: Option<usize>,

    /// Local synthesis workers
    pub worker_count: Option<usize>,

    /// Audio container ("wav", "mp3", "pcm")
    pub format: Option<AudioFormat>,

    /// Output sample rate
    pub sample_rate: Option<u32>,

    /// Offline synthesis command
    pub local_command: Option<LocalCommandConfig>,

    /// Degraded clip length
    pub degraded_clip_ms: Option<u32>,
}

/// Session/history configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionsFileConfig {
    pub history_capacity: Option<usize>,
    pub per_caller_history: Option<usize>,
    pub max_tracked_callers: Option<usize>,
}

/// Manager configuration
#[derive(Debug, Default, Deserialize)]
pub struct ManagerFileConfig {
    /// Advisory call duration limit in seconds
    pub max_call_duration_secs: Option<u64>,

    /// Event channel capacity
    pub event_capacity: Option<usize>,

    /// Answer routed inbound calls immediately
    pub auto_answer: Option<bool>,
}

/// Load the TOML config file
///
/// An explicit `path` must exist. Without one, the standard path is tried
/// and a missing file yields `VoiceConfigFile::default()`.
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<VoiceConfigFile> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match config_file_path() {
            Some(p) if p.exists() => p,
            _ => {
                tracing::debug!("no config file found, using defaults");
                return Ok(VoiceConfigFile::default());
            }
        },
    };

    let content = std::fs::read_to_string(&path).map_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "failed to read config file");
        e
    })?;

    let config = toml::from_str(&content).map_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "failed to parse config file");
        e
    })?;

    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/sovren/voice/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("sovren")
            .join("voice")
            .join("config.toml")
    })
}
