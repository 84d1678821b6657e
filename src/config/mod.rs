//! Configuration for the voice core
//!
//! The core never reads files or the environment itself. This module is the
//! loader the hosting application uses to produce a typed [`Config`], which
//! is then handed to the router, synthesis queue and manager.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::persona::{self, PersonaId, PersonaProfile, SYSTEM_PERSONA_ID};
use crate::router::{self, RoutingRule};
use crate::synthesis::{AudioFormat, RetryPolicy};
use crate::tier::{self, Tier, TierConfig, TierGate};
use crate::{Error, Result};

/// Complete voice core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Active subscription tier
    pub tier: Tier,

    /// Persona catalog
    pub personas: Vec<PersonaProfile>,

    /// Tier layout
    pub tiers: Vec<TierConfig>,

    /// Routing rules
    pub rules: Vec<RoutingRule>,

    /// Call router configuration
    pub router: RouterConfig,

    /// Synthesis queue configuration
    pub synthesis: SynthesisConfig,

    /// Session/history store configuration
    pub sessions: SessionConfig,

    /// Voice system manager configuration
    pub manager: ManagerConfig,
}

/// Call router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Always-on persona used when nothing else is available
    pub fallback_persona: PersonaId,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fallback_persona: PersonaId::from(SYSTEM_PERSONA_ID),
        }
    }
}

/// Synthesis queue configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Enable speech synthesis
    pub enabled: bool,

    /// Remote inference endpoint (stage 1)
    pub remote_url: Option<String>,

    /// Bearer token for the remote endpoint
    pub remote_api_key: Option<String>,

    /// Timeout per remote attempt
    pub remote_timeout: Duration,

    /// Retry policy for the remote stage
    pub retry: RetryPolicy,

    /// Maximum cached results (0 disables caching)
    pub cache_capacity: usize,

    /// Blocking workers for local synthesis (0 = always inline)
    pub worker_count: usize,

    /// Requested audio container
    pub format: AudioFormat,

    /// Requested sample rate
    pub sample_rate: u32,

    /// Offline synthesis command (stage 2)
    pub local_command: Option<LocalCommandConfig>,

    /// Length of the degraded silent clip (stage 3)
    pub degraded_clip_ms: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remote_url: None,
            remote_api_key: None,
            remote_timeout: Duration::from_secs(8),
            retry: RetryPolicy::default(),
            cache_capacity: 256,
            worker_count: 2,
            format: AudioFormat::Wav,
            sample_rate: 22_050,
            local_command: None,
            degraded_clip_ms: 500,
        }
    }
}

/// Offline synthesis command
///
/// Arguments may contain the placeholders `{text}`, `{voice}`, `{output}`,
/// `{sample_rate}`, `{speed}` and `{pitch}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalCommandConfig {
    /// Executable to run
    pub program: String,

    /// Argument template
    #[serde(default = "default_command_args")]
    pub args: Vec<String>,

    /// Directory holding one entry per installed voice model
    pub model_dir: Option<PathBuf>,
}

/// Session/history store configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Ended sessions retained
    pub history_capacity: usize,

    /// Interactions retained per caller
    pub per_caller_history: usize,

    /// Callers tracked before the oldest is forgotten
    pub max_tracked_callers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            per_caller_history: 20,
            max_tracked_callers: 1_000,
        }
    }
}

/// Voice system manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Advisory maximum call duration, enforced by the signaling transport
    pub max_call_duration: Duration,

    /// Event channel capacity per category
    pub event_capacity: usize,

    /// Answer inbound calls as soon as they are routed
    pub auto_answer: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_call_duration: Duration::from_secs(60 * 60),
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
            auto_answer: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tier: Tier::most_restrictive(),
            personas: persona::default_catalog(),
            tiers: tier::default_tiers(),
            rules: router::default_rules(),
            router: RouterConfig::default(),
            synthesis: SynthesisConfig::default(),
            sessions: SessionConfig::default(),
            manager: ManagerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration: environment > TOML file > defaults
    ///
    /// With `path = None` the standard location is used and a missing file
    /// means defaults.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit file is missing, the file cannot be
    /// parsed, or the resulting configuration is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        let mut config = Self::from_file(fc)?;

        // Environment overrides
        if let Ok(tier) = std::env::var("SOVREN_TIER") {
            config.tier = tier.parse()?;
        }
        if let Ok(url) = std::env::var("SOVREN_TTS_URL") {
            config.synthesis.remote_url = Some(url);
        }
        if let Ok(key) = std::env::var("SOVREN_TTS_API_KEY") {
            config.synthesis.remote_api_key = Some(key);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid TOML or the configuration is
    /// invalid
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let fc: file::VoiceConfigFile = toml::from_str(content)?;
        Self::from_file(fc)
    }

    /// Overlay a parsed file on top of defaults
    ///
    /// # Errors
    ///
    /// Returns error if the tier is unknown or the result fails validation
    pub fn from_file(fc: file::VoiceConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let synthesis_defaults = SynthesisConfig::default();
        let session_defaults = SessionConfig::default();
        let manager_defaults = ManagerConfig::default();

        let tier = fc.tier.as_deref().map(str::parse).transpose()?;

        let remote_timeout = fc
            .synthesis
            .remote_timeout_secs
            .map(parse_timeout_secs)
            .transpose()?
            .unwrap_or(synthesis_defaults.remote_timeout);

        let mut retry = synthesis_defaults.retry.clone();
        if let Some(max) = fc.synthesis.max_retries {
            retry.max_retries = max;
        }
        if let Some(ms) = fc.synthesis.retry_base_delay_ms {
            retry.base_delay = Duration::from_millis(ms);
        }

        let config = Self {
            tier: tier.unwrap_or(defaults.tier),
            personas: if fc.personas.is_empty() {
                defaults.personas
            } else {
                fc.personas
            },
            tiers: if fc.tiers.is_empty() {
                defaults.tiers
            } else {
                fc.tiers
            },
            rules: fc.rules.unwrap_or(defaults.rules),
            router: RouterConfig {
                fallback_persona: fc
                    .router
                    .fallback_persona
                    .map_or(defaults.router.fallback_persona, PersonaId::from),
            },
            synthesis: SynthesisConfig {
                enabled: fc.synthesis.enabled.unwrap_or(synthesis_defaults.enabled),
                remote_url: fc.synthesis.remote_url,
                remote_api_key: fc.synthesis.remote_api_key,
                remote_timeout,
                retry,
                cache_capacity: fc
                    .synthesis
                    .cache_capacity
                    .unwrap_or(synthesis_defaults.cache_capacity),
                worker_count: fc
                    .synthesis
                    .worker_count
                    .unwrap_or(synthesis_defaults.worker_count),
                format: fc.synthesis.format.unwrap_or(synthesis_defaults.format),
                sample_rate: fc
                    .synthesis
                    .sample_rate
                    .unwrap_or(synthesis_defaults.sample_rate),
                local_command: fc.synthesis.local_command,
                degraded_clip_ms: fc
                    .synthesis
                    .degraded_clip_ms
                    .unwrap_or(synthesis_defaults.degraded_clip_ms),
            },
            sessions: SessionConfig {
                history_capacity: fc
                    .sessions
                    .history_capacity
                    .unwrap_or(session_defaults.history_capacity),
                per_caller_history: fc
                    .sessions
                    .per_caller_history
                    .unwrap_or(session_defaults.per_caller_history),
                max_tracked_callers: fc
                    .sessions
                    .max_tracked_callers
                    .unwrap_or(session_defaults.max_tracked_callers),
            },
            manager: ManagerConfig {
                max_call_duration: fc
                    .manager
                    .max_call_duration_secs
                    .map_or(manager_defaults.max_call_duration, Duration::from_secs),
                event_capacity: fc
                    .manager
                    .event_capacity
                    .unwrap_or(manager_defaults.event_capacity),
                auto_answer: fc
                    .manager
                    .auto_answer
                    .unwrap_or(manager_defaults.auto_answer),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration as a whole
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on an invalid catalog, tier layout, fallback
    /// persona or routing rule
    pub fn validate(&self) -> Result<()> {
        persona::validate_catalog(&self.personas)?;
        let gate = TierGate::new(self.tiers.clone())?;
        gate.resolve(self.tier, &self.personas)?;

        let fallback = self
            .personas
            .iter()
            .find(|p| p.id == self.router.fallback_persona)
            .ok_or_else(|| {
                Error::Config(format!(
                    "fallback persona {} is not in the catalog",
                    self.router.fallback_persona
                ))
            })?;
        if !fallback.is_unbounded() {
            return Err(Error::Config(format!(
                "fallback persona {} must accept unbounded calls",
                fallback.id
            )));
        }

        for rule in &self.rules {
            rule.validate()?;
            if !self.personas.iter().any(|p| p.id == rule.actions.target) {
                return Err(Error::Config(format!(
                    "rule {} targets unknown persona {}",
                    rule.id, rule.actions.target
                )));
            }
        }

        if self.synthesis.sample_rate == 0 {
            return Err(Error::Config("sample rate must be positive".to_string()));
        }

        Ok(())
    }

    /// Build the tier gate for this configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the tier layout is invalid
    pub fn tier_gate(&self) -> Result<TierGate> {
        TierGate::new(self.tiers.clone())
    }
}

fn default_command_args() -> Vec<String> {
    [
        "--text",
        "{text}",
        "--voice_model",
        "{voice}",
        "--output",
        "{output}",
        "--sample_rate",
        "{sample_rate}",
        "--speed",
        "{speed}",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn parse_timeout_secs(secs: f64) -> Result<Duration> {
    let timeout = Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Config(format!("remote_timeout_secs = {secs}: {e}")))?;
    if timeout.is_zero() {
        return Err(Error::Config(
            "remote_timeout_secs must be greater than zero".to_string(),
        ));
    }
    Ok(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.tier, Tier::Tier1);
        assert_eq!(config.router.fallback_persona, SYSTEM_PERSONA_ID);
        assert_eq!(config.synthesis.sample_rate, 22_050);
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.personas.len(), persona::default_catalog().len());
        assert_eq!(config.rules.len(), router::default_rules().len());
    }

    #[test]
    fn toml_overlays_defaults() {
        let config = Config::from_toml_str(
            r#"
tier = "proof_plus"

[synthesis]
remote_url = "http://localhost:9000/synthesize"
remote_timeout_secs = 5.0
cache_capacity = 16
max_retries = 0

[sessions]
history_capacity = 10

[[rules]]
id = "budget"
priority = 10

[rules.conditions]
keywords = ["budget"]

[rules.actions]
target = "cfo"
"#,
        )
        .unwrap();

        assert_eq!(config.tier, Tier::Tier2);
        assert_eq!(
            config.synthesis.remote_url.as_deref(),
            Some("http://localhost:9000/synthesize")
        );
        assert_eq!(config.synthesis.remote_timeout, Duration::from_secs(5));
        assert_eq!(config.synthesis.cache_capacity, 16);
        assert_eq!(config.synthesis.retry.max_retries, 0);
        assert_eq!(config.sessions.history_capacity, 10);
        assert_eq!(config.sessions.per_caller_history, 20);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].actions.target, "cfo");
    }

    #[test]
    fn unknown_tier_is_rejected() {
        let err = Config::from_toml_str("tier = \"diamond\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn tier_keys_are_snake_case() {
        let config = Config::from_toml_str(
            r#"
rules = []

[[tiers]]
tier = "tier1"
max_personas = 2
allowed_persona_ids = ["sovren-ai", "cfo"]
features = ["voice_calls"]
"#,
        )
        .unwrap();

        assert_eq!(config.tiers.len(), 1);
        assert_eq!(config.tiers[0].max_personas, 2);
        let allowed = config.tier_gate().unwrap().resolve(Tier::Tier1, &config.personas).unwrap();
        assert_eq!(allowed.len(), 2);
    }

    #[test]
    fn unusable_remote_timeouts_are_rejected() {
        for value in ["-1.0", "0.0", "nan", "inf"] {
            let toml = format!("[synthesis]\nremote_timeout_secs = {value}\n");
            let err = Config::from_toml_str(&toml).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{value}: {err:?}");
        }
    }

    #[test]
    fn rule_with_unknown_target_is_rejected() {
        let err = Config::from_toml_str(
            r#"
[[rules]]
id = "ghost"
priority = 1

[rules.actions]
target = "cxo"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn bounded_fallback_is_rejected() {
        let mut config = Config::default();
        config.personas[0].max_concurrent_calls = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_explicit_file_is_error() {
        let result = Config::load(Some(Path::new("/nonexistent/sovren/config.toml")));
        assert!(result.is_err());
    }
}
