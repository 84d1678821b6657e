//! Synthesis request and result types

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::BackendStage;
use crate::{Error, Result};

/// Queue priority; higher is served first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" | "medium" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(Error::InvalidRequest(format!("unknown priority: {other}"))),
        }
    }
}

/// Optional prosody controls
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
}

/// Audio container of a synthesis result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Wav,
    Mp3,
    Pcm,
}

impl AudioFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Pcm => "pcm",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique id of one submitted request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic digest of `(voice, text, options)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    #[must_use]
    pub fn new(voice_id: &str, text: &str, options: &SynthesisOptions) -> Self {
        let options_json = serde_json::to_string(options).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(voice_id.as_bytes());
        hasher.update([0]);
        hasher.update(text.as_bytes());
        hasher.update([0]);
        hasher.update(options_json.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A unit of text-to-speech work
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub id: RequestId,
    pub text: String,
    pub voice_id: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub options: SynthesisOptions,
    pub cache_key: CacheKey,
}

impl SynthesisRequest {
    #[must_use]
    pub fn new(
        text: impl Into<String>,
        voice_id: impl Into<String>,
        priority: Priority,
        options: SynthesisOptions,
    ) -> Self {
        let text = text.into();
        let voice_id = voice_id.into();
        let cache_key = CacheKey::new(&voice_id, &text, &options);
        Self {
            id: RequestId::new(),
            text,
            voice_id,
            priority,
            timestamp: Utc::now(),
            options,
            cache_key,
        }
    }
}

/// Finished synthesis
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub request_id: RequestId,
    /// Shared so cache hits hand out the very same bytes
    pub audio: Arc<[u8]>,
    pub duration_ms: u64,
    pub format: AudioFormat,
    pub sample_rate: u32,
    /// Stage that produced the audio
    pub stage: BackendStage,
    /// Placeholder audio from the last-resort stage
    pub degraded: bool,
    /// Served from the cache without dispatch
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_high_first() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn cache_key_is_deterministic() {
        let opts = SynthesisOptions {
            speed: Some(1.2),
            ..SynthesisOptions::default()
        };
        let a = CacheKey::new("cfo_sarah_chen", "Hello", &opts);
        let b = CacheKey::new("cfo_sarah_chen", "Hello", &opts);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn cache_key_covers_every_component() {
        let base = CacheKey::new("v", "Hello", &SynthesisOptions::default());
        assert_ne!(base, CacheKey::new("w", "Hello", &SynthesisOptions::default()));
        assert_ne!(base, CacheKey::new("v", "Hello!", &SynthesisOptions::default()));
        assert_ne!(
            base,
            CacheKey::new(
                "v",
                "Hello",
                &SynthesisOptions {
                    emotion: Some("calm".to_string()),
                    ..SynthesisOptions::default()
                }
            )
        );
        // Separator keeps ("ab", "c") distinct from ("a", "bc")
        assert_ne!(
            CacheKey::new("ab", "c", &SynthesisOptions::default()),
            CacheKey::new("a", "bc", &SynthesisOptions::default())
        );
    }

    #[test]
    fn requests_get_unique_ids() {
        let a = SynthesisRequest::new("hi", "v", Priority::Normal, SynthesisOptions::default());
        let b = SynthesisRequest::new("hi", "v", Priority::Normal, SynthesisOptions::default());
        assert_ne!(a.id, b.id);
        assert_eq!(a.cache_key, b.cache_key);
    }
}
