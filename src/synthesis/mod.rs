//! Speech synthesis orchestration
//!
//! Requests enter a priority queue ([`SynthesisQueue`]), are deduplicated
//! through a result cache keyed on voice, text and options, and are served by
//! a fallback chain: remote inference service, then a local synthesizer, then
//! a degraded silent clip.

pub mod backend;
pub mod cache;
pub mod chain;
pub mod queue;
pub mod request;
pub mod voices;

use std::fmt;

use serde::Serialize;

pub use backend::{
    BackendAudio, BackendRequest, Backends, CommandSynthesizer, LocalSynthesizer, RemoteBackend,
    RetryPolicy, SynthesisBackend,
};
pub use cache::SynthesisCache;
pub use chain::FallbackChain;
pub use queue::{QueueStats, SynthesisQueue};
pub use request::{
    AudioFormat, CacheKey, Priority, RequestId, SynthesisOptions, SynthesisRequest,
    SynthesisResult,
};
pub use voices::VoiceRegistry;

/// Stage of the fallback chain that produced (or failed to produce) audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStage {
    Remote,
    Local,
    Degraded,
}

impl BackendStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for BackendStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
