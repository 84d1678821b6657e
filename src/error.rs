//! Error types for the SOVREN voice core

use thiserror::Error;

use crate::synthesis::BackendStage;

/// Result type alias for voice core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice core
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing tier, persona catalog or rule configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed routing input (rejected per call)
    #[error("routing error: {0}")]
    Routing(String),

    /// Persona is at its concurrent call limit
    #[error("persona {persona} at capacity ({max} concurrent calls)")]
    CapacityExceeded {
        /// Persona that rejected the call
        persona: String,
        /// Configured limit
        max: u32,
    },

    /// A stage of the synthesis fallback chain failed
    #[error("synthesis backend error ({stage}): {message}")]
    SynthesisBackend {
        /// Stage that failed
        stage: BackendStage,
        /// Failure description
        message: String,
    },

    /// Synthesis request rejected before queueing
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Voice model unknown to the synthesis queue
    #[error("voice not found: {0}")]
    VoiceNotFound(String),

    /// Persona not found in the catalog
    #[error("persona not found: {0}")]
    PersonaNotFound(String),

    /// Call session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Call session status transition not allowed
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Signaling transport error
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Audio collaborator error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid caller pattern
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    /// Build a backend error for the given stage
    #[must_use]
    pub fn backend(stage: BackendStage, message: impl Into<String>) -> Self {
        Self::SynthesisBackend {
            stage,
            message: message.into(),
        }
    }
}
