//! SOVREN Voice - executive call routing and speech synthesis
//!
//! This library provides the voice core of SOVREN AI:
//! - Call routing to executive personas (rules, load balancing, fallback)
//! - Subscription-tier gating of personas, voices and features
//! - A prioritized, cached speech synthesis queue with backend fallback
//! - Call session tracking and lifecycle orchestration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Collaborators                      │
//! │        Signaling (SIP, ...)   │   Audio I/O          │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Voice System Manager                   │
//! │   Router  │  Tier Gate  │  Sessions  │  Events      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                Synthesis Queue                       │
//! │   Cache  │  Remote TTS  │  Local TTS  │  Degraded   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod persona;
pub mod router;
pub mod session;
pub mod signaling;
pub mod synthesis;
pub mod tier;

pub use audio::{AudioFrame, AudioIo, HeadlessAudio, StreamHandle};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{CallEvent, EventBus, SynthesisEvent, SystemEvent};
pub use manager::{ManagerParts, ManagerState, PersonaCommand, SystemStatus, VoiceSystemManager};
pub use persona::{Availability, PersonaId, PersonaProfile};
pub use router::{CallHints, CallRouter, RoutingDecision, RoutingRule, RoutingStrategy};
pub use session::{CallSession, CallStatus, Direction, SessionStore, TranscriptEntry};
pub use signaling::{LoopbackSignaling, SignalingClient, SignalingEvent};
pub use synthesis::{Priority, SynthesisOptions, SynthesisQueue, SynthesisResult};
pub use tier::{Tier, TierGate};
