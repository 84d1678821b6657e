//! Voice system manager
//!
//! Owns the lifecycle of the voice core and ties its parts together:
//! signaling events are routed to personas, calls become sessions, and
//! personas speak through the synthesis queue into the session's audio
//! stream.
//!
//! ```text
//! uninitialized -> initializing -> ready <-> active
//!                        |           \       /
//!                        v            degraded
//!                      error
//! (any) -> shutdown
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::audio::AudioIo;
use crate::config::Config;
use crate::events::{CallEvent, EventBus, SystemEvent};
use crate::persona::PersonaId;
use crate::router::{CallHints, CallRouter, RuleActions};
use crate::session::{
    CallSession, CallStatus, Direction, NewSession, SessionStore, TranscriptEntry,
};
use crate::signaling::{CallOptions, SignalingClient, SignalingEvent};
use crate::synthesis::{Backends, Priority, SynthesisOptions, SynthesisQueue, SynthesisResult};
use crate::tier::Tier;
use crate::{Error, Result};

/// Tier feature that allows rules to record calls
pub const FEATURE_CALL_RECORDING: &str = "call_recording";

/// Tier feature that allows rules to transcribe calls
pub const FEATURE_TRANSCRIPTION: &str = "transcription";

/// Lifecycle state of the voice system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Ready,
    /// At least one call in progress
    Active,
    /// Running with a collaborator down
    Degraded,
    Error,
    Shutdown,
}

impl ManagerState {
    /// Whether calls can be handled in this state
    #[must_use]
    pub const fn is_operational(self) -> bool {
        matches!(self, Self::Ready | Self::Active | Self::Degraded)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Snapshot of the whole voice system
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub state: ManagerState,
    pub tier: Tier,
    pub signaling_connected: bool,
    pub audio_active: bool,
    pub synthesis_ready: bool,
    pub active_calls: usize,
    pub available_personas: usize,
    /// Load over bounded personas, 0-100
    pub load_percent: f64,
}

/// Closed set of actions an operator or persona can take on a call
#[derive(Debug, Clone, PartialEq)]
pub enum PersonaCommand {
    Answer,
    Hold,
    Resume,
    Transfer { target: String },
    Speak { text: String, priority: Priority },
    Hangup,
}

/// Everything the manager is assembled from
pub struct ManagerParts {
    pub tier: Tier,
    pub router: Arc<CallRouter>,
    pub sessions: Arc<SessionStore>,
    pub synthesis: Option<SynthesisQueue>,
    pub audio: Arc<dyn AudioIo>,
    pub signaling: Arc<dyn SignalingClient>,
    pub events: EventBus,
    /// Answer routed inbound calls without operator action
    pub auto_answer: bool,
    pub recording_allowed: bool,
    pub transcription_allowed: bool,
    /// Voices loaded during initialization
    pub preload_voices: Vec<String>,
}

/// Orchestrates routing, sessions, synthesis, audio and signaling
pub struct VoiceSystemManager {
    state: Mutex<ManagerState>,
    tier: Tier,
    router: Arc<CallRouter>,
    sessions: Arc<SessionStore>,
    synthesis: Option<SynthesisQueue>,
    audio: Arc<dyn AudioIo>,
    signaling: Arc<dyn SignalingClient>,
    events: EventBus,
    auto_answer: bool,
    recording_allowed: bool,
    transcription_allowed: bool,
    preload_voices: Vec<String>,
}

impl fmt::Debug for VoiceSystemManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceSystemManager")
            .field("state", &self.state())
            .field("tier", &self.tier)
            .field("synthesis", &self.synthesis.is_some())
            .finish_non_exhaustive()
    }
}

impl VoiceSystemManager {
    #[must_use]
    pub fn new(parts: ManagerParts) -> Self {
        Self {
            state: Mutex::new(ManagerState::Uninitialized),
            tier: parts.tier,
            router: parts.router,
            sessions: parts.sessions,
            synthesis: parts.synthesis,
            audio: parts.audio,
            signaling: parts.signaling,
            events: parts.events,
            auto_answer: parts.auto_answer,
            recording_allowed: parts.recording_allowed,
            transcription_allowed: parts.transcription_allowed,
            preload_voices: parts.preload_voices,
        }
    }

    /// Assemble a manager from configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid
    pub fn from_config(
        config: &Config,
        audio: Arc<dyn AudioIo>,
        signaling: Arc<dyn SignalingClient>,
        backends: Backends,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.manager.event_capacity);
        let sessions = Arc::new(SessionStore::new(&config.sessions));
        let router = Arc::new(CallRouter::from_config(
            config,
            Arc::clone(&sessions),
            events.clone(),
        )?);

        let gate = config.tier_gate()?;
        let voices = gate.allowed_voice_profiles(config.tier, &config.personas)?;
        let synthesis = config.synthesis.enabled.then(|| {
            SynthesisQueue::new(&config.synthesis, voices.clone(), backends, events.clone())
        });

        Ok(Self::new(ManagerParts {
            tier: config.tier,
            router,
            sessions,
            synthesis,
            audio,
            signaling,
            events,
            auto_answer: config.manager.auto_answer,
            recording_allowed: gate.has_feature(config.tier, FEATURE_CALL_RECORDING),
            transcription_allowed: gate.has_feature(config.tier, FEATURE_TRANSCRIPTION),
            preload_voices: voices,
        }))
    }

    #[must_use]
    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, to: ManagerState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let from = *state;
            *state = to;
            from
        };
        if from != to {
            tracing::info!(from = %from, to = %to, "voice system state changed");
            self.events.emit_system(SystemEvent::StateChanged { from, to });
        }
    }

    fn ensure_operational(&self) -> Result<()> {
        let state = self.state();
        if state.is_operational() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "voice system is {state}, not accepting calls"
            )))
        }
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn router(&self) -> &CallRouter {
        &self.router
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[must_use]
    pub const fn synthesis(&self) -> Option<&SynthesisQueue> {
        self.synthesis.as_ref()
    }

    /// Bring up audio, synthesis and signaling, in that order
    ///
    /// The first failing stage puts the system in `error` and aborts the
    /// remaining stages.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` unless the system is uninitialized (or
    /// in error, for a retry), otherwise the failing stage's error
    pub async fn initialize(&self) -> Result<()> {
        {
            let state = self.state();
            if !matches!(state, ManagerState::Uninitialized | ManagerState::Error) {
                return Err(Error::InvalidState(format!(
                    "cannot initialize from {state}"
                )));
            }
        }
        self.set_state(ManagerState::Initializing);

        if let Err(e) = self.audio.start().await {
            return Err(self.stage_failed("audio", e));
        }

        if let Some(queue) = &self.synthesis {
            let failures = queue.start(&self.preload_voices).await;
            if failures > 0 {
                tracing::warn!(failures, "some voices failed to preload");
            }
        } else {
            tracing::info!("speech synthesis disabled");
        }

        if let Err(e) = self.signaling.connect().await {
            return Err(self.stage_failed("signaling", e));
        }

        self.set_state(ManagerState::Ready);
        self.refresh_state();
        Ok(())
    }

    fn stage_failed(&self, stage: &str, error: Error) -> Error {
        tracing::error!(stage, error = %error, "voice system stage failed");
        self.events.emit_system(SystemEvent::StageFailed {
            stage: stage.to_string(),
            error: error.to_string(),
        });
        self.set_state(ManagerState::Error);
        error
    }

    /// Recompute ready/active/degraded from collaborator health
    pub fn refresh_state(&self) {
        if !self.state().is_operational() {
            return;
        }

        let synthesis_down = self.synthesis.as_ref().is_some_and(|q| !q.is_ready());
        let next = if !self.signaling.is_connected() || !self.audio.is_active() || synthesis_down
        {
            ManagerState::Degraded
        } else if self.sessions.active_count() > 0 {
            ManagerState::Active
        } else {
            ManagerState::Ready
        };
        self.set_state(next);
    }

    /// Current system status
    #[must_use]
    pub fn status(&self) -> SystemStatus {
        let capacity = self.router.total_capacity();
        #[allow(clippy::cast_precision_loss)]
        let load_percent = if capacity == 0 {
            0.0
        } else {
            self.router.bounded_load() as f64 / capacity as f64 * 100.0
        };

        SystemStatus {
            state: self.state(),
            tier: self.tier,
            signaling_connected: self.signaling.is_connected(),
            audio_active: self.audio.is_active(),
            synthesis_ready: self.synthesis.as_ref().is_some_and(SynthesisQueue::is_ready),
            active_calls: self.sessions.active_count(),
            available_personas: self.router.available_count(),
            load_percent,
        }
    }

    /// Consume signaling events until the channel closes or the system
    /// shuts down
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SignalingEvent>) {
        while let Some(event) = events.recv().await {
            if self.state() == ManagerState::Shutdown {
                break;
            }
            if let Err(e) = self.handle_signaling_event(event).await {
                tracing::warn!(error = %e, "signaling event not handled");
            }
        }
        tracing::debug!("signaling event loop stopped");
    }

    /// React to one event from the signaling transport
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be applied; the error concerns
    /// that call only
    pub async fn handle_signaling_event(&self, event: SignalingEvent) -> Result<()> {
        match event {
            SignalingEvent::Invite {
                session_id,
                caller_id,
                hints,
            } => self.accept_invite(session_id, caller_id, hints).await,
            SignalingEvent::Connected { session_id } => self.activate(&session_id).await,
            SignalingEvent::Bye { session_id } => {
                self.finish_session(&session_id, CallStatus::Ended)
                    .await
                    .map(|_| ())
            }
            SignalingEvent::AudioReceived { session_id, frame } => {
                let session = self.active_session(&session_id)?;
                let stream = session.audio_stream.ok_or_else(|| {
                    Error::Audio(format!("session {session_id} has no audio stream"))
                })?;
                self.audio.push_frame(&stream, frame).await
            }
        }
    }

    async fn accept_invite(
        &self,
        session_id: String,
        caller_id: String,
        hints: CallHints,
    ) -> Result<()> {
        self.ensure_operational()?;

        let decision = self.router.route(&caller_id, hints)?;
        let actions = decision
            .actions
            .unwrap_or_else(|| RuleActions::target(decision.persona_id.clone()));

        let session = match self.sessions.start(NewSession {
            id: Some(session_id),
            direction: Direction::Inbound,
            remote_id: caller_id.clone(),
            persona_id: decision.persona_id.clone(),
            recording: actions.record_call && self.recording_allowed,
            transcribing: actions.transcribe_call && self.transcription_allowed,
        }) {
            Ok(session) => session,
            Err(e) => {
                self.release_quietly(&decision.persona_id);
                return Err(e);
            }
        };

        tracing::info!(
            session_id = %session.id,
            caller = %caller_id,
            persona = %session.persona_id,
            recording = session.recording,
            transcribing = session.transcribing,
            "inbound call assigned"
        );
        self.events.emit_call(CallEvent::ExecutiveAssigned {
            session_id: session.id.clone(),
            caller_id,
            persona_id: session.persona_id.clone(),
            direction: Direction::Inbound,
        });
        self.refresh_state();

        if actions.require_approval {
            tracing::info!(session_id = %session.id, notify = ?actions.notify, "call awaiting approval");
            self.events.emit_call(CallEvent::ApprovalRequired {
                session_id: session.id,
                persona_id: session.persona_id,
                notify: actions.notify,
            });
            return Ok(());
        }

        if !actions.notify.is_empty() {
            tracing::info!(session_id = %session.id, notify = ?actions.notify, "notifying parties");
        }

        if self.auto_answer {
            self.execute(&session.id, PersonaCommand::Answer).await?;
        }
        Ok(())
    }

    /// Place an outbound call on behalf of a persona
    ///
    /// With `persona = None` the persona is routed like an inbound call
    /// using the target as caller id.
    ///
    /// # Errors
    ///
    /// Returns error if the persona cannot take the call or the transport
    /// fails
    pub async fn place_call(
        &self,
        target_uri: &str,
        persona: Option<PersonaId>,
        hints: CallHints,
    ) -> Result<CallSession> {
        self.ensure_operational()?;

        let persona_id = match persona {
            Some(id) => {
                self.router.acquire(&id)?;
                id
            }
            None => self.router.route(target_uri, hints)?.persona_id,
        };

        let options = CallOptions {
            caller_id: self
                .router
                .persona(&persona_id)
                .map(|p| format!("{} ({})", p.display_name, p.display_role)),
            ..CallOptions::default()
        };
        let session_id = match self.signaling.make_call(target_uri, &options).await {
            Ok(id) => id,
            Err(e) => {
                self.release_quietly(&persona_id);
                return Err(e);
            }
        };

        let session = match self.sessions.start(NewSession {
            id: Some(session_id),
            direction: Direction::Outbound,
            remote_id: target_uri.to_string(),
            persona_id: persona_id.clone(),
            recording: false,
            transcribing: self.transcription_allowed,
        }) {
            Ok(session) => session,
            Err(e) => {
                self.release_quietly(&persona_id);
                return Err(e);
            }
        };

        tracing::info!(session_id = %session.id, target = %target_uri, persona = %persona_id, "outbound call placed");
        self.events.emit_call(CallEvent::ExecutiveAssigned {
            session_id: session.id.clone(),
            caller_id: target_uri.to_string(),
            persona_id,
            direction: Direction::Outbound,
        });
        self.refresh_state();
        Ok(session)
    }

    /// Apply a command to a call
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for unknown sessions,
    /// `Error::InvalidTransition` if the call is in the wrong status, or the
    /// transport/synthesis error
    pub async fn execute(&self, session_id: &str, command: PersonaCommand) -> Result<()> {
        let session = self.active_session(session_id)?;
        tracing::debug!(session_id, command = ?command, "executing persona command");

        match command {
            PersonaCommand::Answer => {
                require_transition(&session, CallStatus::Active)?;
                if let Err(e) = self.signaling.answer(session_id).await {
                    self.finish_session(session_id, CallStatus::Failed).await?;
                    return Err(e);
                }
                self.activate(session_id).await
            }
            PersonaCommand::Hold => {
                require_transition(&session, CallStatus::OnHold)?;
                self.signaling.hold(session_id).await?;
                self.set_status(session_id, CallStatus::OnHold)
            }
            PersonaCommand::Resume => {
                require_transition(&session, CallStatus::Active)?;
                self.signaling.resume(session_id).await?;
                self.set_status(session_id, CallStatus::Active)
            }
            PersonaCommand::Transfer { target } => {
                require_transition(&session, CallStatus::Ended)?;
                self.signaling.transfer(session_id, &target).await?;
                tracing::info!(session_id, target = %target, "call transferred");
                self.finish_session(session_id, CallStatus::Ended)
                    .await
                    .map(|_| ())
            }
            PersonaCommand::Speak { text, priority } => {
                self.speak(session_id, &text, priority).await.map(|_| ())
            }
            PersonaCommand::Hangup => {
                if let Err(e) = self.signaling.hangup(session_id).await {
                    tracing::warn!(session_id, error = %e, "hangup failed, ending session anyway");
                }
                self.finish_session(session_id, CallStatus::Ended)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Synthesize text in the session persona's voice and play it
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if synthesis is disabled or the call is
    /// not active, `Error::Audio` if the session has no stream, or the
    /// synthesis error
    pub async fn speak(
        &self,
        session_id: &str,
        text: &str,
        priority: Priority,
    ) -> Result<SynthesisResult> {
        let queue = self
            .synthesis
            .as_ref()
            .ok_or_else(|| Error::InvalidState("speech synthesis is disabled".to_string()))?;

        let session = self.active_session(session_id)?;
        if session.status != CallStatus::Active {
            return Err(Error::InvalidState(format!(
                "session {session_id} is {}",
                session.status
            )));
        }
        let stream = session
            .audio_stream
            .clone()
            .ok_or_else(|| Error::Audio(format!("session {session_id} has no audio stream")))?;
        let persona = self
            .router
            .persona(&session.persona_id)
            .ok_or_else(|| Error::PersonaNotFound(session.persona_id.to_string()))?;

        let result = queue
            .synthesize(
                text,
                &persona.voice_model_id,
                priority,
                SynthesisOptions::default(),
            )
            .await?;
        self.audio.play(&stream, &result).await?;

        if session.transcribing {
            self.sessions.append_transcript(
                session_id,
                TranscriptEntry::new(persona.id.as_str(), text, 1.0),
            )?;
        }
        Ok(result)
    }

    /// Record an utterance in a call transcript
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if the call is not active, or
    /// `Error::InvalidState` if the call is not being transcribed
    pub fn append_transcript(&self, session_id: &str, entry: TranscriptEntry) -> Result<()> {
        let session = self.active_session(session_id)?;
        if !session.transcribing {
            return Err(Error::InvalidState(format!(
                "session {session_id} is not being transcribed"
            )));
        }
        self.sessions.append_transcript(session_id, entry)
    }

    /// Stop everything in reverse order of initialization
    ///
    /// Every step runs even if an earlier one failed; the failures are
    /// returned.
    pub async fn shutdown(&self) -> Vec<Error> {
        if self.state() == ManagerState::Shutdown {
            return Vec::new();
        }
        let mut errors = Vec::new();

        for session in self.sessions.active() {
            if self.signaling.is_connected()
                && let Err(e) = self.signaling.hangup(&session.id).await
            {
                errors.push(e);
            }
            if let Err(e) = self.finish_session(&session.id, CallStatus::Ended).await {
                errors.push(e);
            }
        }

        if let Err(e) = self.signaling.disconnect().await {
            errors.push(self.stage_error("signaling", e));
        }
        if let Some(queue) = &self.synthesis {
            queue.shutdown();
        }
        if let Err(e) = self.audio.stop().await {
            errors.push(self.stage_error("audio", e));
        }

        self.set_state(ManagerState::Shutdown);
        tracing::info!(errors = errors.len(), "voice system shut down");
        errors
    }

    fn stage_error(&self, stage: &str, error: Error) -> Error {
        tracing::warn!(stage, error = %error, "shutdown stage failed");
        self.events.emit_system(SystemEvent::StageFailed {
            stage: stage.to_string(),
            error: error.to_string(),
        });
        error
    }

    fn active_session(&self, session_id: &str) -> Result<CallSession> {
        self.sessions
            .get(session_id)
            .filter(|s| !s.status.is_terminal())
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Move a session to `Active` and give it an audio stream
    async fn activate(&self, session_id: &str) -> Result<()> {
        let session = self.active_session(session_id)?;
        if session.status == CallStatus::Connecting {
            self.set_status(session_id, CallStatus::Active)?;
        }

        if session.audio_stream.is_none() {
            match self.audio.attach_stream(session_id).await {
                Ok(stream) => self.sessions.set_stream(session_id, Some(stream))?,
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "no audio stream for call");
                }
            }
        }
        Ok(())
    }

    fn set_status(&self, session_id: &str, status: CallStatus) -> Result<()> {
        self.sessions.transition(session_id, status)?;
        self.events.emit_call(CallEvent::SessionStatusChanged {
            session_id: session_id.to_string(),
            status,
        });
        Ok(())
    }

    /// End a session: detach audio, close it, give back persona capacity
    async fn finish_session(&self, session_id: &str, status: CallStatus) -> Result<CallSession> {
        let session = self.active_session(session_id)?;

        if let Some(stream) = &session.audio_stream
            && let Err(e) = self.audio.detach_stream(stream).await
        {
            tracing::warn!(session_id, error = %e, "failed to detach audio stream");
        }

        let ended = self.sessions.transition(session_id, status)?;
        self.release_quietly(&ended.persona_id);

        tracing::info!(
            session_id,
            persona = %ended.persona_id,
            status = %ended.status,
            duration_secs = ended.duration().num_seconds(),
            "call ended"
        );
        self.events.emit_call(CallEvent::SessionEnded {
            session_id: ended.id.clone(),
            persona_id: ended.persona_id.clone(),
            status: ended.status,
        });
        self.refresh_state();
        Ok(ended)
    }

    fn release_quietly(&self, persona_id: &PersonaId) {
        if let Err(e) = self.router.release(persona_id) {
            tracing::warn!(persona = %persona_id, error = %e, "failed to release persona");
        }
    }
}

fn require_transition(session: &CallSession, next: CallStatus) -> Result<()> {
    if session.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: session.status.to_string(),
            to: next.to_string(),
        })
    }
}
