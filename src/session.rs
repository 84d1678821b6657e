//! Call sessions and caller interaction history
//!
//! [`SessionStore`] owns every active call session, a bounded log of ended
//! sessions, and a per-caller interaction count that routing rules consult
//! through `min_prior_interactions`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::audio::StreamHandle;
use crate::config::SessionConfig;
use crate::persona::PersonaId;
use crate::{Error, Result};

/// Which side placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Call session status
///
/// ```text
/// Connecting -> Active | Failed | Ended
/// Active <-> OnHold
/// Active | OnHold -> Ended | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Connecting,
    Active,
    OnHold,
    Ended,
    Failed,
}

impl CallStatus {
    /// Whether the session is over
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Active | Self::Failed | Self::Ended)
                | (Self::Active, Self::OnHold | Self::Ended | Self::Failed)
                | (Self::OnHold, Self::Active | Self::Ended | Self::Failed)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::OnHold => "on_hold",
            Self::Ended => "ended",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One utterance in a call transcript
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    /// Persona id or remote party
    pub speaker: String,
    pub text: String,
    /// Recognition confidence in `[0, 1]`
    pub confidence: f32,
}

impl TranscriptEntry {
    /// Create an entry stamped now
    #[must_use]
    pub fn new(speaker: impl Into<String>, text: impl Into<String>, confidence: f32) -> Self {
        Self {
            timestamp: Utc::now(),
            speaker: speaker.into(),
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// A call between a remote party and a persona
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub id: String,
    pub direction: Direction,
    /// Caller id (inbound) or dialed number (outbound)
    pub remote_id: String,
    pub persona_id: PersonaId,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub transcript: Vec<TranscriptEntry>,
    pub audio_stream: Option<StreamHandle>,
    pub recording: bool,
    pub transcribing: bool,
}

impl CallSession {
    /// Call duration so far (or total, once ended)
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// Parameters for a new session
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Transport-assigned id; generated when absent
    pub id: Option<String>,
    pub direction: Direction,
    pub remote_id: String,
    pub persona_id: PersonaId,
    pub recording: bool,
    pub transcribing: bool,
}

/// A routed contact with a persona
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interaction {
    pub at: DateTime<Utc>,
    pub persona_id: PersonaId,
}

#[derive(Debug, Default)]
struct CallerHistory {
    total: u32,
    recent: VecDeque<Interaction>,
}

#[derive(Debug, Default)]
struct StoreState {
    active: HashMap<String, CallSession>,
    ended: VecDeque<CallSession>,
    /// Insertion order doubles as least-recently-seen order
    callers: IndexMap<String, CallerHistory>,
}

/// Active sessions, ended-session log and per-caller history
#[derive(Debug)]
pub struct SessionStore {
    state: Mutex<StoreState>,
    history_capacity: usize,
    per_caller_history: usize,
    max_tracked_callers: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

impl SessionStore {
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            history_capacity: config.history_capacity,
            per_caller_history: config.per_caller_history,
            max_tracked_callers: config.max_tracked_callers.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a session in `Connecting`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if a session with the same id is
    /// already active
    pub fn start(&self, new: NewSession) -> Result<CallSession> {
        let session = CallSession {
            id: new
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            direction: new.direction,
            remote_id: new.remote_id,
            persona_id: new.persona_id,
            status: CallStatus::Connecting,
            started_at: Utc::now(),
            ended_at: None,
            transcript: Vec::new(),
            audio_stream: None,
            recording: new.recording,
            transcribing: new.transcribing,
        };

        let mut state = self.lock();
        if state.active.contains_key(&session.id) {
            return Err(Error::InvalidState(format!(
                "session {} is already active",
                session.id
            )));
        }
        state.active.insert(session.id.clone(), session.clone());

        tracing::debug!(
            session_id = %session.id,
            persona = %session.persona_id,
            direction = ?session.direction,
            "session started"
        );
        Ok(session)
    }

    /// Move a session to a new status
    ///
    /// Terminal statuses stamp `ended_at` and move the session to history.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for unknown or already ended
    /// sessions, and `Error::InvalidTransition` for illegal moves
    pub fn transition(&self, id: &str, next: CallStatus) -> Result<CallSession> {
        let mut state = self.lock();
        let session = state
            .active
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        if !session.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: session.status.to_string(),
                to: next.to_string(),
            });
        }
        session.status = next;

        if !next.is_terminal() {
            return Ok(session.clone());
        }

        let mut session = state
            .active
            .remove(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.ended_at = Some(Utc::now());
        session.audio_stream = None;
        self.push_ended(&mut state, session.clone());
        Ok(session)
    }

    /// End a session normally
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if the session is not active
    pub fn end(&self, id: &str) -> Result<CallSession> {
        self.transition(id, CallStatus::Ended)
    }

    /// End every active session with the given terminal status
    pub fn end_all(&self, status: CallStatus) -> Vec<CallSession> {
        let status = if status.is_terminal() {
            status
        } else {
            CallStatus::Ended
        };

        let mut state = self.lock();
        let ids: Vec<String> = state.active.keys().cloned().collect();
        let mut ended = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut session) = state.active.remove(&id) {
                session.status = status;
                session.ended_at = Some(Utc::now());
                session.audio_stream = None;
                self.push_ended(&mut state, session.clone());
                ended.push(session);
            }
        }
        ended
    }

    fn push_ended(&self, state: &mut StoreState, session: CallSession) {
        if self.history_capacity == 0 {
            return;
        }
        if state.ended.len() >= self.history_capacity {
            state.ended.pop_front();
        }
        state.ended.push_back(session);
    }

    /// Append a transcript entry to an active session
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if the session is not active
    pub fn append_transcript(&self, id: &str, entry: TranscriptEntry) -> Result<()> {
        let mut state = self.lock();
        let session = state
            .active
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.transcript.push(entry);
        Ok(())
    }

    /// Attach or detach the audio stream of an active session
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if the session is not active
    pub fn set_stream(&self, id: &str, stream: Option<StreamHandle>) -> Result<()> {
        let mut state = self.lock();
        let session = state
            .active
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.audio_stream = stream;
        Ok(())
    }

    /// Look up a session, active or ended
    #[must_use]
    pub fn get(&self, id: &str) -> Option<CallSession> {
        let state = self.lock();
        state
            .active
            .get(id)
            .cloned()
            .or_else(|| state.ended.iter().rev().find(|s| s.id == id).cloned())
    }

    /// Snapshot of active sessions
    #[must_use]
    pub fn active(&self) -> Vec<CallSession> {
        self.lock().active.values().cloned().collect()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Ended sessions, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<CallSession> {
        self.lock().ended.iter().cloned().collect()
    }

    /// Number of earlier routed contacts from a caller
    #[must_use]
    pub fn prior_interactions(&self, caller_id: &str) -> u32 {
        self.lock().callers.get(caller_id).map_or(0, |h| h.total)
    }

    /// Record a routed contact from a caller
    pub fn record_interaction(&self, caller_id: &str, persona_id: &PersonaId) {
        let mut state = self.lock();

        let mut history = state.callers.shift_remove(caller_id).unwrap_or_default();
        history.total = history.total.saturating_add(1);
        if self.per_caller_history > 0 {
            if history.recent.len() >= self.per_caller_history {
                history.recent.pop_front();
            }
            history.recent.push_back(Interaction {
                at: Utc::now(),
                persona_id: persona_id.clone(),
            });
        }

        while state.callers.len() >= self.max_tracked_callers {
            if state.callers.shift_remove_index(0).is_none() {
                break;
            }
        }
        state.callers.insert(caller_id.to_string(), history);
    }

    /// Most recent contacts from a caller, oldest first
    #[must_use]
    pub fn recent_interactions(&self, caller_id: &str) -> Vec<Interaction> {
        self.lock()
            .callers
            .get(caller_id)
            .map(|h| h.recent.iter().cloned().collect())
            .unwrap_or_default()
    }
}
