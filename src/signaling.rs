//! Call signaling collaborator
//!
//! The transport (SIP or anything else) is hidden behind
//! [`SignalingClient`]. Inbound activity reaches the voice system manager as
//! [`SignalingEvent`]s on a channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::AudioFrame;
use crate::router::CallHints;
use crate::{Error, Result};

/// Default capacity of the signaling event channel
pub const SIGNALING_CHANNEL_CAPACITY: usize = 64;

/// Options for an outbound call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Caller id presented to the remote party
    pub caller_id: Option<String>,
    /// Extra transport headers
    pub headers: BTreeMap<String, String>,
}

/// Inbound activity from the transport
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// A remote party is calling
    Invite {
        session_id: String,
        caller_id: String,
        hints: CallHints,
    },
    /// Media is flowing for a session
    Connected { session_id: String },
    /// The remote party hung up
    Bye { session_id: String },
    /// Audio arrived for a session
    AudioReceived {
        session_id: String,
        frame: AudioFrame,
    },
}

/// Call control transport
#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Place a call; returns the transport session id
    async fn make_call(&self, target_uri: &str, options: &CallOptions) -> Result<String>;

    async fn answer(&self, session_id: &str) -> Result<()>;

    async fn hangup(&self, session_id: &str) -> Result<()>;

    async fn hold(&self, session_id: &str) -> Result<()>;

    async fn resume(&self, session_id: &str) -> Result<()>;

    async fn transfer(&self, session_id: &str, target_uri: &str) -> Result<()>;
}

/// Operation performed on a [`LoopbackSignaling`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingOp {
    MakeCall { session_id: String, target: String },
    Answer(String),
    Hangup(String),
    Hold(String),
    Resume(String),
    Transfer { session_id: String, target: String },
}

/// In-process transport
///
/// Outbound calls report `Connected` immediately; inbound calls are injected with
/// [`inject`](Self::inject). Every operation is recorded.
#[derive(Debug)]
pub struct LoopbackSignaling {
    connected: AtomicBool,
    events: mpsc::Sender<SignalingEvent>,
    calls: Mutex<HashMap<String, String>>,
    ops: Mutex<Vec<SignalingOp>>,
}

impl LoopbackSignaling {
    /// Create the transport and the receiver the manager consumes
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<SignalingEvent>) {
        let (tx, rx) = mpsc::channel(SIGNALING_CHANNEL_CAPACITY);
        (
            Self {
                connected: AtomicBool::new(false),
                events: tx,
                calls: Mutex::new(HashMap::new()),
                ops: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    /// Deliver an event as if it came from the network
    ///
    /// # Errors
    ///
    /// Returns `Error::Signaling` if the receiver is gone
    pub async fn inject(&self, event: SignalingEvent) -> Result<()> {
        if let SignalingEvent::Invite {
            session_id,
            caller_id,
            ..
        } = &event
        {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(session_id.clone(), caller_id.clone());
        }
        self.events
            .send(event)
            .await
            .map_err(|_| Error::Signaling("event receiver dropped".to_string()))
    }

    /// Operations performed so far
    #[must_use]
    pub fn operations(&self) -> Vec<SignalingOp> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, op: SignalingOp) {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::Signaling("not connected".to_string()))
        }
    }

    fn ensure_call(&self, session_id: &str) -> Result<()> {
        self.ensure_connected()?;
        if self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
        {
            Ok(())
        } else {
            Err(Error::Signaling(format!("no call {session_id}")))
        }
    }
}

#[async_trait]
impl SignalingClient for LoopbackSignaling {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!("loopback signaling connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn make_call(&self, target_uri: &str, _options: &CallOptions) -> Result<String> {
        self.ensure_connected()?;
        if target_uri.trim().is_empty() {
            return Err(Error::Signaling("target uri must not be empty".to_string()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.clone(), target_uri.to_string());
        self.record(SignalingOp::MakeCall {
            session_id: session_id.clone(),
            target: target_uri.to_string(),
        });
        // The far end picks up at once
        let _ = self.events.try_send(SignalingEvent::Connected {
            session_id: session_id.clone(),
        });
        Ok(session_id)
    }

    async fn answer(&self, session_id: &str) -> Result<()> {
        self.ensure_call(session_id)?;
        self.record(SignalingOp::Answer(session_id.to_string()));
        Ok(())
    }

    async fn hangup(&self, session_id: &str) -> Result<()> {
        self.ensure_call(session_id)?;
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        self.record(SignalingOp::Hangup(session_id.to_string()));
        Ok(())
    }

    async fn hold(&self, session_id: &str) -> Result<()> {
        self.ensure_call(session_id)?;
        self.record(SignalingOp::Hold(session_id.to_string()));
        Ok(())
    }

    async fn resume(&self, session_id: &str) -> Result<()> {
        self.ensure_call(session_id)?;
        self.record(SignalingOp::Resume(session_id.to_string()));
        Ok(())
    }

    async fn transfer(&self, session_id: &str, target_uri: &str) -> Result<()> {
        self.ensure_call(session_id)?;
        self.record(SignalingOp::Transfer {
            session_id: session_id.to_string(),
            target: target_uri.to_string(),
        });
        Ok(())
    }
}
