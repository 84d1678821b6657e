//! Audio I/O collaborator
//!
//! The voice core never touches devices or media transports directly. It
//! attaches one stream per call session and plays synthesized audio into it
//! through [`AudioIo`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use crate::synthesis::SynthesisResult;
use crate::{Error, Result};

/// Handle to a per-session audio stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamHandle {
    pub id: String,
    pub session_id: String,
    pub sample_rate: u32,
}

impl StreamHandle {
    #[must_use]
    pub fn new(session_id: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            sample_rate,
        }
    }
}

/// A chunk of received audio
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// 16-bit mono samples
    pub samples: Arc<[i16]>,
    pub sample_rate: u32,
    /// Offset from the start of the call
    pub timestamp_ms: u64,
}

/// Audio device/transport abstraction
#[async_trait]
pub trait AudioIo: Send + Sync {
    /// Open the audio subsystem
    async fn start(&self) -> Result<()>;

    /// Close the audio subsystem and every stream
    async fn stop(&self) -> Result<()>;

    /// Whether `start` succeeded and `stop` has not been called
    fn is_active(&self) -> bool;

    /// Open a stream for a call session
    async fn attach_stream(&self, session_id: &str) -> Result<StreamHandle>;

    /// Close a stream
    async fn detach_stream(&self, stream: &StreamHandle) -> Result<()>;

    /// Play synthesized audio into a stream
    async fn play(&self, stream: &StreamHandle, audio: &SynthesisResult) -> Result<()>;

    /// Deliver received audio from the transport
    async fn push_frame(&self, stream: &StreamHandle, frame: AudioFrame) -> Result<()>;
}

/// Per-stream counters kept by [`HeadlessAudio`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub clips_played: u64,
    pub played_ms: u64,
    pub frames_received: u64,
    pub samples_received: u64,
}

/// Device-less audio: streams are bookkeeping only
///
/// Used when the voice core runs without a media transport (CLI, tests).
#[derive(Debug)]
pub struct HeadlessAudio {
    sample_rate: u32,
    active: AtomicBool,
    streams: Mutex<HashMap<String, StreamStats>>,
}

impl HeadlessAudio {
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            active: AtomicBool::new(false),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Counters of an attached stream
    #[must_use]
    pub fn stream_stats(&self, stream_id: &str) -> Option<StreamStats> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream_id)
            .cloned()
    }

    /// Number of attached streams
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn with_stream<T>(
        &self,
        stream: &StreamHandle,
        f: impl FnOnce(&mut StreamStats) -> T,
    ) -> Result<T> {
        if !self.is_active() {
            return Err(Error::Audio("audio is not started".to_string()));
        }
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let stats = streams
            .get_mut(&stream.id)
            .ok_or_else(|| Error::Audio(format!("stream {} is not attached", stream.id)))?;
        Ok(f(stats))
    }
}

impl Default for HeadlessAudio {
    fn default() -> Self {
        Self::new(22_050)
    }
}

#[async_trait]
impl AudioIo for HeadlessAudio {
    async fn start(&self) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        tracing::debug!(sample_rate = self.sample_rate, "headless audio started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn attach_stream(&self, session_id: &str) -> Result<StreamHandle> {
        if !self.is_active() {
            return Err(Error::Audio("audio is not started".to_string()));
        }
        let handle = StreamHandle::new(session_id, self.sample_rate);
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.id.clone(), StreamStats::default());
        Ok(handle)
    }

    async fn detach_stream(&self, stream: &StreamHandle) -> Result<()> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream.id)
            .map(|_| ())
            .ok_or_else(|| Error::Audio(format!("stream {} is not attached", stream.id)))
    }

    async fn play(&self, stream: &StreamHandle, audio: &SynthesisResult) -> Result<()> {
        self.with_stream(stream, |stats| {
            stats.clips_played += 1;
            stats.played_ms += audio.duration_ms;
        })
    }

    async fn push_frame(&self, stream: &StreamHandle, frame: AudioFrame) -> Result<()> {
        self.with_stream(stream, |stats| {
            stats.frames_received += 1;
            stats.samples_received += frame.samples.len() as u64;
        })
    }
}
