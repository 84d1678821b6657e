//! Priority synthesis queue
//!
//! Requests are ordered by priority, FIFO within a priority. A single drain
//! task at a time pops the head and runs it through the fallback chain, so
//! requests for one voice at one priority complete in submission order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{Notify, oneshot};

use super::backend::{Backends, wav_duration_ms};
use super::cache::{CachedAudio, SynthesisCache};
use super::chain::FallbackChain;
use super::request::{
    AudioFormat, Priority, RequestId, SynthesisOptions, SynthesisRequest, SynthesisResult,
};
use super::voices::VoiceRegistry;
use super::BackendStage;
use crate::config::SynthesisConfig;
use crate::events::{EventBus, SynthesisEvent};
use crate::{Error, Result};

type Waiter = oneshot::Sender<Result<SynthesisResult>>;

struct Pending {
    request: SynthesisRequest,
    waiter: Option<Waiter>,
}

/// Queue and cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Requests that reached the fallback chain
    pub dispatches: u64,
    pub completed: u64,
    pub degraded: u64,
    pub failed: u64,
}

struct QueueInner {
    pending: Mutex<VecDeque<Pending>>,
    cache: Mutex<SynthesisCache>,
    chain: FallbackChain,
    voices: VoiceRegistry,
    events: EventBus,
    draining: AtomicBool,
    ready: AtomicBool,
    shut_down: AtomicBool,
    idle: Notify,
    dispatches: AtomicU64,
    completed: AtomicU64,
    degraded: AtomicU64,
    failed: AtomicU64,
}

/// Priority queue in front of the synthesis fallback chain
#[derive(Clone)]
pub struct SynthesisQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for SynthesisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisQueue")
            .field("chain", &self.inner.chain)
            .field("voices", &self.inner.voices)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SynthesisQueue {
    /// Create a queue for the given voices
    #[must_use]
    pub fn new<I, S>(
        config: &SynthesisConfig,
        voices: I,
        backends: Backends,
        events: EventBus,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chain = FallbackChain::new(config, backends);
        let voices = VoiceRegistry::new(voices, chain.local());

        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(VecDeque::new()),
                cache: Mutex::new(SynthesisCache::new(config.cache_capacity)),
                chain,
                voices,
                events,
                draining: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                idle: Notify::new(),
                dispatches: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                degraded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Mark the queue ready, preloading the given voices
    ///
    /// Returns the number of voices that failed to load; those are retried
    /// lazily on first use.
    pub async fn start<I, S>(&self, preload: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let failures = self.preload_voices(preload).await;
        if !self.inner.shut_down.load(Ordering::SeqCst) {
            self.inner.ready.store(true, Ordering::SeqCst);
        }
        tracing::info!(
            voices = self.inner.voices.known().len(),
            loaded = self.inner.voices.loaded().len(),
            "synthesis queue ready"
        );
        failures
    }

    /// Load voices ahead of use; returns how many failed
    pub async fn preload_voices<I, S>(&self, voices: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let voices: Vec<String> = voices.into_iter().map(|v| v.as_ref().to_string()).collect();
        let results =
            futures::future::join_all(voices.iter().map(|v| self.inner.voices.ensure_loaded(v)))
                .await;

        voices
            .iter()
            .zip(results)
            .filter(|(voice, result)| match result {
                Ok(()) => false,
                Err(e) => {
                    tracing::warn!(voice = %voice, error = %e, "voice preload failed");
                    true
                }
            })
            .count()
    }

    /// Whether the queue has been started and not shut down
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst) && !self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Voice registry of this queue
    #[must_use]
    pub fn voices(&self) -> &VoiceRegistry {
        &self.inner.voices
    }

    /// Submit a request
    ///
    /// A cache hit completes immediately (a `Completed` event is emitted
    /// before this returns). Otherwise the request is queued behind every
    /// request of higher or equal priority.
    ///
    /// # Errors
    ///
    /// Returns `Error::VoiceNotFound` for unknown voices,
    /// `Error::InvalidRequest` for blank text and `Error::InvalidState`
    /// after shutdown
    pub async fn enqueue(
        &self,
        text: &str,
        voice_id: &str,
        priority: Priority,
        options: SynthesisOptions,
    ) -> Result<RequestId> {
        self.submit(text, voice_id, priority, options, None).await
    }

    /// Submit a request and wait for its result
    ///
    /// # Errors
    ///
    /// Returns the submission error, or the synthesis error if every stage
    /// failed
    pub async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        priority: Priority,
        options: SynthesisOptions,
    ) -> Result<SynthesisResult> {
        let (tx, rx) = oneshot::channel();
        self.submit(text, voice_id, priority, options, Some(tx))
            .await?;
        rx.await
            .map_err(|_| Error::InvalidState("synthesis queue dropped the request".to_string()))?
    }

    async fn submit(
        &self,
        text: &str,
        voice_id: &str,
        priority: Priority,
        options: SynthesisOptions,
        waiter: Option<Waiter>,
    ) -> Result<RequestId> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("synthesis queue is shut down".to_string()));
        }
        if text.trim().is_empty() {
            return Err(Error::InvalidRequest("text must not be empty".to_string()));
        }

        self.inner.voices.check(voice_id)?;
        if let Err(e) = self.inner.voices.ensure_loaded(voice_id).await {
            // The remote stage does not need the local model
            tracing::warn!(voice = %voice_id, error = %e, "voice not loaded, continuing");
        }

        let request = SynthesisRequest::new(text, voice_id, priority, options);
        let id = request.id.clone();

        let hit = self.inner.cache_lock().get(&request.cache_key);
        if let Some(cached) = hit {
            tracing::debug!(request_id = %id, voice = %voice_id, "synthesis cache hit");
            self.inner
                .finish(&request, Ok(cached.to_result(id.clone())), waiter);
            return Ok(id);
        }

        let position = {
            let mut pending = self.inner.pending_lock();
            let position = pending
                .iter()
                .position(|p| p.request.priority < priority)
                .unwrap_or(pending.len());
            pending.insert(position, Pending { request, waiter });
            position
        };

        tracing::debug!(
            request_id = %id,
            voice = %voice_id,
            priority = ?priority,
            position,
            "synthesis request queued"
        );
        self.inner.events.emit_synthesis(SynthesisEvent::Queued {
            request_id: id.clone(),
            position,
        });

        QueueInner::kick(&self.inner);
        Ok(id)
    }

    /// Wait until the queue is empty and no drain task is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.inner.draining.load(Ordering::SeqCst) && self.inner.pending_lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting requests and fail everything still queued
    ///
    /// The request currently being synthesized, if any, still completes.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.ready.store(false, Ordering::SeqCst);

        let drained: Vec<Pending> = self.inner.pending_lock().drain(..).collect();
        let count = drained.len();
        for Pending { request, waiter } in drained {
            self.inner.finish(
                &request,
                Err(Error::InvalidState("synthesis queue shut down".to_string())),
                waiter,
            );
        }
        self.inner.idle.notify_waiters();

        tracing::info!(cancelled = count, "synthesis queue shut down");
    }

    /// Drop every cached result
    pub fn clear_cache(&self) {
        self.inner.cache_lock().clear();
        tracing::debug!("synthesis cache cleared");
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let (cache_entries, cache_hits, cache_misses) = {
            let cache = self.inner.cache_lock();
            (cache.len(), cache.hits(), cache.misses())
        };

        QueueStats {
            pending: self.inner.pending_lock().len(),
            cache_entries,
            cache_hits,
            cache_misses,
            dispatches: self.inner.dispatches.load(Ordering::SeqCst),
            completed: self.inner.completed.load(Ordering::SeqCst),
            degraded: self.inner.degraded.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
        }
    }
}

/// Releases the drain flag if the drain task unwinds, and restarts draining
/// for whatever is still queued
struct DrainGuard {
    inner: Arc<QueueInner>,
    armed: bool,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::error!("synthesis drain task aborted, restarting");
        self.inner.draining.store(false, Ordering::SeqCst);
        let restart = !self.inner.pending_lock().is_empty()
            && !self.inner.shut_down.load(Ordering::SeqCst)
            && tokio::runtime::Handle::try_current().is_ok();
        if restart {
            QueueInner::kick(&self.inner);
        } else {
            self.inner.idle.notify_waiters();
        }
    }
}

impl QueueInner {
    fn pending_lock(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_lock(&self) -> MutexGuard<'_, SynthesisCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a drain task unless one is already running
    fn kick(this: &Arc<Self>) {
        if this
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = Arc::clone(this);
            tokio::spawn(async move { inner.drain().await });
        }
    }

    async fn drain(self: Arc<Self>) {
        let mut guard = DrainGuard {
            inner: Arc::clone(&self),
            armed: true,
        };
        loop {
            let next = self.pending_lock().pop_front();
            if let Some(pending) = next {
                self.process(pending).await;
                continue;
            }

            self.draining.store(false, Ordering::SeqCst);
            // A request may have been queued after the pop but before the
            // flag was cleared; its kick saw `draining` set and did nothing
            let more = !self.pending_lock().is_empty();
            if !more
                || self
                    .draining
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                guard.armed = false;
                self.idle.notify_waiters();
                return;
            }
        }
    }

    async fn process(&self, pending: Pending) {
        let Pending { request, waiter } = pending;

        // An identical request may have been synthesized while this one waited
        let cached = self.cache_lock().peek(&request.cache_key);
        if let Some(cached) = cached {
            let result = cached.to_result(request.id.clone());
            self.finish(&request, Ok(result), waiter);
            return;
        }

        self.dispatches.fetch_add(1, Ordering::SeqCst);
        let outcome = self.chain.run(&request).await.map(|output| {
            let degraded = output.stage == BackendStage::Degraded;
            let duration_ms = output.audio.duration_ms.unwrap_or_else(|| {
                if output.audio.format == AudioFormat::Wav {
                    wav_duration_ms(&output.audio.audio).unwrap_or(0)
                } else {
                    0
                }
            });

            let result = SynthesisResult {
                request_id: request.id.clone(),
                audio: Arc::from(output.audio.audio),
                duration_ms,
                format: output.audio.format,
                sample_rate: output.audio.sample_rate,
                stage: output.stage,
                degraded,
                cached: false,
            };

            if degraded {
                self.degraded.fetch_add(1, Ordering::SeqCst);
            } else {
                self.cache_lock()
                    .insert(request.cache_key.clone(), CachedAudio::from(&result));
            }
            result
        });

        self.finish(&request, outcome, waiter);
    }

    /// Emit the outcome and hand it to the waiting caller, if any
    fn finish(
        &self,
        request: &SynthesisRequest,
        outcome: Result<SynthesisResult>,
        waiter: Option<Waiter>,
    ) {
        match &outcome {
            Ok(result) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    request_id = %request.id,
                    voice = %request.voice_id,
                    stage = %result.stage,
                    cached = result.cached,
                    bytes = result.audio.len(),
                    "synthesis complete"
                );
                self.events.emit_synthesis(SynthesisEvent::Completed {
                    request_id: request.id.clone(),
                    result: result.clone(),
                });
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                tracing::error!(
                    request_id = %request.id,
                    voice = %request.voice_id,
                    text_len = request.text.len(),
                    error = %e,
                    "synthesis failed"
                );
                self.events.emit_synthesis(SynthesisEvent::Failed {
                    request_id: request.id.clone(),
                    error: e.to_string(),
                });
            }
        }

        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> SynthesisConfig {
        SynthesisConfig {
            remote_timeout: Duration::from_millis(100),
            degraded_clip_ms: 20,
            ..SynthesisConfig::default()
        }
    }

    #[tokio::test]
    async fn unknown_voice_is_rejected() {
        let queue = SynthesisQueue::new(
            &config(),
            ["cfo_sarah_chen"],
            Backends::default(),
            EventBus::default(),
        );
        let err = queue
            .enqueue("hi", "nobody", Priority::Normal, SynthesisOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VoiceNotFound(_)));
    }

    #[tokio::test]
    async fn blank_text_is_rejected() {
        let queue = SynthesisQueue::new(
            &config(),
            ["cfo_sarah_chen"],
            Backends::default(),
            EventBus::default(),
        );
        let err = queue
            .enqueue("  ", "cfo_sarah_chen", Priority::Normal, SynthesisOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn without_backends_audio_is_degraded_and_not_cached() {
        let queue = SynthesisQueue::new(
            &config(),
            ["cfo_sarah_chen"],
            Backends::default(),
            EventBus::default(),
        );

        let result = queue
            .synthesize("Hello", "cfo_sarah_chen", Priority::High, SynthesisOptions::default())
            .await
            .unwrap();
        assert!(result.degraded);
        assert_eq!(result.stage, BackendStage::Degraded);
        assert_eq!(result.duration_ms, 20);

        let again = queue
            .synthesize("Hello", "cfo_sarah_chen", Priority::High, SynthesisOptions::default())
            .await
            .unwrap();
        assert!(!again.cached);

        let stats = queue.stats();
        assert_eq!(stats.cache_entries, 0);
        assert_eq!(stats.dispatches, 2);
        assert_eq!(stats.degraded, 2);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_requests() {
        let queue = SynthesisQueue::new(
            &config(),
            ["cfo_sarah_chen"],
            Backends::default(),
            EventBus::default(),
        );
        queue.start(["cfo_sarah_chen"]).await;
        assert!(queue.is_ready());

        queue.shutdown();
        assert!(!queue.is_ready());
        let err = queue
            .enqueue("hi", "cfo_sarah_chen", Priority::Low, SynthesisOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn wait_idle_returns_on_empty_queue() {
        let queue = SynthesisQueue::new(
            &config(),
            ["cfo_sarah_chen"],
            Backends::default(),
            EventBus::default(),
        );
        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .unwrap();
    }
}
