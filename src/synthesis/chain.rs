//! Remote → local → degraded fallback chain

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Semaphore;

use super::BackendStage;
use super::backend::{
    BackendAudio, BackendRequest, Backends, LocalSynthesizer, RetryPolicy, SynthesisBackend,
    degraded_clip, delay_for_attempt,
};
use super::request::{AudioFormat, SynthesisRequest};
use crate::config::SynthesisConfig;
use crate::{Error, Result};

/// Audio plus the stage that produced it
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub audio: BackendAudio,
    pub stage: BackendStage,
}

/// Runs a request through each backend stage until one produces audio
pub struct FallbackChain {
    remote: Option<Arc<dyn SynthesisBackend>>,
    local: Option<Arc<dyn LocalSynthesizer>>,
    remote_timeout: Duration,
    retry: RetryPolicy,
    workers: Arc<Semaphore>,
    format: AudioFormat,
    sample_rate: u32,
    degraded_clip_ms: u32,
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("remote", &self.remote.as_ref().map(|b| b.name().to_string()))
            .field("local", &self.local.as_ref().map(|b| b.name().to_string()))
            .field("remote_timeout", &self.remote_timeout)
            .field("free_workers", &self.workers.available_permits())
            .finish_non_exhaustive()
    }
}

impl FallbackChain {
    #[must_use]
    pub fn new(config: &SynthesisConfig, backends: Backends) -> Self {
        Self {
            remote: backends.remote,
            local: backends.local,
            remote_timeout: config.remote_timeout,
            retry: config.retry.clone(),
            workers: Arc::new(Semaphore::new(config.worker_count)),
            format: config.format,
            sample_rate: config.sample_rate,
            degraded_clip_ms: config.degraded_clip_ms,
        }
    }

    /// The local synthesizer, used for voice loading
    #[must_use]
    pub fn local(&self) -> Option<Arc<dyn LocalSynthesizer>> {
        self.local.clone()
    }

    /// Produce audio for a request
    ///
    /// # Errors
    ///
    /// Returns `Error::SynthesisBackend` only if even the degraded stage
    /// cannot produce audio
    pub async fn run(&self, request: &SynthesisRequest) -> Result<ChainOutput> {
        let backend_request = BackendRequest {
            text: request.text.clone(),
            voice_id: request.voice_id.clone(),
            format: self.format,
            sample_rate: self.sample_rate,
            options: request.options.clone(),
        };

        if let Some(remote) = &self.remote {
            match self.run_remote(remote.as_ref(), &backend_request).await {
                Ok(audio) => {
                    return Ok(ChainOutput {
                        audio,
                        stage: BackendStage::Remote,
                    });
                }
                Err(e) => log_stage_failure(request, BackendStage::Remote, &e),
            }
        }

        if let Some(local) = &self.local {
            match self.run_local(Arc::clone(local), backend_request).await {
                Ok(audio) => {
                    return Ok(ChainOutput {
                        audio,
                        stage: BackendStage::Local,
                    });
                }
                Err(e) => log_stage_failure(request, BackendStage::Local, &e),
            }
        }

        let clip = degraded_clip(self.sample_rate, self.degraded_clip_ms).inspect_err(|e| {
            log_stage_failure(request, BackendStage::Degraded, e);
        })?;
        tracing::warn!(
            request_id = %request.id,
            voice = %request.voice_id,
            "serving degraded audio"
        );

        Ok(ChainOutput {
            audio: BackendAudio {
                audio: clip,
                format: AudioFormat::Wav,
                sample_rate: self.sample_rate,
                duration_ms: Some(u64::from(self.degraded_clip_ms)),
            },
            stage: BackendStage::Degraded,
        })
    }

    async fn run_remote(
        &self,
        remote: &dyn SynthesisBackend,
        request: &BackendRequest,
    ) -> Result<BackendAudio> {
        let mut last_error = None;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let delay = delay_for_attempt(&self.retry, attempt - 1);
                tracing::debug!(
                    voice = %request.voice_id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "retrying remote synthesis"
                );
                tokio::time::sleep(delay).await;
            }

            let attempt_fut = AssertUnwindSafe(remote.synthesize(request)).catch_unwind();
            match tokio::time::timeout(self.remote_timeout, attempt_fut).await {
                Ok(Ok(Ok(audio))) => return Ok(audio),
                Ok(Ok(Err(e))) => last_error = Some(e),
                Ok(Err(panic)) => {
                    last_error = Some(Error::backend(
                        BackendStage::Remote,
                        format!("backend panicked: {}", panic_message(panic.as_ref())),
                    ));
                }
                Err(_) => {
                    last_error = Some(Error::backend(
                        BackendStage::Remote,
                        format!("timed out after {:?}", self.remote_timeout),
                    ));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::backend(BackendStage::Remote, "no attempt was made")))
    }

    /// Run on a pool worker, or inline when every worker is busy
    ///
    /// The inline path moves the drain task's worker thread out of the
    /// scheduler on a multi-thread runtime. On a current-thread runtime it
    /// blocks the runtime until the synthesizer returns.
    async fn run_local(
        &self,
        local: Arc<dyn LocalSynthesizer>,
        request: BackendRequest,
    ) -> Result<BackendAudio> {
        match Arc::clone(&self.workers).try_acquire_owned() {
            Ok(permit) => tokio::task::spawn_blocking(move || {
                let _permit = permit;
                local.synthesize(&request)
            })
            .await
            .map_err(|e| Error::backend(BackendStage::Local, format!("worker panicked: {e}")))?,
            Err(_) => {
                tracing::debug!(voice = %request.voice_id, "no free worker, synthesizing inline");
                let synthesize = || {
                    std::panic::catch_unwind(AssertUnwindSafe(|| local.synthesize(&request)))
                        .unwrap_or_else(|panic| {
                            Err(Error::backend(
                                BackendStage::Local,
                                format!("synthesizer panicked: {}", panic_message(panic.as_ref())),
                            ))
                        })
                };
                match Handle::current().runtime_flavor() {
                    RuntimeFlavor::MultiThread => tokio::task::block_in_place(synthesize),
                    _ => synthesize(),
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn log_stage_failure(request: &SynthesisRequest, stage: BackendStage, error: &Error) {
    tracing::warn!(
        request_id = %request.id,
        voice = %request.voice_id,
        text_len = request.text.len(),
        stage = %stage,
        error = %error,
        "synthesis stage failed"
    );
}
