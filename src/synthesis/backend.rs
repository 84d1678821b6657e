//! Synthesis backends
//!
//! - [`SynthesisBackend`]: async remote inference (HTTP)
//! - [`LocalSynthesizer`]: blocking offline synthesis, run on worker threads
//! - [`degraded_clip`]: last-resort silent WAV

use std::io::Cursor;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::BackendStage;
use super::request::{AudioFormat, SynthesisOptions};
use crate::config::{LocalCommandConfig, SynthesisConfig};
use crate::{Error, Result};

/// What a backend is asked to produce
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub text: String,
    pub voice_id: String,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub options: SynthesisOptions,
}

/// Audio produced by a backend
#[derive(Debug, Clone)]
pub struct BackendAudio {
    pub audio: Vec<u8>,
    pub format: AudioFormat,
    pub sample_rate: u32,
    /// Reported duration; computed from the WAV header when absent
    pub duration_ms: Option<u64>,
}

/// Remote text-to-speech service
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Synthesize one request
    ///
    /// # Errors
    ///
    /// Returns error if the service is unreachable or rejects the request
    async fn synthesize(&self, request: &BackendRequest) -> Result<BackendAudio>;
}

/// Offline synthesizer; every call blocks the calling thread
pub trait LocalSynthesizer: Send + Sync {
    /// Synthesizer name for logs
    fn name(&self) -> &str;

    /// Prepare a voice model; called at most once per successful load
    ///
    /// # Errors
    ///
    /// Returns error if the model is missing or cannot be loaded
    fn load_voice(&self, _voice_id: &str) -> Result<()> {
        Ok(())
    }

    /// Synthesize one request
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    fn synthesize(&self, request: &BackendRequest) -> Result<BackendAudio>;
}

/// The backends a synthesis queue is built with
#[derive(Clone, Default)]
pub struct Backends {
    pub remote: Option<Arc<dyn SynthesisBackend>>,
    pub local: Option<Arc<dyn LocalSynthesizer>>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("remote", &self.remote.as_ref().map(|b| b.name().to_string()))
            .field("local", &self.local.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

impl Backends {
    /// Build the configured backends
    ///
    /// # Errors
    ///
    /// Returns error if the remote backend cannot be constructed
    pub fn from_config(config: &SynthesisConfig) -> Result<Self> {
        let remote = match &config.remote_url {
            Some(url) => Some(Arc::new(RemoteBackend::new(
                url.clone(),
                config.remote_api_key.clone(),
            )?) as Arc<dyn SynthesisBackend>),
            None => None,
        };
        let local = config
            .local_command
            .as_ref()
            .map(|cmd| Arc::new(CommandSynthesizer::from_config(cmd)) as Arc<dyn LocalSynthesizer>);

        if remote.is_none() && local.is_none() {
            tracing::warn!("no synthesis backend configured, only degraded audio is available");
        }
        Ok(Self { remote, local })
    }
}

/// HTTP inference service speaking the `{text, voiceId, ...}` JSON protocol
pub struct RemoteBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoteRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    format: AudioFormat,
    sample_rate: u32,
    #[serde(flatten)]
    options: &'a SynthesisOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteResponse {
    audio_data_base64: String,
    #[serde(default)]
    processing_time_ms: Option<f64>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    sample_rate: Option<u32>,
}

impl RemoteBackend {
    /// Create a remote backend
    ///
    /// # Errors
    ///
    /// Returns error if the URL is empty
    pub fn new(url: String, api_key: Option<String>) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(Error::Config("remote synthesis URL is empty".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url,
            api_key,
        })
    }
}

#[async_trait]
impl SynthesisBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn synthesize(&self, request: &BackendRequest) -> Result<BackendAudio> {
        let body = RemoteRequest {
            text: &request.text,
            voice_id: &request.voice_id,
            format: request.format,
            sample_rate: request.sample_rate,
            options: &request.options,
        };

        let mut http = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            http = http.header("Authorization", format!("Bearer {key}"));
        }
        let response = http.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::backend(
                BackendStage::Remote,
                format!("inference service error {status}: {body}"),
            ));
        }

        let parsed: RemoteResponse = response.json().await?;
        let audio = base64::engine::general_purpose::STANDARD
            .decode(parsed.audio_data_base64.as_bytes())
            .map_err(|e| Error::backend(BackendStage::Remote, format!("bad audio payload: {e}")))?;

        if let Some(ms) = parsed.processing_time_ms {
            tracing::debug!(voice = %request.voice_id, processing_ms = ms, "remote synthesis done");
        }

        Ok(BackendAudio {
            audio,
            format: request.format,
            sample_rate: parsed.sample_rate.unwrap_or(request.sample_rate),
            duration_ms: parsed.duration_ms,
        })
    }
}

/// Runs an offline TTS command that writes a WAV file
///
/// Argument placeholders: `{text}`, `{voice}`, `{output}`, `{sample_rate}`,
/// `{speed}`, `{pitch}`.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    model_dir: Option<PathBuf>,
}

impl CommandSynthesizer {
    #[must_use]
    pub const fn new(program: String, args: Vec<String>, model_dir: Option<PathBuf>) -> Self {
        Self {
            program,
            args,
            model_dir,
        }
    }

    #[must_use]
    pub fn from_config(config: &LocalCommandConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            config.model_dir.clone(),
        )
    }

    fn render_args(&self, request: &BackendRequest, output: &str) -> Vec<String> {
        let speed = request.options.speed.unwrap_or(1.0).to_string();
        let pitch = request.options.pitch.unwrap_or(1.0).to_string();
        let sample_rate = request.sample_rate.to_string();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{text}", &request.text)
                    .replace("{voice}", &request.voice_id)
                    .replace("{output}", output)
                    .replace("{sample_rate}", &sample_rate)
                    .replace("{speed}", &speed)
                    .replace("{pitch}", &pitch)
            })
            .collect()
    }
}

impl LocalSynthesizer for CommandSynthesizer {
    fn name(&self) -> &str {
        &self.program
    }

    fn load_voice(&self, voice_id: &str) -> Result<()> {
        let Some(dir) = &self.model_dir else {
            return Ok(());
        };
        let path = dir.join(voice_id);
        if path.exists() {
            tracing::debug!(voice = %voice_id, path = %path.display(), "voice model found");
            Ok(())
        } else {
            Err(Error::backend(
                BackendStage::Local,
                format!("voice model not installed: {}", path.display()),
            ))
        }
    }

    fn synthesize(&self, request: &BackendRequest) -> Result<BackendAudio> {
        let output = tempfile::Builder::new()
            .prefix("sovren-tts-")
            .suffix(".wav")
            .tempfile()?;
        let output_path = output.path().to_string_lossy().into_owned();

        let result = Command::new(&self.program)
            .args(self.render_args(request, &output_path))
            .output()?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(Error::backend(
                BackendStage::Local,
                format!("{} exited with {}: {}", self.program, result.status, stderr.trim()),
            ));
        }

        let audio = std::fs::read(output.path())?;
        if audio.is_empty() {
            return Err(Error::backend(
                BackendStage::Local,
                format!("{} produced no audio", self.program),
            ));
        }

        Ok(BackendAudio {
            audio,
            format: AudioFormat::Wav,
            sample_rate: request.sample_rate,
            duration_ms: None,
        })
    }
}

/// Retry policy for the remote stage
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Delay before retry number `attempt` (0-based)
///
/// Exponential backoff `min(base_delay * 2^attempt + jitter, max_delay)`,
/// jitter being 0-25% taken from the system clock.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let jitter = base.mul_f64(f64::from(jitter_nanos % 250) / 1000.0);

    (base + jitter).min(policy.max_delay)
}

/// Silent 16-bit mono WAV of the given length
///
/// # Errors
///
/// Returns error if the WAV cannot be encoded
pub fn degraded_clip(sample_rate: u32, duration_ms: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let samples = u64::from(sample_rate) * u64::from(duration_ms) / 1000;

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::backend(BackendStage::Degraded, e.to_string()))?;
        for _ in 0..samples {
            writer
                .write_sample(0i16)
                .map_err(|e| Error::backend(BackendStage::Degraded, e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| Error::backend(BackendStage::Degraded, e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Duration of a WAV buffer, if it parses
#[must_use]
pub fn wav_duration_ms(audio: &[u8]) -> Option<u64> {
    let reader = hound::WavReader::new(Cursor::new(audio)).ok()?;
    let rate = u64::from(reader.spec().sample_rate);
    if rate == 0 {
        return None;
    }
    Some(u64::from(reader.duration()) * 1000 / rate)
}
