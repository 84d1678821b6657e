//! Shared test utilities

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use sovren_voice::config::SynthesisConfig;
use sovren_voice::synthesis::{
    AudioFormat, BackendAudio, BackendRequest, LocalSynthesizer, RetryPolicy, SynthesisBackend,
};
use sovren_voice::{Error, Result};

/// Render a short 16-bit mono tone; the pitch depends on the text so
/// different requests produce different bytes
pub fn tone_wav(text: &str, sample_rate: u32, duration_ms: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    #[allow(clippy::cast_precision_loss)]
    let frequency = 200.0 + (text.len() % 50) as f32 * 10.0;
    let samples = sample_rate * duration_ms / 1000;

    let mut buf = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut buf, spec).expect("wav writer");
    for i in 0..samples {
        #[allow(clippy::cast_precision_loss)]
        let t = i as f32 / sample_rate as f32;
        #[allow(clippy::cast_possible_truncation)]
        let sample = ((t * frequency * 2.0 * std::f32::consts::PI).sin() * 8_000.0) as i16;
        writer.write_sample(sample).expect("write sample");
    }
    writer.finalize().expect("finalize wav");
    buf.into_inner()
}

/// Synthesis config tuned for fast tests
pub fn fast_synthesis_config() -> SynthesisConfig {
    SynthesisConfig {
        remote_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        degraded_clip_ms: 20,
        ..SynthesisConfig::default()
    }
}

/// Remote backend double that counts calls and records texts in call order
#[derive(Default)]
pub struct FakeRemote {
    calls: AtomicUsize,
    texts: Mutex<Vec<String>>,
    /// Every call waits for one permit
    gate: Option<Arc<Semaphore>>,
    /// Every call sleeps this long before answering
    delay: Option<Duration>,
    fail: bool,
    /// The next call panics instead of answering
    panic_next: AtomicBool,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls block until the returned semaphore hands out permits
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                gate: Some(Arc::clone(&gate)),
                ..Self::default()
            },
            gate,
        )
    }

    /// Calls take longer than any sensible timeout
    pub fn hanging(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// The first call panics, later calls answer normally
    pub fn panicking_once() -> Self {
        Self {
            panic_next: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SynthesisBackend for FakeRemote {
    fn name(&self) -> &str {
        "fake-remote"
    }

    async fn synthesize(&self, request: &BackendRequest) -> Result<BackendAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().unwrap().push(request.text.clone());
        assert!(
            !self.panic_next.swap(false, Ordering::SeqCst),
            "remote backend crashed"
        );

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(Error::backend(
                sovren_voice::synthesis::BackendStage::Remote,
                "service unavailable",
            ));
        }

        Ok(BackendAudio {
            audio: tone_wav(&request.text, request.sample_rate, 100),
            format: AudioFormat::Wav,
            sample_rate: request.sample_rate,
            duration_ms: Some(100),
        })
    }
}

/// Local synthesizer double that counts calls and voice loads
#[derive(Default)]
pub struct FakeLocal {
    calls: AtomicUsize,
    loads: AtomicUsize,
    /// Voice loads take this long
    load_delay: Option<Duration>,
    fail_loads: bool,
    panic_next: AtomicBool,
}

impl FakeLocal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow_loading(delay: Duration) -> Self {
        Self {
            load_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn broken_models() -> Self {
        Self {
            fail_loads: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The first synthesis panics, later ones succeed
    pub fn panicking_once() -> Self {
        Self {
            panic_next: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl LocalSynthesizer for FakeLocal {
    fn name(&self) -> &str {
        "fake-local"
    }

    fn load_voice(&self, voice_id: &str) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        if self.fail_loads {
            return Err(Error::VoiceNotFound(format!("no model for {voice_id}")));
        }
        Ok(())
    }

    fn synthesize(&self, request: &BackendRequest) -> Result<BackendAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(
            !self.panic_next.swap(false, Ordering::SeqCst),
            "local synthesizer crashed"
        );
        Ok(BackendAudio {
            audio: tone_wav(&request.text, request.sample_rate, 50),
            format: AudioFormat::Wav,
            sample_rate: request.sample_rate,
            duration_ms: None,
        })
    }
}
