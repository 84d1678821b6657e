//! Voice model registry with single-flight lazy loading

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use super::BackendStage;
use super::backend::LocalSynthesizer;
use crate::{Error, Result};

/// Known voices and their load state
///
/// Concurrent loads of the same voice share one underlying load. A failed
/// load leaves the voice unloaded so the next request tries again.
pub struct VoiceRegistry {
    known: BTreeSet<String>,
    loads: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
    loader: Option<Arc<dyn LocalSynthesizer>>,
}

impl std::fmt::Debug for VoiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceRegistry")
            .field("known", &self.known)
            .field("loaded", &self.loaded())
            .finish_non_exhaustive()
    }
}

impl VoiceRegistry {
    #[must_use]
    pub fn new<I, S>(voices: I, loader: Option<Arc<dyn LocalSynthesizer>>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: voices.into_iter().map(Into::into).collect(),
            loads: Mutex::new(HashMap::new()),
            loader,
        }
    }

    /// Check that a voice is known
    ///
    /// # Errors
    ///
    /// Returns `Error::VoiceNotFound` otherwise
    pub fn check(&self, voice_id: &str) -> Result<()> {
        if self.known.contains(voice_id) {
            Ok(())
        } else {
            Err(Error::VoiceNotFound(voice_id.to_string()))
        }
    }

    fn cell(&self, voice_id: &str) -> Arc<OnceCell<()>> {
        let mut loads = self.loads.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            loads
                .entry(voice_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Load a voice if it is not loaded yet
    ///
    /// # Errors
    ///
    /// Returns `Error::VoiceNotFound` for unknown voices, or the loader's
    /// error if loading fails
    pub async fn ensure_loaded(&self, voice_id: &str) -> Result<()> {
        self.check(voice_id)?;

        let cell = self.cell(voice_id);
        let loader = self.loader.clone();
        let voice = voice_id.to_string();

        cell.get_or_try_init(|| async move {
            let Some(loader) = loader else {
                return Ok(());
            };
            let v = voice.clone();
            tokio::task::spawn_blocking(move || loader.load_voice(&v))
                .await
                .map_err(|e| Error::backend(BackendStage::Local, format!("voice load panicked: {e}")))??;
            tracing::info!(voice = %voice, "voice model loaded");
            Ok::<(), Error>(())
        })
        .await
        .map(|_| ())
    }

    /// Whether a voice has finished loading
    #[must_use]
    pub fn is_loaded(&self, voice_id: &str) -> bool {
        self.loads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(voice_id)
            .is_some_and(|cell| cell.initialized())
    }

    /// Loaded voices, sorted
    #[must_use]
    pub fn loaded(&self) -> Vec<String> {
        let loads = self.loads.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<String> = loads
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(voice, _)| voice.clone())
            .collect();
        out.sort();
        out
    }

    /// Every known voice
    #[must_use]
    pub const fn known(&self) -> &BTreeSet<String> {
        &self.known
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::synthesis::backend::{BackendAudio, BackendRequest};

    struct SlowLoader {
        loads: AtomicUsize,
        fail: bool,
    }

    impl LocalSynthesizer for SlowLoader {
        fn name(&self) -> &str {
            "slow"
        }

        fn load_voice(&self, voice_id: &str) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            if self.fail {
                Err(Error::backend(BackendStage::Local, format!("no model for {voice_id}")))
            } else {
                Ok(())
            }
        }

        fn synthesize(&self, _request: &BackendRequest) -> Result<BackendAudio> {
            Err(Error::backend(BackendStage::Local, "unused"))
        }
    }

    #[tokio::test]
    async fn unknown_voice_is_rejected() {
        let registry = VoiceRegistry::new(["cfo_sarah_chen"], None);
        assert!(matches!(
            registry.ensure_loaded("nobody").await,
            Err(Error::VoiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_load() {
        let loader = Arc::new(SlowLoader {
            loads: AtomicUsize::new(0),
            fail: false,
        });
        let registry = VoiceRegistry::new(
            ["cfo_sarah_chen"],
            Some(Arc::clone(&loader) as Arc<dyn LocalSynthesizer>),
        );

        let (a, b, c) = tokio::join!(
            registry.ensure_loaded("cfo_sarah_chen"),
            registry.ensure_loaded("cfo_sarah_chen"),
            registry.ensure_loaded("cfo_sarah_chen"),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(registry.is_loaded("cfo_sarah_chen"));

        registry.ensure_loaded("cfo_sarah_chen").await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let loader = Arc::new(SlowLoader {
            loads: AtomicUsize::new(0),
            fail: true,
        });
        let registry = VoiceRegistry::new(
            ["cto_alex_kim"],
            Some(Arc::clone(&loader) as Arc<dyn LocalSynthesizer>),
        );

        assert!(registry.ensure_loaded("cto_alex_kim").await.is_err());
        assert!(!registry.is_loaded("cto_alex_kim"));
        assert!(registry.ensure_loaded("cto_alex_kim").await.is_err());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }
}
