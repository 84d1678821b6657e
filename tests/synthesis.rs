//! Synthesis queue integration tests
//!
//! Backends are in-process doubles; nothing touches the network or disk.

use std::sync::Arc;
use std::time::Duration;

use sovren_voice::events::{EventBus, SynthesisEvent};
use sovren_voice::synthesis::{
    BackendStage, Backends, Priority, SynthesisOptions, SynthesisQueue,
};

mod common;

use common::{FakeLocal, FakeRemote, fast_synthesis_config};

const VOICE: &str = "cfo_sarah_chen";

fn queue_with(remote: Option<Arc<FakeRemote>>, local: Option<Arc<FakeLocal>>) -> SynthesisQueue {
    queue_with_config(&fast_synthesis_config(), remote, local, EventBus::default())
}

fn queue_with_config(
    config: &sovren_voice::config::SynthesisConfig,
    remote: Option<Arc<FakeRemote>>,
    local: Option<Arc<FakeLocal>>,
    events: EventBus,
) -> SynthesisQueue {
    let backends = Backends {
        remote: remote.map(|r| r as Arc<dyn sovren_voice::synthesis::SynthesisBackend>),
        local: local.map(|l| l as Arc<dyn sovren_voice::synthesis::LocalSynthesizer>),
    };
    SynthesisQueue::new(config, [VOICE, "cto_alex_kim"], backends, events)
}

#[tokio::test]
async fn identical_requests_dispatch_once() {
    let remote = Arc::new(FakeRemote::new());
    let queue = queue_with(Some(Arc::clone(&remote)), None);

    let first = queue
        .synthesize("Quarterly numbers are in", VOICE, Priority::Normal, SynthesisOptions::default())
        .await
        .unwrap();
    let second = queue
        .synthesize("Quarterly numbers are in", VOICE, Priority::Normal, SynthesisOptions::default())
        .await
        .unwrap();

    assert_eq!(remote.calls(), 1);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(&first.audio[..], &second.audio[..]);
    assert_ne!(first.request_id, second.request_id);

    let stats = queue.stats();
    assert_eq!(stats.dispatches, 1);
    assert_eq!(stats.cache_hits, 1);
}

#[tokio::test]
async fn concurrent_identical_requests_dispatch_once() {
    let remote = Arc::new(FakeRemote::new());
    let queue = queue_with(Some(Arc::clone(&remote)), None);

    let (a, b) = tokio::join!(
        queue.synthesize("Board meeting moved", VOICE, Priority::High, SynthesisOptions::default()),
        queue.synthesize("Board meeting moved", VOICE, Priority::High, SynthesisOptions::default()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(remote.calls(), 1);
    assert_eq!(&a.audio[..], &b.audio[..]);
}

#[tokio::test]
async fn different_options_are_different_cache_entries() {
    let remote = Arc::new(FakeRemote::new());
    let queue = queue_with(Some(Arc::clone(&remote)), None);

    queue
        .synthesize("Hello", VOICE, Priority::Normal, SynthesisOptions::default())
        .await
        .unwrap();
    queue
        .synthesize(
            "Hello",
            VOICE,
            Priority::Normal,
            SynthesisOptions {
                speed: Some(1.2),
                ..SynthesisOptions::default()
            },
        )
        .await
        .unwrap();
    queue
        .synthesize("Hello", "cto_alex_kim", Priority::Normal, SynthesisOptions::default())
        .await
        .unwrap();

    assert_eq!(remote.calls(), 3);
}

#[tokio::test]
async fn priority_then_fifo_ordering() {
    let (remote, gate) = FakeRemote::gated();
    let remote = Arc::new(remote);
    let events = EventBus::default();
    let mut rx = events.subscribe_synthesis();
    let queue = queue_with_config(
        &fast_synthesis_config(),
        Some(Arc::clone(&remote)),
        None,
        events,
    );

    let a = queue
        .enqueue("request A", VOICE, Priority::High, SynthesisOptions::default())
        .await
        .unwrap();
    let b = queue
        .enqueue("request B", VOICE, Priority::Normal, SynthesisOptions::default())
        .await
        .unwrap();
    let c = queue
        .enqueue("request C", VOICE, Priority::High, SynthesisOptions::default())
        .await
        .unwrap();

    gate.add_permits(3);
    queue.wait_idle().await;

    assert_eq!(remote.texts(), ["request A", "request C", "request B"]);

    let mut completed = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SynthesisEvent::Completed { request_id, .. } = event {
            completed.push(request_id);
        }
    }
    assert_eq!(completed, [a, c, b]);
}

#[tokio::test]
async fn remote_timeout_falls_back_to_local_once() {
    let remote = Arc::new(FakeRemote::hanging(Duration::from_secs(5)));
    let local = Arc::new(FakeLocal::new());
    let config = sovren_voice::config::SynthesisConfig {
        remote_timeout: Duration::from_millis(50),
        sample_rate: 16_000,
        ..fast_synthesis_config()
    };
    let queue = queue_with_config(
        &config,
        Some(Arc::clone(&remote)),
        Some(Arc::clone(&local)),
        EventBus::default(),
    );

    let result = queue
        .synthesize("Wire transfer approved", VOICE, Priority::High, SynthesisOptions::default())
        .await
        .unwrap();

    assert_eq!(remote.calls(), 1);
    assert_eq!(local.calls(), 1);
    assert_eq!(result.stage, BackendStage::Local);
    assert!(!result.degraded);
    assert_eq!(result.duration_ms, 50);
}

#[tokio::test]
async fn remote_is_retried_before_falling_back() {
    let remote = Arc::new(FakeRemote::failing());
    let local = Arc::new(FakeLocal::new());
    let mut config = fast_synthesis_config();
    config.retry.max_retries = 2;
    let queue = queue_with_config(
        &config,
        Some(Arc::clone(&remote)),
        Some(Arc::clone(&local)),
        EventBus::default(),
    );

    let result = queue
        .synthesize("Retry me", VOICE, Priority::Normal, SynthesisOptions::default())
        .await
        .unwrap();

    assert_eq!(remote.calls(), 3);
    assert_eq!(local.calls(), 1);
    assert_eq!(result.stage, BackendStage::Local);
}

#[tokio::test]
async fn every_stage_failing_yields_degraded_audio() {
    let remote = Arc::new(FakeRemote::failing());
    let queue = queue_with(Some(Arc::clone(&remote)), None);

    let result = queue
        .synthesize("Anyone there?", VOICE, Priority::Low, SynthesisOptions::default())
        .await
        .unwrap();

    assert_eq!(result.stage, BackendStage::Degraded);
    assert!(result.degraded);
    assert!(!result.audio.is_empty());
    assert_eq!(queue.stats().degraded, 1);
    assert_eq!(queue.stats().cache_entries, 0);
}

#[tokio::test]
async fn panicking_remote_does_not_stall_the_queue() {
    let remote = Arc::new(FakeRemote::panicking_once());
    let queue = queue_with(Some(Arc::clone(&remote)), None);

    let first = tokio::time::timeout(
        Duration::from_secs(2),
        queue.synthesize("first", VOICE, Priority::Normal, SynthesisOptions::default()),
    )
    .await
    .expect("queue stalled after a backend panic")
    .unwrap();
    let second = tokio::time::timeout(
        Duration::from_secs(2),
        queue.synthesize("second", VOICE, Priority::Normal, SynthesisOptions::default()),
    )
    .await
    .expect("queue stalled after a backend panic")
    .unwrap();

    assert_eq!(first.stage, BackendStage::Degraded);
    assert_eq!(second.stage, BackendStage::Remote);
    assert_eq!(remote.calls(), 2);
    assert_eq!(queue.stats().pending, 0);
}

#[tokio::test]
async fn panicking_inline_synthesizer_falls_through() {
    let local = Arc::new(FakeLocal::panicking_once());
    let config = sovren_voice::config::SynthesisConfig {
        worker_count: 0,
        ..fast_synthesis_config()
    };
    let queue = queue_with_config(&config, None, Some(Arc::clone(&local)), EventBus::default());

    let first = queue
        .synthesize("first", VOICE, Priority::Normal, SynthesisOptions::default())
        .await
        .unwrap();
    let second = queue
        .synthesize("second", VOICE, Priority::Normal, SynthesisOptions::default())
        .await
        .unwrap();

    assert_eq!(first.stage, BackendStage::Degraded);
    assert_eq!(second.stage, BackendStage::Local);
    assert_eq!(local.calls(), 2);
}

#[tokio::test]
async fn concurrent_voice_loads_are_single_flight() {
    let local = Arc::new(FakeLocal::slow_loading(Duration::from_millis(50)));
    let queue = queue_with(None, Some(Arc::clone(&local)));

    let (a, b, c) = tokio::join!(
        queue.enqueue("one", VOICE, Priority::Normal, SynthesisOptions::default()),
        queue.enqueue("two", VOICE, Priority::Normal, SynthesisOptions::default()),
        queue.enqueue("three", VOICE, Priority::Normal, SynthesisOptions::default()),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    queue.wait_idle().await;

    assert_eq!(local.loads(), 1);
    assert_eq!(local.calls(), 3);
    assert!(queue.voices().is_loaded(VOICE));
}

#[tokio::test]
async fn failed_voice_load_does_not_block_remote_synthesis() {
    let remote = Arc::new(FakeRemote::new());
    let local = Arc::new(FakeLocal::broken_models());
    let queue = queue_with(Some(Arc::clone(&remote)), Some(Arc::clone(&local)));

    let result = queue
        .synthesize("Still works", VOICE, Priority::Normal, SynthesisOptions::default())
        .await
        .unwrap();

    assert_eq!(result.stage, BackendStage::Remote);
    assert!(!queue.voices().is_loaded(VOICE));
    assert_eq!(local.loads(), 1);
}

#[tokio::test]
async fn shutdown_fails_pending_requests() {
    let (remote, gate) = FakeRemote::gated();
    let remote = Arc::new(remote);
    let queue = queue_with(Some(Arc::clone(&remote)), None);

    let in_flight = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .synthesize("first", VOICE, Priority::Normal, SynthesisOptions::default())
                .await
        })
    };
    // Let the drain task pick up the first request
    while remote.calls() == 0 {
        tokio::task::yield_now().await;
    }

    let waiting = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .synthesize("second", VOICE, Priority::Normal, SynthesisOptions::default())
                .await
        })
    };
    while queue.stats().pending == 0 {
        tokio::task::yield_now().await;
    }

    queue.shutdown();
    gate.add_permits(1);

    assert!(in_flight.await.unwrap().is_ok());
    assert!(matches!(
        waiting.await.unwrap(),
        Err(sovren_voice::Error::InvalidState(_))
    ));
    assert!(
        queue
            .enqueue("third", VOICE, Priority::Normal, SynthesisOptions::default())
            .await
            .is_err()
    );
    assert_eq!(remote.calls(), 1);
}
