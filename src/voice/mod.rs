//! Voice Generator & TTS: a single-writer FIFO queue driving a pluggable
//! TTS backend and an optional push-to-talk key.
//!
//! `TtsEngine` and `PttController` are capability traits, not core logic —
//! audio routing is a pluggable service, not a core concern.
//! The default implementations here just emit status events; a real
//! platform backend plugs in behind the same trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::events::{Event, EventSink};
use crate::model::TtsJob;

/// Abstraction over an OS text-to-speech backend.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Synthesizes and plays `job`, returning once playback completes (or
    /// is judged complete via the caller's watchdog).
    async fn speak(&self, job: &TtsJob) -> anyhow::Result<()>;
}

/// Abstraction over the push-to-talk key driver.
#[async_trait]
pub trait PttController: Send + Sync {
    async fn press(&self) -> anyhow::Result<()>;
    async fn release(&self) -> anyhow::Result<()>;
}

/// Backend that performs no real synthesis or key injection; it only
/// narrates its own actions as `info` events. Used until a platform-
/// specific TTS/input crate is wired in behind the same trait.
pub struct NullTtsEngine {
    events: EventSink,
}

impl NullTtsEngine {
    pub fn new(events: EventSink) -> Self {
        Self { events }
    }
}

#[async_trait]
impl TtsEngine for NullTtsEngine {
    async fn speak(&self, job: &TtsJob) -> anyhow::Result<()> {
        self.events.emit(Event::debug(format!(
            "tts: would speak '{}' (voice={}, rate={})",
            job.text, job.voice, job.rate
        )));
        Ok(())
    }
}

pub struct NullPttController {
    events: EventSink,
}

impl NullPttController {
    pub fn new(events: EventSink) -> Self {
        Self { events }
    }
}

#[async_trait]
impl PttController for NullPttController {
    async fn press(&self) -> anyhow::Result<()> {
        self.events.emit(Event::debug("ptt: press"));
        Ok(())
    }

    async fn release(&self) -> anyhow::Result<()> {
        self.events.emit(Event::debug("ptt: release"));
        Ok(())
    }
}

/// Per-utterance watchdog timeout: `max(2s, 150ms * char_count)`.
pub fn watchdog_timeout(char_count: usize) -> Duration {
    let scaled = Duration::from_millis(150) * char_count as u32;
    scaled.max(Duration::from_secs(2))
}

/// Single-writer FIFO TTS queue. Jobs are consumed one at a time by
/// `run`, which drives the PTT refresh protocol and the synthesis
/// watchdog.
pub struct TtsQueue {
    tx: mpsc::UnboundedSender<TtsJob>,
    lock: Arc<Mutex<()>>,
}

impl TtsQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TtsJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                lock: Arc::new(Mutex::new(())),
            },
            rx,
        )
    }

    /// Enqueues a job. Never blocks — the queue is unbounded so the
    /// router never stalls holding a lock while enqueuing.
    pub fn enqueue(&self, job: TtsJob) {
        let _ = self.tx.send(job);
    }
}

/// Runs the TTS consumer loop: the sole driver of the PTT key and the
/// sole caller of the TTS engine, processing at most one job at a time.
pub async fn run(
    mut rx: mpsc::UnboundedReceiver<TtsJob>,
    engine: Arc<dyn TtsEngine>,
    ptt: Arc<dyn PttController>,
    ptt_enabled: bool,
    events: EventSink,
    lock: Arc<Mutex<()>>,
) {
    while let Some(job) = rx.recv().await {
        let _guard = lock.lock().await;

        if ptt_enabled {
            if let Err(e) = ptt.release().await {
                events.emit(Event::info(format!("ptt release failed: {e}")));
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
            if let Err(e) = ptt.press().await {
                events.emit(Event::info(format!("ptt press failed: {e}")));
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        let wd = watchdog_timeout(job.text.chars().count());
        match timeout(wd, engine.speak(&job)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => events.emit(Event::info(format!("tts failure, utterance dropped: {e}"))),
            Err(_) => events.emit(Event::info("tts watchdog timeout, utterance dropped")),
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        // PTT key intentionally stays pressed between utterances; it is
        // only released on the next utterance's refresh or on shutdown.
    }

    if ptt_enabled {
        let _ = ptt.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_watchdog_timeout_floor() {
        assert_eq!(watchdog_timeout(0), Duration::from_secs(2));
        assert_eq!(watchdog_timeout(5), Duration::from_secs(2));
    }

    #[test]
    fn test_watchdog_timeout_scales_with_length() {
        // 20 chars * 150ms = 3000ms > 2s floor
        assert_eq!(watchdog_timeout(20), Duration::from_millis(3000));
    }

    struct CountingEngine {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TtsEngine for CountingEngine {
        async fn speak(&self, _job: &TtsJob) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingPtt {
        presses: AtomicUsize,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl PttController for CountingPtt {
        async fn press(&self) -> anyhow::Result<()> {
            self.presses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn release(&self) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_queue_processes_jobs_in_fifo_order_with_ptt_refresh() {
        let (queue, rx) = TtsQueue::new();
        let engine = Arc::new(CountingEngine { calls: AtomicUsize::new(0) });
        let ptt = Arc::new(CountingPtt {
            presses: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        });
        let (sink, mut evrx) = EventSink::new();
        tokio::spawn(async move { while evrx.recv().await.is_some() {} });

        let lock = Arc::new(Mutex::new(()));
        queue.enqueue(TtsJob { text: "hi".into(), voice: "default".into(), rate: 1.0 });
        queue.enqueue(TtsJob { text: "there".into(), voice: "default".into(), rate: 1.0 });
        drop(queue);

        run(rx, engine.clone(), ptt.clone(), true, sink, lock).await;

        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
        // refresh (press) x2 jobs + final unconditional release on shutdown
        assert_eq!(ptt.presses.load(Ordering::SeqCst), 2);
        assert_eq!(ptt.releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_engine_failure_does_not_stop_queue() {
        struct FailingEngine;
        #[async_trait]
        impl TtsEngine for FailingEngine {
            async fn speak(&self, _job: &TtsJob) -> anyhow::Result<()> {
                anyhow::bail!("synthesis failed")
            }
        }

        let (queue, rx) = TtsQueue::new();
        let engine = Arc::new(FailingEngine);
        let ptt = Arc::new(CountingPtt {
            presses: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        });
        let (sink, mut evrx) = EventSink::new();
        tokio::spawn(async move { while evrx.recv().await.is_some() {} });

        queue.enqueue(TtsJob { text: "hi".into(), voice: "default".into(), rate: 1.0 });
        drop(queue);

        run(rx, engine, ptt, false, sink, Arc::new(Mutex::new(()))).await;
        // No panic, loop drained cleanly — the failure was swallowed.
    }
}
