//! Background watch loop
//!
//! A single dedicated thread blocks on the backend with a bounded timeout,
//! decodes each read and hands the batch to the subscribers. The stop flag
//! is checked after every wake and after every dispatch; there is no
//! interruption of an in-flight wait, so stopping takes at most one timeout
//! plus one dispatch.

use crate::config::WatcherConfig;
use crate::decoder;
use crate::error::{Result, WatchError};
use crate::platform::NotificationBackend;
use crate::subscriber::SubscriberRegistry;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed wait so a broken backend does not spin the loop
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Loop id and stop flag of the run executing on this thread
    static CURRENT_RUN: RefCell<Option<(usize, Arc<AtomicBool>)>> = const { RefCell::new(None) };
}

/// Stop flag of this thread's run, if it belongs to loop `loop_id`
fn current_run(loop_id: usize) -> Option<Arc<AtomicBool>> {
    CURRENT_RUN.with(|run| match &*run.borrow() {
        Some((id, stop)) if *id == loop_id => Some(Arc::clone(stop)),
        _ => None,
    })
}

/// Counters maintained by the loop thread
#[derive(Debug, Default)]
pub struct LoopStats {
    cycles: AtomicU64,
    batches: AtomicU64,
    events: AtomicU64,
    read_failures: AtomicU64,
    truncated: AtomicU64,
    overflows: AtomicU64,
}

/// Point-in-time copy of [`LoopStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Poll cycles started
    pub cycles: u64,
    /// Non-empty batches dispatched
    pub batches: u64,
    /// Events dispatched across all batches
    pub events: u64,
    /// Failed waits or reads
    pub read_failures: u64,
    /// Reads whose trailing record was cut short
    pub truncated: u64,
    /// Queue overflows reported by the backend
    pub overflows: u64,
}

impl LoopStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// One spawned loop thread and its private stop flag
struct Run {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Run {
    /// Thread still running and not asked to stop
    fn is_live(&self) -> bool {
        !self.stop.load(Ordering::Acquire) && !self.handle.is_finished()
    }
}

/// Owner of the background thread and its start/stop lifecycle
pub struct WatchLoop<B: NotificationBackend> {
    id: usize,
    backend: Arc<B>,
    subscribers: Arc<SubscriberRegistry>,
    config: WatcherConfig,
    stats: Arc<LoopStats>,
    /// Serializes start and stop; held across join so concurrent stop
    /// callers all return after the thread has exited
    lifecycle: Mutex<()>,
    /// Current run; never held across a join
    run: Mutex<Option<Run>>,
}

impl<B: NotificationBackend> WatchLoop<B> {
    pub fn new(backend: Arc<B>, subscribers: Arc<SubscriberRegistry>, config: WatcherConfig) -> Self {
        Self {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            subscribers,
            config,
            stats: Arc::new(LoopStats::default()),
            lifecycle: Mutex::new(()),
            run: Mutex::new(None),
        }
    }

    /// Spawn the loop thread
    ///
    /// Does nothing if the loop is already running. A loop that was stopped
    /// can be started again. From a subscriber whose run has already been
    /// asked to stop, fails with `Stopping`: the thread cannot restart itself.
    pub fn start(&self) -> Result<()> {
        if let Some(stop) = current_run(self.id) {
            if stop.load(Ordering::Acquire) {
                return Err(WatchError::Stopping);
            }
            debug!("Start requested from the watch loop thread; already running");
            return Ok(());
        }

        let _lifecycle = self.lifecycle.lock();
        let previous = {
            let mut run = self.run.lock();
            if run.as_ref().is_some_and(Run::is_live) {
                debug!("Watch loop already running");
                return Ok(());
            }
            run.take()
        };
        // A run that stopped itself or died still has to be reaped
        if let Some(previous) = previous {
            join_run(previous);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            loop_id: self.id,
            backend: Arc::clone(&self.backend),
            subscribers: Arc::clone(&self.subscribers),
            stats: Arc::clone(&self.stats),
            stop: Arc::clone(&stop),
            timeout: self.config.poll_timeout(),
            buffer_size: self.config.buffer_size(),
        };

        let handle = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || worker.run())
            .map_err(WatchError::SpawnFailed)?;

        *self.run.lock() = Some(Run { stop, handle });
        info!(
            "Watch loop started (timeout {:?}, buffer {} bytes)",
            self.config.poll_timeout(),
            self.config.buffer_size()
        );
        Ok(())
    }

    /// Signal the loop to exit and wait until it has
    ///
    /// No dispatch happens after this returns. Called from a subscriber on
    /// the loop thread itself, it only raises the flag; the thread finishes
    /// the current dispatch and exits on its own.
    pub fn stop(&self) {
        if let Some(stop) = current_run(self.id) {
            stop.store(true, Ordering::Release);
            debug!("Stop requested from the watch loop thread");
            return;
        }

        let _lifecycle = self.lifecycle.lock();
        let Some(active) = self.run.lock().take() else {
            return;
        };
        join_run(active);
        info!("Watch loop stopped");
    }

    /// Whether a loop thread is running and has not been asked to stop
    pub fn is_running(&self) -> bool {
        if let Some(stop) = current_run(self.id) {
            return !stop.load(Ordering::Acquire);
        }
        self.run.lock().as_ref().is_some_and(Run::is_live)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<B: NotificationBackend> Drop for WatchLoop<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_run(run: Run) {
    run.stop.store(true, Ordering::Release);
    if run.handle.join().is_err() {
        error!("Watch loop thread panicked");
    }
}

/// State moved onto the loop thread
struct Worker<B: NotificationBackend> {
    loop_id: usize,
    backend: Arc<B>,
    subscribers: Arc<SubscriberRegistry>,
    stats: Arc<LoopStats>,
    stop: Arc<AtomicBool>,
    timeout: Duration,
    buffer_size: usize,
}

impl<B: NotificationBackend> Worker<B> {
    fn run(self) {
        CURRENT_RUN.with(|run| *run.borrow_mut() = Some((self.loop_id, Arc::clone(&self.stop))));

        let mut buffer = vec![0u8; self.buffer_size];
        debug!("Watch loop thread running");

        while !self.stopped() {
            self.poll_once(&mut buffer);
        }

        CURRENT_RUN.with(|run| run.borrow_mut().take());
        debug!("Watch loop thread exiting");
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Count a failed wait or read; a closed backend ends the run
    fn fail(&self, what: &str, e: &WatchError) {
        LoopStats::bump(&self.stats.read_failures, 1);
        if e.is_recoverable() {
            warn!("{}: {}", what, e);
        } else {
            error!("{}: {}; stopping watch loop", what, e);
            self.stop.store(true, Ordering::Release);
        }
    }

    /// One wait, read, decode and dispatch pass
    fn poll_once(&self, buffer: &mut [u8]) {
        LoopStats::bump(&self.stats.cycles, 1);

        match self.backend.wait_readable(self.timeout) {
            Ok(true) => {}
            Ok(false) => {
                trace!("No change records within {:?}", self.timeout);
                return;
            }
            Err(e) => {
                self.fail("Waiting for change records failed", &e);
                thread::sleep(self.timeout.min(ERROR_BACKOFF));
                return;
            }
        }

        if self.stopped() {
            return;
        }

        let len = match self.backend.read_raw(buffer) {
            Ok(0) => return,
            Ok(len) => len.min(buffer.len()),
            Err(e) => {
                self.fail("Reading change records failed", &e);
                return;
            }
        };

        let batch = decoder::decode(&buffer[..len]);
        if batch.truncated {
            LoopStats::bump(&self.stats.truncated, 1);
            warn!(
                "Dropped a truncated record after {} events in a {} byte read",
                batch.events.len(),
                len
            );
        }
        if batch.overflowed {
            LoopStats::bump(&self.stats.overflows, 1);
            warn!("Notification queue overflowed; some changes were lost");
        }
        if batch.events.is_empty() {
            return;
        }

        let report = self.subscribers.dispatch(&batch.events);
        LoopStats::bump(&self.stats.batches, 1);
        LoopStats::bump(&self.stats.events, batch.events.len() as u64);
        trace!(
            "Dispatched {} events to {} subscribers ({} failed)",
            batch.events.len(),
            report.delivered + report.failed,
            report.failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{FLAG_CREATE, FLAG_DELETE, FLAG_MODIFY};
    use crate::event::{Event, EventKind};
    use crate::platform::MemoryBackend;
    use crate::subscriber::EventSubscriber;
    use std::time::Instant;

    fn fast_config() -> WatcherConfig {
        WatcherConfig::builder().poll_timeout_ms(20).build()
    }

    fn setup() -> (Arc<MemoryBackend>, Arc<SubscriberRegistry>, WatchLoop<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let subscribers = Arc::new(SubscriberRegistry::new());
        let watch_loop = WatchLoop::new(Arc::clone(&backend), Arc::clone(&subscribers), fast_config());
        (backend, subscribers, watch_loop)
    }

    fn collector() -> (Arc<Mutex<Vec<Vec<Event>>>>, Arc<dyn EventSubscriber>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let subscriber: Arc<dyn EventSubscriber> = Arc::new(move |events: &[Event]| -> anyhow::Result<()> {
            sink.lock().push(events.to_vec());
            Ok(())
        });
        (batches, subscriber)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_dispatches_one_batch_per_read() {
        let (backend, subscribers, watch_loop) = setup();
        let (batches, subscriber) = collector();
        subscribers.add(subscriber);

        watch_loop.start().unwrap();
        backend
            .feed()
            .push_records(&[(FLAG_CREATE, "a.txt"), (FLAG_MODIFY, "a.txt"), (FLAG_DELETE, "a.txt")]);

        assert!(wait_until(|| batches.lock().len() == 1));
        watch_loop.stop();

        assert_eq!(
            batches.lock()[0],
            vec![
                Event::new("a.txt", false, EventKind::Created),
                Event::new("a.txt", false, EventKind::Modified),
                Event::new("a.txt", false, EventKind::Deleted),
            ]
        );
        let stats = watch_loop.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.events, 3);
    }

    #[test]
    fn test_start_is_idempotent() {
        let (backend, subscribers, watch_loop) = setup();
        let (batches, subscriber) = collector();
        subscribers.add(subscriber);

        watch_loop.start().unwrap();
        watch_loop.start().unwrap();
        assert!(watch_loop.is_running());

        backend.feed().push_records(&[(FLAG_CREATE, "once")]);
        assert!(wait_until(|| batches.lock().len() == 1));
        thread::sleep(Duration::from_millis(100));
        watch_loop.stop();

        assert_eq!(batches.lock().len(), 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_final() {
        let (backend, subscribers, watch_loop) = setup();
        let (batches, subscriber) = collector();
        subscribers.add(subscriber);

        // Stop before start is a no-op
        watch_loop.stop();

        watch_loop.start().unwrap();
        backend.feed().push_records(&[(FLAG_CREATE, "before")]);
        assert!(wait_until(|| batches.lock().len() == 1));

        watch_loop.stop();
        watch_loop.stop();
        assert!(!watch_loop.is_running());

        let delivered = batches.lock().len();
        backend.feed().push_records(&[(FLAG_CREATE, "after")]);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(batches.lock().len(), delivered);
    }

    #[test]
    fn test_restart_after_stop() {
        let (backend, subscribers, watch_loop) = setup();
        let (batches, subscriber) = collector();
        subscribers.add(subscriber);

        watch_loop.start().unwrap();
        watch_loop.stop();
        watch_loop.start().unwrap();

        backend.feed().push_records(&[(FLAG_MODIFY, "again")]);
        assert!(wait_until(|| batches.lock().len() == 1));
        watch_loop.stop();
    }

    #[test]
    fn test_read_failure_does_not_kill_loop() {
        let (backend, subscribers, watch_loop) = setup();
        let (batches, subscriber) = collector();
        subscribers.add(subscriber);

        backend.fail_next_read();
        backend.feed().push_records(&[(FLAG_CREATE, "lost")]);
        watch_loop.start().unwrap();
        assert!(wait_until(|| watch_loop.stats().read_failures == 1));

        backend.feed().push_records(&[(FLAG_CREATE, "kept")]);
        assert!(wait_until(|| batches.lock().len() == 1));
        watch_loop.stop();

        assert_eq!(batches.lock()[0][0].name(), "kept");
    }

    #[test]
    fn test_truncated_read_dispatches_partial_batch() {
        let backend = Arc::new(MemoryBackend::new());
        let subscribers = Arc::new(SubscriberRegistry::new());
        // Room for exactly one record carrying a maximal name
        let config = WatcherConfig::builder()
            .poll_timeout_ms(20)
            .buffer_records(1)
            .name_margin(decoder::MAX_NAME_LEN + 1)
            .build();
        let watch_loop = WatchLoop::new(Arc::clone(&backend), Arc::clone(&subscribers), config);
        let (batches, subscriber) = collector();
        subscribers.add(subscriber);

        let long = "n".repeat(250);
        backend
            .feed()
            .push_records(&[(FLAG_CREATE, "short"), (FLAG_CREATE, long.as_str())]);
        watch_loop.start().unwrap();

        assert!(wait_until(|| batches.lock().len() == 1));
        watch_loop.stop();

        assert_eq!(batches.lock()[0], vec![Event::new("short", false, EventKind::Created)]);
        assert_eq!(watch_loop.stats().truncated, 1);
    }

    #[test]
    fn test_stop_from_subscriber_does_not_deadlock() {
        let backend = Arc::new(MemoryBackend::new());
        let subscribers = Arc::new(SubscriberRegistry::new());
        let watch_loop = Arc::new(WatchLoop::new(
            Arc::clone(&backend),
            Arc::clone(&subscribers),
            fast_config(),
        ));

        let weak = Arc::downgrade(&watch_loop);
        subscribers.add(Arc::new(move |_: &[Event]| -> anyhow::Result<()> {
            if let Some(watch_loop) = weak.upgrade() {
                watch_loop.stop();
            }
            Ok(())
        }));

        watch_loop.start().unwrap();
        backend.feed().push_records(&[(FLAG_CREATE, "halt")]);
        assert!(wait_until(|| !watch_loop.is_running()));

        // The self-stopped run is reaped by the next lifecycle call
        watch_loop.stop();
        watch_loop.start().unwrap();
        assert!(watch_loop.is_running());
        watch_loop.stop();
    }

    #[test]
    fn test_stop_while_subscriber_queries_state() {
        let backend = Arc::new(MemoryBackend::new());
        let subscribers = Arc::new(SubscriberRegistry::new());
        let watch_loop = Arc::new(WatchLoop::new(
            Arc::clone(&backend),
            Arc::clone(&subscribers),
            fast_config(),
        ));

        let entered = Arc::new(AtomicBool::new(false));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&watch_loop);
        let (flag, sink) = (Arc::clone(&entered), Arc::clone(&observed));
        subscribers.add(Arc::new(move |_: &[Event]| -> anyhow::Result<()> {
            flag.store(true, Ordering::Release);
            thread::sleep(Duration::from_millis(100));
            if let Some(watch_loop) = weak.upgrade() {
                sink.lock().push(watch_loop.is_running());
            }
            Ok(())
        }));

        watch_loop.start().unwrap();
        backend.feed().push_records(&[(FLAG_CREATE, "busy")]);
        assert!(wait_until(|| entered.load(Ordering::Acquire)));

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let stopper = Arc::clone(&watch_loop);
        thread::spawn(move || {
            stopper.stop();
            let _ = done_tx.send(());
        });

        assert!(
            done_rx.recv_timeout(Duration::from_secs(3)).is_ok(),
            "stop() blocked while a subscriber queried is_running()"
        );
        assert!(!watch_loop.is_running());
        assert_eq!(observed.lock().len(), 1);
    }

    #[test]
    fn test_restart_from_stopping_subscriber_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let subscribers = Arc::new(SubscriberRegistry::new());
        let watch_loop = Arc::new(WatchLoop::new(
            Arc::clone(&backend),
            Arc::clone(&subscribers),
            fast_config(),
        ));

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&watch_loop);
        let sink = Arc::clone(&outcomes);
        subscribers.add(Arc::new(move |_: &[Event]| -> anyhow::Result<()> {
            if let Some(watch_loop) = weak.upgrade() {
                // Still running: start is a no-op
                let before = watch_loop.start().is_ok();
                watch_loop.stop();
                let after = watch_loop.start();
                sink.lock().push((before, matches!(after, Err(WatchError::Stopping))));
            }
            Ok(())
        }));

        watch_loop.start().unwrap();
        backend.feed().push_records(&[(FLAG_CREATE, "bounce")]);
        assert!(wait_until(|| !outcomes.lock().is_empty()));
        assert!(wait_until(|| !watch_loop.is_running()));

        assert_eq!(*outcomes.lock(), vec![(true, true)]);
        watch_loop.stop();
    }

    #[test]
    fn test_closed_backend_ends_run() {
        let (backend, _subscribers, watch_loop) = setup();
        watch_loop.start().unwrap();

        backend.close().unwrap();
        assert!(wait_until(|| !watch_loop.is_running()));
        assert_eq!(watch_loop.stats().read_failures, 1);

        // Reaped without blocking
        watch_loop.stop();
    }

    #[test]
    fn test_stop_returns_within_timeout() {
        let backend = Arc::new(MemoryBackend::new());
        let subscribers = Arc::new(SubscriberRegistry::new());
        let config = WatcherConfig::builder().poll_timeout_ms(200).build();
        let watch_loop = WatchLoop::new(backend, subscribers, config);

        watch_loop.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        watch_loop.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
