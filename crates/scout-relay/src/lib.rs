//! Drains the capture buffer to the ingest endpoint.
//!
//! Every cycle lists the buffer, tries each pending task once in ascending id
//! order and sleeps for a fixed interval. A task is deleted only after the
//! receiver acknowledged it; anything else leaves it on disk for the next
//! cycle. There is no backoff and no retry limit. Because deletion follows the
//! acknowledgment, a crash in between re-sends the task (at-least-once).

pub mod clock;
pub mod doctor;
pub mod transport;

use futures::stream::{self, StreamExt};
use scout_buffer::{BufferError, CaptureBuffer, TaskId};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use clock::{Clock, TokioClock};
pub use transport::{HttpTransport, TransmissionFailure, Transport};

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Full upload URL, e.g. `http://gpu-node:8888/upload`.
    pub endpoint: String,
    #[serde(default = "default_interval_s")]
    pub interval_s: f64,
    /// Deadline for one upload request.
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,
    /// Uploads allowed in flight at once within a cycle.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_true")]
    pub skip_tunnel_interstitial: bool,
}

fn default_interval_s() -> f64 { 2.0 }
fn default_timeout_s() -> f64 { 15.0 }
fn default_max_in_flight() -> usize { 1 }
fn default_true() -> bool { true }

impl RelayConfig {
    /// Pause between cycles. Values that are not a finite positive number of
    /// seconds fall back to the default; `doctor::check_relay` reports them.
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_s)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_interval_s()))
    }
}

#[derive(Debug, Clone)]
pub struct LinkHealth {
    pub rtt_ms: Option<u32>,
    pub quality: u8,           // 0-100
    pub consecutive_failures: u32,
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self {
            rtt_ms: None,
            quality: 100,
            consecutive_failures: 0,
        }
    }
}

impl LinkHealth {
    fn on_success(&mut self, rtt: Duration) {
        self.rtt_ms = Some(rtt.as_millis().min(u32::MAX as u128) as u32);
        self.consecutive_failures = 0;
        self.quality = self.quality.saturating_add(10).min(100);
    }

    fn on_failure(&mut self) {
        self.consecutive_failures += 1;
        self.quality = self.quality.saturating_sub(20);
    }
}

/// What happened to the pending tasks in one cycle.
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub pending: usize,
    pub delivered: Vec<TaskId>,
    pub retained: Vec<TaskId>,
    /// Tasks that could not be read back from disk; kept for inspection.
    pub unreadable: Vec<TaskId>,
    pub list_failed: bool,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && !self.list_failed
    }
}

enum Delivery {
    Delivered(Duration),
    Failed(TransmissionFailure),
    Unreadable(BufferError),
}

pub struct RelayWorker<T, C = TokioClock> {
    buffer: CaptureBuffer,
    transport: T,
    clock: C,
    interval: Duration,
    max_in_flight: usize,
    health: LinkHealth,
}

impl<T: Transport, C: Clock> RelayWorker<T, C> {
    pub fn new(buffer: CaptureBuffer, transport: T, clock: C, interval: Duration, max_in_flight: usize) -> Self {
        Self { buffer, transport, clock, interval, max_in_flight: max_in_flight.max(1), health: LinkHealth::default() }
    }

    pub fn link_health(&self) -> &LinkHealth {
        &self.health
    }

    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    /// One LIST → SEND* pass. Never fails; problems are reported and logged.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let ids = match self.buffer.list_pending() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("relay: listing {} failed: {}", self.buffer.root().display(), e);
                report.list_failed = true;
                return report;
            }
        };
        report.pending = ids.len();
        if ids.is_empty() {
            debug!("relay: buffer empty");
            return report;
        }

        let this = &*self;
        let outcomes: Vec<(TaskId, Delivery)> = stream::iter(ids)
            .map(|id| async move { (id, this.deliver(id).await) })
            .buffered(this.max_in_flight)
            .collect()
            .await;

        for (id, outcome) in outcomes {
            match outcome {
                Delivery::Delivered(rtt) => {
                    self.health.on_success(rtt);
                    report.delivered.push(id);
                }
                Delivery::Failed(e) => {
                    self.health.on_failure();
                    warn!(
                        "relay: {} postponed for retry (failures: {}, quality: {}%): {}",
                        id, self.health.consecutive_failures, self.health.quality, e
                    );
                    report.retained.push(id);
                }
                Delivery::Unreadable(e) => {
                    warn!("relay: {} unreadable, left in place: {}", id, e);
                    report.unreadable.push(id);
                }
            }
        }
        report
    }

    async fn deliver(&self, id: TaskId) -> Delivery {
        let task = match self.buffer.load(id) {
            Ok(t) => t,
            Err(e) => return Delivery::Unreadable(e),
        };

        debug!("relay: sending {} (frame={})", id, task.gps.frame);
        let start = Instant::now();
        if let Err(e) = self.transport.send(&task).await {
            return Delivery::Failed(e);
        }
        let rtt = start.elapsed();
        info!("relay: {} delivered in {}ms", id, rtt.as_millis());

        // a failed delete means the task is sent again next cycle; the server
        // treats that as a second log row
        if let Err(e) = self.buffer.remove(id) {
            warn!("relay: {} delivered but not removed: {}", id, e);
        }
        Delivery::Delivered(rtt)
    }

    /// Polls until `shutdown` flips to true (or its sender is dropped).
    /// Shutdown is only observed between cycles, never during a send.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "relay: worker started (buffer={}, interval={:?}, in_flight={})",
            self.buffer.root().display(),
            self.interval,
            self.max_in_flight
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.run_cycle().await;
            if !report.is_idle() {
                info!(
                    "relay: cycle pending={} delivered={} retained={} unreadable={}",
                    report.pending,
                    report.delivered.len(),
                    report.retained.len(),
                    report.unreadable.len()
                );
            }
            tokio::select! {
                _ = self.clock.sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("relay: worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scout_buffer::{CaptureSource, LoadedTask};
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct FakeTransport {
        failing: Arc<Mutex<HashSet<String>>>,
        down: Arc<Mutex<bool>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, task: &LoadedTask) -> Result<(), TransmissionFailure> {
            if *self.down.lock().unwrap() {
                return Err(TransmissionFailure::Network("connection refused".into()));
            }
            if self.failing.lock().unwrap().contains(&task.gps.frame) {
                return Err(TransmissionFailure::Status { status: 500, body: "boom".into() });
            }
            self.sent.lock().unwrap().push(task.gps.frame.clone());
            Ok(())
        }
    }

    /// Returns immediately and requests shutdown after `stop_after` sleeps.
    struct CountingClock {
        sleeps: Arc<AtomicUsize>,
        stop_after: usize,
        stop: watch::Sender<bool>,
    }

    #[async_trait]
    impl Clock for CountingClock {
        async fn sleep(&self, _d: Duration) {
            let n = self.sleeps.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.stop_after {
                let _ = self.stop.send(true);
            }
            tokio::task::yield_now().await;
        }
    }

    fn buffer_with(root: &Path, frames: &[&str]) -> CaptureBuffer {
        let buf = CaptureBuffer::open(root.join("buf")).unwrap();
        let src_dir = root.join("src");
        std::fs::create_dir_all(&src_dir).unwrap();
        for f in frames {
            let left = src_dir.join(format!("{f}_l.jpg"));
            let right = src_dir.join(format!("{f}_r.jpg"));
            std::fs::write(&left, b"L").unwrap();
            std::fs::write(&right, b"R").unwrap();
            let src = CaptureSource { frame_name: f.to_string(), lat: 48.84, lon: 2.30, left, right, mask: None };
            buf.enqueue(&src).unwrap();
        }
        buf
    }

    fn worker(buf: CaptureBuffer, t: FakeTransport) -> RelayWorker<FakeTransport, TokioClock> {
        RelayWorker::new(buf, t, TokioClock, Duration::from_millis(1), 1)
    }

    #[tokio::test]
    async fn delivered_tasks_are_removed_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let buf = buffer_with(tmp.path(), &["a", "b", "c"]);
        let t = FakeTransport::default();
        let mut w = worker(buf.clone(), t.clone());

        let report = w.run_cycle().await;
        assert_eq!(report.delivered, vec![TaskId(0), TaskId(1), TaskId(2)]);
        assert!(buf.list_pending().unwrap().is_empty());
        assert_eq!(*t.sent.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(w.link_health().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn failed_task_does_not_block_later_ones() {
        let tmp = tempfile::tempdir().unwrap();
        let buf = buffer_with(tmp.path(), &["a", "b", "c"]);
        let t = FakeTransport::default();
        t.failing.lock().unwrap().insert("b".into());
        let mut w = worker(buf.clone(), t.clone());

        let first = w.run_cycle().await;
        assert_eq!(first.delivered, vec![TaskId(0), TaskId(2)]);
        assert_eq!(first.retained, vec![TaskId(1)]);
        assert_eq!(buf.list_pending().unwrap(), vec![TaskId(1)]);

        t.failing.lock().unwrap().clear();
        let second = w.run_cycle().await;
        assert_eq!(second.delivered, vec![TaskId(1)]);
        assert!(buf.list_pending().unwrap().is_empty());
        assert_eq!(*t.sent.lock().unwrap(), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn unreachable_server_never_drops_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let buf = buffer_with(tmp.path(), &["a", "b"]);
        let t = FakeTransport::default();
        *t.down.lock().unwrap() = true;
        let mut w = worker(buf.clone(), t.clone());

        for _ in 0..5 {
            let r = w.run_cycle().await;
            assert!(r.delivered.is_empty());
        }
        assert_eq!(buf.list_pending().unwrap(), vec![TaskId(0), TaskId(1)]);
        assert_eq!(w.link_health().consecutive_failures, 10);
        assert_eq!(w.link_health().quality, 0);

        *t.down.lock().unwrap() = false;
        assert_eq!(w.run_cycle().await.delivered.len(), 2);
        assert_eq!(w.link_health().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn unreadable_task_is_left_for_inspection() {
        let tmp = tempfile::tempdir().unwrap();
        let buf = buffer_with(tmp.path(), &["a", "b"]);
        std::fs::write(buf.task_dir(TaskId(0)).join(scout_buffer::GPS_FILE), b"{not json").unwrap();
        let mut w = worker(buf.clone(), FakeTransport::default());

        let r = w.run_cycle().await;
        assert_eq!(r.unreadable, vec![TaskId(0)]);
        assert_eq!(r.delivered, vec![TaskId(1)]);
        assert_eq!(buf.list_pending().unwrap(), vec![TaskId(0)]);
    }

    #[tokio::test]
    async fn parallel_sends_still_deliver_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let buf = buffer_with(tmp.path(), &["a", "b", "c", "d", "e"]);
        let t = FakeTransport::default();
        let mut w = RelayWorker::new(buf.clone(), t.clone(), TokioClock, Duration::from_millis(1), 3);

        let r = w.run_cycle().await;
        assert_eq!(r.delivered, (0..5).map(TaskId).collect::<Vec<_>>());
        assert!(buf.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_between_cycles_on_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let buf = buffer_with(tmp.path(), &["a"]);
        let (tx, rx) = watch::channel(false);
        let sleeps = Arc::new(AtomicUsize::new(0));
        let clock = CountingClock { sleeps: sleeps.clone(), stop_after: 3, stop: tx };
        let t = FakeTransport::default();
        let mut w = RelayWorker::new(buf.clone(), t.clone(), clock, Duration::from_secs(3600), 1);

        tokio::time::timeout(Duration::from_secs(5), w.run(rx)).await.expect("loop did not stop");
        assert_eq!(sleeps.load(Ordering::SeqCst), 3);
        assert_eq!(*t.sent.lock().unwrap(), vec!["a"]);
        assert!(buf.list_pending().unwrap().is_empty());
    }

    #[test]
    fn config_defaults() {
        let cfg: RelayConfig = serde_json::from_str(r#"{"endpoint":"http://h:8888/upload"}"#).unwrap();
        assert_eq!(cfg.interval(), Duration::from_secs(2));
        assert_eq!(cfg.timeout_s, 15.0);
        assert_eq!(cfg.max_in_flight, 1);
        assert!(cfg.skip_tunnel_interstitial);
    }
}
