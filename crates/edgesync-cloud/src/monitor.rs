use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{
    Duration,
    Instant,
};

use chrono::{
    DateTime,
    Utc,
};
use log::{
    info,
    warn,
};
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOp {
    Poll,
    Report,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Degraded,
    Offline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Online,
    Degraded,
    Offline,
}

#[derive(Clone, Debug)]
pub struct MonitorOptions {
    /// Consecutive failures (of any op) before online degrades.
    pub degraded_threshold: u32,
    /// How long failures may continue in the degraded state before the
    /// device is considered offline. 60s, the top of the sensible range:
    /// a flaky uplink should not flap the offline flag.
    pub grace_period: Duration,
    /// Rolling window length for per-op success rates.
    pub window: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            degraded_threshold: 3,
            grace_period: Duration::from_secs(60),
            window: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub offline_duration: Duration,
    pub poll_success_rate: f64,
    pub report_success_rate: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct OpStats {
    window: VecDeque<bool>,
}

impl OpStats {
    fn record(&mut self, success: bool, window: usize) {
        self.window.push_back(success);
        while self.window.len() > window {
            self.window.pop_front();
        }
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let successes = self.window.iter().filter(|s| **s).count();
        successes as f64 / self.window.len() as f64
    }
}

#[derive(Debug)]
struct Inner {
    poll: OpStats,
    report: OpStats,
    status: ConnectionStatus,
    consecutive_failures: u32,
    degraded_since: Option<Instant>,
    offline_since: Option<Instant>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

/// Tracks poll/report outcomes and drives the online/degraded/offline
/// state machine. Transitions are broadcast so the sync engine (and only
/// the listeners it registered) can react.
pub struct ConnectionMonitor {
    options: MonitorOptions,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionMonitor {
    pub fn new(options: MonitorOptions) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            options,
            inner: Mutex::new(Inner {
                poll: OpStats::default(),
                report: OpStats::default(),
                status: ConnectionStatus::Online,
                consecutive_failures: 0,
                degraded_since: None,
                offline_since: None,
                last_success: None,
                last_failure: None,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn mark_success(&self, op: SyncOp) {
        let mut inner = self.lock();
        match op {
            SyncOp::Poll => inner.poll.record(true, self.options.window),
            SyncOp::Report => inner.report.record(true, self.options.window),
        }
        inner.consecutive_failures = 0;
        inner.last_success = Some(Utc::now());

        if inner.status != ConnectionStatus::Online {
            info!("Connection recovered; back online");
            inner.status = ConnectionStatus::Online;
            inner.degraded_since = None;
            inner.offline_since = None;
            let _ = self.events.send(ConnectionEvent::Online);
        }
    }

    pub fn mark_failure(&self, op: SyncOp) {
        let mut inner = self.lock();
        match op {
            SyncOp::Poll => inner.poll.record(false, self.options.window),
            SyncOp::Report => inner.report.record(false, self.options.window),
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Utc::now());

        match inner.status {
            ConnectionStatus::Online => {
                if inner.consecutive_failures >= self.options.degraded_threshold {
                    warn!(
                        "Connection degraded after {} consecutive failures",
                        inner.consecutive_failures
                    );
                    inner.status = ConnectionStatus::Degraded;
                    inner.degraded_since = Some(Instant::now());
                    let _ = self.events.send(ConnectionEvent::Degraded);
                }
            }
            ConnectionStatus::Degraded => {
                let degraded_for = inner
                    .degraded_since
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if degraded_for >= self.options.grace_period {
                    warn!(
                        "Connection offline; failures persisted for {:.0}s",
                        degraded_for.as_secs_f64()
                    );
                    inner.status = ConnectionStatus::Offline;
                    inner.offline_since = Some(Instant::now());
                    let _ = self.events.send(ConnectionEvent::Offline);
                }
            }
            ConnectionStatus::Offline => {}
        }
    }

    pub fn is_online(&self) -> bool {
        self.lock().status == ConnectionStatus::Online
    }

    pub fn health(&self) -> ConnectionHealth {
        let inner = self.lock();
        let offline_duration = match (inner.status, inner.offline_since) {
            (ConnectionStatus::Offline, Some(at)) => at.elapsed(),
            _ => Duration::ZERO,
        };

        ConnectionHealth {
            status: inner.status,
            offline_duration,
            poll_success_rate: inner.poll.success_rate(),
            report_success_rate: inner.report.success_rate(),
            last_success: inner.last_success,
            last_failure: inner.last_failure,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(MonitorOptions::default())
    }
}
