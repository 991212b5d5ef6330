//! Recurring background tasks
//!
//! Timers are modelled as a [`Schedule`] of named tasks with an interval and a
//! next-run instant. The runtime loop ticks once per second, asks the schedule
//! which tasks are due under the injected [`Clock`], and hands them to a
//! [`TaskRunner`]. Tests drive the schedule with a [`ManualClock`] instead of
//! waiting on real timers.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Expiry sweep cadence.
pub const SWEEP_INTERVAL_SECS: i64 = 30;
/// How often the daily auto-post time is checked.
pub const DAILY_CHECK_INTERVAL_SECS: i64 = 60;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    ExpirySweep,
    LeaderboardRefresh,
    DailyAutoPost,
}

#[derive(Debug, Clone)]
pub struct RecurringTask {
    pub kind: TaskKind,
    pub interval: Duration,
    pub next_run: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Schedule {
    tasks: Vec<RecurringTask>,
}

impl Schedule {
    /// The three engine timers, each first due one interval after `now`.
    pub fn standard(refresh_interval_secs: u64, now: DateTime<Utc>) -> Self {
        let mut schedule = Self::default();
        schedule.add(
            TaskKind::ExpirySweep,
            Duration::seconds(SWEEP_INTERVAL_SECS),
            now,
        );
        schedule.add(
            TaskKind::LeaderboardRefresh,
            Duration::seconds(refresh_interval_secs as i64),
            now,
        );
        schedule.add(
            TaskKind::DailyAutoPost,
            Duration::seconds(DAILY_CHECK_INTERVAL_SECS),
            now,
        );
        schedule
    }

    pub fn add(&mut self, kind: TaskKind, interval: Duration, now: DateTime<Utc>) {
        self.tasks.retain(|t| t.kind != kind);
        self.tasks.push(RecurringTask {
            kind,
            interval,
            next_run: now + interval,
        });
    }

    /// Replace a task's interval and restart its countdown from `now`.
    pub fn reschedule(&mut self, kind: TaskKind, interval: Duration, now: DateTime<Utc>) {
        self.add(kind, interval, now);
    }

    pub fn interval_of(&self, kind: TaskKind) -> Option<Duration> {
        self.tasks
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.interval)
    }

    /// Tasks due at `now`. Each due task runs once even if several intervals
    /// were missed, and its next run is counted from `now`.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<TaskKind> {
        let mut due = Vec::new();
        for task in self.tasks.iter_mut() {
            if task.next_run <= now {
                due.push(task.kind);
                task.next_run = now + task.interval;
            }
        }
        due
    }
}

/// Schedule plus the clock that drives it.
pub struct Scheduler {
    schedule: Mutex<Schedule>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(schedule: Schedule, clock: Arc<dyn Clock>) -> Self {
        Self {
            schedule: Mutex::new(schedule),
            clock,
        }
    }

    pub fn take_due(&self) -> Vec<TaskKind> {
        let now = self.clock.now();
        self.schedule.lock().take_due(now)
    }

    pub fn reschedule(&self, kind: TaskKind, interval: Duration) {
        let now = self.clock.now();
        self.schedule.lock().reschedule(kind, interval, now);
    }

    pub fn interval_of(&self, kind: TaskKind) -> Option<Duration> {
        self.schedule.lock().interval_of(kind)
    }
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, kind: TaskKind);
}

/// Broadcasts a stop signal to every background loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Background loops spawned against one [`ShutdownHandle`].
pub struct BackgroundTasks {
    shutdown: ShutdownHandle,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn new(shutdown: ShutdownHandle) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push((name, tokio::spawn(task)));
    }

    /// Signal every loop and wait until each has returned.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        for (name, handle) in self.handles {
            match handle.await {
                Ok(()) => debug!("{} stopped", name),
                Err(e) => error!("{} task failed: {}", name, e),
            }
        }
    }
}

/// Tick once per second until shutdown, running whatever is due.
pub async fn run_loop(
    scheduler: Arc<Scheduler>,
    runner: Arc<dyn TaskRunner>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("Scheduler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for kind in scheduler.take_due() {
                    debug!("Running {:?}", kind);
                    runner.run_task(kind).await;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Scheduler stopped");
}
