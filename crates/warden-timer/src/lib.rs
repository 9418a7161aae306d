//! Background expiry timer for Warden.
//!
//! One [`ExpiryTimer`] drives every session timeout in a registry. It is
//! a single Tokio task that owns an ordered queue of deadlines and sleeps
//! until the earliest one. Callers talk to it through a cheap, cloneable
//! handle; expired payloads come out of a channel returned by
//! [`ExpiryTimer::spawn`].
//!
//! # Why a single task
//!
//! Session refreshes happen on every request. Re-arming must cost no
//! more than a channel send, and must never block the caller on the
//! timer's own bookkeeping. Firing happens on the timer task, so the
//! consumer of the expired channel is free to take whatever locks it
//! needs without risking an inversion with the caller that re-armed.
//!
//! # Integration
//!
//! ```ignore
//! let (timer, mut expired) = ExpiryTimer::spawn(TimerConfig::default());
//! let key = timer.schedule(Duration::from_secs(30), session_id)?;
//! timer.reschedule(key, Duration::from_secs(30))?; // on activity
//!
//! while let Some(fired) = expired.recv().await {
//!     registry.expire(fired.payload).await;
//! }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for an [`ExpiryTimer`].
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Name used in log output, to tell several timers apart.
    pub name: String,
    /// A warning is logged when a timer fires later than this.
    /// Late fires mean the runtime is starved.
    pub late_warn_threshold: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            name: "expiry".to_string(),
            late_warn_threshold: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Keys, errors, fired entries
// ---------------------------------------------------------------------------

/// Identifies one scheduled timer. Unique per [`ExpiryTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(u64);

impl TimerKey {
    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Errors returned by the timer handle.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// The timer task has stopped (shut down, or its consumer went away).
    #[error("expiry timer '{0}' is not running")]
    Stopped(String),
}

/// A payload whose deadline has passed.
#[derive(Debug)]
pub struct Expired<T> {
    /// The key it was scheduled under.
    pub key: TimerKey,
    /// What the caller handed to [`ExpiryTimer::schedule`].
    pub payload: T,
    /// How far past its deadline it was delivered.
    pub late_by: Duration,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Snapshot of timer activity counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerMetrics {
    /// Timers ever scheduled.
    pub scheduled: u64,
    /// Re-arm requests applied.
    pub rescheduled: u64,
    /// Timers cancelled before firing.
    pub cancelled: u64,
    /// Timers that fired.
    pub fired: u64,
    /// Timers currently waiting.
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    rescheduled: AtomicU64,
    cancelled: AtomicU64,
    fired: AtomicU64,
    pending: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> TimerMetrics {
        TimerMetrics {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command<T> {
    Schedule {
        key: TimerKey,
        deadline: Instant,
        payload: T,
    },
    Reschedule {
        key: TimerKey,
        deadline: Instant,
    },
    Cancel {
        key: TimerKey,
    },
    Shutdown,
}

/// Handle to a running expiry timer task.
///
/// Cloning is cheap; every clone talks to the same task.
pub struct ExpiryTimer<T> {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command<T>>,
    next_key: Arc<AtomicU64>,
    counters: Arc<Counters>,
}

impl<T> Clone for ExpiryTimer<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            commands: self.commands.clone(),
            next_key: Arc::clone(&self.next_key),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<T: Send + 'static> ExpiryTimer<T> {
    /// Spawns the timer task on the current Tokio runtime.
    ///
    /// Returns the handle and the channel on which expired payloads are
    /// delivered. Dropping the receiver stops the timer.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime, like `tokio::spawn`.
    pub fn spawn(config: TimerConfig) -> (Self, mpsc::UnboundedReceiver<Expired<T>>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let name: Arc<str> = Arc::from(config.name.as_str());

        let task = TimerTask {
            config,
            entries: HashMap::new(),
            queue: BTreeSet::new(),
            commands: command_rx,
            expired: expired_tx,
            counters: Arc::clone(&counters),
        };
        tokio::spawn(task.run());

        let handle = Self {
            name,
            commands: command_tx,
            next_key: Arc::new(AtomicU64::new(1)),
            counters,
        };
        (handle, expired_rx)
    }

    /// Schedules `payload` to be delivered after `after` has elapsed.
    pub fn schedule(&self, after: Duration, payload: T) -> Result<TimerKey, TimerError> {
        self.schedule_at(Instant::now() + after, payload)
    }

    /// Schedules `payload` for an absolute deadline.
    pub fn schedule_at(&self, deadline: Instant, payload: T) -> Result<TimerKey, TimerError> {
        let key = TimerKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.send(Command::Schedule {
            key,
            deadline,
            payload,
        })?;
        Ok(key)
    }

    /// Moves an existing timer to fire `after` from now.
    ///
    /// A key that already fired or was cancelled is ignored by the task.
    pub fn reschedule(&self, key: TimerKey, after: Duration) -> Result<(), TimerError> {
        self.send(Command::Reschedule {
            key,
            deadline: Instant::now() + after,
        })
    }

    /// Cancels a timer. Unknown keys are ignored.
    pub fn cancel(&self, key: TimerKey) -> Result<(), TimerError> {
        self.send(Command::Cancel { key })
    }

    /// Stops the timer task. Pending timers are dropped without firing.
    pub fn shutdown(&self) {
        // A closed channel means the task is already gone.
        let _ = self.commands.send(Command::Shutdown);
    }

    /// `true` while the timer task is accepting commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Snapshot of the activity counters.
    pub fn metrics(&self) -> TimerMetrics {
        self.counters.snapshot()
    }

    fn send(&self, command: Command<T>) -> Result<(), TimerError> {
        self.commands
            .send(command)
            .map_err(|_| TimerError::Stopped(self.name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The state owned by the timer task.
struct TimerTask<T> {
    config: TimerConfig,
    /// Deadline and payload per live key.
    entries: HashMap<TimerKey, (Instant, T)>,
    /// Deadlines in firing order. Mirrors `entries`.
    queue: BTreeSet<(Instant, TimerKey)>,
    commands: mpsc::UnboundedReceiver<Command<T>>,
    expired: mpsc::UnboundedSender<Expired<T>>,
    counters: Arc<Counters>,
}

impl<T: Send + 'static> TimerTask<T> {
    async fn run(mut self) {
        debug!(timer = %self.config.name, "expiry timer started");

        loop {
            let next = self.queue.first().map(|(deadline, _)| *deadline);

            tokio::select! {
                // Commands first: a re-arm that arrives together with the
                // old deadline must win.
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.apply(command),
                },
                _ = sleep_until(next) => {
                    if !self.fire_due() {
                        debug!(timer = %self.config.name, "expired receiver dropped");
                        break;
                    }
                }
            }
        }

        self.counters.pending.store(0, Ordering::Relaxed);
        debug!(
            timer = %self.config.name,
            dropped = self.entries.len(),
            "expiry timer stopped"
        );
    }

    fn apply(&mut self, command: Command<T>) {
        match command {
            Command::Schedule {
                key,
                deadline,
                payload,
            } => {
                self.queue.insert((deadline, key));
                self.entries.insert(key, (deadline, payload));
                self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
                trace!(timer = %self.config.name, %key, "scheduled");
            }
            Command::Reschedule { key, deadline } => {
                if let Some(entry) = self.entries.get_mut(&key) {
                    self.queue.remove(&(entry.0, key));
                    entry.0 = deadline;
                    self.queue.insert((deadline, key));
                    self.counters.rescheduled.fetch_add(1, Ordering::Relaxed);
                    trace!(timer = %self.config.name, %key, "rescheduled");
                }
            }
            Command::Cancel { key } => {
                if let Some((deadline, _)) = self.entries.remove(&key) {
                    self.queue.remove(&(deadline, key));
                    self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    trace!(timer = %self.config.name, %key, "cancelled");
                }
            }
            Command::Shutdown => {}
        }
        self.counters.pending.store(self.entries.len(), Ordering::Relaxed);
    }

    /// Delivers everything that is due. Returns `false` once nobody is
    /// listening any more.
    fn fire_due(&mut self) -> bool {
        let now = Instant::now();

        while let Some(&(deadline, key)) = self.queue.first() {
            if deadline > now {
                break;
            }
            self.queue.pop_first();
            let Some((_, payload)) = self.entries.remove(&key) else {
                continue;
            };

            let late_by = now.saturating_duration_since(deadline);
            if late_by > self.config.late_warn_threshold {
                warn!(
                    timer = %self.config.name,
                    %key,
                    late_ms = late_by.as_secs_f64() * 1000.0,
                    "timer fired late"
                );
            }

            self.counters.fired.fetch_add(1, Ordering::Relaxed);
            self.counters.pending.store(self.entries.len(), Ordering::Relaxed);
            trace!(timer = %self.config.name, %key, "fired");

            if self
                .expired
                .send(Expired {
                    key,
                    payload,
                    late_by,
                })
                .is_err()
            {
                return false;
            }
        }
        true
    }
}

/// Sleeps until `deadline`, or forever when there is nothing to wait for.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
