//! Adaptive execution throttler
//!
//! Debounces normal-priority requests with a delay that follows recent run
//! durations, lets the newest normal request supersede an older queued one, and
//! keeps at most one job in flight.

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

/// Throttler tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "ThrottleConfig::default_min_delay", with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(default = "ThrottleConfig::default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Share of the average run duration added to the delay
    #[serde(default = "ThrottleConfig::default_weight")]
    pub duration_weight: f64,
    /// Number of recent durations averaged
    #[serde(default = "ThrottleConfig::default_window")]
    pub window: usize,
}

impl ThrottleConfig {
    fn default_min_delay() -> Duration {
        Duration::from_millis(50)
    }

    fn default_max_delay() -> Duration {
        Duration::from_secs(1)
    }

    fn default_weight() -> f64 {
        0.5
    }

    fn default_window() -> usize {
        20
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_delay: Self::default_min_delay(),
            max_delay: Self::default_max_delay(),
            duration_weight: Self::default_weight(),
            window: Self::default_window(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrottleError {
    #[error("Superseded by a newer request")]
    Superseded,
    #[error("Throttler is shut down")]
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThrottleStats {
    pub scheduled: u64,
    pub executed: u64,
    pub superseded: u64,
    pub high_priority: u64,
    pub current_delay_ms: u64,
    pub in_flight: bool,
}

trait Runnable: Send {
    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;
    fn reject(self: Box<Self>, err: ThrottleError);
}

struct Task<F, T> {
    job: F,
    tx: oneshot::Sender<Result<T, ThrottleError>>,
}

impl<F, Fut, T> Runnable for Task<F, T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Task { job, tx } = *self;
        async move {
            let output = job().await;
            let _ = tx.send(Ok(output));
        }
        .boxed()
    }

    fn reject(self: Box<Self>, err: ThrottleError) {
        let _ = self.tx.send(Err(err));
    }
}

struct ThrottleEntry {
    id: String,
    priority: Priority,
    task: Box<dyn Runnable>,
    enqueued_at: Instant,
}

struct QueuedNormal {
    generation: u64,
    ready_at: Instant,
    entry: ThrottleEntry,
}

struct ThrottleState {
    running: Option<String>,
    pending_normal: Option<QueuedNormal>,
    pending_high: VecDeque<ThrottleEntry>,
    durations: VecDeque<Duration>,
    generation: u64,
    closed: bool,
    stats: ThrottleStats,
}

impl ThrottleState {
    fn record(&mut self, elapsed: Duration, window: usize) {
        self.durations.push_back(elapsed);
        while self.durations.len() > window {
            self.durations.pop_front();
        }
    }
}

struct Inner {
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
}

/// Debounces and serializes executions
#[derive(Clone)]
pub struct Throttler {
    inner: Arc<Inner>,
}

impl Throttler {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ThrottleState {
                    running: None,
                    pending_normal: None,
                    pending_high: VecDeque::new(),
                    durations: VecDeque::new(),
                    generation: 0,
                    closed: false,
                    stats: ThrottleStats::default(),
                }),
            }),
        }
    }

    /// Queue `job` and wait for its output.
    ///
    /// Normal-priority jobs wait out the adaptive delay and are superseded by
    /// any newer normal job queued before they start. High-priority jobs skip
    /// the delay and are never superseded.
    pub async fn schedule<F, Fut, T>(
        &self,
        id: impl Into<String>,
        priority: Priority,
        job: F,
    ) -> Result<T, ThrottleError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let entry = ThrottleEntry {
            id: id.into(),
            priority,
            task: Box::new(Task { job, tx }),
            enqueued_at: Instant::now(),
        };
        self.enqueue(entry).await;
        rx.await.unwrap_or(Err(ThrottleError::Shutdown))
    }

    async fn enqueue(&self, entry: ThrottleEntry) {
        let mut st = self.inner.state.lock().await;
        if st.closed {
            entry.task.reject(ThrottleError::Shutdown);
            return;
        }
        st.stats.scheduled += 1;

        match entry.priority {
            Priority::High => {
                st.stats.high_priority += 1;
                tracing::debug!(id = %entry.id, "Scheduling high-priority execution");
                st.pending_high.push_back(entry);
            }
            Priority::Normal => {
                if let Some(old) = st.pending_normal.take() {
                    st.stats.superseded += 1;
                    tracing::debug!(
                        superseded = %old.entry.id,
                        by = %entry.id,
                        "Queued execution superseded"
                    );
                    old.entry.task.reject(ThrottleError::Superseded);
                }
                let delay = compute_delay(&self.inner.config, &st.durations);
                st.generation += 1;
                let generation = st.generation;
                tracing::trace!(id = %entry.id, delay_ms = delay.as_millis() as u64, "Debouncing execution");
                st.pending_normal = Some(QueuedNormal {
                    generation,
                    ready_at: entry.enqueued_at + delay,
                    entry,
                });

                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut st = inner.state.lock().await;
                    let still_queued = st
                        .pending_normal
                        .as_ref()
                        .is_some_and(|q| q.generation == generation);
                    if still_queued {
                        pump(&inner, &mut st);
                    }
                });
            }
        }

        pump(&self.inner, &mut st);
    }

    /// Delay a normal-priority job scheduled now would wait
    pub async fn current_delay(&self) -> Duration {
        let st = self.inner.state.lock().await;
        compute_delay(&self.inner.config, &st.durations)
    }

    pub async fn stats(&self) -> ThrottleStats {
        let st = self.inner.state.lock().await;
        let mut stats = st.stats;
        stats.current_delay_ms = compute_delay(&self.inner.config, &st.durations).as_millis() as u64;
        stats.in_flight = st.running.is_some();
        stats
    }

    /// Reject everything still queued; the running job is left to finish.
    pub async fn shutdown(&self) {
        let mut st = self.inner.state.lock().await;
        st.closed = true;
        if let Some(queued) = st.pending_normal.take() {
            queued.entry.task.reject(ThrottleError::Shutdown);
        }
        for entry in st.pending_high.drain(..) {
            entry.task.reject(ThrottleError::Shutdown);
        }
    }
}

/// `clamp(min + avg * weight, min, max)` over the recorded window
fn compute_delay(config: &ThrottleConfig, durations: &VecDeque<Duration>) -> Duration {
    let avg = if durations.is_empty() {
        Duration::ZERO
    } else {
        durations.iter().sum::<Duration>() / durations.len() as u32
    };
    let weight = config.duration_weight.max(0.0);
    let extra = avg.mul_f64(weight);
    (config.min_delay + extra).clamp(config.min_delay, config.max_delay.max(config.min_delay))
}

/// Start the next eligible job if the slot is free. Caller holds the lock.
fn pump(inner: &Arc<Inner>, st: &mut ThrottleState) {
    if st.running.is_some() || st.closed {
        return;
    }

    let next = if let Some(entry) = st.pending_high.pop_front() {
        Some(entry)
    } else if st
        .pending_normal
        .as_ref()
        .is_some_and(|q| q.ready_at <= Instant::now())
    {
        st.pending_normal.take().map(|q| q.entry)
    } else {
        None
    };

    let Some(entry) = next else {
        return;
    };

    st.running = Some(entry.id.clone());
    st.stats.executed += 1;
    tracing::debug!(
        id = %entry.id,
        priority = ?entry.priority,
        waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
        "Starting throttled execution"
    );

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let started = Instant::now();
        if AssertUnwindSafe(entry.task.run()).catch_unwind().await.is_err() {
            tracing::error!(id = %entry.id, "Throttled execution panicked");
        }
        let elapsed = started.elapsed();

        let mut st = inner.state.lock().await;
        st.running = None;
        st.record(elapsed, inner.config.window.max(1));
        pump(&inner, &mut st);
    });
}
