//! The autoscaled task pool.
//!
//! Two tickers drive the pool: a fast admission tick that decides whether to
//! start one more task, and a slow autoscale tick that moves the desired
//! concurrency up or down based on the long-window system verdict. Admission
//! uses the short-window verdict so a transient spike pauses intake without
//! shrinking the target.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use spindrift_monitoring::{SystemMonitor, SystemReport};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::ticker::Ticker;
use crate::work::TaskSource;

/// AutoscaledPool configuration.
#[derive(Debug, Clone)]
pub struct AutoscaledPoolConfig {
    /// Tasks the pool keeps running even while the system is overloaded.
    pub min_concurrency: usize,
    /// Hard upper bound on the desired concurrency.
    pub max_concurrency: usize,
    /// Starting target; defaults to `min_concurrency`.
    pub desired_concurrency: Option<usize>,
    /// Scale-up gate: only grow when the current concurrency has reached
    /// this fraction of the target (otherwise task supply, not capacity, is
    /// the bottleneck).
    pub desired_concurrency_ratio: f64,
    /// Fractional scale-up step, minimum one.
    pub scale_up_step_ratio: f64,
    /// Fractional scale-down step, minimum one.
    pub scale_down_step_ratio: f64,
    /// Admission tick cadence.
    pub maybe_run_interval: Duration,
    /// Autoscale tick cadence.
    pub autoscale_interval: Duration,
    /// Cadence of the periodic status log line; zero disables it.
    pub logging_interval: Duration,
}

impl Default for AutoscaledPoolConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 1000,
            desired_concurrency: None,
            desired_concurrency_ratio: 0.9,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            maybe_run_interval: Duration::from_millis(500),
            autoscale_interval: Duration::from_secs(10),
            logging_interval: Duration::from_secs(60),
        }
    }
}

impl AutoscaledPoolConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.min_concurrency == 0 {
            return Err(SchedulerError::config(
                "min_concurrency",
                "must be at least 1",
            ));
        }
        if self.max_concurrency < self.min_concurrency {
            return Err(SchedulerError::config(
                "max_concurrency",
                format!(
                    "{} is below min_concurrency {}",
                    self.max_concurrency, self.min_concurrency
                ),
            ));
        }
        if let Some(desired) = self.desired_concurrency {
            if desired < self.min_concurrency || desired > self.max_concurrency {
                return Err(SchedulerError::config(
                    "desired_concurrency",
                    format!(
                        "{desired} is outside [{}, {}]",
                        self.min_concurrency, self.max_concurrency
                    ),
                ));
            }
        }
        for (field, ratio) in [
            ("desired_concurrency_ratio", self.desired_concurrency_ratio),
            ("scale_up_step_ratio", self.scale_up_step_ratio),
            ("scale_down_step_ratio", self.scale_down_step_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(SchedulerError::config(
                    field,
                    format!("{ratio} is outside (0, 1]"),
                ));
            }
        }
        if self.maybe_run_interval.is_zero() {
            return Err(SchedulerError::config(
                "maybe_run_interval",
                "must be non-zero",
            ));
        }
        if self.autoscale_interval.is_zero() {
            return Err(SchedulerError::config(
                "autoscale_interval",
                "must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of the pool counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStateSnapshot {
    pub current_concurrency: usize,
    pub desired_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub is_stopped: bool,
}

#[derive(Debug)]
struct PoolState {
    desired_concurrency: usize,
    current_concurrency: usize,
    is_stopped: bool,
    querying_is_task_ready: bool,
    querying_is_finished: bool,
    finished: bool,
    running: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    config: AutoscaledPoolConfig,
    monitor: Arc<dyn SystemMonitor>,
    source: Arc<dyn TaskSource>,
    state: Mutex<PoolState>,
    first_error: Mutex<Option<SchedulerError>>,
    done: watch::Sender<bool>,
    drained: Notify,
    maybe_run_wake: Arc<Notify>,
    last_status_log: Mutex<Instant>,
}

/// Task scheduler that keeps the number of in-flight tasks close to an
/// autoscaled target.
pub struct AutoscaledPool {
    inner: Arc<Inner>,
}

impl AutoscaledPool {
    pub fn new(
        config: AutoscaledPoolConfig,
        monitor: Arc<dyn SystemMonitor>,
        source: Arc<dyn TaskSource>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let desired = config.desired_concurrency.unwrap_or(config.min_concurrency);
        let (done, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PoolState {
                    desired_concurrency: desired,
                    current_concurrency: 0,
                    is_stopped: false,
                    querying_is_task_ready: false,
                    querying_is_finished: false,
                    finished: false,
                    running: false,
                }),
                first_error: Mutex::new(None),
                done,
                drained: Notify::new(),
                maybe_run_wake: Arc::new(Notify::new()),
                last_status_log: Mutex::new(Instant::now()),
                config,
                monitor,
                source,
            }),
        })
    }

    /// Drive the pool until the work source reports finished (with all tasks
    /// drained), a caller error surfaces, or [`Self::abort`] is called.
    /// Returns the first caller error; subsequent ones are logged and
    /// discarded.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        {
            let mut state = lock(&self.inner.state);
            if state.running {
                return Err(SchedulerError::config("run", "pool is already running"));
            }
            state.running = true;
        }
        info!(
            min_concurrency = self.inner.config.min_concurrency,
            max_concurrency = self.inner.config.max_concurrency,
            desired_concurrency = lock(&self.inner.state).desired_concurrency,
            "autoscaled pool starting"
        );

        let admission = Ticker::spawn(
            self.inner.config.maybe_run_interval,
            Arc::clone(&self.inner.maybe_run_wake),
            {
                let inner = Arc::clone(&self.inner);
                move || Arc::clone(&inner).maybe_run_task()
            },
        );
        let autoscale = Ticker::spawn(
            self.inner.config.autoscale_interval,
            Arc::new(Notify::new()),
            {
                let inner = Arc::clone(&self.inner);
                move || {
                    let inner = Arc::clone(&inner);
                    async move { inner.autoscale() }
                }
            },
        );

        let mut done_rx = self.inner.done.subscribe();
        while !*done_rx.borrow_and_update() {
            if done_rx.changed().await.is_err() {
                break;
            }
        }

        admission.stop();
        autoscale.stop();

        match lock(&self.inner.first_error).take() {
            Some(error) => Err(error),
            None => {
                info!("autoscaled pool finished");
                Ok(())
            }
        }
    }

    /// Resolve [`Self::run`] immediately. In-flight tasks are not cancelled;
    /// they finish in the background.
    pub fn abort(&self) {
        lock(&self.inner.state).is_stopped = true;
        info!("autoscaled pool aborted");
        self.inner.resolve();
    }

    /// Stop admitting tasks and wait for the in-flight ones to drain.
    /// [`Self::run`] stays pending; [`Self::resume`] re-opens admission.
    pub async fn pause(&self, timeout: Option<Duration>) -> Result<(), SchedulerError> {
        lock(&self.inner.state).is_stopped = true;
        debug!("autoscaled pool pausing");

        let drained = async {
            loop {
                let notified = self.inner.drained.notified();
                if lock(&self.inner.state).current_concurrency == 0 {
                    return;
                }
                notified.await;
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, drained)
                .await
                .map_err(|_| SchedulerError::DrainTimeout { timeout: limit }),
            None => {
                drained.await;
                Ok(())
            }
        }
    }

    /// Re-open admission after [`Self::pause`].
    pub fn resume(&self) {
        lock(&self.inner.state).is_stopped = false;
        self.inner.maybe_run_wake.notify_one();
        debug!("autoscaled pool resumed");
    }

    pub fn current_concurrency(&self) -> usize {
        lock(&self.inner.state).current_concurrency
    }

    pub fn desired_concurrency(&self) -> usize {
        lock(&self.inner.state).desired_concurrency
    }

    pub fn state_snapshot(&self) -> PoolStateSnapshot {
        let state = lock(&self.inner.state);
        PoolStateSnapshot {
            current_concurrency: state.current_concurrency,
            desired_concurrency: state.desired_concurrency,
            min_concurrency: self.inner.config.min_concurrency,
            max_concurrency: self.inner.config.max_concurrency,
            is_stopped: state.is_stopped,
        }
    }
}

impl Inner {
    /// One admission tick: decide whether to start one more task.
    async fn maybe_run_task(self: Arc<Self>) {
        let above_min = {
            let state = lock(&self.state);
            if state.finished || state.is_stopped || state.querying_is_task_ready {
                return;
            }
            if state.current_concurrency >= state.desired_concurrency {
                return;
            }
            state.current_concurrency >= self.config.min_concurrency
        };
        // Below the minimum the pool admits even while overloaded, so it
        // cannot deadlock at zero.
        if above_min && !self.monitor.current_status().is_system_idle {
            return;
        }

        lock(&self.state).querying_is_task_ready = true;
        let ready = self.source.is_task_ready().await;
        lock(&self.state).querying_is_task_ready = false;

        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                self.record_error(SchedulerError::predicate("is_task_ready", e));
                return;
            }
        };
        if !ready {
            self.maybe_finish().await;
            return;
        }

        {
            let mut state = lock(&self.state);
            // conditions may have shifted while the ready query was in flight
            if state.finished || state.is_stopped {
                return;
            }
            if state.current_concurrency >= state.desired_concurrency {
                return;
            }
            state.current_concurrency += 1;
        }
        // Ramp as fast as readiness allows instead of waiting out the tick.
        self.maybe_run_wake.notify_one();

        let inner = Arc::clone(&self);
        tokio::spawn(async move {
            let result = inner.source.run_task().await;
            {
                let mut state = lock(&inner.state);
                state.current_concurrency -= 1;
                if state.current_concurrency == 0 {
                    inner.drained.notify_waiters();
                }
            }
            if let Err(e) = result {
                inner.record_error(SchedulerError::task(e));
            }
            inner.maybe_run_wake.notify_one();
        });
    }

    /// Ask the work source whether the pool is done. Single-flight, and only
    /// meaningful once every task has drained.
    async fn maybe_finish(&self) {
        {
            let mut state = lock(&self.state);
            if state.querying_is_finished || state.finished {
                return;
            }
            if state.current_concurrency > 0 {
                return;
            }
            state.querying_is_finished = true;
        }
        let finished = self.source.is_finished().await;
        lock(&self.state).querying_is_finished = false;

        match finished {
            Ok(true) => {
                debug!("work source reports finished, resolving run");
                self.resolve();
            }
            Ok(false) => {}
            Err(e) => self.record_error(SchedulerError::predicate("is_finished", e)),
        }
    }

    /// One autoscale tick over the long-window verdict.
    fn autoscale(&self) {
        let report = self.monitor.historical_status();
        let (current, desired) = {
            let mut state = lock(&self.state);
            if report.is_system_idle && state.desired_concurrency < self.config.max_concurrency {
                let gate = (state.desired_concurrency as f64 * self.config.desired_concurrency_ratio)
                    .floor() as usize;
                if state.current_concurrency >= gate {
                    let step = scale_step(state.desired_concurrency, self.config.scale_up_step_ratio);
                    state.desired_concurrency =
                        (state.desired_concurrency + step).min(self.config.max_concurrency);
                    debug!(
                        desired_concurrency = state.desired_concurrency,
                        "scaled up"
                    );
                }
            } else if !report.is_system_idle && state.desired_concurrency > self.config.min_concurrency
            {
                let step = scale_step(state.desired_concurrency, self.config.scale_down_step_ratio);
                state.desired_concurrency = state
                    .desired_concurrency
                    .saturating_sub(step)
                    .max(self.config.min_concurrency);
                debug!(
                    desired_concurrency = state.desired_concurrency,
                    "scaled down"
                );
            }
            (state.current_concurrency, state.desired_concurrency)
        };
        self.maybe_log_status(current, desired, &report);
    }

    fn maybe_log_status(&self, current: usize, desired: usize, report: &SystemReport) {
        if self.config.logging_interval.is_zero() {
            return;
        }
        let mut last = lock(&self.last_status_log);
        if last.elapsed() >= self.config.logging_interval {
            *last = Instant::now();
            info!(
                current_concurrency = current,
                desired_concurrency = desired,
                system_idle = report.is_system_idle,
                memory_ratio = report.memory.actual_ratio,
                event_loop_ratio = report.event_loop.actual_ratio,
                cpu_ratio = report.cpu.actual_ratio,
                client_ratio = report.client.actual_ratio,
                "autoscaled pool status"
            );
        }
    }

    /// Keep the first error for `run()`; log everything after it.
    fn record_error(&self, error: SchedulerError) {
        let mut slot = lock(&self.first_error);
        if slot.is_some() {
            warn!(error = %error, "pool already failing, discarding subsequent error");
            return;
        }
        warn!(error = %error, "pool failing, surfacing first error through run");
        *slot = Some(error);
        drop(slot);
        // Stop admitting; tasks already in flight continue in the background.
        lock(&self.state).is_stopped = true;
        self.resolve();
    }

    fn resolve(&self) {
        lock(&self.state).finished = true;
        // send_replace stores the value even when run() has not subscribed
        // yet, so an abort can never be lost.
        self.done.send_replace(true);
    }
}

fn scale_step(desired: usize, ratio: f64) -> usize {
    ((desired as f64 * ratio).ceil() as usize).max(1)
}
