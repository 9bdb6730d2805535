//! The browser instance pool.
//!
//! Instances move through `Launching → Active → Retired → Killed`. A page
//! quota retires an instance (it keeps serving open pages, takes no new
//! ones); a retired instance is killed the moment it drains, and a periodic
//! sweep reaps the ones that went idle or stopped answering. Teardown is
//! graceful-then-forceful: ask the browser to close, and terminate the OS
//! process if it does not comply within the kill timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::HeadlessError;
use crate::handle::{BrowserHandle, BrowserLauncher, LaunchOptions, PageHandle};

/// BrowserPool configuration.
#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    /// Page quota per instance: caps concurrently open pages and, once the
    /// cumulative count reaches it, retires the instance.
    pub max_pages_per_instance: u64,
    /// A retired instance that has not opened a page for this long is killed
    /// regardless of what it still holds.
    pub kill_instance_after: Duration,
    /// Sweep cadence.
    pub instance_killer_interval: Duration,
    /// Budget for a graceful close before the process is terminated.
    pub process_kill_timeout: Duration,
    /// Passed through to the launcher for every instance.
    pub launch_options: LaunchOptions,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            max_pages_per_instance: 50,
            kill_instance_after: Duration::from_secs(300),
            instance_killer_interval: Duration::from_secs(60),
            process_kill_timeout: Duration::from_secs(5),
            launch_options: LaunchOptions::default(),
        }
    }
}

impl BrowserPoolConfig {
    pub fn validate(&self) -> Result<(), HeadlessError> {
        if self.max_pages_per_instance == 0 {
            return Err(HeadlessError::config(
                "max_pages_per_instance",
                "must be at least 1",
            ));
        }
        if self.kill_instance_after.is_zero() {
            return Err(HeadlessError::config(
                "kill_instance_after",
                "must be non-zero",
            ));
        }
        if self.instance_killer_interval.is_zero() {
            return Err(HeadlessError::config(
                "instance_killer_interval",
                "must be non-zero",
            ));
        }
        if self.process_kill_timeout.is_zero() {
            return Err(HeadlessError::config(
                "process_kill_timeout",
                "must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Counters over both instance maps.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BrowserPoolStats {
    pub active_instances: usize,
    pub retired_instances: usize,
    pub open_pages: u64,
    pub pages_opened_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum InstanceState {
    Launching,
    Active,
    Retired,
    Killed,
}

type SharedHandshake =
    Shared<BoxFuture<'static, Result<Arc<dyn BrowserHandle>, Arc<HeadlessError>>>>;

struct Instance {
    id: u64,
    state: InstanceState,
    active_pages: u64,
    total_pages_ever: u64,
    last_page_opened_at: Instant,
    handshake: SharedHandshake,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("active_pages", &self.active_pages)
            .field("total_pages_ever", &self.total_pages_ever)
            .finish()
    }
}

#[derive(Default)]
struct Maps {
    active: HashMap<u64, Instance>,
    retired: HashMap<u64, Instance>,
}

/// Internal lifecycle notifications, processed in order by the supervisor.
enum PoolSignal {
    Launched { instance_id: u64 },
    LaunchFailed { instance_id: u64 },
    Disconnected { instance_id: u64 },
    PageClosed { instance_id: u64 },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PoolInner {
    config: BrowserPoolConfig,
    launcher: Arc<dyn BrowserLauncher>,
    maps: Mutex<Maps>,
    signals: mpsc::UnboundedSender<PoolSignal>,
    next_instance_id: AtomicU64,
    destroyed: AtomicBool,
}

/// Pool of browser subprocesses with per-instance page quotas, retirement
/// and supervised teardown.
pub struct BrowserPool {
    inner: Arc<PoolInner>,
    supervisor: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl BrowserPool {
    pub fn new(
        config: BrowserPoolConfig,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self, HeadlessError> {
        config.validate()?;
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            config,
            launcher,
            maps: Mutex::new(Maps::default()),
            signals,
            next_instance_id: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        });

        let supervisor = tokio::spawn(supervise(Arc::clone(&inner), signal_rx));
        let sweeper = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                loop {
                    tokio::time::sleep(inner.config.instance_killer_interval).await;
                    inner.sweep().await;
                }
            }
        });

        Ok(Self {
            inner,
            supervisor,
            sweeper,
        })
    }

    /// Open a page on an instance with remaining quota, launching a fresh
    /// browser when none has room. The returned lease reports the page back
    /// to the pool when closed or dropped.
    pub async fn new_page(&self) -> Result<PageLease, HeadlessError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(HeadlessError::Destroyed);
        }

        let (instance_id, handshake, retire_now) = {
            let mut maps = lock(&self.inner.maps);
            let picked = maps
                .active
                .values()
                .find(|i| i.active_pages < self.inner.config.max_pages_per_instance)
                .map(|i| i.id);
            let id = match picked {
                Some(id) => id,
                None => {
                    let id = self.inner.next_instance_id.fetch_add(1, Ordering::SeqCst);
                    debug!(instance_id = id, "no instance has page capacity, launching");
                    let handshake = launch_handshake(
                        Arc::clone(&self.inner.launcher),
                        self.inner.config.launch_options.clone(),
                        self.inner.signals.clone(),
                        id,
                    );
                    maps.active.insert(
                        id,
                        Instance {
                            id,
                            state: InstanceState::Launching,
                            active_pages: 0,
                            total_pages_ever: 0,
                            last_page_opened_at: Instant::now(),
                            handshake,
                        },
                    );
                    id
                }
            };
            let Some(instance) = maps.active.get_mut(&id) else {
                return Err(HeadlessError::Other(
                    "instance vanished during page reservation".into(),
                ));
            };
            instance.active_pages += 1;
            instance.total_pages_ever += 1;
            instance.last_page_opened_at = Instant::now();
            let retire_now =
                instance.total_pages_ever >= self.inner.config.max_pages_per_instance;
            (id, instance.handshake.clone(), retire_now)
        };

        if retire_now {
            // The caller still gets this page; the instance just stops
            // taking new ones.
            self.inner.retire(instance_id);
        }

        let handle = match handshake.await {
            Ok(handle) => handle,
            Err(e) => {
                // The handshake already retired the slot; give the
                // reservation back so the carcass can drain.
                let _ = self.inner.signals.send(PoolSignal::PageClosed { instance_id });
                return Err(match e.as_ref() {
                    HeadlessError::Launch(message) => HeadlessError::Launch(message.clone()),
                    other => HeadlessError::Launch(other.to_string()),
                });
            }
        };

        match handle.new_page().await {
            Ok(page) => Ok(PageLease {
                page,
                instance_id,
                signals: self.inner.signals.clone(),
                released: false,
            }),
            Err(e) => {
                warn!(instance_id, error = %e, "page creation failed, retiring instance");
                self.inner.retire(instance_id);
                let _ = self.inner.signals.send(PoolSignal::PageClosed { instance_id });
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> BrowserPoolStats {
        let maps = lock(&self.inner.maps);
        let all = maps.active.values().chain(maps.retired.values());
        let (mut open_pages, mut pages_opened_total) = (0, 0);
        for instance in all {
            open_pages += instance.active_pages;
            pages_opened_total += instance.total_pages_ever;
        }
        BrowserPoolStats {
            active_instances: maps.active.len(),
            retired_instances: maps.retired.len(),
            open_pages,
            pages_opened_total,
        }
    }

    /// Tear the whole pool down: stop the sweep, then close every instance
    /// in parallel, forcing the ones that hang.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("destroying browser pool");
        self.sweeper.abort();

        let doomed: Vec<Instance> = {
            let mut maps = lock(&self.inner.maps);
            let active: Vec<Instance> = maps.active.drain().map(|(_, instance)| instance).collect();
            let retired: Vec<Instance> = maps.retired.drain().map(|(_, instance)| instance).collect();
            active.into_iter().chain(retired).collect()
        };
        let kill_timeout = self.inner.config.process_kill_timeout;
        futures::future::join_all(
            doomed
                .into_iter()
                .map(|instance| teardown(instance, kill_timeout)),
        )
        .await;
        info!("browser pool destroyed");
    }
}

impl Drop for BrowserPool {
    fn drop(&mut self) {
        self.supervisor.abort();
        self.sweeper.abort();
    }
}

impl PoolInner {
    /// Move an instance out of rotation. It keeps serving its open pages; a
    /// drained instance is killed on the spot.
    fn retire(&self, instance_id: u64) {
        let drained = {
            let mut maps = lock(&self.maps);
            let Some(mut instance) = maps.active.remove(&instance_id) else {
                return;
            };
            instance.state = InstanceState::Retired;
            info!(
                instance_id,
                total_pages = instance.total_pages_ever,
                "browser instance retired"
            );
            let drained = instance.active_pages == 0;
            maps.retired.insert(instance_id, instance);
            drained
        };
        if drained {
            self.kill(instance_id);
        }
    }

    /// Remove a retired instance and tear its browser down in the
    /// background. Teardown failures are logged, never resurrected: the pool
    /// must not leak an entry even if it leaks a process.
    fn kill(&self, instance_id: u64) {
        let Some(instance) = lock(&self.maps).retired.remove(&instance_id) else {
            return;
        };
        info!(instance_id, "killing browser instance");
        let kill_timeout = self.config.process_kill_timeout;
        tokio::spawn(teardown(instance, kill_timeout));
    }

    fn page_closed(&self, instance_id: u64) {
        let kill_now = {
            let mut maps = lock(&self.maps);
            if let Some(instance) = maps.active.get_mut(&instance_id) {
                instance.active_pages = instance.active_pages.saturating_sub(1);
                false
            } else if let Some(instance) = maps.retired.get_mut(&instance_id) {
                instance.active_pages = instance.active_pages.saturating_sub(1);
                instance.active_pages == 0
            } else {
                // already killed; nothing left to account against
                false
            }
        };
        if kill_now {
            self.kill(instance_id);
        }
    }

    /// One sweep pass: retire actives that sat idle past the kill window,
    /// then reap retired instances that idled out, drained behind the
    /// pool's back, or stopped answering.
    async fn sweep(&self) {
        let idle_active: Vec<u64> = {
            let maps = lock(&self.maps);
            maps.active
                .values()
                .filter(|i| {
                    i.active_pages == 0
                        && i.last_page_opened_at.elapsed() > self.config.kill_instance_after
                })
                .map(|i| i.id)
                .collect()
        };
        for instance_id in idle_active {
            info!(instance_id, "browser instance idle past kill window, retiring");
            // Zero open pages, so retire kills it immediately.
            self.retire(instance_id);
        }

        enum Verdict {
            IdledOut,
            Probe(SharedHandshake),
        }
        let candidates: Vec<(u64, Verdict)> = {
            let maps = lock(&self.maps);
            maps.retired
                .values()
                .map(|i| {
                    if i.last_page_opened_at.elapsed() > self.config.kill_instance_after {
                        (i.id, Verdict::IdledOut)
                    } else {
                        (i.id, Verdict::Probe(i.handshake.clone()))
                    }
                })
                .collect()
        };
        for (instance_id, verdict) in candidates {
            match verdict {
                Verdict::IdledOut => {
                    info!(instance_id, "retired browser exceeded idle window, killing");
                    self.kill(instance_id);
                }
                Verdict::Probe(handshake) => {
                    let Some(launched) = handshake.now_or_never() else {
                        // still mid-handshake; next sweep will see it
                        continue;
                    };
                    match launched {
                        Ok(handle) => match handle.page_count().await {
                            Ok(0) => {
                                info!(instance_id, "retired browser reports no pages, killing");
                                self.kill(instance_id);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(
                                    instance_id,
                                    error = %e,
                                    "page count probe failed, assuming unhealthy and killing"
                                );
                                self.kill(instance_id);
                            }
                        },
                        Err(_) => {
                            // launch never succeeded; dispose of the carcass
                            self.kill(instance_id);
                        }
                    }
                }
            }
        }
    }
}

/// Lifecycle event loop: serializes all map mutations triggered by launches,
/// disconnects and page closures.
async fn supervise(inner: Arc<PoolInner>, mut signals: mpsc::UnboundedReceiver<PoolSignal>) {
    while let Some(signal) = signals.recv().await {
        match signal {
            PoolSignal::Launched { instance_id } => {
                let mut maps = lock(&inner.maps);
                if let Some(instance) = maps.active.get_mut(&instance_id) {
                    if instance.state == InstanceState::Launching {
                        instance.state = InstanceState::Active;
                        debug!(instance_id, "browser instance active");
                    }
                }
            }
            PoolSignal::LaunchFailed { instance_id } => {
                warn!(instance_id, "browser launch failed, retiring slot");
                inner.retire(instance_id);
            }
            PoolSignal::Disconnected { instance_id } => {
                if inner.destroyed.load(Ordering::SeqCst) {
                    continue;
                }
                let still_active = lock(&inner.maps).active.contains_key(&instance_id);
                if still_active {
                    warn!(instance_id, "browser disconnected unexpectedly, retiring");
                    inner.retire(instance_id);
                }
            }
            PoolSignal::PageClosed { instance_id } => inner.page_closed(instance_id),
        }
    }
}

/// The launch handshake, shared so every `new_page` waiting on the same
/// instance observes one result. Success wires up the disconnect watcher;
/// failure retires the slot through the supervisor.
fn launch_handshake(
    launcher: Arc<dyn BrowserLauncher>,
    options: LaunchOptions,
    signals: mpsc::UnboundedSender<PoolSignal>,
    instance_id: u64,
) -> SharedHandshake {
    async move {
        match launcher.launch(&options).await {
            Ok(handle) => {
                let mut disconnects = handle.disconnects();
                let disconnect_signals = signals.clone();
                tokio::spawn(async move {
                    if disconnects.recv().await.is_ok() {
                        let _ = disconnect_signals
                            .send(PoolSignal::Disconnected { instance_id });
                    }
                });
                let _ = signals.send(PoolSignal::Launched { instance_id });
                Ok(handle)
            }
            Err(e) => {
                let _ = signals.send(PoolSignal::LaunchFailed { instance_id });
                Err(Arc::new(e))
            }
        }
    }
    .boxed()
    .shared()
}

/// Graceful-then-forceful teardown of one instance.
async fn teardown(mut instance: Instance, kill_timeout: Duration) {
    instance.state = InstanceState::Killed;
    debug!(instance = ?instance, "tearing down browser instance");
    let handle = match instance.handshake.clone().await {
        Ok(handle) => handle,
        // Never finished launching; there is no process to tear down.
        Err(_) => return,
    };
    match tokio::time::timeout(kill_timeout, handle.close()).await {
        Ok(Ok(())) => debug!(instance_id = instance.id, "browser closed gracefully"),
        Ok(Err(e)) => {
            warn!(instance_id = instance.id, error = %e, "graceful close failed, terminating process");
            if let Err(e) = handle.force_kill().await {
                warn!(instance_id = instance.id, error = %e, "process termination failed");
            }
        }
        Err(_) => {
            warn!(
                instance_id = instance.id,
                "graceful close timed out, terminating process"
            );
            if let Err(e) = handle.force_kill().await {
                warn!(instance_id = instance.id, error = %e, "process termination failed");
            }
        }
    }
}

/// A page checked out of the pool. Close it explicitly to surface close
/// errors; dropping it still returns the slot to the pool.
pub struct PageLease {
    page: Box<dyn PageHandle>,
    instance_id: u64,
    signals: mpsc::UnboundedSender<PoolSignal>,
    released: bool,
}

impl PageLease {
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn page(&self) -> &dyn PageHandle {
        self.page.as_ref()
    }

    /// Close the page in the browser and return the slot to the pool.
    pub async fn close(mut self) -> Result<(), HeadlessError> {
        let result = self.page.close().await;
        self.release();
        result
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.signals.send(PoolSignal::PageClosed {
                instance_id: self.instance_id,
            });
        }
    }
}

impl std::ops::Deref for PageLease {
    type Target = dyn PageHandle;

    fn deref(&self) -> &Self::Target {
        self.page.as_ref()
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        if !self.released {
            debug!(
                instance_id = self.instance_id,
                "page lease dropped without explicit close"
            );
            self.release();
        }
    }
}
