//! Trait seams between the pool and a concrete browser engine.
//!
//! These traits carry no CDP types; the production implementation lives in
//! [`crate::launcher`] and tests substitute mocks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::HeadlessError;

/// How a [`BrowserLauncher`] should bring a browser up.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    /// Extra command-line switches appended after the built-in set.
    pub args: Vec<String>,
    /// Base directory for per-instance profile directories; system temp when
    /// unset.
    pub profile_base_dir: Option<PathBuf>,
    /// How long the launch handshake may take before it counts as failed.
    pub launch_timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            args: Vec::new(),
            profile_base_dir: None,
            launch_timeout: Duration::from_secs(30),
        }
    }
}

/// One page inside a launched browser.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Close the page in the browser.
    async fn close(&self) -> Result<(), HeadlessError>;
}

/// One launched browser subprocess.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Open a fresh page.
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, HeadlessError>;

    /// How many pages the browser currently reports open.
    async fn page_count(&self) -> Result<usize, HeadlessError>;

    /// Ask the browser to shut down cleanly.
    async fn close(&self) -> Result<(), HeadlessError>;

    /// Terminate the OS process when a graceful close hangs or fails.
    async fn force_kill(&self) -> Result<(), HeadlessError>;

    /// Fires once when the browser goes away on its own rather than through
    /// [`Self::close`].
    fn disconnects(&self) -> broadcast::Receiver<()>;
}

/// Starts browser subprocesses for the pool.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions)
        -> Result<Arc<dyn BrowserHandle>, HeadlessError>;
}
