//! Production launcher over the Chrome DevTools Protocol.
//!
//! spider_chrome exports its types as the `chromiumoxide` module. Each
//! launched browser gets its own temp profile directory; Chrome's
//! SingletonLock forbids two instances sharing one.

use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tempfile::TempDir;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::HeadlessError;
use crate::handle::{BrowserHandle, BrowserLauncher, LaunchOptions, PageHandle};

/// Switches every pooled browser starts with; callers append their own via
/// [`LaunchOptions::args`].
fn default_args() -> &'static [&'static str] {
    &[
        "--no-sandbox",
        "--disable-dev-shm-usage",
        "--disable-gpu",
        "--disable-extensions",
        "--disable-background-timer-throttling",
        "--disable-backgrounding-occluded-windows",
        "--disable-renderer-backgrounding",
        "--memory-pressure-off",
    ]
}

/// [`BrowserLauncher`] that spawns real Chrome subprocesses over CDP.
#[derive(Debug, Default)]
pub struct CdpLauncher;

impl CdpLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserLauncher for CdpLauncher {
    async fn launch(
        &self,
        options: &LaunchOptions,
    ) -> Result<Arc<dyn BrowserHandle>, HeadlessError> {
        let profile_dir = match options.profile_base_dir.as_deref() {
            Some(base) => TempDir::new_in(base),
            None => TempDir::new(),
        }
        .map_err(|e| HeadlessError::Launch(format!("failed to create profile directory: {e}")))?;

        let mut builder = BrowserConfig::builder();
        if !options.headless {
            builder = builder.with_head();
        }
        for arg in default_args() {
            builder = builder.arg(*arg);
        }
        for arg in &options.args {
            builder = builder.arg(arg);
        }
        let mut config = builder
            .build()
            .map_err(|e| HeadlessError::Launch(format!("invalid browser config: {e}")))?;
        config.user_data_dir = Some(profile_dir.path().to_path_buf());

        debug!(profile_dir = ?profile_dir.path(), "launching browser");
        let (browser, mut handler) =
            tokio::time::timeout(options.launch_timeout, Browser::launch(config))
                .await
                .map_err(|_| {
                    HeadlessError::Launch(format!(
                        "browser did not come up within {:?}",
                        options.launch_timeout
                    ))
                })?
                .map_err(|e| HeadlessError::Launch(e.to_string()))?;

        let (disconnect_tx, _) = broadcast::channel(1);
        let stream_ended = disconnect_tx.clone();
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!(error = %e, "browser event error");
                }
            }
            // The event stream ends when the browser process is gone.
            let _ = stream_ended.send(());
        });

        Ok(Arc::new(CdpBrowser {
            browser: Mutex::new(browser),
            disconnect_tx,
            events,
            _profile_dir: profile_dir,
        }))
    }
}

struct CdpBrowser {
    browser: Mutex<Browser>,
    disconnect_tx: broadcast::Sender<()>,
    events: JoinHandle<()>,
    // Keeps the profile directory alive for the browser's lifetime.
    _profile_dir: TempDir,
}

#[async_trait]
impl BrowserHandle for CdpBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, HeadlessError> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| HeadlessError::PageCreation(e.to_string()))?;
        Ok(Box::new(CdpPage {
            page: Mutex::new(Some(page)),
        }))
    }

    async fn page_count(&self) -> Result<usize, HeadlessError> {
        self.browser
            .lock()
            .await
            .pages()
            .await
            .map(|pages| pages.len())
            .map_err(|e| HeadlessError::PageQuery(e.to_string()))
    }

    async fn close(&self) -> Result<(), HeadlessError> {
        self.browser
            .lock()
            .await
            .close()
            .await
            .map(|_| ())
            .map_err(|e| HeadlessError::BrowserClose(e.to_string()))
    }

    async fn force_kill(&self) -> Result<(), HeadlessError> {
        match self.browser.lock().await.kill().await {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(HeadlessError::BrowserClose(format!(
                "process termination failed: {e}"
            ))),
            // Browser was attached to an external process; nothing to kill.
            None => Ok(()),
        }
    }

    fn disconnects(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }
}

impl Drop for CdpBrowser {
    fn drop(&mut self) {
        self.events.abort();
    }
}

struct CdpPage {
    page: Mutex<Option<Page>>,
}

#[async_trait]
impl PageHandle for CdpPage {
    async fn close(&self) -> Result<(), HeadlessError> {
        let Some(page) = self.page.lock().await.take() else {
            return Ok(());
        };
        page.close()
            .await
            .map_err(|e| HeadlessError::PageClose(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_args_keep_the_sandbox_off_for_containers() {
        assert!(default_args().contains(&"--no-sandbox"));
        assert!(default_args().contains(&"--disable-dev-shm-usage"));
    }

    #[test]
    fn launch_options_default_to_headless() {
        let options = LaunchOptions::default();
        assert!(options.headless);
        assert!(options.args.is_empty());
        assert!(options.profile_base_dir.is_none());
    }
}
