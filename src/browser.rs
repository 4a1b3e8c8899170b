//! Shared Chrome session for a diff run
//!
//! One browser process and one browsing context serve every page scope of the
//! run: story enumeration plus both captures of every story. Pages are opened
//! and closed per capture, the context itself lives until [`BrowserSession::shutdown`].

use crate::{create_browser_config, Cancellation, Config, DiffError};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct BrowserSession {
    browser: Mutex<Browser>,
    handler: JoinHandle<Result<(), CdpError>>,
    context_id: Option<BrowserContextId>,
}

impl BrowserSession {
    /// Launch Chrome and open the shared browsing context
    ///
    /// The DevTools handler is polled on its own task. A handler error means
    /// the session is unusable, so it trips `cancellation` and the run stops
    /// at the next story boundary.
    pub async fn launch(config: &Config, cancellation: Cancellation) -> Result<Self, DiffError> {
        let browser_config = create_browser_config(config)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| DiffError::BrowserLaunch(e.to_string()))?;

        // The handler implements Stream and must be polled for the browser to make progress
        let handler = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Browser handler error: {}", e);
                        cancellation.cancel();
                        return Err(e);
                    }
                    None => {
                        debug!("Browser handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        let context_id = match browser.execute(CreateBrowserContextParams::default()).await {
            Ok(response) => Some(response.result.browser_context_id),
            Err(e) => {
                warn!("Falling back to the default browsing context: {}", e);
                None
            }
        };

        info!("Browser session started");

        Ok(Self {
            browser: Mutex::new(browser),
            handler,
            context_id,
        })
    }

    /// Open a blank page in the shared context
    pub async fn new_page(&self) -> Result<Page, DiffError> {
        if !self.is_alive() {
            return Err(DiffError::BrowserLaunch(
                "browser handler is no longer running".to_string(),
            ));
        }

        let mut builder = CreateTargetParams::builder().url("about:blank");
        if let Some(context_id) = &self.context_id {
            builder = builder.browser_context_id(context_id.clone());
        }
        let params = builder.build().map_err(DiffError::BrowserLaunch)?;

        let browser = self.browser.lock().await;
        browser
            .new_page(params)
            .await
            .map_err(|e| DiffError::BrowserLaunch(e.to_string()))
    }

    pub fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    /// Dispose the context and close the browser
    pub async fn shutdown(&self) {
        info!("Shutting down browser session...");
        let mut browser = self.browser.lock().await;

        if let Some(context_id) = &self.context_id {
            if let Err(e) = browser
                .execute(DisposeBrowserContextParams::new(context_id.clone()))
                .await
            {
                debug!("Failed to dispose browsing context: {}", e);
            }
        }

        if let Err(e) = browser.close().await {
            debug!("Failed to close browser: {}", e);
        }
        self.handler.abort();
        info!("Browser session shutdown complete");
    }
}
