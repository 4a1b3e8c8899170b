//! Screenshot capture of a single story on one origin
//!
//! Every capture runs in its own page scope: emulate the device, navigate,
//! wait for the network to settle, scroll to the bottom so lazy content
//! renders, then take a full-page PNG. The page is closed on every path.

use crate::metrics::record_capture;
use crate::{BrowserSession, Config, DeviceProfile, DiffError, ScrollSettings, StoryRef};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTouchEmulationEnabledParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventLifecycleEvent, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

const SCROLL_HEIGHT_EXPRESSION: &str = "document.body ? document.body.scrollHeight : 0";

/// Which origin a screenshot was taken on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Baseline,
    Candidate,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Baseline => write!(f, "baseline"),
            Side::Candidate => write!(f, "candidate"),
        }
    }
}

/// PNG bytes of one story on one side
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub story: String,
    pub side: Side,
    pub url: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Capturer: Send + Sync {
    async fn capture(&self, story: &StoryRef, url: &str, side: Side)
        -> Result<Screenshot, DiffError>;
}

/// Captures through the shared [`BrowserSession`]
pub struct ChromeCapturer {
    session: Arc<BrowserSession>,
    config: Config,
}

impl ChromeCapturer {
    pub fn new(session: Arc<BrowserSession>, config: Config) -> Self {
        Self { session, config }
    }

    async fn capture_on(&self, page: &Page, url: &str) -> Result<Vec<u8>, DiffError> {
        apply_device(page, &self.config.device)
            .await
            .map_err(|e| DiffError::capture(url, e))?;
        navigate_and_settle(page, url, self.config.timeouts.network_idle)
            .await
            .map_err(|e| DiffError::capture(url, e))?;

        let steps = auto_scroll(page, &self.config.scroll)
            .await
            .map_err(|e| DiffError::capture(url, e))?;
        debug!("Scrolled {} in {} steps", url, steps);

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();

        page.screenshot(params)
            .await
            .map_err(|e| DiffError::capture(url, e))
    }
}

#[async_trait]
impl Capturer for ChromeCapturer {
    async fn capture(
        &self,
        story: &StoryRef,
        url: &str,
        side: Side,
    ) -> Result<Screenshot, DiffError> {
        let start_time = Instant::now();
        let page = self
            .session
            .new_page()
            .await
            .map_err(|e| DiffError::capture(url, e))?;

        let limit = self.config.timeouts.navigation;
        let result = match timeout(limit, self.capture_on(&page, url)).await {
            Ok(result) => result,
            Err(_) => Err(DiffError::Timeout(limit)),
        };

        // runs beforeunload hooks
        if let Err(e) = page.close().await {
            warn!("Failed to close page for {}: {}", url, e);
        }

        record_capture(side, start_time.elapsed(), result.is_ok());

        result.map(|data| Screenshot {
            story: story.label(),
            side,
            url: url.to_string(),
            data,
        })
    }
}

/// Apply viewport, user agent and touch emulation to a page
pub(crate) async fn apply_device(page: &Page, device: &DeviceProfile) -> Result<(), DiffError> {
    let viewport = &device.viewport;
    let metrics = SetDeviceMetricsOverrideParams::builder()
        .width(viewport.width)
        .height(viewport.height)
        .device_scale_factor(viewport.device_scale_factor)
        .mobile(viewport.mobile)
        .build()
        .map_err(DiffError::BrowserLaunch)?;

    page.execute(metrics)
        .await
        .map_err(|e| DiffError::BrowserLaunch(e.to_string()))?;
    page.execute(SetUserAgentOverrideParams::new(device.user_agent.clone()))
        .await
        .map_err(|e| DiffError::BrowserLaunch(e.to_string()))?;
    page.execute(SetTouchEmulationEnabledParams::new(viewport.has_touch))
        .await
        .map_err(|e| DiffError::BrowserLaunch(e.to_string()))?;

    Ok(())
}

/// Navigate and wait for the network to go idle
///
/// Idle is bounded by `idle_limit`; when it expires the page is used as it is.
pub(crate) async fn navigate_and_settle(
    page: &Page,
    url: &str,
    idle_limit: Duration,
) -> Result<(), DiffError> {
    page.execute(SetLifecycleEventsEnabledParams::new(true))
        .await
        .map_err(|e| DiffError::capture(url, e))?;

    // subscribe before navigating so the idle event cannot be missed
    let events = page
        .event_listener::<EventLifecycleEvent>()
        .await
        .map_err(|e| DiffError::capture(url, e))?;
    let main_frame = page.mainframe().await.ok().flatten();

    page.goto(url).await.map_err(|e| DiffError::capture(url, e))?;

    let idle = wait_for_network_idle(events, main_frame);
    match timeout(idle_limit, idle).await {
        Ok(true) => debug!("Network idle on {}", url),
        Ok(false) => debug!("Lifecycle events ended before network idle on {}", url),
        Err(_) => debug!("Network not idle after {:?} on {}, capturing anyway", idle_limit, url),
    }
    Ok(())
}

/// Resolves once the navigation that started after subscribing reports
/// `networkIdle`
///
/// Events of the previous document (the blank page) are skipped by tracking
/// the loader announced by the `init` event.
async fn wait_for_network_idle<S>(
    events: S,
    main_frame: Option<chromiumoxide::cdp::browser_protocol::page::FrameId>,
) -> bool
where
    S: Stream<Item = Arc<EventLifecycleEvent>>,
{
    futures::pin_mut!(events);
    let mut loader = None;

    while let Some(event) = events.next().await {
        if main_frame.as_ref().map_or(false, |frame| *frame != event.frame_id) {
            continue;
        }
        match event.name.as_str() {
            "init" => loader = Some(event.loader_id.clone()),
            "networkIdle" if loader.as_ref() == Some(&event.loader_id) => return true,
            _ => {}
        }
    }
    false
}

/// Scroll down in fixed steps until the scrolled distance reaches the body
/// height, re-reading the height every step
///
/// Returns the number of steps taken. Stops at `max_steps` for pages that
/// keep growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScrollState {
    Scrolling,
    /// The scrolled distance covers the document height
    Reached,
    /// Out of steps while the page is still taller
    Capped,
}

/// Where scrolling stands after `step` steps of a run capped at `max_steps`
fn scroll_state(step: u32, scrolled: f64, height: f64, max_steps: u32) -> ScrollState {
    if scrolled >= height {
        ScrollState::Reached
    } else if step >= max_steps {
        ScrollState::Capped
    } else {
        ScrollState::Scrolling
    }
}

pub(crate) async fn auto_scroll(page: &Page, settings: &ScrollSettings) -> Result<u32, DiffError> {
    let scroll_expression = format!("window.scrollBy(0, {})", settings.step_px);
    let mut total: f64 = 0.0;

    for step in 1..=settings.max_steps {
        let height: f64 = evaluate_value(page, SCROLL_HEIGHT_EXPRESSION).await?;
        evaluate(page, &scroll_expression).await?;
        total += f64::from(settings.step_px);

        match scroll_state(step, total, height, settings.max_steps) {
            ScrollState::Reached => return Ok(step),
            ScrollState::Capped => {
                warn!(
                    "Page still growing after {} scroll steps, capturing as is",
                    settings.max_steps
                );
                return Ok(step);
            }
            ScrollState::Scrolling => sleep(settings.delay).await,
        }
    }

    Ok(0)
}

fn evaluate_params(expression: &str) -> Result<EvaluateParams, DiffError> {
    EvaluateParams::builder()
        .expression(expression)
        .return_by_value(true)
        .await_promise(true)
        .build()
        .map_err(DiffError::BrowserLaunch)
}

/// Evaluate an expression for its side effects
pub(crate) async fn evaluate(page: &Page, expression: &str) -> Result<(), DiffError> {
    page.evaluate_expression(evaluate_params(expression)?)
        .await
        .map_err(|e| DiffError::BrowserLaunch(e.to_string()))?;
    Ok(())
}

/// Evaluate an expression and deserialize its by-value result
pub(crate) async fn evaluate_value<T: DeserializeOwned>(
    page: &Page,
    expression: &str,
) -> Result<T, DiffError> {
    let result = page
        .evaluate_expression(evaluate_params(expression)?)
        .await
        .map_err(|e| DiffError::BrowserLaunch(e.to_string()))?;

    result
        .into_value::<T>()
        .map_err(|e| DiffError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_display() {
        assert_eq!(Side::Baseline.to_string(), "baseline");
        assert_eq!(Side::Candidate.to_string(), "candidate");
    }

    #[test]
    fn test_scroll_stops_once_height_is_covered() {
        assert_eq!(scroll_state(3, 300.0, 300.0, 50), ScrollState::Reached);
        assert_eq!(scroll_state(4, 400.0, 350.0, 50), ScrollState::Reached);
    }

    #[test]
    fn test_scroll_continues_below_height() {
        assert_eq!(scroll_state(1, 100.0, 2000.0, 50), ScrollState::Scrolling);
        assert_eq!(scroll_state(49, 4900.0, 5000.0, 50), ScrollState::Scrolling);
    }

    #[test]
    fn test_scroll_is_capped_on_growing_page() {
        assert_eq!(scroll_state(50, 5000.0, 9000.0, 50), ScrollState::Capped);
        assert_eq!(scroll_state(1, 100.0, 9000.0, 1), ScrollState::Capped);
    }

    #[test]
    fn test_empty_page_is_reached_on_first_step() {
        assert_eq!(scroll_state(1, 100.0, 0.0, 50), ScrollState::Reached);
        // reaching the height on the last allowed step is not a cap
        assert_eq!(scroll_state(50, 5000.0, 5000.0, 50), ScrollState::Reached);
    }
}
