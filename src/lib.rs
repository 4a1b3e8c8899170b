//! # Story Diff
//!
//! Visual regression checking for component story catalogs. Every story
//! registered in a baseline catalog is rendered on two origins (a deployed
//! baseline and a freshly built candidate) in headless Chrome, the two full
//! page captures are compared pixel by pixel, and every story that differs
//! ends up as a three-panel composite in a single report image. The report
//! can be uploaded to S3 and linked from a pull request comment.
//!
//! ## Pipeline
//!
//! 1. **Launch**: optional build and serve commands for the candidate catalog
//! 2. **Enumerate**: the story registry is read from the baseline catalog
//! 3. **Batch**: stories are split into batches that run concurrently
//! 4. **Compare**: each story is captured on both origins and diffed
//!    (CIEDE2000 color distance with anti-aliasing detection)
//! 5. **Report**: composites are stacked and scaled to the report width
//! 6. **Publish**: upload plus review comment
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use story_diff::{
//!     BrowserSession, Cancellation, ChromeCapturer, ChromeCatalog, Comparator, Config,
//!     DiffEngine, Pipeline,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let cancellation = Cancellation::new();
//!     let session = Arc::new(BrowserSession::launch(&config, cancellation.clone()).await?);
//!
//!     let baseline = "https://storybook.example.com/iframe.html";
//!     let candidate = "http://localhost:9009/iframe.html";
//!     let catalog = Arc::new(ChromeCatalog::new(session.clone(), baseline, config.clone()));
//!     let capturer = Arc::new(ChromeCapturer::new(session.clone(), config.clone()));
//!     let comparator = Arc::new(Comparator::new(
//!         capturer,
//!         baseline,
//!         candidate,
//!         DiffEngine::new(config.diff.clone()),
//!         config.composite.clone(),
//!     ));
//!
//!     let summary = Pipeline::new(config, catalog, comparator, cancellation).run().await?;
//!     println!("{} of {} stories differ", summary.differences, summary.stories);
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! story-diff run \
//!     --constant-url https://storybook.example.com/iframe.html \
//!     --variable-url http://localhost:9009/iframe.html \
//!     --report-path report.png
//! ```

/// Configuration and settings
pub mod config;

/// Error types and error scopes
pub mod error;

/// Headless Chrome session shared by all captures
pub mod browser;

/// Story registry enumeration and batching
pub mod story;

/// Full page capture of a single story URL
pub mod capture;

/// Pixel comparison engine
pub mod diff;

/// Capture, compare and compose one story
pub mod compare;

/// Concurrent batch execution
pub mod orchestrator;

/// Report image assembly
pub mod report;

/// Report upload and review comment
pub mod publish;

/// Build and serve processes for the candidate catalog
pub mod launcher;

/// End-to-end run
pub mod pipeline;

/// Command-line interface implementation
pub mod cli;

/// Run metrics
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use browser::*;
pub use capture::*;
pub use cli::*;
pub use compare::*;
pub use config::*;
pub use diff::*;
pub use error::*;
pub use launcher::*;
pub use orchestrator::*;
pub use pipeline::*;
pub use publish::*;
pub use report::*;
pub use self::metrics::*;
pub use story::*;
pub use utils::*;
