//! One diff run from story list to published report

use crate::metrics::record_run;
use crate::publish::report_key;
use crate::story::{find_duplicates, partition};
use crate::utils::format_duration;
use crate::{
    assemble, Cancellation, Comparator, Config, DiffError, Orchestrator, Publisher, StoryCatalog,
    StoryFailure,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Final verdict of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every story rendered the same on both origins
    Clean,
    /// A report was built; nothing failed
    DifferencesFound,
    /// A story could not be compared, the report could not be written or
    /// published, or the run was cancelled
    Failed,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Clean | RunStatus::DifferencesFound => 0,
            RunStatus::Failed => 1,
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub stories: usize,
    pub batches: usize,
    pub compared: usize,
    pub differences: usize,
    pub skipped: usize,
    pub failures: Vec<StoryFailure>,
    /// Where the report ended up: its public URL, else the local path
    pub report_location: Option<String>,
    /// Encoding or writing the report failed; publishing still went ahead
    pub report_error: Option<DiffError>,
    pub publish_error: Option<DiffError>,
    pub duration: Duration,
    pub status: RunStatus,
}

pub struct Pipeline {
    config: Config,
    catalog: Arc<dyn StoryCatalog>,
    comparator: Arc<Comparator>,
    publisher: Option<Publisher>,
    cancellation: Cancellation,
}

impl Pipeline {
    pub fn new(
        config: Config,
        catalog: Arc<dyn StoryCatalog>,
        comparator: Arc<Comparator>,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            config,
            catalog,
            comparator,
            publisher: None,
            cancellation,
        }
    }

    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Enumerate, compare every story, assemble and publish the report
    ///
    /// Enumeration errors abort the run. Story failures, report errors and
    /// publish errors only show up in the returned summary.
    pub async fn run(&self) -> Result<RunSummary, DiffError> {
        let start_time = Instant::now();

        let stories = self.catalog.stories().await?;
        for duplicate in find_duplicates(&stories) {
            warn!(
                "Story {} is registered more than once and will be compared again",
                duplicate.label()
            );
        }

        let batches = partition(&stories, self.config.batch_size);
        let batch_count = batches.len();

        let orchestrator = Orchestrator::new(self.comparator.clone(), self.cancellation.clone());
        let outcome = orchestrator.run_all(batches).await;
        let differences = outcome.artifacts.len();

        let mut report_location = None;
        let mut report_error = None;
        let mut publish_error = None;

        let report = match assemble(outcome.artifacts, &self.config.report) {
            Ok(report) => report,
            Err(e) => {
                error!("Assembling the report failed: {}", e);
                report_error = Some(e);
                None
            }
        };

        if let Some(report) = report {
            if let Some(path) = &self.config.report.report_path {
                match tokio::fs::write(path, &report.png).await {
                    Ok(()) => {
                        info!("Report written to {}", path.display());
                        report_location = Some(path.display().to_string());
                    }
                    Err(e) => {
                        error!("Writing the report to {} failed: {}", path.display(), e);
                        report_error = Some(e.into());
                    }
                }
            }

            let thread = self.config.publish.github.pull_request;
            match (&self.publisher, thread) {
                (Some(publisher), Some(thread)) => {
                    let key = report_key(self.config.publish.commit_sha.as_deref());
                    match publisher.publish(&report, &key, thread).await {
                        Ok(url) => report_location = Some(url),
                        Err(e) => {
                            error!("Publishing the report failed: {}", e);
                            publish_error = Some(e);
                        }
                    }
                }
                (Some(_), None) => warn!("No pull request to comment on, report not published"),
                (None, _) => info!("Publishing disabled"),
            }
        }

        let status = if !outcome.failures.is_empty()
            || report_error.is_some()
            || publish_error.is_some()
            || outcome.cancelled
        {
            RunStatus::Failed
        } else if differences > 0 {
            RunStatus::DifferencesFound
        } else {
            RunStatus::Clean
        };

        let duration = start_time.elapsed();
        record_run(stories.len(), outcome.failures.len(), duration);
        info!(
            "Run finished in {}: {} stories, {} compared, {} differing, {} failed, {} skipped -> {:?}",
            format_duration(duration),
            stories.len(),
            outcome.compared,
            differences,
            outcome.failures.len(),
            outcome.skipped,
            status
        );

        Ok(RunSummary {
            stories: stories.len(),
            batches: batch_count,
            compared: outcome.compared,
            differences,
            skipped: outcome.skipped,
            failures: outcome.failures,
            report_location,
            report_error,
            publish_error,
            duration,
            status,
        })
    }
}
