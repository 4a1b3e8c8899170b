//! Run metrics
//!
//! Recorded through the `metrics` facade. Without an installed recorder every
//! call is a no-op; `--metrics-out` installs the Prometheus recorder and
//! writes its rendering as a textfile-collector file at the end of the run.

use crate::capture::Side;
use crate::DiffError;
use metrics::{counter, gauge, histogram, increment_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryOutcome {
    Equal,
    Different,
    Failed,
}

impl StoryOutcome {
    fn as_str(self) -> &'static str {
        match self {
            StoryOutcome::Equal => "equal",
            StoryOutcome::Different => "different",
            StoryOutcome::Failed => "failed",
        }
    }
}

fn side_label(side: Side) -> &'static str {
    match side {
        Side::Baseline => "baseline",
        Side::Candidate => "candidate",
    }
}

pub fn record_capture(side: Side, duration: Duration, success: bool) {
    let side = side_label(side);
    if success {
        increment_counter!("story_diff_captures_total", "side" => side);
    } else {
        increment_counter!("story_diff_capture_failures_total", "side" => side);
    }
    histogram!("story_diff_capture_duration_seconds", duration.as_secs_f64(), "side" => side);
}

pub fn record_story(outcome: StoryOutcome) {
    increment_counter!("story_diff_stories_total", "outcome" => outcome.as_str());
}

pub fn record_batch(duration: Duration) {
    histogram!("story_diff_batch_duration_seconds", duration.as_secs_f64());
}

pub fn record_report(bytes: usize, artifacts: usize) {
    gauge!("story_diff_report_bytes", bytes as f64);
    gauge!("story_diff_report_composites", artifacts as f64);
}

pub fn record_publish(success: bool) {
    if success {
        increment_counter!("story_diff_publish_total");
    } else {
        increment_counter!("story_diff_publish_failures_total");
    }
}

pub fn record_run(stories: usize, failures: usize, duration: Duration) {
    counter!("story_diff_enumerated_stories_total", stories as u64);
    gauge!("story_diff_failed_stories", failures as f64);
    histogram!("story_diff_run_duration_seconds", duration.as_secs_f64());
}

/// Install the Prometheus recorder as the global recorder
pub fn install_recorder() -> Result<PrometheusHandle, DiffError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| DiffError::Configuration(format!("failed to install metrics recorder: {e}")))
}

/// Write the current rendering for a node-exporter textfile collector
pub fn write_textfile(handle: &PrometheusHandle, path: &Path) -> Result<(), DiffError> {
    std::fs::write(path, handle.render())?;
    info!("Metrics written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_capture(Side::Baseline, Duration::from_millis(10), true);
        record_story(StoryOutcome::Different);
        record_batch(Duration::from_secs(1));
        record_report(1024, 2);
        record_publish(false);
        record_run(3, 1, Duration::from_secs(2));
    }

    #[test]
    fn test_story_outcome_labels() {
        assert_eq!(StoryOutcome::Equal.as_str(), "equal");
        assert_eq!(StoryOutcome::Different.as_str(), "different");
        assert_eq!(StoryOutcome::Failed.as_str(), "failed");
    }
}
