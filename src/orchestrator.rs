//! Concurrent batch execution
//!
//! Every batch runs as its own task; the stories of a batch run one after
//! another. Results flow through a channel into a single collector, so the
//! artifact list is only ever touched by one task.

use crate::metrics::{record_batch, record_story, StoryOutcome};
use crate::{Comparator, ComparisonArtifact, DiffError, StoryRef};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Cooperative stop signal, checked between stories
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A story that could not be compared
#[derive(Debug, Clone)]
pub struct StoryFailure {
    pub story: StoryRef,
    pub error: DiffError,
}

#[derive(Debug, Default)]
pub struct OrchestratorOutcome {
    /// Composites of differing stories, in completion order
    pub artifacts: Vec<ComparisonArtifact>,
    pub failures: Vec<StoryFailure>,
    /// Stories that finished comparing, equal or not
    pub compared: usize,
    /// Stories never started because the run was cancelled
    pub skipped: usize,
    pub cancelled: bool,
}

enum BatchEvent {
    Compared(Option<ComparisonArtifact>),
    Failed(StoryFailure),
    Skipped(usize),
}

pub struct Orchestrator {
    comparator: Arc<Comparator>,
    cancellation: Cancellation,
}

impl Orchestrator {
    pub fn new(comparator: Arc<Comparator>, cancellation: Cancellation) -> Self {
        Self {
            comparator,
            cancellation,
        }
    }

    /// Run all batches concurrently and wait for every one of them
    pub async fn run_all(&self, batches: Vec<Vec<StoryRef>>) -> OrchestratorOutcome {
        let total: usize = batches.iter().map(Vec::len).sum();
        let progress = Arc::new(ProgressTracker::new(total));
        info!("Comparing {} stories in {} batches", total, batches.len());

        let (results, mut receiver) = mpsc::channel::<BatchEvent>(100);

        let collector = tokio::spawn(async move {
            let mut outcome = OrchestratorOutcome::default();
            while let Some(event) = receiver.recv().await {
                match event {
                    BatchEvent::Compared(artifact) => {
                        outcome.compared += 1;
                        outcome.artifacts.extend(artifact);
                    }
                    BatchEvent::Failed(failure) => outcome.failures.push(failure),
                    BatchEvent::Skipped(count) => outcome.skipped += count,
                }
            }
            outcome
        });

        let mut handles = Vec::with_capacity(batches.len());
        for (index, batch) in batches.into_iter().enumerate() {
            let comparator = self.comparator.clone();
            let cancellation = self.cancellation.clone();
            let progress = progress.clone();
            let results = results.clone();

            handles.push(tokio::spawn(async move {
                run_batch(index, batch, comparator, cancellation, progress, results).await;
            }));
        }
        drop(results);

        let mut lost_batches = 0;
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Batch task failed: {}", e);
                lost_batches += 1;
            }
        }

        let mut outcome = match collector.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Result collector failed: {}", e);
                OrchestratorOutcome::default()
            }
        };
        outcome.cancelled = self.cancellation.is_cancelled();

        if lost_batches > 0 {
            warn!("{} batches ended without reporting all stories", lost_batches);
        }

        let info = progress.get_progress();
        info!(
            "Compared {}/{} stories in {:?}: {} differing, {} failed",
            outcome.compared,
            total,
            info.elapsed,
            outcome.artifacts.len(),
            outcome.failures.len()
        );
        outcome
    }
}

async fn run_batch(
    index: usize,
    batch: Vec<StoryRef>,
    comparator: Arc<Comparator>,
    cancellation: Cancellation,
    progress: Arc<ProgressTracker>,
    results: mpsc::Sender<BatchEvent>,
) {
    let start_time = Instant::now();
    debug!("Batch {} started with {} stories", index, batch.len());

    let batch_len = batch.len();
    for (position, story) in batch.into_iter().enumerate() {
        if cancellation.is_cancelled() {
            let remaining = batch_len - position;
            info!("Batch {} stopping, run cancelled ({} stories skipped)", index, remaining);
            // the collector may already be gone during shutdown
            let _ = results.send(BatchEvent::Skipped(remaining)).await;
            break;
        }

        let result = AssertUnwindSafe(comparator.compare(&story))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(DiffError::Comparison(format!(
                    "comparison of {} panicked",
                    story.label()
                )))
            });

        let event = match result {
            Ok(artifact) => {
                progress.record_completion(true);
                record_story(if artifact.is_some() {
                    StoryOutcome::Different
                } else {
                    StoryOutcome::Equal
                });
                BatchEvent::Compared(artifact)
            }
            Err(error) => {
                progress.record_completion(false);
                record_story(StoryOutcome::Failed);
                warn!("Skipping {}: {}", story.label(), error);
                BatchEvent::Failed(StoryFailure { story, error })
            }
        };

        if results.send(event).await.is_err() {
            error!("Batch {} lost its result channel", index);
            break;
        }

        let info = progress.get_progress();
        debug!(
            "Progress {}/{} ({} failed)",
            info.completed, info.total, info.errors
        );
    }

    record_batch(start_time.elapsed());
    debug!("Batch {} finished in {:?}", index, start_time.elapsed());
}

pub struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    start_time: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_completion(&self, success: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_progress(&self) -> ProgressInfo {
        ProgressInfo {
            total: self.total,
            completed: self.completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            elapsed: self.start_time.elapsed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub elapsed: Duration,
}
