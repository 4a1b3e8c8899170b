use crate::{
    BrowserSession, Cancellation, ChromeCapturer, ChromeCatalog, Comparator, Config, DiffEngine,
    GithubCommentPoster, Launcher, Pipeline, Publisher, RunStatus, RunSummary, S3ObjectStore,
    StoryCatalog,
};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "story-diff")]
#[command(about = "Visual regression checker for component story catalogs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    pub json_logs: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<PathBuf>,

    #[arg(long, global = true, help = "Stories per batch")]
    pub batch_size: Option<usize>,

    #[arg(long, global = true, help = "Write Prometheus metrics to this file when done")]
    pub metrics_out: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compare every story of the baseline and candidate catalogs
    Run {
        #[arg(long, env = "INPUT_CONSTANT_URL", help = "Baseline catalog iframe URL")]
        constant_url: Option<String>,

        #[arg(long, env = "INPUT_VARIABLE_URL", help = "Candidate catalog iframe URL")]
        variable_url: Option<String>,

        #[arg(long, help = "Also write the report PNG to this path")]
        report_path: Option<PathBuf>,

        #[arg(long, help = "Skip upload and review comment")]
        no_publish: bool,
    },

    /// List the stories of the baseline catalog
    Stories,

    /// Validate configuration and print warnings
    Validate,
}

impl Cli {
    /// Apply the global flags on top of a loaded configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(chrome_path) = &self.chrome_path {
            config.browser.chrome_path = Some(chrome_path.clone());
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
    }
}

pub struct CliRunner {
    pub config: Config,
    cancellation: Cancellation,
}

impl CliRunner {
    pub fn new(config: Config, cancellation: Cancellation) -> Self {
        Self {
            config,
            cancellation,
        }
    }

    /// Execute a subcommand and return the process exit code
    pub async fn run(&self, command: Commands) -> anyhow::Result<i32> {
        match command {
            Commands::Run {
                constant_url,
                variable_url,
                report_path,
                no_publish,
            } => {
                let mut config = self.config.clone();
                if constant_url.is_some() {
                    config.constant_url = constant_url;
                }
                if variable_url.is_some() {
                    config.variable_url = variable_url;
                }
                if report_path.is_some() {
                    config.report.report_path = report_path;
                }

                let summary = self.run_diff(config, !no_publish).await?;
                print_summary(&summary);
                Ok(summary.status.exit_code())
            }
            Commands::Stories => {
                self.list_stories().await?;
                Ok(0)
            }
            Commands::Validate => {
                let warnings = self.config.validate()?;
                if warnings.is_empty() {
                    println!("Configuration is valid");
                } else {
                    for warning in &warnings {
                        println!("warning: {warning}");
                    }
                }
                Ok(0)
            }
        }
    }

    async fn run_diff(&self, config: Config, publish: bool) -> anyhow::Result<RunSummary> {
        for warning in config.validate()? {
            warn!("Configuration: {}", warning);
        }
        let constant_url = config
            .constant_url
            .clone()
            .context("constant_url is required for a run")?;
        let variable_url = config
            .variable_url
            .clone()
            .context("variable_url is required for a run")?;

        let mut launcher = Launcher::new(config.launch.clone(), config.timeouts.startup);
        if let Err(e) = launcher.prepare().await {
            launcher.shutdown().await;
            return Err(e.into());
        }

        let session = match BrowserSession::launch(&config, self.cancellation.clone()).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                launcher.shutdown().await;
                return Err(e.into());
            }
        };

        let result = match self.build_pipeline(&config, session.clone(), constant_url, variable_url, publish) {
            Ok(pipeline) => pipeline.run().await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };

        session.shutdown().await;
        launcher.shutdown().await;
        result
    }

    fn build_pipeline(
        &self,
        config: &Config,
        session: Arc<BrowserSession>,
        constant_url: String,
        variable_url: String,
        publish: bool,
    ) -> anyhow::Result<Pipeline> {
        let catalog = Arc::new(ChromeCatalog::new(
            session.clone(),
            constant_url.clone(),
            config.clone(),
        ));
        let capturer = Arc::new(ChromeCapturer::new(session, config.clone()));
        let comparator = Arc::new(Comparator::new(
            capturer,
            constant_url,
            variable_url,
            DiffEngine::new(config.diff.clone()),
            config.composite.clone(),
        ));

        let pipeline = Pipeline::new(config.clone(), catalog, comparator, self.cancellation.clone());
        let publisher = if publish { build_publisher(config)? } else { None };
        Ok(match publisher {
            Some(publisher) => pipeline.with_publisher(publisher),
            None => pipeline,
        })
    }

    async fn list_stories(&self) -> anyhow::Result<()> {
        let constant_url = self
            .config
            .constant_url
            .clone()
            .context("constant_url is required to list stories")?;

        let session = Arc::new(BrowserSession::launch(&self.config, self.cancellation.clone()).await?);
        let catalog = ChromeCatalog::new(session.clone(), constant_url, self.config.clone());
        let result = catalog.stories().await;
        session.shutdown().await;

        for story in result? {
            println!("{}\t{}", story.label(), story.query);
        }
        Ok(())
    }
}

/// Publisher for a complete publish configuration, `None` otherwise
fn build_publisher(config: &Config) -> anyhow::Result<Option<Publisher>> {
    if !config.publish_enabled() {
        warn!("Publish configuration incomplete, report will not be uploaded");
        return Ok(None);
    }

    let store = S3ObjectStore::new(&config.publish.s3)?;
    let poster = GithubCommentPoster::new(&config.publish.github)?;
    Ok(Some(Publisher::new(Arc::new(store), Arc::new(poster))))
}

fn print_summary(summary: &RunSummary) {
    info!("=== Run Summary ===");
    info!("Stories: {} in {} batches", summary.stories, summary.batches);
    info!("Compared: {}", summary.compared);
    info!("Differences: {}", summary.differences);
    if summary.skipped > 0 {
        warn!("Skipped: {}", summary.skipped);
    }
    for failure in &summary.failures {
        error!("Failed: {} ({})", failure.story.label(), failure.error);
    }
    if let Some(e) = &summary.report_error {
        error!("Report: {}", e);
    }
    if let Some(e) = &summary.publish_error {
        error!("Publish: {}", e);
    }
    if let Some(location) = &summary.report_location {
        info!("Report: {}", location);
    }
    match summary.status {
        RunStatus::Clean => info!("No visual differences"),
        RunStatus::DifferencesFound => info!("Visual differences found"),
        RunStatus::Failed => error!("Run failed"),
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `--verbose` when set.
pub fn setup_logging(verbose: bool, json: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!(e))
}
