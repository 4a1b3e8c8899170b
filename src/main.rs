use anyhow::Context;
use clap::Parser;
use story_diff::{
    install_recorder, pull_request_from_event, setup_logging, write_textfile, Cancellation, Cli,
    CliRunner, Config,
};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose, args.json_logs)?;

    info!("Starting story-diff v{}", env!("CARGO_PKG_VERSION"));

    let metrics = match &args.metrics_out {
        Some(_) => Some(install_recorder()?),
        None => None,
    };

    let config = load_config(&args).await?;

    // Signals stop new stories from starting; running ones finish and the
    // browser is still shut down cleanly.
    let cancellation = Cancellation::new();
    let _shutdown_handler = setup_shutdown_handler(cancellation.clone());

    let cli_runner = CliRunner::new(config, cancellation);
    let result = cli_runner.run(args.command).await;

    if let (Some(handle), Some(path)) = (&metrics, &args.metrics_out) {
        if let Err(e) = write_textfile(handle, path) {
            warn!("Could not write metrics: {}", e);
        }
    }

    match result {
        Ok(0) => {
            info!("story-diff finished");
            Ok(())
        }
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Application error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Defaults, then the config file, then environment, then CLI flags
async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("reading {}", config_path.display()))?;
        serde_json::from_str(&config_content)
            .with_context(|| format!("parsing {}", config_path.display()))?
    } else {
        Config::default()
    };

    config.apply_env();

    if config.publish.github.pull_request.is_none() {
        if let Ok(event_path) = std::env::var("GITHUB_EVENT_PATH") {
            match tokio::fs::read_to_string(&event_path).await {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(event) => config.publish.github.pull_request = pull_request_from_event(&event),
                    Err(e) => warn!("Ignoring unreadable event payload {}: {}", event_path, e),
                },
                Err(e) => warn!("Ignoring event payload {}: {}", event_path, e),
            }
        }
    }

    args.apply_overrides(&mut config);

    info!("Configuration loaded successfully");
    info!("Batch size: {}", config.batch_size);
    info!(
        "Device: {}x{} @{}",
        config.device.viewport.width,
        config.device.viewport.height,
        config.device.viewport.device_scale_factor
    );
    info!("Navigation timeout: {:?}", config.timeouts.navigation);

    Ok(config)
}

fn setup_shutdown_handler(cancellation: Cancellation) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested, finishing running stories");
        cancellation.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use signal::unix::SignalKind;

    let (mut sigint, mut sigterm) = match (
        signal::unix::signal(SignalKind::interrupt()),
        signal::unix::signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            warn!("Failed to install signal handlers, falling back to Ctrl-C");
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C");
    }
}
