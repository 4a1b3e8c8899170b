//! Candidate catalog build and serve
//!
//! The build command runs to completion before anything is captured. A serve
//! command is kept alive for the whole run and killed when the [`Launcher`]
//! is dropped; readiness is detected by polling a TCP port.

use crate::{DiffError, LaunchSettings};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

pub struct Launcher {
    settings: LaunchSettings,
    startup_timeout: Duration,
    server: Option<Child>,
}

impl Launcher {
    pub fn new(settings: LaunchSettings, startup_timeout: Duration) -> Self {
        Self {
            settings,
            startup_timeout,
            server: None,
        }
    }

    /// Build, start serving and wait until the server accepts connections
    ///
    /// Every step is optional; with nothing configured this returns at once.
    pub async fn prepare(&mut self) -> Result<(), DiffError> {
        if let Some(command) = self.settings.build_command.clone() {
            self.build(&command).await?;
        }

        if let Some(command) = self.settings.serve_command.clone() {
            info!("Starting candidate server: {}", command);
            let child = shell(&command)
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| DiffError::Startup(format!("failed to spawn '{command}': {e}")))?;
            self.server = Some(child);
        }

        if let Some(address) = self.settings.wait_for_port.clone() {
            wait_for_port(&address, self.settings.port_poll_interval, self.startup_timeout).await?;
        }
        Ok(())
    }

    async fn build(&self, command: &str) -> Result<(), DiffError> {
        info!("Building candidate catalog: {}", command);
        let start_time = Instant::now();

        let status = timeout(self.startup_timeout, shell(command).kill_on_drop(true).status())
            .await
            .map_err(|_| {
                DiffError::Startup(format!(
                    "'{command}' did not finish within {:?}",
                    self.startup_timeout
                ))
            })?
            .map_err(|e| DiffError::Startup(format!("failed to run '{command}': {e}")))?;

        if !status.success() {
            return Err(DiffError::Startup(format!("'{command}' exited with {status}")));
        }
        info!("Build finished in {:?}", start_time.elapsed());
        Ok(())
    }

    /// Stop the serve process if one is running
    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.server.take() {
            if let Err(e) = child.kill().await {
                debug!("Candidate server already gone: {}", e);
            }
        }
    }
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Poll `address` until a TCP connection succeeds or `limit` elapses
pub async fn wait_for_port(address: &str, interval: Duration, limit: Duration) -> Result<(), DiffError> {
    let start_time = Instant::now();
    let poll = async {
        loop {
            match TcpStream::connect(address).await {
                Ok(_) => return,
                Err(e) => debug!("{} not reachable yet: {}", address, e),
            }
            sleep(interval).await;
        }
    };

    timeout(limit, poll).await.map_err(|_| {
        DiffError::Startup(format!("{address} not reachable after {limit:?}"))
    })?;
    info!("{} reachable after {:?}", address, start_time.elapsed());
    Ok(())
}
