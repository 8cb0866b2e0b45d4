use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::{BspConnectionConfig, JsonRpcConnection, ServerMessageSender};

/// An external build server child process whose stdio carries the JSON-RPC connection.
///
/// The child is killed when this value is dropped.
#[derive(Debug)]
pub struct BuildServerProcess {
    name: String,
    child: Child,
}

impl BuildServerProcess {
    /// Spawns `config.program` in `cwd` and starts a connection over its stdin/stdout.
    /// Lines written to stderr are logged at debug level.
    pub fn spawn(
        config: &BspConnectionConfig,
        cwd: &Path,
        incoming: ServerMessageSender,
    ) -> Result<(Self, JsonRpcConnection)> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn build server `{}`", config.program))?;

        let stdin = child.stdin.take().context("build server stdin unavailable")?;
        let stdout = child
            .stdout
            .take()
            .context("build server stdout unavailable")?;
        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target = "keel.bsp", server = %name, "{line}");
                }
            });
        }

        tracing::info!(
            target = "keel.bsp",
            server = %config.name,
            program = %config.program,
            pid = ?child.id(),
            "started build server"
        );

        let connection = JsonRpcConnection::start(stdout, stdin, incoming);
        Ok((
            Self {
                name: config.name.clone(),
                child,
            },
            connection,
        ))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits up to `grace` for the process to exit on its own, then kills it.
    pub async fn wait_or_kill(&mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(target = "keel.bsp", server = %self.name, %status, "build server exited");
            }
            Ok(Err(err)) => {
                tracing::warn!(target = "keel.bsp", server = %self.name, error = %err, "failed to wait for build server");
            }
            Err(_) => {
                tracing::warn!(
                    target = "keel.bsp",
                    server = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "build server did not exit in time; killing it"
                );
                if let Err(err) = self.child.kill().await {
                    tracing::warn!(target = "keel.bsp", server = %self.name, error = %err, "failed to kill build server");
                }
            }
        }
    }

    /// Whether the process has exited (without blocking).
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}
