//! Command execution on the local machine.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use super::{ConnectionError, ConnectionResult, ExecResult, Provider};

/// Runs commands on the machine the tool itself is running on, through
/// `sh -c`. Useful for validating the controller host and for tests.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    identifier: String,
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProvider {
    pub fn new() -> Self {
        let identifier = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self { identifier }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn execute_command(&self, command: &str) -> ConnectionResult<ExecResult> {
        trace!(%command, "executing locally");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| {
                ConnectionError::ExecutionFailed(format!("failed to spawn shell: {}", e))
            })?;

        Ok(ExecResult::new(
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.code(),
        ))
    }
}
