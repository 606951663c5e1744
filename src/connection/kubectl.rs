//! Command execution inside Kubernetes pods via `kubectl exec`.
//!
//! Shelling out to `kubectl` inherits the operator's kubeconfig, context
//! handling and authentication plugins without reimplementing any of them.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use super::{ConnectionError, ConnectionResult, ExecResult, Provider};

/// Where inside the cluster commands run.
#[derive(Debug, Clone)]
pub struct KubectlConfig {
    /// Pod name.
    pub pod: String,
    /// Namespace; `None` uses the kubeconfig default.
    pub namespace: Option<String>,
    /// Container within the pod; `None` uses the pod's default container.
    pub container: Option<String>,
    /// Explicit kubeconfig path.
    pub kubeconfig: Option<String>,
    /// kubectl context to use.
    pub context: Option<String>,
}

impl KubectlConfig {
    pub fn new(pod: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            namespace: None,
            container: None,
            kubeconfig: None,
            context: None,
        }
    }
}

/// Runs commands in a pod through the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct KubectlProvider {
    identifier: String,
    config: KubectlConfig,
}

impl KubectlProvider {
    pub fn new(config: KubectlConfig) -> Self {
        let identifier = match &config.namespace {
            Some(ns) => format!("{}/{}", ns, config.pod),
            None => config.pod.clone(),
        };
        Self { identifier, config }
    }
}

/// Argument vector for one `kubectl exec` invocation. Split out so argument
/// ordering and quoting can be tested without a cluster.
fn build_args(config: &KubectlConfig, command: &str) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(kubeconfig) = &config.kubeconfig {
        args.push("--kubeconfig".to_string());
        args.push(kubeconfig.clone());
    }
    if let Some(context) = &config.context {
        args.push("--context".to_string());
        args.push(context.clone());
    }
    args.push("exec".to_string());
    if let Some(namespace) = &config.namespace {
        args.push("-n".to_string());
        args.push(namespace.clone());
    }
    args.push(config.pod.clone());
    if let Some(container) = &config.container {
        args.push("-c".to_string());
        args.push(container.clone());
    }
    args.push("--".to_string());
    args.push("sh".to_string());
    args.push("-c".to_string());
    args.push(command.to_string());
    args
}

#[async_trait]
impl Provider for KubectlProvider {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn execute_command(&self, command: &str) -> ConnectionResult<ExecResult> {
        let args = build_args(&self.config, command);
        trace!(pod = %self.config.pod, %command, "executing via kubectl");

        let output = Command::new("kubectl")
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                ConnectionError::ExecutionFailed(format!("failed to spawn kubectl: {}", e))
            })?;

        Ok(ExecResult::new(
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.code(),
        ))
    }
}
