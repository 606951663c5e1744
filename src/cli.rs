//! Command-line interface.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use hostcheck::connection::{ConnectionConfig, KubectlConfig};
use hostcheck::retry::{BackoffStrategy, RetryPolicy};

/// Validate infrastructure state against a spec file.
#[derive(Parser, Debug)]
#[command(name = "hostcheck")]
#[command(version)]
#[command(about = "Validate infrastructure state against a spec", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a spec's tests against a target
    Validate(ValidateArgs),
}

/// How the target environment is reached.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Run commands on this machine
    Local,
    /// Run commands over SSH (optionally through a jump host)
    Ssh,
    /// Run commands in a Kubernetes pod via kubectl
    Kubectl,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Linear,
    Exponential,
    Jitter,
}

impl From<RetryStrategy> for BackoffStrategy {
    fn from(strategy: RetryStrategy) -> Self {
        match strategy {
            RetryStrategy::Linear => BackoffStrategy::Linear,
            RetryStrategy::Exponential => BackoffStrategy::Exponential,
            RetryStrategy::Jitter => BackoffStrategy::ExponentialWithJitter,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// Spec file to run
    #[arg(short = 's', long, default_value = "hostcheck.yaml")]
    pub spec: PathBuf,

    /// Execution backend
    #[arg(short = 'b', long, value_enum, default_value_t = Backend::Local)]
    pub backend: Backend,

    /// Stop at the first failed test
    #[arg(long)]
    pub fail_fast: bool,

    /// Target hostname, IP, or SSH alias (ssh backend)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Target SSH port
    #[arg(short = 'p', long, default_value_t = 22)]
    pub port: u16,

    /// Username on the target
    #[arg(short = 'u', long, env = "USER")]
    pub user: Option<String>,

    /// Private key for the target
    #[arg(short = 'i', long)]
    pub identity_file: Option<PathBuf>,

    /// Dial/handshake timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub connect_timeout: u64,

    /// Accept hosts missing from known_hosts on first connection
    #[arg(long)]
    pub no_strict_host_key_checking: bool,

    /// Override the known_hosts path
    #[arg(long)]
    pub known_hosts: Option<PathBuf>,

    /// Skip host key verification entirely (unsafe)
    #[arg(long)]
    pub insecure_ignore_host_key: bool,

    /// Bastion host to tunnel through
    #[arg(short = 'J', long)]
    pub jump_host: Option<String>,

    /// Bastion SSH port
    #[arg(long, default_value_t = 22)]
    pub jump_port: u16,

    /// Username on the bastion (defaults to the target user)
    #[arg(long)]
    pub jump_user: Option<String>,

    /// Private key for the bastion
    #[arg(long)]
    pub jump_identity_file: Option<PathBuf>,

    /// Connection retries after the first attempt (0 = single attempt)
    #[arg(long, default_value_t = 0)]
    pub retries: u32,

    /// Initial retry delay in seconds
    #[arg(long, default_value_t = 1)]
    pub retry_delay: u64,

    /// Maximum retry delay in seconds
    #[arg(long, default_value_t = 30)]
    pub retry_max_delay: u64,

    /// Backoff strategy between retries
    #[arg(long, value_enum, default_value_t = RetryStrategy::Jitter)]
    pub retry_strategy: RetryStrategy,

    /// Pod to exec into (kubectl backend)
    #[arg(long)]
    pub pod: Option<String>,

    /// Pod namespace
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// Container within the pod
    #[arg(long)]
    pub container: Option<String>,

    /// Explicit kubeconfig path
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// kubectl context
    #[arg(long)]
    pub context: Option<String>,
}

impl ValidateArgs {
    fn retry_policy(&self) -> Option<RetryPolicy> {
        if self.retries == 0 {
            return None;
        }
        Some(RetryPolicy {
            max_retries: self.retries,
            initial_delay: Duration::from_secs(self.retry_delay),
            max_delay: Duration::from_secs(self.retry_max_delay),
            strategy: self.retry_strategy.into(),
        })
    }

    /// Build the SSH connection parameters from the flags. `verbose` enables
    /// the elapsed-stamped connection progress lines.
    pub fn connection_config(&self, verbose: bool) -> Result<ConnectionConfig> {
        let host = match &self.host {
            Some(host) => host.clone(),
            None => bail!("--host is required with the ssh backend"),
        };
        let user = match &self.user {
            Some(user) => user.clone(),
            None => bail!("--user is required with the ssh backend"),
        };

        let mut config = ConnectionConfig::new(host, user)
            .port(self.port)
            .connect_timeout(Duration::from_secs(self.connect_timeout));
        config.identity_file = self.identity_file.clone();
        config.strict_host_key_checking = !self.no_strict_host_key_checking;
        config.known_hosts_path = self.known_hosts.clone();
        config.insecure_ignore_host_key = self.insecure_ignore_host_key;
        config.jump_host = self.jump_host.clone();
        config.jump_port = self.jump_port;
        config.jump_user = self.jump_user.clone();
        config.jump_identity_file = self.jump_identity_file.clone();
        config.retry = self.retry_policy();
        config.verbose = verbose;
        Ok(config)
    }

    /// Build the kubectl parameters from the flags.
    pub fn kubectl_config(&self) -> Result<KubectlConfig> {
        let pod = match &self.pod {
            Some(pod) => pod.clone(),
            None => bail!("--pod is required with the kubectl backend"),
        };
        let mut config = KubectlConfig::new(pod);
        config.namespace = self.namespace.clone();
        config.container = self.container.clone();
        config.kubeconfig = self.kubeconfig.clone();
        config.context = self.context.clone();
        Ok(config)
    }
}
