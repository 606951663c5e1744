//! hostcheck - validate infrastructure state against a spec
//!
//! This is the main entry point for the hostcheck CLI.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Backend, Cli, Commands, ValidateArgs};
use hostcheck::checks;
use hostcheck::connection::{KubectlProvider, LocalProvider, Provider, SshConnection};
use hostcheck::runner::{CheckResult, CheckStatus, Dispatcher, SuiteRun};
use hostcheck::spec::Spec;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let exit_code = match &cli.command {
        Commands::Validate(args) => validate(args, cli.verbose).await?,
    };

    std::process::exit(exit_code);
}

/// Initialize logging based on verbosity level
fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbosity >= 3))
        .with(env_filter)
        .init();
}

async fn validate(args: &ValidateArgs, verbosity: u8) -> Result<i32> {
    let spec = Spec::load(&args.spec)
        .with_context(|| format!("cannot load spec {}", args.spec.display()))?;

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, aborting");
            ctrl_c_cancel.cancel();
        }
    });

    let dispatcher = Dispatcher::new(checks::builtins())
        .fail_fast(args.fail_fast)
        .on_result(Box::new(print_result));

    let run = match args.backend {
        Backend::Local => {
            let provider = LocalProvider::new();
            run_suite(&dispatcher, &provider, &spec, &cancel).await
        }
        Backend::Kubectl => {
            let provider = KubectlProvider::new(args.kubectl_config()?);
            run_suite(&dispatcher, &provider, &spec, &cancel).await
        }
        Backend::Ssh => {
            let config = args.connection_config(verbosity >= 1)?;
            let connection = SshConnection::connect_with_retry(config, &cancel)
                .await
                .map_err(|e| anyhow::anyhow!("connection failed: {e}"))?;

            // A cancelled run returns early through run_until, so the
            // connection is closed on that path too.
            let run = run_suite(&dispatcher, &connection, &spec, &cancel).await;
            if let Err(e) = connection.close().await {
                tracing::warn!(error = %e, "failed to close connection cleanly");
            }
            run
        }
    };

    print_summary(&run);
    Ok(if run.cancelled {
        130
    } else if run.success() {
        0
    } else {
        1
    })
}

async fn run_suite(
    dispatcher: &Dispatcher,
    provider: &dyn Provider,
    spec: &Spec,
    cancel: &CancellationToken,
) -> SuiteRun {
    tracing::info!(target_id = provider.identifier(), tests = spec.len(), "starting run");
    dispatcher.run_until(provider, spec, cancel).await
}

fn print_result(result: &CheckResult) {
    let tag = match result.status {
        CheckStatus::Pass => "ok".green(),
        CheckStatus::Fail => "failed".red(),
        CheckStatus::Skip => "skipped".yellow(),
        CheckStatus::Error => "error".red().bold(),
    };
    println!(
        "{:>7}  {}  {} ({:.1?})",
        tag, result.name, result.message, result.duration
    );
}

fn print_summary(run: &SuiteRun) {
    let line = format!(
        "{} passed, {} failed, {} errors, {} skipped",
        run.passed(),
        run.failed(),
        run.errored(),
        run.skipped()
    );
    println!();
    if run.success() {
        println!("{}", line.green());
    } else {
        println!("{}", line.red());
    }
    if run.short_circuited {
        println!("{}", "run stopped at first failure".yellow());
    }
    if run.cancelled {
        println!("{}", "run cancelled".yellow());
    }
}
