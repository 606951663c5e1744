//! The `command` checker: run a command and assert on its outcome.
//!
//! ```yaml
//! command:
//!   nginx-active:
//!     exec: systemctl is-active nginx   # defaults to the test name
//!     exit-status: 0                    # defaults to 0
//!     stdout-contains: active           # optional substring assertion
//!     skip: false
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::connection::Provider;
use crate::runner::{Check, CheckResult};
use crate::spec::TestSpec;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct CommandParams {
    /// Command to run; the test name when absent.
    #[serde(default)]
    exec: Option<String>,
    /// Expected exit status.
    #[serde(default)]
    exit_status: Option<i32>,
    /// Substring that must appear in stdout.
    #[serde(default)]
    stdout_contains: Option<String>,
    /// Declare the test skipped without running anything.
    #[serde(default)]
    skip: bool,
}

pub struct CommandCheck;

#[async_trait]
impl Check for CommandCheck {
    fn kind(&self) -> &'static str {
        "command"
    }

    async fn run(&self, provider: &dyn Provider, test: &TestSpec) -> CheckResult {
        let params: CommandParams = match serde_yaml::from_value(test.params.clone()) {
            Ok(p) => p,
            Err(e) => {
                return CheckResult::error(&test.name, format!("invalid parameters: {}", e))
            }
        };

        if params.skip {
            return CheckResult::skip(&test.name, "skipped by spec");
        }

        let command = params.exec.as_deref().unwrap_or(&test.name);
        let result = match provider.execute_command(command).await {
            Ok(r) => r,
            Err(e) => {
                return CheckResult::error(&test.name, format!("command execution failed: {}", e))
            }
        };

        let expected_status = params.exit_status.unwrap_or(0);
        let detail = |r: CheckResult| {
            r.with_detail("command", json!(command))
                .with_detail("exit_code", json!(result.exit_code))
                .with_detail("stdout", json!(result.stdout.clone()))
                .with_detail("stderr", json!(result.stderr.clone()))
        };

        if result.exit_code != expected_status {
            return detail(CheckResult::fail(
                &test.name,
                format!(
                    "exit status {} (expected {})",
                    result.exit_code, expected_status
                ),
            ));
        }

        if let Some(needle) = &params.stdout_contains {
            if !result.stdout.contains(needle.as_str()) {
                return detail(CheckResult::fail(
                    &test.name,
                    format!("stdout does not contain {:?}", needle),
                ));
            }
        }

        detail(CheckResult::pass(
            &test.name,
            format!("exit status {}", result.exit_code),
        ))
    }
}
