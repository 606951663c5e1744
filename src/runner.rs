//! Test dispatch and result aggregation.
//!
//! The dispatcher walks a spec's declared tests in order, hands each to the
//! checker registered for its kind, stamps the duration, and collects the
//! results into a [`SuiteRun`]. Fail-fast short-circuits on an explicit
//! assertion failure only; a checker that errored (could not determine the
//! state at all) never stops the run.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Provider;
use crate::spec::{Spec, TestSpec};

/// Outcome of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// The assertion held.
    Pass,
    /// The assertion was evaluated and did not hold.
    Fail,
    /// The test was declared skipped.
    Skip,
    /// The state could not be determined (transport failure, bad params).
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "pass"),
            CheckStatus::Fail => write!(f, "fail"),
            CheckStatus::Skip => write!(f, "skip"),
            CheckStatus::Error => write!(f, "error"),
        }
    }
}

/// The record produced for each executed test. Created once; the dispatcher
/// stamps the duration and it is never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub detail: IndexMap<String, serde_json::Value>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl CheckResult {
    pub fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            detail: IndexMap::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    pub fn skip(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Skip, message)
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Error, message)
    }

    /// Attach a structured detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.detail.insert(key.into(), value);
        self
    }
}

/// Ordered results of one suite run plus aggregate counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteRun {
    pub results: Vec<CheckResult>,
    /// True when fail-fast stopped the run before all tests executed.
    pub short_circuited: bool,
    /// True when cancellation stopped the run; results collected up to that
    /// point are kept.
    pub cancelled: bool,
}

impl SuiteRun {
    pub fn count(&self, status: CheckStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(CheckStatus::Pass)
    }

    pub fn failed(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn errored(&self) -> usize {
        self.count(CheckStatus::Error)
    }

    pub fn skipped(&self) -> usize {
        self.count(CheckStatus::Skip)
    }

    /// True when the run completed with nothing failed and nothing errored.
    pub fn success(&self) -> bool {
        !self.cancelled && self.failed() == 0 && self.errored() == 0
    }
}

/// A per-kind checker. Implementations interpret the test's parameters and
/// reach the target only through the given [`Provider`].
#[async_trait]
pub trait Check: Send + Sync {
    /// The spec kind this checker handles (the top-level YAML key).
    fn kind(&self) -> &'static str;

    /// Evaluate one declared test. Duration is stamped by the dispatcher.
    async fn run(&self, provider: &dyn Provider, test: &TestSpec) -> CheckResult;
}

/// Callback invoked after each result, for live progress reporting.
pub type ResultCallback = Box<dyn Fn(&CheckResult) + Send + Sync>;

/// Runs a spec's tests against one Provider.
pub struct Dispatcher {
    checks: HashMap<&'static str, Box<dyn Check>>,
    fail_fast: bool,
    callback: Option<ResultCallback>,
}

impl Dispatcher {
    pub fn new(checks: Vec<Box<dyn Check>>) -> Self {
        let checks = checks.into_iter().map(|c| (c.kind(), c)).collect();
        Self {
            checks,
            fail_fast: false,
            callback: None,
        }
    }

    /// Stop at the first `Fail` result. `Error` results never short-circuit.
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    /// Invoke `callback` after every result, before it is appended.
    pub fn on_result(mut self, callback: ResultCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Run every declared test in spec order.
    pub async fn run(&self, provider: &dyn Provider, spec: &Spec) -> SuiteRun {
        self.run_until(provider, spec, &CancellationToken::new())
            .await
    }

    /// Run the suite, stopping between tests (or mid-test) when `cancel`
    /// fires. A cancelled run keeps the results gathered so far and sets
    /// [`SuiteRun::cancelled`].
    pub async fn run_until(
        &self,
        provider: &dyn Provider,
        spec: &Spec,
        cancel: &CancellationToken,
    ) -> SuiteRun {
        let mut run = SuiteRun::default();

        for test in spec.flatten() {
            if cancel.is_cancelled() {
                run.cancelled = true;
                break;
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                result = self.run_one(provider, &test) => Some(result),
                _ = cancel.cancelled() => None,
            };
            let Some(mut result) = outcome else {
                warn!(name = %test.name, "run cancelled during check");
                run.cancelled = true;
                break;
            };
            result.duration = started.elapsed();
            debug!(
                name = %result.name,
                status = %result.status,
                duration_ms = result.duration.as_millis() as u64,
                "check finished"
            );

            if let Some(callback) = &self.callback {
                callback(&result);
            }

            let failed = result.status == CheckStatus::Fail;
            run.results.push(result);

            if self.fail_fast && failed {
                run.short_circuited = true;
                break;
            }
        }

        run
    }

    async fn run_one(&self, provider: &dyn Provider, test: &TestSpec) -> CheckResult {
        match self.checks.get(test.kind.as_str()) {
            Some(check) => check.run(provider, test).await,
            None => {
                warn!(kind = %test.kind, name = %test.name, "no checker for kind");
                CheckResult::error(
                    &test.name,
                    format!("no checker registered for kind '{}'", test.kind),
                )
            }
        }
    }
}
