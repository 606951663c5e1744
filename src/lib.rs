//! # hostcheck
//!
//! Validates infrastructure state declared in a YAML spec against a live
//! target. Targets are reached through pluggable execution backends (the
//! local shell, direct SSH, SSH tunneled through a jump host, or `kubectl
//! exec` into a pod), all behind one capability: run a command, return
//! stdout, stderr and an exit code.
//!
//! The heart of the crate is the [`connection`] layer: authenticated,
//! host-key-verified SSH sessions with automatic reconnection, wrapped in the
//! configurable retry/backoff machinery in [`retry`]. The [`runner`]
//! dispatches the tests a [`spec::Spec`] declares against a
//! [`connection::Provider`], and [`checks`] holds the built-in checkers.
//!
//! ```no_run
//! use hostcheck::checks;
//! use hostcheck::connection::LocalProvider;
//! use hostcheck::runner::Dispatcher;
//! use hostcheck::spec::Spec;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let spec = Spec::parse("command:\n  uptime: {}\n")?;
//! let run = Dispatcher::new(checks::builtins())
//!     .run(&LocalProvider::new(), &spec)
//!     .await;
//! assert!(run.success());
//! # Ok(())
//! # }
//! ```

pub mod checks;
pub mod connection;
pub mod retry;
pub mod runner;
pub mod spec;

pub use connection::{ConnectionError, ExecResult, Provider};
pub use runner::{CheckResult, CheckStatus, SuiteRun};
