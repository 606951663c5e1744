//! Loading of validation spec files.
//!
//! A spec is a YAML document whose top-level keys are checker kinds, each
//! mapping test names to that kind's parameters:
//!
//! ```yaml
//! command:
//!   nginx-active:
//!     exec: systemctl is-active nginx
//!     exit-status: 0
//! ```
//!
//! Declaration order is preserved end to end so results come back in the
//! order the author wrote the tests.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors from loading or parsing a spec file.
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("failed to read spec file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse spec file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// One declared test: its checker kind, its name, and the kind-specific
/// parameters left for the checker to interpret.
#[derive(Debug, Clone)]
pub struct TestSpec {
    pub kind: String,
    pub name: String,
    pub params: serde_yaml::Value,
}

/// A parsed spec file: checker kind → test name → parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Spec {
    tests: IndexMap<String, IndexMap<String, serde_yaml::Value>>,
}

impl Spec {
    /// Load and parse a spec file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let spec = Self::parse(&content).map_err(|source| SpecError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), tests = spec.len(), "loaded spec");
        Ok(spec)
    }

    /// Parse spec YAML text.
    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Total number of declared tests across all kinds.
    pub fn len(&self) -> usize {
        self.tests.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared tests in declaration order: kinds in file order, tests in
    /// file order within each kind.
    pub fn flatten(&self) -> Vec<TestSpec> {
        let mut out = Vec::with_capacity(self.len());
        for (kind, tests) in &self.tests {
            for (name, params) in tests {
                out.push(TestSpec {
                    kind: kind.clone(),
                    name: name.clone(),
                    params: params.clone(),
                });
            }
        }
        out
    }
}
