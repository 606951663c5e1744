//! Connection configuration and SSH-config alias resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::retry::RetryPolicy;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default dial/handshake timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_timeout() -> Duration {
    Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
}

fn default_true() -> bool {
    true
}

/// Parameters for reaching one target host over SSH.
///
/// Immutable once constructed; owned by the [`super::SshConnection`] built
/// from it so a reconnect replays the exact same parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Target hostname, IP address, or SSH-config alias.
    pub host: String,

    /// Target SSH port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username on the target.
    pub user: String,

    /// Private key for the target; when absent only the agent is tried.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Dial and handshake timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Reject hosts absent from known_hosts instead of accepting on first use.
    #[serde(default = "default_true")]
    pub strict_host_key_checking: bool,

    /// Override for the known_hosts path (default: `~/.ssh/known_hosts`).
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,

    /// Skip host key verification entirely.
    #[serde(default)]
    pub insecure_ignore_host_key: bool,

    /// Bastion to tunnel through; absent means a direct connection.
    #[serde(default)]
    pub jump_host: Option<String>,

    /// Bastion SSH port.
    #[serde(default = "default_port")]
    pub jump_port: u16,

    /// Username on the bastion; falls back to `user`.
    #[serde(default)]
    pub jump_user: Option<String>,

    /// Private key for the bastion; independent of the target's.
    #[serde(default)]
    pub jump_identity_file: Option<PathBuf>,

    /// Retry policy for connection establishment; absent means one attempt.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Emit elapsed-stamped progress lines at connection milestones.
    #[serde(default)]
    pub verbose: bool,
}

impl ConnectionConfig {
    /// Config for a direct connection with defaults everywhere else.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            identity_file: None,
            connect_timeout: default_timeout(),
            strict_host_key_checking: true,
            known_hosts_path: None,
            insecure_ignore_host_key: false,
            jump_host: None,
            jump_port: DEFAULT_SSH_PORT,
            jump_user: None,
            jump_identity_file: None,
            retry: None,
            verbose: false,
        }
    }

    /// Set the target port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the target identity file.
    pub fn identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Route the connection through a bastion.
    pub fn jump(mut self, host: impl Into<String>, port: u16) -> Self {
        self.jump_host = Some(host.into());
        self.jump_port = port;
        self
    }

    /// Set the bastion user.
    pub fn jump_user(mut self, user: impl Into<String>) -> Self {
        self.jump_user = Some(user.into());
        self
    }

    /// Set the bastion identity file.
    pub fn jump_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.jump_identity_file = Some(path.into());
        self
    }

    /// Set the retry policy for connection establishment.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Set the dial/handshake timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bastion user, falling back to the target user.
    pub fn effective_jump_user(&self) -> &str {
        self.jump_user.as_deref().unwrap_or(&self.user)
    }
}

/// Expand `~` in a path.
pub(crate) fn expand_path(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(s.as_ref()).into_owned())
}

/// Resolve an SSH-config-style alias to a hostname.
///
/// Consults the personal config (`~/.ssh/config`) then the system one
/// (`/etc/ssh/ssh_config`) on every call; aliases are deliberately not cached
/// so edits between connection attempts take effect. Returns the literal
/// hostname when nothing matches.
pub fn resolve_alias(host: &str) -> String {
    let personal = dirs::home_dir().map(|h| h.join(".ssh").join("config"));
    let candidates = [personal, Some(PathBuf::from("/etc/ssh/ssh_config"))];

    for path in candidates.into_iter().flatten() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Some(resolved) = resolve_alias_in(&content, host) {
                debug!(alias = %host, hostname = %resolved, config = %path.display(), "resolved SSH alias");
                return resolved;
            }
        }
    }

    host.to_string()
}

/// Find the `HostName` for `host` in SSH config text, if any block matches.
pub(crate) fn resolve_alias_in(content: &str, host: &str) -> Option<String> {
    let mut in_matching_block = false;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (keyword, value) = match line.split_once(char::is_whitespace) {
            Some((k, v)) => (k, v.trim()),
            None => continue,
        };

        if keyword.eq_ignore_ascii_case("Host") {
            in_matching_block = value
                .split_whitespace()
                .any(|pattern| pattern_matches(pattern, host));
        } else if in_matching_block && keyword.eq_ignore_ascii_case("HostName") {
            return Some(value.to_string());
        }
    }

    None
}

/// Glob-style matching for SSH config `Host` patterns (`*` and `?`).
pub(crate) fn pattern_matches(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') && !pattern.contains('?') {
        return pattern == text;
    }
    wildcard_match(pattern, text)
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let mut pattern_chars = pattern.chars();
    let mut text_chars = text.chars();

    while let Some(pc) = pattern_chars.next() {
        match pc {
            '*' => {
                let rest_pattern: String = pattern_chars.collect();
                if rest_pattern.is_empty() {
                    return true;
                }
                let rest_text: String = text_chars.collect();
                for i in 0..=rest_text.len() {
                    if rest_text.is_char_boundary(i) && wildcard_match(&rest_pattern, &rest_text[i..]) {
                        return true;
                    }
                }
                return false;
            }
            '?' => {
                if text_chars.next().is_none() {
                    return false;
                }
            }
            c => {
                if text_chars.next() != Some(c) {
                    return false;
                }
            }
        }
    }

    text_chars.next().is_none()
}
