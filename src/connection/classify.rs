//! Classification of connection errors into transient and permanent.
//!
//! The retry executor consults [`is_transient`] and nothing else; all message
//! matching lives here so the retry loop stays mechanism-free.

use std::io::ErrorKind;

use super::ConnectionError;

/// Returns true if the error is transient and a retry may succeed.
///
/// Authentication, host-key, name-resolution and configuration failures are
/// permanent: retrying them would re-fail identically (or mask an active
/// attack, in the host-key case).
pub fn is_transient(error: &ConnectionError) -> bool {
    match error {
        ConnectionError::Timeout(_) => true,
        ConnectionError::ConnectionClosed => true,
        ConnectionError::DialFailed { reason, .. } => is_transient_message(reason),
        ConnectionError::ExecutionFailed(msg) => is_transient_message(msg),
        ConnectionError::Io(e) => is_transient_io_kind(e.kind()) || is_transient_message(&e.to_string()),
        ConnectionError::Ssh(msg) => is_transient_message(msg),
        ConnectionError::AuthenticationFailed { .. }
        | ConnectionError::HostKeyRejected { .. }
        | ConnectionError::NameResolution(_)
        | ConnectionError::InvalidConfig(_) => false,
    }
}

fn is_transient_io_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::UnexpectedEof
            | ErrorKind::Interrupted
    )
}

/// Substring match against known transient failure texts.
pub fn is_transient_message(msg: &str) -> bool {
    const TRANSIENT_PATTERNS: &[&str] = &[
        "connection refused",
        "connection reset",
        "connection aborted",
        "connection closed",
        "host unreachable",
        "no route to host",
        "network unreachable",
        "network is unreachable",
        "broken pipe",
        "timed out",
        "timeout",
        "temporarily unavailable",
        "eof",
        "failed to open channel",
        "channel open failure",
        "disconnected",
    ];

    let msg = msg.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| msg.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Peer;
    use std::io;

    fn dial(reason: &str) -> ConnectionError {
        ConnectionError::DialFailed {
            addr: "host:22".into(),
            reason: reason.into(),
        }
    }

    #[test]
    fn refused_and_unreachable_are_transient() {
        assert!(is_transient(&dial("connection refused")));
        assert!(is_transient(&dial("No route to host")));
        assert!(is_transient(&dial("Network is unreachable")));
        assert!(is_transient(&dial("connection reset by peer")));
    }

    #[test]
    fn timeouts_and_dead_links_are_transient() {
        assert!(is_transient(&ConnectionError::Timeout(30)));
        assert!(is_transient(&ConnectionError::ConnectionClosed));
        assert!(is_transient(&ConnectionError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "broken pipe"
        ))));
        assert!(is_transient(&ConnectionError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "early eof"
        ))));
    }

    #[test]
    fn session_creation_failure_is_transient() {
        assert!(is_transient(&ConnectionError::ExecutionFailed(
            "failed to open channel: Disconnected".into()
        )));
    }

    #[test]
    fn auth_and_hostkey_failures_are_permanent() {
        assert!(!is_transient(&ConnectionError::AuthenticationFailed {
            peer: Peer::Target,
            reason: "all methods rejected".into(),
        }));
        assert!(!is_transient(&ConnectionError::HostKeyRejected {
            host: "db1".into(),
            reason: "key mismatch".into(),
        }));
    }

    #[test]
    fn config_and_resolution_failures_are_permanent() {
        assert!(!is_transient(&ConnectionError::InvalidConfig(
            "malformed known_hosts".into()
        )));
        assert!(!is_transient(&ConnectionError::NameResolution(
            "nosuchhost.example".into()
        )));
    }

    #[test]
    fn unclassified_dial_reasons_are_permanent() {
        assert!(!is_transient(&dial("invalid socket address")));
    }
}
