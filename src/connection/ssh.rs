//! SSH connection management and command execution.
//!
//! [`SshConnection::connect`] establishes an authenticated, host-key-verified
//! session, either directly or tunneled through a jump host: the jump
//! connection is dialed and authenticated first, a raw byte-stream to the
//! target is opened through it, and the target handshake runs over that
//! stream. Any failure after the jump connection succeeds closes the jump
//! connection before the error is returned.
//!
//! Commands each get a fresh channel. If channel creation fails, the
//! connection is presumed dead and rebuilt once from the original config;
//! a second failure is fatal for that call.

use std::sync::Arc;
use std::sync::Once;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client::{Config, Handle, Handler, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::agent::client::AgentClient;
use russh_keys::key::PublicKey;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::retry::{retry, RetryError};

use super::auth::{self, AuthMethod};
use super::classify;
use super::config::resolve_alias;
use super::hostkey::{self, HostKeyStatus, HostKeyVerifier};
use super::{ConnectionConfig, ConnectionError, ConnectionResult, ExecResult, Peer, Provider};

static INSECURE_WARNING: Once = Once::new();

/// Wrapper so `russh::Error` can serve as the client handler's error type.
#[derive(Debug)]
pub struct HandlerError(pub russh::Error);

impl From<russh::Error> for HandlerError {
    fn from(err: russh::Error) -> Self {
        HandlerError(err)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

/// Client-side handler performing host key verification for one peer.
struct ClientHandler {
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
    strict: bool,
}

impl ClientHandler {
    fn new(host: &str, port: u16, verifier: HostKeyVerifier, strict: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            verifier,
            strict,
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = HandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.verifier.verify(&self.host, self.port, server_public_key) {
            HostKeyStatus::Verified => {
                trace!(host = %self.host, "host key accepted");
                Ok(true)
            }
            HostKeyStatus::Unknown => {
                if self.strict {
                    warn!(host = %self.host, "host not found in known_hosts, rejecting");
                    Ok(false)
                } else {
                    warn!(host = %self.host, "host not found in known_hosts, accepting (first connection)");
                    Ok(true)
                }
            }
            HostKeyStatus::Mismatch => {
                warn!(
                    host = %self.host,
                    "HOST KEY VERIFICATION FAILED: server key does not match known_hosts entry"
                );
                Ok(false)
            }
        }
    }
}

/// Elapsed-stamped progress reporting for verbose mode. Never affects
/// control flow.
struct Progress {
    start: Instant,
    enabled: bool,
}

impl Progress {
    fn new(enabled: bool) -> Self {
        Self {
            start: Instant::now(),
            enabled,
        }
    }

    fn note(&self, message: &str) {
        if self.enabled {
            info!(
                elapsed_ms = self.start.elapsed().as_millis() as u64,
                "{message}"
            );
        }
    }
}

/// An authenticated SSH session to one target, optionally through a jump
/// host. Holds at most one live target handle and one jump handle; when both
/// exist the target session was opened through the jump session.
pub struct SshConnection {
    identifier: String,
    config: ConnectionConfig,
    target: Mutex<Option<Handle<ClientHandler>>>,
    jump: Mutex<Option<Handle<ClientHandler>>>,
}

impl SshConnection {
    /// Connect using `config`, dialing through the jump host when one is
    /// configured.
    pub async fn connect(config: ConnectionConfig) -> ConnectionResult<Self> {
        if config.insecure_ignore_host_key {
            INSECURE_WARNING.call_once(|| {
                warn!("host key verification disabled; connections are open to impersonation");
            });
        }

        let progress = Progress::new(config.verbose);
        let (jump, target) = Self::establish(&config, &progress).await?;

        let identifier = match &config.jump_host {
            Some(jump_host) => format!(
                "{}@{}:{} via {}",
                config.user, config.host, config.port, jump_host
            ),
            None => format!("{}@{}:{}", config.user, config.host, config.port),
        };

        Ok(Self {
            identifier,
            config,
            target: Mutex::new(Some(target)),
            jump: Mutex::new(jump),
        })
    }

    /// Connect under the config's retry policy, classifying failures with
    /// [`classify::is_transient`]. Absent policy means a single attempt.
    pub async fn connect_with_retry(
        config: ConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, RetryError<ConnectionError>> {
        let policy = config.retry.clone();
        retry(policy.as_ref(), classify::is_transient, cancel, || {
            let config = config.clone();
            async move { Self::connect(config).await }
        })
        .await
    }

    /// Close the session(s): target first, then the jump handle even if the
    /// target close failed. The first error encountered is surfaced.
    pub async fn close(&self) -> ConnectionResult<()> {
        let target = self.target.lock().await.take();
        let jump = self.jump.lock().await.take();

        let target_err = match target {
            Some(handle) => close_handle(&handle).await.err(),
            None => None,
        };
        let jump_err = match jump {
            Some(handle) => close_handle(&handle).await.err(),
            None => None,
        };

        first_close_error(target_err, jump_err)
    }

    async fn establish(
        config: &ConnectionConfig,
        progress: &Progress,
    ) -> ConnectionResult<(Option<Handle<ClientHandler>>, Handle<ClientHandler>)> {
        match &config.jump_host {
            None => {
                let target = Self::connect_direct(config, progress).await?;
                Ok((None, target))
            }
            Some(jump_host) => {
                let (jump, target) =
                    Self::connect_through_jump(config, jump_host, progress).await?;
                Ok((Some(jump), target))
            }
        }
    }

    async fn connect_direct(
        config: &ConnectionConfig,
        progress: &Progress,
    ) -> ConnectionResult<Handle<ClientHandler>> {
        let methods = auth::resolve(config.identity_file.as_deref(), Peer::Target)?;
        let verifier = hostkey::resolve(config)?;

        // Alias resolution runs on every attempt; config file edits between
        // attempts take effect.
        let host = resolve_alias(&config.host);
        let addr = format!("{}:{}", host, config.port);

        progress.note(&format!("dialing {addr}"));
        let socket = dial(&addr, config.connect_timeout).await?;

        let handler = ClientHandler::new(
            &host,
            config.port,
            verifier,
            config.strict_host_key_checking,
        );
        let mut session = handshake(socket, handler, &addr, config.connect_timeout).await?;
        authenticate(&mut session, &config.user, &methods, Peer::Target).await?;
        progress.note("target connected");

        Ok(session)
    }

    async fn connect_through_jump(
        config: &ConnectionConfig,
        jump_host: &str,
        progress: &Progress,
    ) -> ConnectionResult<(Handle<ClientHandler>, Handle<ClientHandler>)> {
        // Both peers resolve their methods up front: a broken target identity
        // file fails before anything is dialed.
        let jump_methods = auth::resolve(config.jump_identity_file.as_deref(), Peer::Jump)?;
        let target_methods = auth::resolve(config.identity_file.as_deref(), Peer::Target)?;
        let verifier = hostkey::resolve(config)?;

        let resolved_jump = resolve_alias(jump_host);
        let jump_addr = format!("{}:{}", resolved_jump, config.jump_port);

        progress.note(&format!("dialing jump host {jump_addr}"));
        let socket = dial(&jump_addr, config.connect_timeout).await?;
        let handler = ClientHandler::new(
            &resolved_jump,
            config.jump_port,
            verifier.clone(),
            config.strict_host_key_checking,
        );
        let mut jump = handshake(socket, handler, &jump_addr, config.connect_timeout).await?;
        authenticate(&mut jump, config.effective_jump_user(), &jump_methods, Peer::Jump).await?;
        progress.note("jump host connected");

        // From here on the jump connection is a resource that must not leak:
        // every failure path closes it before returning.
        let resolved_target = resolve_alias(&config.host);
        let target_addr = format!("{}:{}", resolved_target, config.port);

        let channel = match jump
            .channel_open_direct_tcpip(
                resolved_target.clone(),
                u32::from(config.port),
                "127.0.0.1",
                0,
            )
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let err = ConnectionError::DialFailed {
                    addr: target_addr,
                    reason: format!("dial-through failed: {}", e),
                };
                return Err(close_jump_after(jump, err).await);
            }
        };

        let handler = ClientHandler::new(
            &resolved_target,
            config.port,
            verifier,
            config.strict_host_key_checking,
        );
        let mut target = match handshake(
            channel.into_stream(),
            handler,
            &target_addr,
            config.connect_timeout,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => return Err(close_jump_after(jump, e).await),
        };

        if let Err(e) = authenticate(&mut target, &config.user, &target_methods, Peer::Target).await
        {
            let _ = close_handle(&target).await;
            return Err(close_jump_after(jump, e).await);
        }
        progress.note("target connected");

        Ok((jump, target))
    }

    /// Tear down whatever is live and establish fresh sessions from the
    /// original config.
    async fn reconnect(&self) -> ConnectionResult<()> {
        debug!(identifier = %self.identifier, "reconnecting");
        let progress = Progress::new(self.config.verbose);
        let (new_jump, new_target) = Self::establish(&self.config, &progress).await?;

        let old_target = self.target.lock().await.replace(new_target);
        let old_jump = {
            let mut guard = self.jump.lock().await;
            std::mem::replace(&mut *guard, new_jump)
        };
        if let Some(handle) = old_target {
            let _ = close_handle(&handle).await;
        }
        if let Some(handle) = old_jump {
            let _ = close_handle(&handle).await;
        }
        Ok(())
    }

    async fn open_channel(&self) -> ConnectionResult<Channel<Msg>> {
        let guard = self.target.lock().await;
        let handle = guard.as_ref().ok_or(ConnectionError::ConnectionClosed)?;
        handle.channel_open_session().await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("failed to open channel: {}", e))
        })
    }

    async fn run_on_channel(
        &self,
        mut channel: Channel<Msg>,
        command: &str,
    ) -> ConnectionResult<ExecResult> {
        channel.exec(true, command).await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("failed to start command: {}", e))
        })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } => {
                    if ext == 1 {
                        stderr.extend_from_slice(data);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        let _ = channel.eof().await;

        trace!(exit_code = ?exit_code, "command completed");
        Ok(ExecResult::new(
            String::from_utf8_lossy(&stdout).to_string(),
            String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
        ))
    }
}

#[async_trait]
impl Provider for SshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Run a command on a fresh channel, reconnecting exactly once if the
    /// connection has died. A nonzero exit status is a normal result.
    async fn execute_command(&self, command: &str) -> ConnectionResult<ExecResult> {
        let channel = match self.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "channel open failed, attempting reconnect");
                self.reconnect().await?;
                self.open_channel().await.map_err(|e| {
                    ConnectionError::ExecutionFailed(format!(
                        "channel open failed after reconnect: {}",
                        e
                    ))
                })?
            }
        };
        self.run_on_channel(channel, command).await
    }
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

async fn dial(addr: &str, timeout: Duration) -> ConnectionResult<TcpStream> {
    let socket = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ConnectionError::Timeout(timeout.as_secs()))?
        .map_err(|e| map_dial_error(addr, e))?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

/// Distinguish name-resolution failures from ordinary dial failures; the
/// former are permanent, the latter usually transient.
fn map_dial_error(addr: &str, e: std::io::Error) -> ConnectionError {
    let reason = e.to_string();
    let lowered = reason.to_lowercase();
    if lowered.contains("lookup") || lowered.contains("name or service") {
        ConnectionError::NameResolution(format!("{}: {}", addr, reason))
    } else {
        ConnectionError::DialFailed {
            addr: addr.to_string(),
            reason,
        }
    }
}

async fn handshake<S>(
    stream: S,
    handler: ClientHandler,
    addr: &str,
    timeout: Duration,
) -> ConnectionResult<Handle<ClientHandler>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut ssh_config = Config::default();
    ssh_config.inactivity_timeout = Some(timeout);

    let host = addr.rsplit_once(':').map(|(h, _)| h.to_string());
    russh::client::connect_stream(Arc::new(ssh_config), stream, handler)
        .await
        .map_err(|e| match e.0 {
            russh::Error::UnknownKey => ConnectionError::HostKeyRejected {
                host: host.unwrap_or_else(|| addr.to_string()),
                reason: "server key rejected by verifier".to_string(),
            },
            other => ConnectionError::DialFailed {
                addr: addr.to_string(),
                reason: format!("SSH handshake failed: {}", other),
            },
        })
}

async fn authenticate(
    session: &mut Handle<ClientHandler>,
    user: &str,
    methods: &[AuthMethod],
    peer: Peer,
) -> ConnectionResult<()> {
    let mut last_rejection = String::from("no authentication method succeeded");

    for method in methods {
        match method {
            AuthMethod::Key(key) => match session.authenticate_publickey(user, key.clone()).await {
                Ok(true) => {
                    debug!(%peer, "authenticated with identity file");
                    return Ok(());
                }
                Ok(false) => {
                    last_rejection = "public key rejected".to_string();
                    debug!(%peer, "identity file rejected, trying next method");
                }
                Err(e) => {
                    last_rejection = e.to_string();
                    debug!(%peer, error = %e, "key authentication errored, trying next method");
                }
            },
            AuthMethod::Agent => match try_agent_auth(session, user).await {
                Ok(()) => {
                    debug!(%peer, "authenticated via SSH agent");
                    return Ok(());
                }
                Err(reason) => {
                    last_rejection = reason;
                    debug!(%peer, "agent authentication failed, trying next method");
                }
            },
        }
    }

    Err(ConnectionError::AuthenticationFailed {
        peer,
        reason: last_rejection,
    })
}

/// Try every identity the agent offers. Returns the failure reason rather
/// than an error so the caller can keep its peer attribution.
async fn try_agent_auth(session: &mut Handle<ClientHandler>, user: &str) -> Result<(), String> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| format!("failed to connect to SSH agent: {}", e))?;

    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("failed to list agent identities: {}", e))?;

    if identities.is_empty() {
        return Err("SSH agent has no identities".to_string());
    }
    debug!(identity_count = identities.len(), "trying SSH agent identities");

    for identity in identities {
        let (returned_agent, result) = session
            .authenticate_future(user, identity.clone(), agent)
            .await;
        agent = returned_agent;

        match result {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("agent identity rejected, trying next"),
            Err(e) => trace!(error = %e, "agent authentication attempt errored"),
        }
    }

    Err("all SSH agent identities rejected".to_string())
}

async fn close_handle(handle: &Handle<ClientHandler>) -> ConnectionResult<()> {
    handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
        .map_err(ConnectionError::from)
}

/// Close the jump handle after a post-jump failure, preserving the original
/// error. The close result is logged, never propagated over the cause.
async fn close_jump_after(jump: Handle<ClientHandler>, err: ConnectionError) -> ConnectionError {
    if let Err(close_err) = close_handle(&jump).await {
        warn!(error = %close_err, "failed to close jump connection after error");
    }
    err
}

/// Dual-close aggregation: the target close error wins; the jump close error
/// is reported only when the target close did not already report one.
fn first_close_error(
    target_err: Option<ConnectionError>,
    jump_err: Option<ConnectionError>,
) -> ConnectionResult<()> {
    match (target_err, jump_err) {
        (Some(e), _) => Err(e),
        (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::server::{self, Auth};
    use russh_keys::key::KeyPair;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key_file() -> tempfile::NamedTempFile {
        let key = KeyPair::generate_ed25519().expect("keygen");
        let file = tempfile::NamedTempFile::new().unwrap();
        russh_keys::encode_pkcs8_pem(&key, file.as_file()).unwrap();
        file
    }

    /// In-process SSH server that accepts any public key and leaves channel
    /// opens to the default handler, which refuses them. Counts sessions
    /// created and sessions torn down.
    struct CountingServer {
        clients: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    struct CountingHandler {
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for CountingHandler {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl server::Server for CountingServer {
        type Handler = CountingHandler;

        fn new_client(&mut self, _peer: Option<std::net::SocketAddr>) -> CountingHandler {
            self.clients.fetch_add(1, Ordering::SeqCst);
            CountingHandler {
                dropped: Arc::clone(&self.dropped),
            }
        }
    }

    #[async_trait]
    impl server::Handler for CountingHandler {
        type Error = russh::Error;

        async fn auth_publickey(
            &mut self,
            _user: &str,
            _key: &PublicKey,
        ) -> Result<Auth, Self::Error> {
            Ok(Auth::Accept)
        }
    }

    async fn spawn_jump_server() -> (std::net::SocketAddr, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let clients = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let config = Arc::new(server::Config {
            keys: vec![KeyPair::generate_ed25519().expect("keygen")],
            ..Default::default()
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut srv = CountingServer {
            clients: Arc::clone(&clients),
            dropped: Arc::clone(&dropped),
        };
        tokio::spawn(async move {
            use russh::server::Server as _;
            let _ = srv.run_on_socket(config, &listener).await;
        });
        (addr, clients, dropped)
    }

    #[test]
    fn dial_error_mapping_distinguishes_dns_failures() {
        let dns = map_dial_error(
            "nosuchhost:22",
            std::io::Error::new(
                std::io::ErrorKind::Other,
                "failed to lookup address information: Name or service not known",
            ),
        );
        assert!(matches!(dns, ConnectionError::NameResolution(_)));
        assert!(!classify::is_transient(&dns));

        let refused = map_dial_error(
            "127.0.0.1:2222",
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
        );
        assert!(matches!(refused, ConnectionError::DialFailed { .. }));
        assert!(classify::is_transient(&refused));
    }

    #[test]
    fn close_error_aggregation_prefers_target_error() {
        let target = ConnectionError::Ssh("target close failed".into());
        let jump = ConnectionError::Ssh("jump close failed".into());
        let err = first_close_error(Some(target), Some(jump)).unwrap_err();
        assert!(err.to_string().contains("target close failed"));

        let jump = ConnectionError::Ssh("jump close failed".into());
        let err = first_close_error(None, Some(jump)).unwrap_err();
        assert!(err.to_string().contains("jump close failed"));

        assert!(first_close_error(None, None).is_ok());
    }

    #[tokio::test]
    async fn missing_identity_file_fails_before_any_dial() {
        // No listener exists on this port; a dial attempt would surface as
        // DialFailed. Getting AuthenticationFailed proves resolution ran
        // first and nothing was dialed.
        let mut config = ConnectionConfig::new("127.0.0.1", "deploy").port(1);
        config.identity_file = Some("/nonexistent/id_ed25519".into());
        config.insecure_ignore_host_key = true;

        let err = SshConnection::connect(config).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::AuthenticationFailed {
                peer: Peer::Target,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn refused_dial_is_a_transient_dial_failure() {
        // Bind to an ephemeral port, then drop the listener so the port is
        // known to be closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let keys = key_file();
        let mut config = ConnectionConfig::new("127.0.0.1", "deploy").port(port);
        config.identity_file = Some(keys.path().to_path_buf());
        config.insecure_ignore_host_key = true;

        let err = SshConnection::connect(config).await.unwrap_err();
        assert!(matches!(err, ConnectionError::DialFailed { .. }), "{err}");
        assert!(classify::is_transient(&err));
    }

    #[tokio::test]
    async fn connect_with_retry_reports_exhaustion_with_cause() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let keys = key_file();
        let mut config = ConnectionConfig::new("127.0.0.1", "deploy").port(port);
        config.identity_file = Some(keys.path().to_path_buf());
        config.insecure_ignore_host_key = true;
        config.retry = Some(crate::retry::RetryPolicy::linear(
            2,
            Duration::from_millis(5),
        ));

        let cancel = CancellationToken::new();
        let err = SshConnection::connect_with_retry(config, &cancel)
            .await
            .err()
            .expect("connection must fail");
        match err {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last_error, ConnectionError::DialFailed { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_dial_through_closes_the_jump_connection() {
        let (addr, clients, dropped) = spawn_jump_server().await;

        let keys = key_file();
        let mut config = ConnectionConfig::new("203.0.113.9", "deploy")
            .port(2201)
            .jump("127.0.0.1", addr.port());
        config.identity_file = Some(keys.path().to_path_buf());
        config.jump_identity_file = Some(keys.path().to_path_buf());
        config.insecure_ignore_host_key = true;

        // Jump dial and auth succeed; the dial-through is refused by the
        // server, so establishment fails after the jump session is live.
        let err = SshConnection::connect(config.clone()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::DialFailed { .. }), "{err}");
        assert!(err.to_string().contains("dial-through"), "{err}");

        // The jump handle was released before the error came back: a second
        // attempt opens a fresh jump session rather than tripping over a
        // leaked one.
        let err = SshConnection::connect(config).await.unwrap_err();
        assert!(matches!(err, ConnectionError::DialFailed { .. }), "{err}");
        assert_eq!(clients.load(Ordering::SeqCst), 2);

        // Both jump sessions were torn down by the client's disconnect.
        tokio::time::timeout(Duration::from_secs(5), async {
            while dropped.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("jump sessions were not torn down");
    }

    #[tokio::test]
    async fn dead_session_triggers_exactly_one_reconnect_dial() {
        let dials = Arc::new(AtomicUsize::new(0));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let counter = Arc::clone(&dials);
        // Accept and immediately hang up, so every reconnect dial is counted
        // and every handshake fails.
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let keys = key_file();
        let mut config = ConnectionConfig::new("127.0.0.1", "deploy").port(port);
        config.identity_file = Some(keys.path().to_path_buf());
        config.insecure_ignore_host_key = true;

        // A connection whose target session is already gone.
        let connection = SshConnection {
            identifier: "deploy@127.0.0.1".to_string(),
            config,
            target: Mutex::new(None),
            jump: Mutex::new(None),
        };

        let err = connection.execute_command("true").await.unwrap_err();
        assert!(matches!(err, ConnectionError::DialFailed { .. }), "{err}");
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_auth_failure_is_not_retried() {
        let mut config = ConnectionConfig::new("127.0.0.1", "deploy").port(1);
        config.identity_file = Some("/nonexistent/id_ed25519".into());
        config.insecure_ignore_host_key = true;
        config.retry = Some(crate::retry::RetryPolicy::linear(
            5,
            Duration::from_millis(5),
        ));

        let cancel = CancellationToken::new();
        let start = Instant::now();
        let err = SshConnection::connect_with_retry(config, &cancel)
            .await
            .err()
            .expect("connection must fail");
        assert!(matches!(err, RetryError::Fatal { .. }));
        // A retried run would have slept between attempts.
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
