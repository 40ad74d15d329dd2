//! SSH Tunnel
//!
//! Authenticated SSH transport that stands in for a direct network dial.
//! Engines whose client library only accepts a host and port are routed
//! through a loopback [`LocalForward`] that pipes every accepted socket over a
//! `direct-tcpip` channel.
//!
//! Host keys are accepted without verification. This is an interactive
//! developer tool pointed at hosts the user already trusts.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse, Msg};
use russh::{Channel, ChannelStream, Disconnect};
use russh_keys::agent::client::AgentClient;
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::dispatcher::with_cancel;
use crate::engine::error::{Cancelled, DriverError, DriverResult};
use crate::engine::types::TunnelConfig;

/// Environment variable naming the authentication agent socket
pub const AGENT_SOCKET_ENV: &str = "SSH_AUTH_SOCK";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Most prompt rounds answered before keyboard-interactive gives up
const KEYBOARD_INTERACTIVE_ROUNDS: usize = 5;
const ORIGINATOR_HOST: &str = "127.0.0.1";

#[cfg(unix)]
type AgentStream = tokio::net::UnixStream;
#[cfg(windows)]
type AgentStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// SSH client handler for russh.
struct TunnelHandler;

#[async_trait]
impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One way of proving identity to the SSH server
enum AuthMethod {
    PublicKey(Arc<KeyPair>),
    Agent(AgentClient<AgentStream>),
    Password(String),
    KeyboardInteractive(String),
}

impl AuthMethod {
    fn label(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey(_) => "publickey",
            AuthMethod::Agent(_) => "agent",
            AuthMethod::Password(_) => "password",
            AuthMethod::KeyboardInteractive(_) => "keyboard-interactive",
        }
    }

    /// Collects every method the configuration allows, in the order they will
    /// be offered. Nothing here touches the SSH server.
    async fn assemble(config: &TunnelConfig, agent_socket: Option<&Path>) -> Vec<AuthMethod> {
        let mut methods = Vec::new();
        let password = config.password.as_deref().filter(|p| !p.is_empty());

        if let Some(path) = config
            .private_key_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            match load_private_key(path, password).await {
                Ok(key) => methods.push(AuthMethod::PublicKey(key)),
                Err(reason) => warn!(path, %reason, "skipping ssh private key"),
            }
        }

        if let Some(socket) = agent_socket {
            match open_agent(socket).await {
                Ok(stream) => {
                    let agent = AuthMethod::Agent(AgentClient::connect(stream));
                    if config.use_agent {
                        methods.insert(0, agent);
                    } else {
                        methods.push(agent);
                    }
                }
                Err(e) => debug!(socket = %socket.display(), error = %e, "ssh agent unavailable"),
            }
        }

        if let Some(password) = password {
            methods.push(AuthMethod::Password(password.to_string()));
            methods.push(AuthMethod::KeyboardInteractive(password.to_string()));
        }

        methods
    }
}

/// Expands a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Reads and decodes a private key, retrying with `passphrase` when the plain
/// decode fails.
async fn load_private_key(path: &str, passphrase: Option<&str>) -> Result<Arc<KeyPair>, String> {
    let path = expand_home(path);
    let key_data = tokio::fs::read(&path)
        .await
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let key_text = String::from_utf8_lossy(&key_data);

    match russh_keys::decode_secret_key(&key_text, None) {
        Ok(key) => Ok(Arc::new(key)),
        Err(plain_err) => match passphrase {
            Some(passphrase) => russh_keys::decode_secret_key(&key_text, Some(passphrase))
                .map(Arc::new)
                .map_err(|e| format!("failed to decrypt key: {}", e)),
            None => Err(format!("failed to parse key: {}", plain_err)),
        },
    }
}

#[cfg(unix)]
async fn open_agent(socket: &Path) -> std::io::Result<AgentStream> {
    tokio::net::UnixStream::connect(socket).await
}

#[cfg(windows)]
async fn open_agent(socket: &Path) -> std::io::Result<AgentStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(socket)
}

/// Represents an authenticated SSH session
///
/// Cheap to clone; clones share the same session. Channel opens run
/// concurrently and never block [`SshTunnel::close`].
#[derive(Clone)]
pub struct SshTunnel {
    session: Arc<client::Handle<TunnelHandler>>,
    address: String,
}

impl SshTunnel {
    /// Authenticates against the SSH server, discovering the agent through
    /// [`AGENT_SOCKET_ENV`].
    pub async fn connect(config: &TunnelConfig) -> DriverResult<Self> {
        let agent_socket = std::env::var_os(AGENT_SOCKET_ENV)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        Self::connect_with_agent(config, agent_socket.as_deref()).await
    }

    /// Same as [`SshTunnel::connect`] with an explicit agent socket.
    #[instrument(
        skip(config, agent_socket),
        fields(ssh_host = %config.host, ssh_port = config.port, ssh_user = %config.user)
    )]
    pub async fn connect_with_agent(
        config: &TunnelConfig,
        agent_socket: Option<&Path>,
    ) -> DriverResult<Self> {
        config.validate().map_err(DriverError::connection)?;

        let methods = AuthMethod::assemble(config, agent_socket).await;
        if methods.is_empty() {
            return Err(DriverError::connection(format!(
                "ssh: no valid authentication methods for {}@{}",
                config.user, config.host
            )));
        }

        let address = config.address();
        let client_config = Arc::new(client::Config::default());
        let connect = client::connect(client_config, address.as_str(), TunnelHandler);

        let mut handle = match timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(DriverError::connection(format!(
                    "ssh: failed to connect to {}: {}",
                    address, e
                )))
            }
            Err(_) => {
                return Err(DriverError::connection(format!(
                    "ssh: timed out connecting to {} after {}s",
                    address,
                    CONNECT_TIMEOUT.as_secs()
                )))
            }
        };

        authenticate(&mut handle, &config.user, methods).await?;
        info!(%address, "ssh session established");

        Ok(Self {
            session: Arc::new(handle),
            address,
        })
    }

    /// Address of the SSH server this session is connected to
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Opens a tunneled connection to `host:port` as seen from the SSH server.
    pub async fn dial(&self, host: &str, port: u16) -> DriverResult<ChannelStream<Msg>> {
        let channel = open_channel(Arc::clone(&self.session), host.to_string(), port).await?;
        Ok(channel.into_stream())
    }

    /// Like [`SshTunnel::dial`], but returns as soon as `cancel` fires.
    ///
    /// The dial keeps running on its own task; a channel that opens after the
    /// caller gave up is closed rather than left dangling.
    pub async fn dial_cancellable(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> DriverResult<ChannelStream<Msg>> {
        let (tx, rx) = oneshot::channel();
        let session = Arc::clone(&self.session);
        let host = host.to_string();

        tokio::spawn(async move {
            let opened = open_channel(session, host, port).await;
            if let Err(Ok(late)) = tx.send(opened) {
                let _ = late.close().await;
            }
        });

        match with_cancel(cancel, rx).await {
            Err(Cancelled) => Err(DriverError::connection(Cancelled)),
            Ok(Ok(opened)) => opened.map(Channel::into_stream),
            Ok(Err(_)) => Err(DriverError::connection("ssh: dial task ended without a result")),
        }
    }

    /// Binds a loopback listener whose connections are piped to
    /// `remote_host:remote_port` through this session.
    pub async fn forward(&self, remote_host: &str, remote_port: u16) -> DriverResult<LocalForward> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| DriverError::connection(format!("ssh: failed to bind local port: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DriverError::connection(format!("ssh: failed to get local address: {}", e)))?;

        let cancel = CancellationToken::new();
        let tunnel = self.clone();
        let target_host = remote_host.to_string();
        let token = cancel.clone();
        tokio::spawn(async move {
            tunnel
                .accept_loop(listener, target_host, remote_port, token)
                .await;
        });

        debug!(%local_addr, remote_host, remote_port, "ssh forward listening");
        Ok(LocalForward { local_addr, cancel })
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        remote_host: String,
        remote_port: u16,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((local, peer)) => {
                        debug!(%peer, "new tunneled connection");
                        let tunnel = self.clone();
                        let host = remote_host.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = tunnel.pipe(local, &host, remote_port, &cancel).await {
                                warn!(error = %e, "tunnel forwarding error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept tunnel connection"),
                },
                _ = cancel.cancelled() => {
                    debug!(remote_host, remote_port, "ssh forward stopped");
                    break;
                }
            }
        }
    }

    async fn pipe(
        &self,
        mut local: TcpStream,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> DriverResult<()> {
        let mut remote = self.dial_cancellable(host, port, cancel).await?;

        tokio::select! {
            copied = tokio::io::copy_bidirectional(&mut local, &mut remote) => {
                copied.map(|_| ()).map_err(DriverError::connection)
            }
            _ = cancel.cancelled() => Ok(()),
        }
    }

    /// Ends the SSH session. Open channels die with it.
    pub async fn close(&self) -> DriverResult<()> {
        self.session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| DriverError::connection(format!("ssh: disconnect failed: {}", e)))
    }
}

async fn open_channel(
    session: Arc<client::Handle<TunnelHandler>>,
    host: String,
    port: u16,
) -> DriverResult<Channel<Msg>> {
    session
        .channel_open_direct_tcpip(host.clone(), u32::from(port), ORIGINATOR_HOST, 0)
        .await
        .map_err(|e| {
            DriverError::connection(format!(
                "ssh: failed to open channel to {}:{}: {}",
                host, port, e
            ))
        })
}

/// Offers each method in turn until the server accepts one.
async fn authenticate(
    handle: &mut client::Handle<TunnelHandler>,
    user: &str,
    methods: Vec<AuthMethod>,
) -> DriverResult<()> {
    let mut attempted = Vec::with_capacity(methods.len());

    for method in methods {
        let label = method.label();
        attempted.push(label);

        let outcome = match method {
            AuthMethod::PublicKey(key) => handle
                .authenticate_publickey(user, key)
                .await
                .map_err(|e| e.to_string()),
            AuthMethod::Agent(agent) => authenticate_with_agent(handle, user, agent).await,
            AuthMethod::Password(password) => handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| e.to_string()),
            AuthMethod::KeyboardInteractive(password) => {
                authenticate_keyboard_interactive(handle, user, &password).await
            }
        };

        match outcome {
            Ok(true) => {
                info!(method = label, user, "ssh authentication successful");
                return Ok(());
            }
            Ok(false) => debug!(method = label, "ssh authentication method rejected"),
            Err(e) => debug!(method = label, error = %e, "ssh authentication method failed"),
        }
    }

    Err(DriverError::connection(format!(
        "ssh: authentication failed for {} (tried {})",
        user,
        attempted.join(", ")
    )))
}

async fn authenticate_with_agent(
    handle: &mut client::Handle<TunnelHandler>,
    user: &str,
    mut agent: AgentClient<AgentStream>,
) -> Result<bool, String> {
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("failed to list agent identities: {}", e))?;
    debug!(count = identities.len(), "ssh agent identities");

    for identity in identities {
        let (returned, accepted) = handle.authenticate_future(user, identity, agent).await;
        agent = returned;
        if let Ok(true) = accepted {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Answers every prompt the server sends with `password`.
async fn authenticate_keyboard_interactive(
    handle: &mut client::Handle<TunnelHandler>,
    user: &str,
    password: &str,
) -> Result<bool, String> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(user, None::<String>)
        .await
        .map_err(|e| e.to_string())?;

    let mut answered = 0;
    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. }
                if answered < KEYBOARD_INTERACTIVE_ROUNDS =>
            {
                let answers = prompts.iter().map(|_| password.to_string()).collect();
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(|e| e.to_string())?;
                answered += 1;
            }
            _ => return Ok(false),
        }
    }
}

/// Loopback listener forwarding through an [`SshTunnel`]
///
/// Stops accepting when closed or dropped.
pub struct LocalForward {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl LocalForward {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LocalForward {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
