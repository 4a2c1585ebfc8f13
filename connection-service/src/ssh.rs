//! SSH transport.
//!
//! `SshConnector` opens authenticated sessions, `SshSession` forwards local
//! ports through them. The russh implementation is the production one; the
//! tunnel manager only sees the traits.

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::errors::ConnectError;
use common::models::connection::{AlgorithmPreferences, SshAuth, SshDescriptor};
use russh::client::{AuthResult, Handle};
use russh::keys::PublicKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Downstream resource a forwarded port leads to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One authenticated SSH session.
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Binds a fresh port on 127.0.0.1 whose connections are forwarded to `target`.
    async fn forward(&self, target: &ForwardTarget) -> Result<u16, ConnectError>;

    /// Stops the listener bound to `local_port`. Unknown ports are ignored.
    async fn stop_forward(&self, local_port: u16);

    /// Stops every forward and disconnects.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens SSH sessions.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, ssh: &SshDescriptor) -> Result<Arc<dyn SshSession>, ConnectError>;
}

/// russh client callbacks.
pub struct TunnelClientHandler {
    host: String,
}

impl russh::client::Handler for TunnelClientHandler {
    type Error = russh::Error;

    // Host keys are not pinned; the fingerprint is logged for audit.
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key.fingerprint(russh::keys::ssh_key::HashAlg::Sha256);
        tracing::debug!(ssh_host = %self.host, %fingerprint, "accepting server host key");
        async { Ok(true) }
    }
}

/// Production connector backed by russh.
pub struct RusshConnector {
    connect_timeout: Duration,
    keepalive: Duration,
}

impl RusshConnector {
    pub fn new(connect_timeout: Duration, keepalive: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive,
        }
    }

    fn client_config(&self, algorithms: &AlgorithmPreferences) -> Result<russh::client::Config, ConnectError> {
        let mut config = russh::client::Config::default();
        config.keepalive_interval = Some(self.keepalive);
        config.keepalive_max = 3;
        config.preferred = preferred_algorithms(algorithms)?;
        Ok(config)
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, ssh: &SshDescriptor) -> Result<Arc<dyn SshSession>, ConnectError> {
        let config = Arc::new(self.client_config(&ssh.algorithms)?);
        let secs = self.connect_timeout.as_secs();

        tracing::debug!(ssh_host = %ssh.host, ssh_port = ssh.port, user = %ssh.user, "opening SSH session");

        let stream = timeout(self.connect_timeout, TcpStream::connect((ssh.host.as_str(), ssh.port)))
            .await
            .map_err(|_| ConnectError::timeout(format!("SSH connect to {}:{} after {}s", ssh.host, ssh.port, secs)))?
            .map_err(|e| ConnectError::network(format!("cannot reach {}:{}: {}", ssh.host, ssh.port, e)))?;

        let handler = TunnelClientHandler {
            host: ssh.host.clone(),
        };
        let mut handle = timeout(
            self.connect_timeout,
            russh::client::connect_stream(config, stream, handler),
        )
        .await
        .map_err(|_| ConnectError::timeout(format!("SSH handshake with {} after {}s", ssh.host, secs)))?
        .map_err(classify_russh)?;

        timeout(self.connect_timeout, authenticate(&mut handle, ssh))
            .await
            .map_err(|_| ConnectError::timeout(format!("SSH authentication on {} after {}s", ssh.host, secs)))??;

        tracing::info!(ssh_host = %ssh.host, ssh_port = ssh.port, "SSH session established");
        Ok(Arc::new(RusshSession::new(handle)))
    }
}

/// Builds russh negotiation preferences from the descriptor's allow-list.
fn preferred_algorithms(algorithms: &AlgorithmPreferences) -> Result<russh::Preferred, ConnectError> {
    let mut preferred = russh::Preferred::default();
    if algorithms.cipher.is_empty() {
        return Ok(preferred);
    }
    let ciphers = algorithms
        .cipher
        .iter()
        .map(|name| {
            russh::cipher::Name::try_from(name.as_str())
                .map_err(|_| ConnectError::protocol(format!("unsupported cipher `{}`", name)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    preferred.cipher = Cow::Owned(ciphers);
    Ok(preferred)
}

fn classify_russh(err: russh::Error) -> ConnectError {
    match err {
        russh::Error::IO(e) => ConnectError::network(e.to_string()),
        other => ConnectError::protocol(other.to_string()),
    }
}

async fn authenticate(
    handle: &mut Handle<TunnelClientHandler>,
    ssh: &SshDescriptor,
) -> Result<(), ConnectError> {
    let result = match &ssh.auth {
        SshAuth::Password { password } => handle
            .authenticate_password(ssh.user.as_str(), password.as_str())
            .await
            .map_err(classify_russh)?,
        SshAuth::PrivateKey { path, passphrase } => {
            let key = russh::keys::load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                ConnectError::authentication(format!("cannot load private key {}: {}", path, e))
            })?;
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .map_err(classify_russh)?
                .flatten();
            handle
                .authenticate_publickey(
                    ssh.user.as_str(),
                    russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
                .map_err(classify_russh)?
        }
        SshAuth::Agent => return authenticate_with_agent(handle, &ssh.user).await,
    };

    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods, ..
        } => Err(ConnectError::authentication(format!(
            "{}@{} rejected credentials (server accepts {:?})",
            ssh.user, ssh.host, remaining_methods
        ))),
    }
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut Handle<TunnelClientHandler>,
    user: &str,
) -> Result<(), ConnectError> {
    let mut agent = russh::keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| ConnectError::authentication(format!("SSH agent unavailable: {}", e)))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ConnectError::authentication(format!("SSH agent refused to list keys: {}", e)))?;

    for key in identities {
        let result = handle
            .authenticate_publickey_with(user, key, None, &mut agent)
            .await
            .map_err(|e| ConnectError::authentication(e.to_string()))?;
        if matches!(result, AuthResult::Success) {
            return Ok(());
        }
    }
    Err(ConnectError::authentication(format!(
        "no SSH agent identity accepted for {}",
        user
    )))
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut Handle<TunnelClientHandler>,
    _user: &str,
) -> Result<(), ConnectError> {
    Err(ConnectError::authentication(
        "SSH agent authentication is only available on unix",
    ))
}

/// russh session plus the accept loops of its forwarded ports.
pub struct RusshSession {
    handle: Arc<Handle<TunnelClientHandler>>,
    forwards: Mutex<HashMap<u16, JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RusshSession {
    fn new(handle: Handle<TunnelClientHandler>) -> Self {
        Self {
            handle: Arc::new(handle),
            forwards: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn drain_forwards(&self) -> Vec<JoinHandle<()>> {
        match self.forwards.lock() {
            Ok(mut forwards) => forwards.drain().map(|(_, task)| task).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, task)| task).collect(),
        }
    }
}

#[async_trait]
impl SshSession for RusshSession {
    async fn forward(&self, target: &ForwardTarget) -> Result<u16, ConnectError> {
        if self.is_closed() {
            return Err(ConnectError::tunnel_closed("SSH session is closed"));
        }
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| ConnectError::network(format!("cannot bind local forward port: {}", e)))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| ConnectError::network(e.to_string()))?
            .port();

        let task = tokio::spawn(accept_loop(listener, self.handle.clone(), target.clone()));
        match self.forwards.lock() {
            Ok(mut forwards) => {
                forwards.insert(local_port, task);
            }
            Err(_) => {
                task.abort();
                return Err(ConnectError::connection("forward registry poisoned"));
            }
        }

        tracing::debug!(local_port, target = %target, "forwarding local port");
        Ok(local_port)
    }

    async fn stop_forward(&self, local_port: u16) {
        let task = match self.forwards.lock() {
            Ok(mut forwards) => forwards.remove(&local_port),
            Err(poisoned) => poisoned.into_inner().remove(&local_port),
        };
        if let Some(task) = task {
            task.abort();
            tracing::debug!(local_port, "stopped local forward");
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.drain_forwards() {
            task.abort();
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "tunnel closed", "en")
            .await
        {
            tracing::debug!(error = %e, "SSH disconnect after peer already left");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }
}

async fn accept_loop(
    listener: TcpListener,
    handle: Arc<Handle<TunnelClientHandler>>,
    target: ForwardTarget,
) {
    loop {
        let (mut socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "forward listener failed");
                return;
            }
        };
        let handle = handle.clone();
        let target = target.clone();
        tokio::spawn(async move {
            let channel = match handle
                .channel_open_direct_tcpip(
                    target.host.clone(),
                    u32::from(target.port),
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!(target = %target, error = %e, "direct-tcpip channel refused");
                    return;
                }
            };
            let mut remote = channel.into_stream();
            if let Err(e) = tokio::io::copy_bidirectional(&mut socket, &mut remote).await {
                tracing::debug!(target = %target, error = %e, "forwarded stream ended");
            }
        });
    }
}
