//! Test doubles for the SSH transport and the client drivers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::errors::ConnectError;
use common::models::connection::{ConnectionDescription, Dialect, SshAuth, SshDescriptor};

use crate::driver::{ClientDriver, Endpoint, LiveClient};
use crate::ssh::{ForwardTarget, SshConnector, SshSession};

static NEXT_PORT: AtomicU16 = AtomicU16::new(40000);

pub fn bastion(host: &str) -> SshDescriptor {
    SshDescriptor::new(host, "ops", SshAuth::Agent)
}

pub fn postgres(host: &str) -> ConnectionDescription {
    ConnectionDescription::new(Dialect::Postgres, host).with_port(5432)
}

#[derive(Default)]
pub struct MockSshSession {
    forwards: Mutex<BTreeMap<u16, ForwardTarget>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockSshSession {
    /// Targets currently forwarded, in local port order.
    pub fn forwarded_targets(&self) -> Vec<ForwardTarget> {
        self.forwards.lock().unwrap().values().cloned().collect()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// The peer went away without us closing anything.
    pub fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SshSession for MockSshSession {
    async fn forward(&self, target: &ForwardTarget) -> Result<u16, ConnectError> {
        if self.is_closed() {
            return Err(ConnectError::tunnel_closed("mock session closed"));
        }
        let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
        self.forwards.lock().unwrap().insert(port, target.clone());
        Ok(port)
    }

    async fn stop_forward(&self, local_port: u16) {
        self.forwards.lock().unwrap().remove(&local_port);
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.forwards.lock().unwrap().clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockSshConnector {
    opened: AtomicUsize,
    delay: Duration,
    failures: Mutex<VecDeque<ConnectError>>,
    sessions: Mutex<Vec<Arc<MockSshSession>>>,
}

impl MockSshConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn fail_next(&self, err: ConnectError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Sessions successfully opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<MockSshSession>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SshConnector for MockSshConnector {
    async fn connect(&self, _ssh: &SshDescriptor) -> Result<Arc<dyn SshSession>, ConnectError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let session = Arc::new(MockSshSession::default());
        self.sessions.lock().unwrap().push(session.clone());
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }
}

pub struct MockClient {
    dialect: Dialect,
    alive: AtomicBool,
    closed: AtomicBool,
}

impl MockClient {
    /// Makes every later ping fail like a dropped connection.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveClient for MockClient {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn ping(&self) -> Result<(), ConnectError> {
        if self.is_closed() {
            return Err(ConnectError::connection("client closed"));
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ConnectError::network("connection reset by peer"));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockDriver {
    opened: AtomicUsize,
    delay: Duration,
    failures: Mutex<VecDeque<ConnectError>>,
    endpoints: Mutex<Vec<String>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn fail_next(&self, err: ConnectError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Open attempts, failed ones included.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientDriver for MockDriver {
    async fn open(
        &self,
        description: &ConnectionDescription,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn LiveClient>, ConnectError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(endpoint.address());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let client = Arc::new(MockClient {
            dialect: description.dialect,
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        self.clients.lock().unwrap().push(client.clone());
        Ok(client)
    }
}
