//! Live client cache.
//!
//! One slot per connection identity. A slot's mutex serializes creation,
//! probing and removal for that identity; distinct identities never contend
//! beyond the short map lookup. Creation runs on a spawned task that owns the
//! slot guard, so a caller that goes away does not cancel it and the waiters
//! still observe its outcome.
//!
//! A slot lives only while a client is cached or a caller holds it. Whoever
//! lets go of a slot last removes it from the map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::errors::ConnectError;
use common::identity::{display_key_of, identity_of, ConnectionIdentity};
use common::models::connection::{ConnectionDescription, ConnectionItem, Dialect, Scope};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::driver::{ClientDriver, Endpoint, LiveClient};
use crate::ssh::ForwardTarget;
use crate::tunnel_manager::{TunnelLease, TunnelManager};

/// A live client bound to its resolved endpoint.
pub struct ClientHandle {
    identity: ConnectionIdentity,
    display_key: String,
    description: ConnectionDescription,
    endpoint: Endpoint,
    client: Arc<dyn LiveClient>,
    tunnel: Option<TunnelLease>,
    connected_at: DateTime<Utc>,
}

impl ClientHandle {
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn display_key(&self) -> &str {
        &self.display_key
    }

    /// Description as connected, with `assigned_port` and `connected_at` filled in.
    pub fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn client(&self) -> &Arc<dyn LiveClient> {
        &self.client
    }

    pub fn tunnel(&self) -> Option<&TunnelLease> {
        self.tunnel.as_ref()
    }

    /// Probes the tunnel first, then the client.
    pub async fn ping(&self) -> Result<(), ConnectError> {
        if let Some(lease) = &self.tunnel {
            lease.ensure_open()?;
        }
        self.client.ping().await
    }

    pub fn to_item(&self) -> ConnectionItem {
        ConnectionItem {
            identity: self.identity.to_string(),
            display_key: self.display_key.clone(),
            dialect: self.description.dialect,
            scope: self.description.scope,
            category: self.description.category(),
            address: self.endpoint.address(),
            tunneled: self.tunnel.is_some(),
            connected_at: self.connected_at,
        }
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

/// How a request for a client was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// An existing client passed its probe, or a concurrent attempt made it.
    Cached,
    /// This call opened the client.
    Created,
    /// A cached client failed its probe and this call replaced it.
    Reopened,
}

#[derive(Default)]
struct SlotState {
    handle: Option<Arc<ClientHandle>>,
    /// Outcome of the most recent creation attempt, kept for its waiters.
    last_failure: Option<ConnectError>,
}

#[derive(Default)]
struct Slot {
    /// Finished creation attempts. Read before queueing on `state`.
    attempts: AtomicU64,
    state: Arc<Mutex<SlotState>>,
}

type SlotMap = RwLock<HashMap<ConnectionIdentity, Arc<Slot>>>;

/// Drops `slot` and forgets it when nothing else holds it and no client is cached.
///
/// New references come from the map under its lock or from a caller already
/// holding one, so a count of one under the write lock means nobody is queued.
async fn release_slot(slots: &SlotMap, identity: &ConnectionIdentity, slot: Arc<Slot>) {
    let mut map = slots.write().await;
    drop(slot);
    let idle = map.get(identity).is_some_and(|entry| {
        Arc::strong_count(entry) == 1
            && entry.state.try_lock().is_ok_and(|state| state.handle.is_none())
    });
    if idle {
        map.remove(identity);
    }
}

/// What creation needs, shareable with the spawned task.
struct Opener {
    tunnels: Arc<TunnelManager>,
    driver: Arc<dyn ClientDriver>,
    connect_timeout: Duration,
    probe_timeout: Duration,
}

impl Opener {
    async fn probe(&self, handle: &ClientHandle) -> Result<Duration, ConnectError> {
        let started = Instant::now();
        tokio::time::timeout(self.probe_timeout, handle.ping())
            .await
            .map_err(|_| {
                ConnectError::timeout(format!(
                    "liveness probe exceeded {}ms",
                    self.probe_timeout.as_millis()
                ))
            })??;
        Ok(started.elapsed())
    }

    async fn dispose(&self, handle: &ClientHandle) {
        handle.client.close().await;
        if let Some(lease) = &handle.tunnel {
            self.tunnels.release_tunnel(lease).await;
        }
    }

    /// Resolves the endpoint, opening a tunnel if needed, then opens the client.
    async fn open(
        &self,
        identity: ConnectionIdentity,
        description: &ConnectionDescription,
    ) -> Result<ClientHandle, ConnectError> {
        let mut description = description.clone();
        description.clear_ephemeral();

        let lease = match (description.dialect, description.ssh.as_ref()) {
            (Dialect::SQLite, _) => None,
            (Dialect::Ssh, Some(ssh)) => Some(self.tunnels.acquire_session(ssh).await?),
            (Dialect::Ssh, None) => {
                return Err(ConnectError::validation("SSH connections need an SSH descriptor"))
            }
            (_, Some(ssh)) => {
                let target = ForwardTarget {
                    host: description.host.trim().to_string(),
                    port: description.forward_port(),
                };
                Some(self.tunnels.acquire_tunnel(ssh, &target).await?)
            }
            (_, None) => None,
        };

        match self.open_client(&description, lease.as_ref()).await {
            Ok((endpoint, client)) => {
                let connected_at = Utc::now();
                description.connected_at = Some(connected_at);
                if let (Some(ssh), Some(lease)) = (description.ssh.as_mut(), lease.as_ref()) {
                    ssh.assigned_port = lease.local_port();
                }
                Ok(ClientHandle {
                    display_key: display_key_of(&description),
                    identity,
                    description,
                    endpoint,
                    client,
                    tunnel: lease,
                    connected_at,
                })
            }
            Err(err) => {
                if let Some(lease) = &lease {
                    self.tunnels.release_tunnel(lease).await;
                }
                Err(err)
            }
        }
    }

    async fn open_client(
        &self,
        description: &ConnectionDescription,
        lease: Option<&TunnelLease>,
    ) -> Result<(Endpoint, Arc<dyn LiveClient>), ConnectError> {
        let endpoint = match (description.dialect, lease) {
            (Dialect::SQLite, _) => Endpoint::File(
                description
                    .file_path
                    .clone()
                    .ok_or_else(|| ConnectError::validation("SQLite connections need a file path"))?,
            ),
            (Dialect::Ssh, Some(lease)) => Endpoint::Session(lease.session()?),
            (_, Some(lease)) => Endpoint::Tunneled {
                local_port: lease
                    .local_port()
                    .ok_or_else(|| ConnectError::tunnel_closed("tunnel lease has no forwarded port"))?,
            },
            (_, None) => Endpoint::Direct {
                host: description.host.trim().to_string(),
                port: description.effective_port(),
            },
        };

        let client = tokio::time::timeout(self.connect_timeout, self.driver.open(description, &endpoint))
            .await
            .map_err(|_| {
                ConnectError::timeout(format!(
                    "{} client at {} did not connect within {}s",
                    description.dialect,
                    endpoint.address(),
                    self.connect_timeout.as_secs()
                ))
            })??;
        Ok((endpoint, client))
    }

    /// Body of one creation attempt, run while holding the slot guard.
    async fn get_or_create_locked(
        &self,
        state: &mut SlotState,
        identity: ConnectionIdentity,
        description: &ConnectionDescription,
    ) -> Result<(Arc<ClientHandle>, Lookup), ConnectError> {
        let mut outcome = Lookup::Created;
        if let Some(handle) = state.handle.clone() {
            match self.probe(&handle).await {
                Ok(_) => {
                    tracing::debug!(identity = %identity, "reusing live client");
                    return Ok((handle, Lookup::Cached));
                }
                Err(err) => {
                    tracing::warn!(identity = %identity, error = %err, "cached client failed probe, reconnecting");
                    state.handle = None;
                    self.dispose(&handle).await;
                    outcome = Lookup::Reopened;
                }
            }
        }

        match self.open(identity.clone(), description).await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                tracing::info!(
                    identity = %identity,
                    endpoint = %handle.endpoint.address(),
                    tunneled = handle.tunnel.is_some(),
                    "client connected"
                );
                state.handle = Some(handle.clone());
                state.last_failure = None;
                Ok((handle, outcome))
            }
            Err(err) => {
                tracing::warn!(identity = %identity, kind = ?err.kind(), error = %err, "connect failed");
                state.last_failure = Some(err.clone());
                Err(err)
            }
        }
    }
}

/// Sole owner of live clients.
pub struct PoolManager {
    opener: Arc<Opener>,
    slots: Arc<SlotMap>,
}

impl PoolManager {
    pub fn new(
        tunnels: Arc<TunnelManager>,
        driver: Arc<dyn ClientDriver>,
        connect_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            opener: Arc::new(Opener {
                tunnels,
                driver,
                connect_timeout,
                probe_timeout,
            }),
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.opener.tunnels
    }

    async fn slot(&self, identity: &ConnectionIdentity) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().await.get(identity) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    async fn existing_slot(&self, identity: &ConnectionIdentity) -> Option<Arc<Slot>> {
        self.slots.read().await.get(identity).cloned()
    }

    async fn release(&self, identity: &ConnectionIdentity, slot: Arc<Slot>) {
        release_slot(&self.slots, identity, slot).await;
    }

    /// Number of identities with a slot, live or in flight.
    #[cfg(test)]
    pub(crate) async fn slot_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Returns the live client for `description`, creating it on a miss or
    /// after a failed probe.
    ///
    /// Callers that queued behind an attempt in flight get that attempt's
    /// result, success or failure, instead of starting their own.
    pub async fn get_or_create(
        &self,
        description: &ConnectionDescription,
    ) -> Result<Arc<ClientHandle>, ConnectError> {
        self.lookup_or_create(description)
            .await
            .map(|(handle, _)| handle)
    }

    /// Like [`get_or_create`](Self::get_or_create), also reporting whether
    /// this call opened the client.
    pub async fn lookup_or_create(
        &self,
        description: &ConnectionDescription,
    ) -> Result<(Arc<ClientHandle>, Lookup), ConnectError> {
        let identity = identity_of(description);
        let slot = self.slot(&identity).await;
        let ticket = slot.attempts.load(Ordering::SeqCst);
        let mut guard: OwnedMutexGuard<SlotState> = slot.state.clone().lock_owned().await;

        if slot.attempts.load(Ordering::SeqCst) != ticket {
            let shared = match (guard.handle.clone(), guard.last_failure.clone()) {
                (Some(handle), _) => Some(Ok((handle, Lookup::Cached))),
                (None, Some(err)) => Some(Err(err)),
                (None, None) => None,
            };
            if let Some(result) = shared {
                drop(guard);
                self.release(&identity, slot).await;
                return result;
            }
        }

        let opener = self.opener.clone();
        let slots = self.slots.clone();
        let description = description.clone();
        let task_identity = identity.clone();
        let task_slot = slot.clone();
        let attempt = tokio::spawn(async move {
            let result = opener
                .get_or_create_locked(&mut guard, task_identity.clone(), &description)
                .await;
            task_slot.attempts.fetch_add(1, Ordering::SeqCst);
            drop(guard);
            release_slot(&slots, &task_identity, task_slot).await;
            result
        });

        let result = attempt
            .await
            .map_err(|e| ConnectError::connection(format!("connection attempt aborted: {}", e)));
        self.release(&identity, slot).await;
        result?
    }

    /// Closes and evicts the client for `identity`. Returns whether one was live.
    pub async fn remove(&self, identity: &ConnectionIdentity) -> bool {
        let Some(slot) = self.existing_slot(identity).await else {
            return false;
        };
        let removed = {
            let mut state = slot.state.lock().await;
            state.last_failure = None;
            match state.handle.take() {
                Some(handle) => {
                    self.opener.dispose(&handle).await;
                    tracing::info!(identity = %identity, "client removed");
                    true
                }
                None => false,
            }
        };
        self.release(identity, slot).await;
        removed
    }

    /// Removes every client, or only those in `scope`. Returns the removed identities.
    pub async fn remove_all(&self, scope: Option<Scope>) -> Vec<ConnectionIdentity> {
        let slots: Vec<(ConnectionIdentity, Arc<Slot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(identity, slot)| (identity.clone(), slot.clone()))
            .collect();

        let mut removed = Vec::new();
        for (identity, slot) in slots {
            let disposed = {
                let mut state = slot.state.lock().await;
                let matches = state
                    .handle
                    .as_ref()
                    .is_some_and(|handle| scope.map_or(true, |s| handle.description.scope == s));
                let taken = if matches { state.handle.take() } else { None };
                match taken {
                    Some(handle) => {
                        state.last_failure = None;
                        self.opener.dispose(&handle).await;
                        true
                    }
                    None => false,
                }
            };
            self.release(&identity, slot).await;
            if disposed {
                removed.push(identity);
            }
        }
        removed.sort();
        tracing::info!(scope = ?scope, count = removed.len(), "clients removed");
        removed
    }

    /// Probes the live client. A fatal transport failure evicts it.
    ///
    /// `None` when no client is live for `identity`.
    pub async fn check(&self, identity: &ConnectionIdentity) -> Option<Result<Duration, ConnectError>> {
        let slot = self.existing_slot(identity).await?;
        let result = {
            let mut state = slot.state.lock().await;
            match state.handle.clone() {
                Some(handle) => {
                    let result = self.opener.probe(&handle).await;
                    if let Err(err) = &result {
                        if err.is_fatal_transport() {
                            tracing::warn!(identity = %identity, error = %err, "evicting client after fatal transport error");
                            state.handle = None;
                            self.opener.dispose(&handle).await;
                        }
                    }
                    Some(result)
                }
                None => None,
            }
        };
        self.release(identity, slot).await;
        result
    }

    /// Live client for `identity`, without probing.
    pub async fn get(&self, identity: &ConnectionIdentity) -> Option<Arc<ClientHandle>> {
        let slot = self.existing_slot(identity).await?;
        let handle = slot.state.lock().await.handle.clone();
        self.release(identity, slot).await;
        handle
    }

    pub async fn contains(&self, identity: &ConnectionIdentity) -> bool {
        self.get(identity).await.is_some()
    }

    /// Every live client, ordered by identity.
    pub async fn handles(&self) -> Vec<Arc<ClientHandle>> {
        let slots: Vec<(ConnectionIdentity, Arc<Slot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(identity, slot)| (identity.clone(), slot.clone()))
            .collect();
        let mut handles = Vec::new();
        for (identity, slot) in slots {
            let handle = slot.state.lock().await.handle.clone();
            self.release(&identity, slot).await;
            handles.extend(handle);
        }
        handles.sort_by(|a, b| a.identity.cmp(&b.identity));
        handles
    }

    pub async fn len(&self) -> usize {
        self.handles().await.len()
    }
}
