//! SSH tunnel manager.
//!
//! Caches one SSH session per SSH host identity and hands out leases on it.
//! Each lease optionally owns a forwarded local port. The session stays open
//! while at least one lease is outstanding and is closed explicitly on the
//! last release or on `force_close`. A slot with no tunnel is forgotten by
//! the last caller to let go of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use common::errors::ConnectError;
use common::identity::{tunnel_identity_of, TunnelIdentity};
use common::models::connection::SshDescriptor;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use utoipa::ToSchema;

use crate::ssh::{ForwardTarget, SshConnector, SshSession};

/// A live SSH session owned by the manager.
pub struct Tunnel {
    id: u64,
    identity: TunnelIdentity,
    session: Arc<dyn SshSession>,
    closed: AtomicBool,
}

impl Tunnel {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.session.is_closed()
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.session.close().await;
    }
}

/// Non-owning reference to a tunnel held by a dependent connection.
///
/// Dropping a lease does nothing; dependents return it through
/// [`TunnelManager::release_tunnel`].
#[derive(Clone)]
pub struct TunnelLease {
    identity: TunnelIdentity,
    tunnel_id: u64,
    lease_id: u64,
    local_port: Option<u16>,
    tunnel: Weak<Tunnel>,
}

impl TunnelLease {
    pub fn identity(&self) -> &TunnelIdentity {
        &self.identity
    }

    /// Local port forwarded for this lease, `None` for raw session leases.
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Fails with `TunnelClosed` once the tunnel was closed or force-closed.
    pub fn ensure_open(&self) -> Result<(), ConnectError> {
        self.session().map(|_| ())
    }

    /// The SSH session behind this lease.
    pub fn session(&self) -> Result<Arc<dyn SshSession>, ConnectError> {
        match self.tunnel.upgrade() {
            Some(tunnel) if !tunnel.is_closed() => Ok(tunnel.session.clone()),
            _ => Err(ConnectError::tunnel_closed(format!(
                "tunnel {} is no longer open",
                self.identity
            ))),
        }
    }
}

impl std::fmt::Debug for TunnelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelLease")
            .field("identity", &self.identity)
            .field("tunnel_id", &self.tunnel_id)
            .field("lease_id", &self.lease_id)
            .field("local_port", &self.local_port)
            .finish()
    }
}

/// Cache entry: the tunnel and its outstanding leases.
struct TunnelEntry {
    tunnel: Arc<Tunnel>,
    ref_count: usize,
    /// lease id -> forwarded local port
    leases: HashMap<u64, Option<u16>>,
    next_lease: u64,
}

impl TunnelEntry {
    fn new(tunnel: Arc<Tunnel>) -> Self {
        Self {
            tunnel,
            ref_count: 0,
            leases: HashMap::new(),
            next_lease: 0,
        }
    }

    fn lease(&mut self, local_port: Option<u16>) -> TunnelLease {
        let lease_id = self.next_lease;
        self.next_lease += 1;
        self.leases.insert(lease_id, local_port);
        self.ref_count += 1;
        TunnelLease {
            identity: self.tunnel.identity.clone(),
            tunnel_id: self.tunnel.id,
            lease_id,
            local_port,
            tunnel: Arc::downgrade(&self.tunnel),
        }
    }
}

/// Per-identity slot. Its mutex serializes every mutation for one SSH host.
type Slot = Arc<Mutex<Option<TunnelEntry>>>;

/// Snapshot of an active tunnel.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TunnelInfo {
    pub identity: TunnelIdentity,
    pub ref_count: usize,
    pub forwarded_ports: Vec<u16>,
}

/// Sole owner of SSH sessions.
pub struct TunnelManager {
    connector: Arc<dyn SshConnector>,
    slots: RwLock<HashMap<TunnelIdentity, Slot>>,
    next_tunnel_id: AtomicU64,
}

impl TunnelManager {
    pub fn new(connector: Arc<dyn SshConnector>) -> Self {
        Self {
            connector,
            slots: RwLock::new(HashMap::new()),
            next_tunnel_id: AtomicU64::new(1),
        }
    }

    async fn slot(&self, identity: &TunnelIdentity) -> Slot {
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

    async fn existing_slot(&self, identity: &TunnelIdentity) -> Option<Slot> {
        self.slots.read().await.get(identity).cloned()
    }

    /// Drops `slot` and forgets it when nothing else holds it and no tunnel is open.
    async fn release_slot(&self, identity: &TunnelIdentity, slot: Slot) {
        let mut slots = self.slots.write().await;
        drop(slot);
        let idle = slots.get(identity).is_some_and(|entry| {
            Arc::strong_count(entry) == 1 && entry.try_lock().is_ok_and(|guard| guard.is_none())
        });
        if idle {
            slots.remove(identity);
        }
    }

    /// Number of SSH identities with a slot.
    #[cfg(test)]
    pub(crate) async fn slot_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Leases the tunnel for `ssh` and forwards a fresh local port to `target`.
    pub async fn acquire_tunnel(
        &self,
        ssh: &SshDescriptor,
        target: &ForwardTarget,
    ) -> Result<TunnelLease, ConnectError> {
        self.acquire(ssh, Some(target)).await
    }

    /// Leases the raw SSH session for `ssh` without forwarding anything.
    pub async fn acquire_session(&self, ssh: &SshDescriptor) -> Result<TunnelLease, ConnectError> {
        self.acquire(ssh, None).await
    }

    async fn acquire(
        &self,
        ssh: &SshDescriptor,
        target: Option<&ForwardTarget>,
    ) -> Result<TunnelLease, ConnectError> {
        let identity = tunnel_identity_of(ssh);
        let slot = self.slot(&identity).await;
        let result = {
            let mut guard = slot.lock().await;
            self.acquire_locked(&identity, ssh, target, &mut guard).await
        };
        self.release_slot(&identity, slot).await;
        result
    }

    async fn acquire_locked(
        &self,
        identity: &TunnelIdentity,
        ssh: &SshDescriptor,
        target: Option<&ForwardTarget>,
        guard: &mut Option<TunnelEntry>,
    ) -> Result<TunnelLease, ConnectError> {
        if guard.as_ref().is_some_and(|entry| entry.tunnel.is_closed()) {
            if let Some(stale) = guard.take() {
                tracing::warn!(tunnel = %identity, dependents = stale.ref_count, "dropping dead SSH session");
                stale.tunnel.shutdown().await;
            }
        }

        if guard.is_none() {
            let session = self.connector.connect(ssh).await?;
            let tunnel = Arc::new(Tunnel {
                id: self.next_tunnel_id.fetch_add(1, Ordering::SeqCst),
                identity: identity.clone(),
                session,
                closed: AtomicBool::new(false),
            });
            tracing::info!(tunnel = %identity, "SSH tunnel opened");
            *guard = Some(TunnelEntry::new(tunnel));
        }

        let Some(entry) = guard.as_mut() else {
            return Err(ConnectError::tunnel_closed(format!("tunnel {} vanished", identity)));
        };

        let local_port = match target {
            Some(target) => {
                let forwarded = entry.tunnel.session.forward(target).await;
                match forwarded {
                    Ok(port) => Some(port),
                    Err(err) => {
                        // A session opened just for this lease must not linger.
                        if entry.ref_count == 0 {
                            if let Some(entry) = guard.take() {
                                entry.tunnel.shutdown().await;
                            }
                        }
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        let lease = entry.lease(local_port);
        tracing::debug!(
            tunnel = %identity,
            ref_count = entry.ref_count,
            local_port = ?local_port,
            "tunnel leased"
        );
        Ok(lease)
    }

    /// Returns a lease. The last release closes the session.
    ///
    /// Releasing the same lease twice, a lease of a force-closed tunnel, or a
    /// lease for an unknown identity is a no-op.
    pub async fn release_tunnel(&self, lease: &TunnelLease) {
        let Some(slot) = self.existing_slot(&lease.identity).await else {
            return;
        };
        {
            let mut guard = slot.lock().await;
            Self::release_locked(lease, &mut guard).await;
        }
        self.release_slot(&lease.identity, slot).await;
    }

    async fn release_locked(lease: &TunnelLease, guard: &mut Option<TunnelEntry>) {
        let Some(entry) = guard.as_mut() else {
            return;
        };
        if entry.tunnel.id != lease.tunnel_id {
            return;
        }
        let Some(local_port) = entry.leases.remove(&lease.lease_id) else {
            return;
        };
        entry.ref_count -= 1;
        if let Some(port) = local_port {
            entry.tunnel.session.stop_forward(port).await;
        }
        tracing::debug!(tunnel = %lease.identity, ref_count = entry.ref_count, "tunnel released");

        if entry.ref_count == 0 {
            if let Some(entry) = guard.take() {
                entry.tunnel.shutdown().await;
                tracing::info!(tunnel = %lease.identity, "SSH tunnel closed after last release");
            }
        }
    }

    /// Closes the tunnel regardless of outstanding leases.
    ///
    /// Dependents observe `TunnelClosed` on their next operation. Returns
    /// whether a tunnel was open.
    pub async fn force_close(&self, identity: &TunnelIdentity) -> bool {
        let Some(slot) = self.existing_slot(identity).await else {
            return false;
        };
        let closed = slot.lock().await.take();
        let found = match closed {
            Some(entry) => {
                entry.tunnel.shutdown().await;
                tracing::warn!(tunnel = %identity, dependents = entry.ref_count, "SSH tunnel force-closed");
                true
            }
            None => false,
        };
        self.release_slot(identity, slot).await;
        found
    }

    /// Outstanding leases on the tunnel, 0 when absent.
    pub async fn ref_count(&self, identity: &TunnelIdentity) -> usize {
        let Some(slot) = self.existing_slot(identity).await else {
            return 0;
        };
        let count = slot.lock().await.as_ref().map_or(0, |entry| entry.ref_count);
        self.release_slot(identity, slot).await;
        count
    }

    pub async fn is_active(&self, identity: &TunnelIdentity) -> bool {
        let Some(slot) = self.existing_slot(identity).await else {
            return false;
        };
        let active = slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|entry| !entry.tunnel.is_closed());
        self.release_slot(identity, slot).await;
        active
    }

    /// Snapshot of every open tunnel.
    pub async fn tunnels(&self) -> Vec<TunnelInfo> {
        let slots: Vec<(TunnelIdentity, Slot)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(identity, slot)| (identity.clone(), slot.clone()))
            .collect();
        let mut infos = Vec::new();
        for (identity, slot) in slots {
            let info = slot.lock().await.as_ref().map(|entry| {
                let mut forwarded_ports: Vec<u16> = entry.leases.values().flatten().copied().collect();
                forwarded_ports.sort_unstable();
                TunnelInfo {
                    identity: entry.tunnel.identity.clone(),
                    ref_count: entry.ref_count,
                    forwarded_ports,
                }
            });
            self.release_slot(&identity, slot).await;
            infos.extend(info);
        }
        infos.sort_by(|a, b| a.identity.cmp(&b.identity));
        infos
    }
}
