//! 连接编排服务
//!
//! Entry point for every inbound request: validates descriptions, drives the
//! pool, and reports outcomes on the event channels.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use validator::Validate;

use common::errors::{AppError, AppResult, ConnectError};
use common::identity::{display_key_of, ConnectionIdentity, TunnelIdentity};
use common::models::connection::{
    ConnectionDescription, ConnectionItem, Dialect, SavedConnections, Scope, SshAuth,
};
use common::models::event::{ConnectionEvent, TreeNotice};

use crate::events::EventHub;
use crate::pool_manager::{ClientHandle, Lookup, PoolManager};
use crate::tunnel_manager::TunnelInfo;

/// 连接服务 Trait
#[async_trait]
pub trait ConnectionServiceTrait: Send + Sync {
    /// 建立连接（命中缓存时复用）
    async fn connect(&self, description: ConnectionDescription) -> Result<Arc<ClientHandle>, ConnectError>;

    /// 编辑连接：校验通过后先移除旧标识，再连接新描述
    async fn edit(
        &self,
        previous: &ConnectionIdentity,
        description: ConnectionDescription,
    ) -> Result<Arc<ClientHandle>, ConnectError>;

    /// 移除连接（幂等）
    async fn remove(&self, identity: &ConnectionIdentity) -> bool;

    /// 按作用域批量移除
    async fn remove_all(&self, scope: Option<Scope>) -> Vec<ConnectionIdentity>;

    /// 整体替换已保存的连接配置，返回保存的连接数
    async fn reload(&self, saved: SavedConnections) -> AppResult<usize>;

    /// 导出已保存的连接配置（不含连接时填充的字段）
    async fn saved(&self) -> SavedConnections;

    /// 列出所有活动连接
    async fn list(&self) -> Vec<ConnectionItem>;

    /// 测试连接，返回延迟毫秒数
    async fn test(&self, identity: &ConnectionIdentity) -> AppResult<u64>;

    /// 列出活动的 SSH 隧道
    async fn tunnels(&self) -> Vec<TunnelInfo>;

    /// 强制关闭 SSH 隧道
    async fn close_tunnel(&self, identity: &TunnelIdentity) -> AppResult<()>;
}

/// Connection orchestrator.
pub struct ConnectionService {
    pool: Arc<PoolManager>,
    events: EventHub,
    saved: RwLock<SavedConnections>,
}

impl ConnectionService {
    pub fn new(pool: Arc<PoolManager>, events: EventHub) -> Self {
        Self {
            pool,
            events,
            saved: RwLock::new(SavedConnections::default()),
        }
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }
}

/// Field and cross-field checks. Runs before anything touches the network.
pub fn validate(description: &ConnectionDescription) -> Result<(), ConnectError> {
    description
        .validate()
        .map_err(|e| ConnectError::validation(e.to_string()))?;

    if description.port == Some(0) {
        return Err(ConnectError::validation("port must be between 1 and 65535"));
    }

    match description.dialect {
        Dialect::Ssh => {
            if description.ssh.is_none() {
                return Err(ConnectError::validation("ssh connections require an SSH descriptor"));
            }
        }
        Dialect::SQLite => {
            if description.file_path.as_deref().map_or(true, |p| p.trim().is_empty()) {
                return Err(ConnectError::validation("sqlite connections require a file path"));
            }
            if description.ssh.is_some() {
                return Err(ConnectError::validation("sqlite files cannot be reached through SSH"));
            }
        }
        _ => {
            if description.host.trim().is_empty() {
                return Err(ConnectError::validation(format!(
                    "{} connections require a host",
                    description.dialect
                )));
            }
        }
    }

    if let Some(ssh) = &description.ssh {
        if ssh.port == 0 {
            return Err(ConnectError::validation("SSH port must be between 1 and 65535"));
        }
        if ssh.forward_port == Some(0) {
            return Err(ConnectError::validation("forward port must be between 1 and 65535"));
        }
        if let SshAuth::PrivateKey { path, .. } = &ssh.auth {
            if path.trim().is_empty() {
                return Err(ConnectError::validation("SSH private key path is empty"));
            }
        }
    }
    Ok(())
}

/// Checks every entry of a saved document, stopping at the first bad one.
fn validate_saved(saved: &SavedConnections) -> Result<(), ConnectError> {
    let misplaced = saved.misplaced();
    if !misplaced.is_empty() {
        return Err(ConnectError::validation(format!(
            "saved connections in the wrong partition: {}",
            misplaced.join("; ")
        )));
    }
    for (category, scope, description) in saved.entries() {
        if let Err(err) = validate(description) {
            let reason = match err {
                ConnectError::Validation(reason) => reason,
                other => other.to_string(),
            };
            return Err(ConnectError::validation(format!(
                "{:?}/{} entry {}: {}",
                category,
                scope,
                display_key_of(description),
                reason
            )));
        }
    }
    Ok(())
}

impl ConnectionService {
    fn report_failure(&self, description: &ConnectionDescription, err: &ConnectError) {
        tracing::warn!(dialect = %description.dialect, kind = ?err.kind(), error = %err, "连接失败");
        self.events.publish(ConnectionEvent::failure(err));
    }
}

#[async_trait]
impl ConnectionServiceTrait for ConnectionService {
    async fn connect(&self, description: ConnectionDescription) -> Result<Arc<ClientHandle>, ConnectError> {
        let result = match validate(&description) {
            Ok(()) => self.pool.lookup_or_create(&description).await,
            Err(err) => Err(err),
        };

        match result {
            Ok((handle, lookup)) => {
                tracing::info!(
                    identity = %handle.identity(),
                    display_key = handle.display_key(),
                    lookup = ?lookup,
                    "连接成功"
                );
                self.events.publish(ConnectionEvent::success(
                    handle.identity().to_string(),
                    handle.display_key(),
                ));
                // 仅在新建连接时通知树视图添加节点
                if lookup == Lookup::Created {
                    self.events.notify_tree(TreeNotice::Added {
                        identity: handle.identity().to_string(),
                        display_key: handle.display_key().to_string(),
                        scope: description.scope,
                        category: description.category(),
                    });
                }
                Ok(handle)
            }
            Err(err) => {
                self.report_failure(&description, &err);
                Err(err)
            }
        }
    }

    async fn edit(
        &self,
        previous: &ConnectionIdentity,
        mut description: ConnectionDescription,
    ) -> Result<Arc<ClientHandle>, ConnectError> {
        description.clear_ephemeral();
        // 校验失败时保留旧连接
        if let Err(err) = validate(&description) {
            self.report_failure(&description, &err);
            return Err(err);
        }
        self.remove(previous).await;
        self.connect(description).await
    }

    async fn remove(&self, identity: &ConnectionIdentity) -> bool {
        let removed = self.pool.remove(identity).await;
        if removed {
            self.events.notify_tree(TreeNotice::Removed {
                identity: identity.to_string(),
            });
        }
        removed
    }

    async fn remove_all(&self, scope: Option<Scope>) -> Vec<ConnectionIdentity> {
        let removed = self.pool.remove_all(scope).await;
        for identity in &removed {
            self.events.notify_tree(TreeNotice::Removed {
                identity: identity.to_string(),
            });
        }
        removed
    }

    async fn reload(&self, mut saved: SavedConnections) -> AppResult<usize> {
        validate_saved(&saved)?;
        for list in [
            &mut saved.database.global,
            &mut saved.database.workspace,
            &mut saved.nosql.global,
            &mut saved.nosql.workspace,
        ] {
            list.iter_mut().for_each(ConnectionDescription::clear_ephemeral);
        }

        let count = saved.len();
        *self.saved.write().await = saved;
        let dropped = self.pool.remove_all(None).await;
        self.events.notify_tree(TreeNotice::Refresh);
        tracing::info!(saved = count, dropped = dropped.len(), "配置已重新加载");
        Ok(count)
    }

    async fn saved(&self) -> SavedConnections {
        self.saved.read().await.clone()
    }

    async fn list(&self) -> Vec<ConnectionItem> {
        self.pool
            .handles()
            .await
            .iter()
            .map(|handle| handle.to_item())
            .collect()
    }

    async fn test(&self, identity: &ConnectionIdentity) -> AppResult<u64> {
        match self.pool.check(identity).await {
            None => Err(AppError::ConnectionNotFound(identity.to_string())),
            Some(Ok(latency)) => Ok(latency.as_millis() as u64),
            Some(Err(err)) => {
                if err.is_fatal_transport() {
                    self.events.notify_tree(TreeNotice::Removed {
                        identity: identity.to_string(),
                    });
                }
                Err(err.into())
            }
        }
    }

    async fn tunnels(&self) -> Vec<TunnelInfo> {
        self.pool.tunnels().tunnels().await
    }

    async fn close_tunnel(&self, identity: &TunnelIdentity) -> AppResult<()> {
        if self.pool.tunnels().force_close(identity).await {
            Ok(())
        } else {
            Err(AppError::TunnelNotFound(identity.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bastion, postgres, MockDriver, MockSshConnector};
    use crate::tunnel_manager::TunnelManager;
    use common::errors::ErrorKind;
    use common::identity::{identity_of, tunnel_identity_of};
    use std::time::Duration;

    struct Fixture {
        connector: Arc<MockSshConnector>,
        driver: Arc<MockDriver>,
        events: EventHub,
        service: ConnectionService,
    }

    fn fixture() -> Fixture {
        let connector = MockSshConnector::new();
        let driver = MockDriver::new();
        let tunnels = Arc::new(TunnelManager::new(connector.clone()));
        let pool = Arc::new(PoolManager::new(
            tunnels,
            driver.clone(),
            Duration::from_secs(5),
            Duration::from_millis(500),
        ));
        let events = EventHub::new(16);
        Fixture {
            connector,
            driver,
            service: ConnectionService::new(pool, events.clone()),
            events,
        }
    }

    #[test]
    fn test_validate_cross_field_rules() {
        let ssh_without_descriptor = ConnectionDescription::new(Dialect::Ssh, "host");
        assert!(matches!(validate(&ssh_without_descriptor), Err(ConnectError::Validation(_))));

        let sqlite_without_file = ConnectionDescription::new(Dialect::SQLite, "");
        assert!(matches!(validate(&sqlite_without_file), Err(ConnectError::Validation(_))));

        let missing_host = ConnectionDescription::new(Dialect::Redis, "  ");
        assert!(matches!(validate(&missing_host), Err(ConnectError::Validation(_))));

        let mut empty_ssh_user = bastion("bastion");
        empty_ssh_user.user = String::new();
        let nested = postgres("db").with_ssh(empty_ssh_user);
        assert!(matches!(validate(&nested), Err(ConnectError::Validation(_))));

        assert!(validate(&postgres("db1")).is_ok());
        assert!(validate(&ConnectionDescription::new(Dialect::SQLite, "").with_file("/tmp/a.db")).is_ok());
        assert!(validate(&ConnectionDescription::new(Dialect::Ssh, "").with_ssh(bastion("b"))).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_description_never_reaches_pool() {
        let f = fixture();
        let mut rx = f.events.subscribe();

        let err = f
            .service
            .connect(ConnectionDescription::new(Dialect::Ssh, "host"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(f.driver.opened(), 0);
        assert_eq!(f.connector.opened(), 0);
        assert!(f.service.list().await.is_empty());

        match rx.recv().await.unwrap() {
            ConnectionEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::Validation),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_direct_connect_emits_success_and_tree_notice() {
        let f = fixture();
        let mut events = f.events.subscribe();
        let mut tree = f.events.subscribe_tree();

        let handle = f.service.connect(postgres("db1")).await.unwrap();
        assert_eq!(f.connector.opened(), 0);
        assert_eq!(handle.endpoint().address(), "db1:5432");

        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::success("global:postgres:db1:5432", "db1:5432")
        );
        assert!(matches!(
            tree.recv().await.unwrap(),
            TreeNotice::Added { ref identity, .. } if identity == "global:postgres:db1:5432"
        ));
    }

    #[tokio::test]
    async fn test_missing_subscribers_do_not_roll_back() {
        let f = fixture();
        let d = postgres("db1");
        f.service.connect(d.clone()).await.unwrap();
        assert!(f.service.pool().contains(&identity_of(&d)).await);
    }

    #[tokio::test]
    async fn test_tunneled_connect_targets_forwarded_port() {
        let f = fixture();
        let mut ssh = bastion("bastion");
        ssh.auth = SshAuth::PrivateKey {
            path: "/home/ops/.ssh/id_ed25519".into(),
            passphrase: None,
        };
        let d = ConnectionDescription::new(Dialect::MySQL, "internal-db").with_ssh(ssh);

        let handle = f.service.connect(d).await.unwrap();
        let port = handle.tunnel().and_then(|lease| lease.local_port()).unwrap();
        assert_eq!(f.connector.opened(), 1);
        assert_eq!(f.driver.endpoints(), vec![format!("127.0.0.1:{}", port)]);
        assert!(handle.to_item().tunneled);
    }

    #[tokio::test]
    async fn test_shared_bastion_counts_two_dependents() {
        let f = fixture();
        let a = ConnectionDescription::new(Dialect::MySQL, "db-a").with_ssh(bastion("bastion"));
        let b = ConnectionDescription::new(Dialect::MySQL, "db-b").with_ssh(bastion("bastion"));
        f.service.connect(a).await.unwrap();
        f.service.connect(b).await.unwrap();

        let tunnels = f.service.tunnels().await;
        assert_eq!(f.connector.opened(), 1);
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].ref_count, 2);
        assert_eq!(tunnels[0].forwarded_ports.len(), 2);
    }

    #[tokio::test]
    async fn test_force_close_then_reconnect() {
        let f = fixture();
        let a = ConnectionDescription::new(Dialect::MySQL, "db-a").with_ssh(bastion("bastion"));
        let b = ConnectionDescription::new(Dialect::MongoDB, "db-b").with_ssh(bastion("bastion"));
        let ha = f.service.connect(a.clone()).await.unwrap();
        let hb = f.service.connect(b.clone()).await.unwrap();
        let tunnel = tunnel_identity_of(a.ssh.as_ref().unwrap());

        f.service.close_tunnel(&tunnel).await.unwrap();
        assert!(matches!(ha.ping().await, Err(ConnectError::TunnelClosed(_))));
        assert!(matches!(hb.ping().await, Err(ConnectError::TunnelClosed(_))));
        assert!(matches!(
            f.service.close_tunnel(&tunnel).await,
            Err(AppError::TunnelNotFound(_))
        ));

        f.service.connect(b).await.unwrap();
        assert_eq!(f.connector.opened(), 2);
        assert_eq!(f.service.tunnels().await[0].ref_count, 1);
    }

    #[tokio::test]
    async fn test_edit_removes_old_identity_first() {
        let f = fixture();
        let before = postgres("db1");
        let old = identity_of(&before);
        f.service.connect(before).await.unwrap();
        let mut tree = f.events.subscribe_tree();

        let after = postgres("db2");
        let handle = f.service.edit(&old, after).await.unwrap();

        assert!(!f.service.pool().contains(&old).await);
        assert_eq!(handle.identity().as_str(), "global:postgres:db2:5432");
        assert_eq!(
            tree.recv().await.unwrap(),
            TreeNotice::Removed {
                identity: old.to_string()
            }
        );
        assert!(f.driver.clients()[0].is_closed());
    }

    #[tokio::test]
    async fn test_failed_edit_leaves_identity_absent() {
        let f = fixture();
        let d = postgres("db1");
        let identity = identity_of(&d);
        f.service.connect(d.clone()).await.unwrap();

        f.driver.fail_next(ConnectError::authentication("password changed"));
        let err = f.service.edit(&identity, d).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(f.service.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_edit_keeps_old_connection() {
        let f = fixture();
        let d = postgres("db1");
        let old = identity_of(&d);
        f.service.connect(d).await.unwrap();
        let mut tree = f.events.subscribe_tree();

        let err = f
            .service
            .edit(&old, ConnectionDescription::new(Dialect::Postgres, "   "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(f.service.pool().contains(&old).await);
        assert!(!f.driver.clients()[0].is_closed());
        assert!(tree.try_recv().is_err());

        let err = f
            .service
            .edit(&old, ConnectionDescription::new(Dialect::Ssh, "box"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(f.service.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_does_not_repeat_tree_notice() {
        let f = fixture();
        let mut events = f.events.subscribe();
        let mut tree = f.events.subscribe_tree();
        let d = postgres("db1");

        f.service.connect(d.clone()).await.unwrap();
        f.service.connect(d.clone()).await.unwrap();
        assert!(matches!(tree.recv().await.unwrap(), TreeNotice::Added { .. }));
        assert!(tree.try_recv().is_err());
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        // A replaced dead client keeps its node.
        f.driver.clients()[0].kill();
        f.service.connect(d).await.unwrap();
        assert!(tree.try_recv().is_err());
        assert_eq!(f.driver.opened(), 2);
    }

    #[tokio::test]
    async fn test_ssh_auth_failure_through_connect() {
        let f = fixture();
        let mut events = f.events.subscribe();
        f.connector.fail_next(ConnectError::authentication("publickey rejected"));
        let d = ConnectionDescription::new(Dialect::MySQL, "internal-db").with_ssh(bastion("bastion"));
        let tunnel = tunnel_identity_of(d.ssh.as_ref().unwrap());

        let err = f.service.connect(d.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(f.driver.opened(), 0);
        assert!(!f.service.pool().contains(&identity_of(&d)).await);
        assert_eq!(f.service.pool().tunnels().ref_count(&tunnel).await, 0);
        assert_eq!(f.service.pool().slot_count().await, 0);
        match events.recv().await.unwrap() {
            ConnectionEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::Authentication),
            other => panic!("unexpected event {:?}", other),
        }

        let handle = f.service.connect(d).await.unwrap();
        assert!(handle.tunnel().is_some());
        assert_eq!(f.service.pool().tunnels().ref_count(&tunnel).await, 1);
    }

    #[tokio::test]
    async fn test_edit_clears_assigned_port() {
        let f = fixture();
        let d = ConnectionDescription::new(Dialect::Redis, "cache").with_ssh(bastion("bastion"));
        let first = f.service.connect(d.clone()).await.unwrap();
        let edited = first.description().clone();
        assert!(edited.ssh.as_ref().unwrap().assigned_port.is_some());

        let second = f.service.edit(first.identity(), edited).await.unwrap();
        assert_eq!(first.identity(), second.identity());
        assert_ne!(
            first.tunnel().and_then(|l| l.local_port()),
            second.tunnel().and_then(|l| l.local_port())
        );
    }

    #[tokio::test]
    async fn test_remove_all_by_scope_notifies_tree() {
        let f = fixture();
        f.service.connect(postgres("db1")).await.unwrap();
        f.service
            .connect(postgres("db2").with_scope(Scope::Workspace))
            .await
            .unwrap();
        let mut tree = f.events.subscribe_tree();

        let removed = f.service.remove_all(Some(Scope::Workspace)).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(
            tree.recv().await.unwrap(),
            TreeNotice::Removed {
                identity: "workspace:postgres:db2:5432".into()
            }
        );
        assert_eq!(f.service.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let f = fixture();
        let d = postgres("db1");
        f.service.connect(d.clone()).await.unwrap();
        assert!(f.service.remove(&identity_of(&d)).await);
        assert!(!f.service.remove(&identity_of(&d)).await);
    }

    #[tokio::test]
    async fn test_reload_drops_everything_and_refreshes() {
        let f = fixture();
        f.service.connect(postgres("db1")).await.unwrap();
        let mut tree = f.events.subscribe_tree();

        let mut saved = SavedConnections::default();
        saved.database.global.push(postgres("db1"));
        let mut tunneled = ConnectionDescription::new(Dialect::Redis, "cache").with_ssh(bastion("bastion"));
        tunneled.connected_at = Some(chrono::Utc::now());
        if let Some(ssh) = tunneled.ssh.as_mut() {
            ssh.assigned_port = Some(40123);
        }
        saved.nosql.global.push(tunneled);

        assert_eq!(f.service.reload(saved).await.unwrap(), 2);
        assert!(f.service.list().await.is_empty());
        assert_eq!(tree.recv().await.unwrap(), TreeNotice::Refresh);

        let stored = f.service.saved().await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.database.global[0].host, "db1");
        let cache = &stored.nosql.global[0];
        assert!(cache.connected_at.is_none());
        assert_eq!(cache.ssh.as_ref().unwrap().assigned_port, None);
    }

    #[tokio::test]
    async fn test_reload_rejects_invalid_entry_and_keeps_document() {
        let f = fixture();
        let mut first = SavedConnections::default();
        first.database.global.push(postgres("db1"));
        f.service.reload(first).await.unwrap();
        f.service.connect(postgres("db1")).await.unwrap();

        let mut bad = SavedConnections::default();
        bad.database.global.push(postgres("db2"));
        bad.database.global.push(ConnectionDescription::new(Dialect::MySQL, "  "));
        let err = f.service.reload(bad).await.unwrap_err();
        assert!(matches!(err, AppError::Connect(ConnectError::Validation(_))));

        let stored = f.service.saved().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.database.global[0].host, "db1");
        assert_eq!(f.service.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_rejects_misplaced_entries() {
        let f = fixture();
        f.service.connect(postgres("db1")).await.unwrap();
        let mut saved = SavedConnections::default();
        saved
            .nosql
            .global
            .push(ConnectionDescription::new(Dialect::MySQL, "db"));

        let err = f.service.reload(saved).await.unwrap_err();
        assert!(matches!(err, AppError::Connect(ConnectError::Validation(_))));
        assert_eq!(f.service.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_liveness_check_unknown_and_dead_connections() {
        let f = fixture();
        let d = postgres("db1");
        let identity = identity_of(&d);
        assert!(matches!(
            f.service.test(&identity).await,
            Err(AppError::ConnectionNotFound(_))
        ));

        f.service.connect(d).await.unwrap();
        f.service.test(&identity).await.unwrap();

        f.driver.clients()[0].kill();
        assert!(matches!(
            f.service.test(&identity).await,
            Err(AppError::Connect(ConnectError::Network(_)))
        ));
        assert!(f.service.list().await.is_empty());
    }
}
