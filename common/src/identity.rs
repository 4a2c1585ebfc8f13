//! Connection identity.
//!
//! Identities are plain concatenations of the fields that decide which server
//! a client talks to. Fields assigned at connect time (tunnel local port,
//! timestamps) and secrets never take part.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::connection::{ConnectionDescription, Dialect, SshDescriptor};

/// Cache key of a live client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ConnectionIdentity(String);

impl ConnectionIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Cache key of an SSH session: `user@host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct TunnelIdentity(String);

impl TunnelIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TunnelIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TunnelIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().to_ascii_lowercase()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// SSH host identity, the sub-projection the tunnel cache keys on.
pub fn tunnel_identity_of(ssh: &SshDescriptor) -> TunnelIdentity {
    TunnelIdentity(format!(
        "{}@{}:{}",
        ssh.user.trim(),
        normalize_host(&ssh.host),
        ssh.port
    ))
}

/// Full identity of a description.
///
/// Layout: `scope:dialect:target[~ssh-identity][#label]` where `target` is
/// `user@host:port`, the file path for SQLite, or the SSH identity for SSH hosts.
pub fn identity_of(description: &ConnectionDescription) -> ConnectionIdentity {
    let mut key = format!("{}:{}:", description.scope, description.dialect);

    match (description.dialect, description.ssh.as_ref()) {
        (Dialect::SQLite, _) => {
            key.push_str(non_empty(description.file_path.as_deref()).unwrap_or_default());
        }
        (Dialect::Ssh, Some(ssh)) => key.push_str(tunnel_identity_of(ssh).as_str()),
        _ => {
            if let Some(user) = non_empty(description.user.as_deref()) {
                key.push_str(user);
                key.push('@');
            }
            key.push_str(&normalize_host(&description.host));
            key.push(':');
            key.push_str(&description.effective_port().to_string());
        }
    }

    if description.dialect != Dialect::Ssh {
        if let Some(ssh) = &description.ssh {
            key.push('~');
            key.push_str(tunnel_identity_of(ssh).as_str());
        }
    }

    if let Some(label) = non_empty(description.label.as_deref()) {
        key.push('#');
        key.push_str(label);
    }

    ConnectionIdentity(key)
}

/// Name shown in the tree view.
pub fn display_key_of(description: &ConnectionDescription) -> String {
    if let Some(label) = non_empty(description.label.as_deref()) {
        return label.to_string();
    }
    match (description.dialect, description.ssh.as_ref()) {
        (Dialect::SQLite, _) => {
            let path = non_empty(description.file_path.as_deref()).unwrap_or_default();
            path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
        }
        (Dialect::Ssh, Some(ssh)) => format!("{}@{}", ssh.user.trim(), ssh.host.trim()),
        _ => format!("{}:{}", description.host.trim(), description.effective_port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::connection::{Scope, SshAuth};
    use chrono::Utc;

    fn bastion() -> SshDescriptor {
        SshDescriptor::new("bastion", "ops", SshAuth::Agent)
    }

    #[test]
    fn test_identity_ignores_ephemeral_fields() {
        let base = ConnectionDescription::new(Dialect::MySQL, "internal-db").with_ssh(bastion());
        let mut connected = base.clone();
        connected.connected_at = Some(Utc::now());
        if let Some(ssh) = connected.ssh.as_mut() {
            ssh.assigned_port = Some(49152);
        }
        assert_eq!(identity_of(&base), identity_of(&connected));
    }

    #[test]
    fn test_identity_ignores_secrets() {
        let a = ConnectionDescription::new(Dialect::Postgres, "db1").with_user("app", "one");
        let b = ConnectionDescription::new(Dialect::Postgres, "db1").with_user("app", "two");
        assert_eq!(identity_of(&a), identity_of(&b));
    }

    #[test]
    fn test_identity_layout() {
        let d = ConnectionDescription::new(Dialect::Postgres, "DB1 ").with_port(5432);
        assert_eq!(identity_of(&d).as_str(), "global:postgres:db1:5432");

        let d = ConnectionDescription::new(Dialect::MySQL, "internal-db")
            .with_user("root", "pw")
            .with_scope(Scope::Workspace)
            .with_ssh(bastion())
            .with_label("prod");
        assert_eq!(
            identity_of(&d).as_str(),
            "workspace:mysql:root@internal-db:3306~ops@bastion:22#prod"
        );
    }

    #[test]
    fn test_default_port_matches_explicit_port() {
        let implicit = ConnectionDescription::new(Dialect::Redis, "cache");
        let explicit = ConnectionDescription::new(Dialect::Redis, "cache").with_port(6379);
        assert_eq!(identity_of(&implicit), identity_of(&explicit));
    }

    #[test]
    fn test_scope_label_and_hop_disambiguate() {
        let base = ConnectionDescription::new(Dialect::MySQL, "db");
        let others = [
            base.clone().with_scope(Scope::Workspace),
            base.clone().with_label("replica"),
            base.clone().with_ssh(bastion()),
            base.clone().with_port(3307),
            ConnectionDescription::new(Dialect::Postgres, "db").with_port(3306),
        ];
        for other in &others {
            assert_ne!(identity_of(&base), identity_of(other));
        }
    }

    #[test]
    fn test_ssh_host_identity() {
        let d = ConnectionDescription::new(Dialect::Ssh, "").with_ssh(bastion());
        assert_eq!(identity_of(&d).as_str(), "global:ssh:ops@bastion:22");
        assert_eq!(display_key_of(&d), "ops@bastion");
        assert_eq!(tunnel_identity_of(&bastion()).as_str(), "ops@bastion:22");
    }

    #[test]
    fn test_display_keys() {
        let d = ConnectionDescription::new(Dialect::SQLite, "").with_file("/data/app.db");
        assert_eq!(display_key_of(&d), "app.db");
        assert_eq!(identity_of(&d).as_str(), "global:sqlite:/data/app.db");
        let d = ConnectionDescription::new(Dialect::Postgres, "db1");
        assert_eq!(display_key_of(&d), "db1:5432");
        assert_eq!(display_key_of(&d.with_label("main")), "main");
    }
}
