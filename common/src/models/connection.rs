//! Connection description models.
//!
//! A `ConnectionDescription` is what the configuration panel hands over when a
//! user confirms a new or edited connection. Everything the lifecycle core
//! needs to derive an identity, open a tunnel and open a client lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Data store dialect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// MySQL / MariaDB.
    #[serde(alias = "mariadb")]
    MySQL,
    /// PostgreSQL.
    #[serde(alias = "postgresql")]
    Postgres,
    /// SQLite database file.
    SQLite,
    /// Redis key-value store.
    Redis,
    /// MongoDB document store.
    MongoDB,
    /// Elasticsearch over HTTP.
    #[serde(alias = "es")]
    Elasticsearch,
    /// Plain SSH host (terminal / file access, no database behind it).
    Ssh,
}

impl Dialect {
    /// Returns the default port for this dialect.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Dialect::MySQL => Some(3306),
            Dialect::Postgres => Some(5432),
            Dialect::SQLite => None,
            Dialect::Redis => Some(6379),
            Dialect::MongoDB => Some(27017),
            Dialect::Elasticsearch => Some(9200),
            Dialect::Ssh => Some(22),
        }
    }

    /// Storage partition the saved description belongs to.
    pub fn category(&self) -> Category {
        match self {
            Dialect::MySQL | Dialect::Postgres | Dialect::SQLite => Category::Database,
            Dialect::Redis | Dialect::MongoDB | Dialect::Elasticsearch | Dialect::Ssh => {
                Category::Nosql
            }
        }
    }

    /// Whether this dialect talks to a network endpoint (everything but SQLite).
    pub fn is_networked(&self) -> bool {
        !matches!(self, Dialect::SQLite)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::MySQL => write!(f, "mysql"),
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::SQLite => write!(f, "sqlite"),
            Dialect::Redis => write!(f, "redis"),
            Dialect::MongoDB => write!(f, "mongodb"),
            Dialect::Elasticsearch => write!(f, "elasticsearch"),
            Dialect::Ssh => write!(f, "ssh"),
        }
    }
}

/// Saved-connection partition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Relational databases.
    Database,
    /// Document stores, key-value stores and SSH hosts.
    Nosql,
}

/// Where a connection is saved and how long it lives.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Visible in every workspace.
    #[default]
    Global,
    /// Bound to the current workspace; dropped when it closes.
    Workspace,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Workspace => write!(f, "workspace"),
        }
    }
}

/// SSH authentication material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SshAuth {
    /// Password authentication.
    Password {
        /// Opaque secret.
        password: String,
    },
    /// Private key file on disk.
    PrivateKey {
        /// Path to the key file.
        path: String,
        /// Passphrase protecting the key, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    /// Keys held by the local SSH agent.
    Agent,
}

/// Algorithm allow-lists applied during SSH negotiation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct AlgorithmPreferences {
    /// Allowed ciphers in preference order. Empty means library defaults.
    #[serde(default)]
    pub cipher: Vec<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// SSH hop used to reach a database, or the target of an SSH-host connection.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq, ToSchema)]
pub struct SshDescriptor {
    /// Bastion host.
    #[validate(length(min = 1, max = 255, message = "SSH host must be 1-255 characters"))]
    pub host: String,
    /// Bastion port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user.
    #[validate(length(min = 1, max = 128, message = "SSH user must be 1-128 characters"))]
    pub user: String,
    /// Authentication method.
    pub auth: SshAuth,
    /// Negotiation allow-lists.
    #[serde(default)]
    pub algorithms: AlgorithmPreferences,
    /// Remote port to forward to. Overrides the description port when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_port: Option<u16>,
    /// Local port assigned when the tunnel was opened. Never persisted as input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_port: Option<u16>,
}

impl SshDescriptor {
    /// Creates a descriptor with default port and no algorithm constraints.
    pub fn new(host: impl Into<String>, user: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            user: user.into(),
            auth,
            algorithms: AlgorithmPreferences::default(),
            forward_port: None,
            assigned_port: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// User-authored connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, ToSchema)]
pub struct ConnectionDescription {
    /// Dialect tag.
    pub dialect: Dialect,
    /// User-chosen label that disambiguates otherwise identical connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 100, message = "Label must be at most 100 characters"))]
    pub label: Option<String>,
    /// Database host (ignored for SQLite).
    #[serde(default = "default_host")]
    #[validate(length(max = 255, message = "Host must be at most 255 characters"))]
    pub host: String,
    /// Database port (dialect default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Database user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Database secret (never serialized back out).
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Default database / schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// SQLite file path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Global or workspace-local.
    #[serde(default)]
    pub scope: Scope,
    /// Optional SSH hop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub ssh: Option<SshDescriptor>,
    /// Set when the connection was established. Never part of the identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

impl ConnectionDescription {
    /// Creates a description with dialect defaults and no SSH hop.
    pub fn new(dialect: Dialect, host: impl Into<String>) -> Self {
        Self {
            dialect,
            label: None,
            host: host.into(),
            port: None,
            user: None,
            password: None,
            database: None,
            file_path: None,
            scope: Scope::default(),
            ssh: None,
            connected_at: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_ssh(mut self, ssh: SshDescriptor) -> Self {
        self.ssh = Some(ssh);
        self
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Port actually dialled on the database side (0 for SQLite).
    pub fn effective_port(&self) -> u16 {
        if self.dialect == Dialect::Ssh {
            if let Some(ssh) = &self.ssh {
                return ssh.port;
            }
        }
        self.port
            .or_else(|| self.dialect.default_port())
            .unwrap_or(0)
    }

    /// Remote port the SSH tunnel forwards to.
    pub fn forward_port(&self) -> u16 {
        self.ssh
            .as_ref()
            .and_then(|ssh| ssh.forward_port)
            .unwrap_or_else(|| self.effective_port())
    }

    /// Storage partition derived from the dialect.
    pub fn category(&self) -> Category {
        self.dialect.category()
    }

    /// Drops fields that are assigned at connect time.
    pub fn clear_ephemeral(&mut self) {
        self.connected_at = None;
        if let Some(ssh) = self.ssh.as_mut() {
            ssh.assigned_port = None;
        }
    }
}

/// Saved descriptions for one category, split by scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ScopedConnections {
    #[serde(default)]
    pub global: Vec<ConnectionDescription>,
    #[serde(default)]
    pub workspace: Vec<ConnectionDescription>,
}

/// Persisted connection document as the configuration bridge stores it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SavedConnections {
    #[serde(default)]
    pub database: ScopedConnections,
    #[serde(default)]
    pub nosql: ScopedConnections,
}

impl SavedConnections {
    /// Iterates every saved description with the partition it was found in.
    pub fn entries(&self) -> impl Iterator<Item = (Category, Scope, &ConnectionDescription)> {
        let partitions = [
            (Category::Database, Scope::Global, &self.database.global),
            (Category::Database, Scope::Workspace, &self.database.workspace),
            (Category::Nosql, Scope::Global, &self.nosql.global),
            (Category::Nosql, Scope::Workspace, &self.nosql.workspace),
        ];
        partitions
            .into_iter()
            .flat_map(|(category, scope, list)| list.iter().map(move |d| (category, scope, d)))
    }

    /// Total number of saved descriptions.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptions stored under the wrong category or scope.
    pub fn misplaced(&self) -> Vec<String> {
        self.entries()
            .filter(|(category, scope, d)| d.category() != *category || d.scope != *scope)
            .map(|(category, scope, d)| {
                format!("{} {}@{} saved under {:?}/{}", d.dialect, d.host, d.effective_port(), category, scope)
            })
            .collect()
    }
}

/// Live connection summary returned to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConnectionItem {
    /// Cache identity.
    pub identity: String,
    /// Name shown in the tree view.
    pub display_key: String,
    pub dialect: Dialect,
    pub scope: Scope,
    pub category: Category,
    /// Address the client is bound to (`127.0.0.1:<port>` when tunneled).
    pub address: String,
    /// Whether the client goes through an SSH tunnel.
    pub tunneled: bool,
    /// When the client was opened.
    pub connected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_parses_aliases() {
        let d: Dialect = serde_json::from_str("\"postgresql\"").unwrap();
        assert_eq!(d, Dialect::Postgres);
        let d: Dialect = serde_json::from_str("\"es\"").unwrap();
        assert_eq!(d, Dialect::Elasticsearch);
    }

    #[test]
    fn test_effective_port_falls_back_to_dialect_default() {
        let d = ConnectionDescription::new(Dialect::MySQL, "db");
        assert_eq!(d.effective_port(), 3306);
        let d = d.with_port(3307);
        assert_eq!(d.effective_port(), 3307);
        assert_eq!(ConnectionDescription::new(Dialect::SQLite, "").effective_port(), 0);
    }

    #[test]
    fn test_forward_port_prefers_ssh_override() {
        let mut ssh = SshDescriptor::new("bastion", "ops", SshAuth::Agent);
        ssh.forward_port = Some(15432);
        let d = ConnectionDescription::new(Dialect::Postgres, "internal").with_ssh(ssh);
        assert_eq!(d.forward_port(), 15432);
    }

    #[test]
    fn test_password_is_not_serialized() {
        let d = ConnectionDescription::new(Dialect::Redis, "cache").with_user("u", "secret");
        let json = serde_json::to_string(&d).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_ssh_auth_tagged_format() {
        let json = r#"{"host":"bastion","user":"ops","auth":{"type":"private_key","path":"/k"}}"#;
        let ssh: SshDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(ssh.port, 22);
        assert!(matches!(ssh.auth, SshAuth::PrivateKey { ref path, passphrase: None } if path == "/k"));
    }

    #[test]
    fn test_saved_connections_reports_misplaced_entries() {
        let mut saved = SavedConnections::default();
        saved
            .database
            .global
            .push(ConnectionDescription::new(Dialect::MySQL, "a"));
        saved
            .database
            .workspace
            .push(ConnectionDescription::new(Dialect::Redis, "b").with_scope(Scope::Workspace));
        assert_eq!(saved.len(), 2);
        let misplaced = saved.misplaced();
        assert_eq!(misplaced.len(), 1);
        assert!(misplaced[0].starts_with("redis b@6379"));
    }
}
