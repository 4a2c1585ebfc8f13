//! Dialect client drivers.
//!
//! A driver turns a description plus a resolved endpoint into a live client.
//! It never sees the SSH descriptor: when a tunnel is involved the endpoint is
//! already the forwarded local port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::errors::ConnectError;
use common::models::connection::{ConnectionDescription, Dialect};
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use redis::aio::ConnectionManager as RedisConnectionManager;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{MySqlPool, PgPool, SqlitePool};

use crate::ssh::SshSession;

/// Where the client should connect.
#[derive(Clone)]
pub enum Endpoint {
    /// Straight to the database host.
    Direct { host: String, port: u16 },
    /// Through a forwarded port on 127.0.0.1.
    Tunneled { local_port: u16 },
    /// The SSH session itself is the client (SSH-host connections).
    Session(Arc<dyn SshSession>),
    /// Local file, no network.
    File(String),
}

impl Endpoint {
    /// Address the client talks to, for logs and listings.
    pub fn address(&self) -> String {
        match self {
            Endpoint::Direct { host, port } => format!("{}:{}", host, port),
            Endpoint::Tunneled { local_port } => format!("127.0.0.1:{}", local_port),
            Endpoint::Session(_) => "ssh-session".to_string(),
            Endpoint::File(path) => path.clone(),
        }
    }

    fn host_port(&self, dialect: Dialect) -> Result<(String, u16), ConnectError> {
        match self {
            Endpoint::Direct { host, port } => Ok((host.clone(), *port)),
            Endpoint::Tunneled { local_port } => Ok(("127.0.0.1".to_string(), *local_port)),
            _ => Err(ConnectError::validation(format!(
                "{} needs a network endpoint, got {}",
                dialect,
                self.address()
            ))),
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address())
    }
}

/// Live client handle for one dialect.
#[async_trait]
pub trait LiveClient: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Cheap round trip proving the client is still usable.
    async fn ping(&self) -> Result<(), ConnectError>;

    /// Releases client resources. Idempotent.
    async fn close(&self);

    /// Native client, when this is one of the built-in drivers.
    fn native(&self) -> Option<&DatabaseClient> {
        None
    }
}

/// Opens live clients.
#[async_trait]
pub trait ClientDriver: Send + Sync {
    async fn open(
        &self,
        description: &ConnectionDescription,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn LiveClient>, ConnectError>;
}

/// Elasticsearch has no driver in the stack; it is plain HTTP.
#[derive(Clone)]
pub struct ElasticsearchClient {
    pub http: reqwest::Client,
    pub base_url: String,
    credentials: Option<(String, Option<String>)>,
}

impl ElasticsearchClient {
    /// GET request against `path` with credentials applied.
    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(format!("{}{}", self.base_url, path));
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, password.as_deref()),
            None => request,
        }
    }
}

/// Client produced by [`NativeDriver`].
pub enum DatabaseClient {
    MySQL(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
    Redis(RedisConnectionManager),
    MongoDB(mongodb::Client),
    Elasticsearch(ElasticsearchClient),
    /// Session owned by the tunnel manager; closing the client leaves it alone.
    Ssh(Arc<dyn SshSession>),
}

#[async_trait]
impl LiveClient for DatabaseClient {
    fn dialect(&self) -> Dialect {
        match self {
            DatabaseClient::MySQL(_) => Dialect::MySQL,
            DatabaseClient::Postgres(_) => Dialect::Postgres,
            DatabaseClient::SQLite(_) => Dialect::SQLite,
            DatabaseClient::Redis(_) => Dialect::Redis,
            DatabaseClient::MongoDB(_) => Dialect::MongoDB,
            DatabaseClient::Elasticsearch(_) => Dialect::Elasticsearch,
            DatabaseClient::Ssh(_) => Dialect::Ssh,
        }
    }

    async fn ping(&self) -> Result<(), ConnectError> {
        match self {
            DatabaseClient::MySQL(pool) => {
                sqlx::query("SELECT 1").execute(pool).await.map_err(classify_sqlx)?;
            }
            DatabaseClient::Postgres(pool) => {
                sqlx::query("SELECT 1").execute(pool).await.map_err(classify_sqlx)?;
            }
            DatabaseClient::SQLite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await.map_err(classify_sqlx)?;
            }
            DatabaseClient::Redis(manager) => {
                let mut conn = manager.clone();
                redis::cmd("PING")
                    .query_async::<String>(&mut conn)
                    .await
                    .map_err(classify_redis)?;
            }
            DatabaseClient::MongoDB(client) => {
                client
                    .database("admin")
                    .run_command(doc! { "ping": 1 })
                    .await
                    .map_err(classify_mongo)?;
            }
            DatabaseClient::Elasticsearch(es) => {
                let resp = es.get("/").send().await.map_err(classify_reqwest)?;
                check_es_status(resp.status())?;
            }
            DatabaseClient::Ssh(session) => {
                if session.is_closed() {
                    return Err(ConnectError::tunnel_closed("SSH session is closed"));
                }
            }
        }
        Ok(())
    }

    async fn close(&self) {
        match self {
            DatabaseClient::MySQL(pool) => pool.close().await,
            DatabaseClient::Postgres(pool) => pool.close().await,
            DatabaseClient::SQLite(pool) => pool.close().await,
            // ConnectionManager closes when the last clone drops.
            DatabaseClient::Redis(_) => {}
            DatabaseClient::MongoDB(client) => client.clone().shutdown().immediate(true).await,
            DatabaseClient::Elasticsearch(_) => {}
            DatabaseClient::Ssh(_) => {}
        }
    }

    fn native(&self) -> Option<&DatabaseClient> {
        Some(self)
    }
}

/// Production driver over sqlx, redis, mongodb and reqwest.
pub struct NativeDriver {
    connect_timeout: Duration,
    max_connections: u32,
}

impl NativeDriver {
    pub fn new(connect_timeout: Duration, max_connections: u32) -> Self {
        Self {
            connect_timeout,
            max_connections,
        }
    }

    async fn open_mysql(&self, d: &ConnectionDescription, host: String, port: u16) -> Result<DatabaseClient, ConnectError> {
        let mut options = MySqlConnectOptions::new()
            .host(&host)
            .port(port)
            .username(d.user.as_deref().unwrap_or("root"));
        if let Some(password) = d.password.as_deref() {
            options = options.password(password);
        }
        if let Some(database) = d.database.as_deref().filter(|db| !db.is_empty()) {
            options = options.database(database);
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options)
            .await
            .map_err(classify_sqlx)?;
        Ok(DatabaseClient::MySQL(pool))
    }

    async fn open_postgres(&self, d: &ConnectionDescription, host: String, port: u16) -> Result<DatabaseClient, ConnectError> {
        let mut options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .username(d.user.as_deref().unwrap_or("postgres"))
            .database(d.database.as_deref().filter(|db| !db.is_empty()).unwrap_or("postgres"));
        if let Some(password) = d.password.as_deref() {
            options = options.password(password);
        }
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options)
            .await
            .map_err(classify_sqlx)?;
        Ok(DatabaseClient::Postgres(pool))
    }

    async fn open_sqlite(&self, path: &str) -> Result<DatabaseClient, ConnectError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options)
            .await
            .map_err(classify_sqlx)?;
        Ok(DatabaseClient::SQLite(pool))
    }

    async fn open_redis(&self, d: &ConnectionDescription, host: String, port: u16) -> Result<DatabaseClient, ConnectError> {
        let url = build_redis_url(d, &host, port);
        let client = redis::Client::open(url).map_err(classify_redis)?;
        let manager = tokio::time::timeout(self.connect_timeout, RedisConnectionManager::new(client))
            .await
            .map_err(|_| ConnectError::timeout(format!("Redis {}:{} did not answer", host, port)))?
            .map_err(classify_redis)?;
        let client = DatabaseClient::Redis(manager);
        client.ping().await?;
        Ok(client)
    }

    async fn open_mongo(&self, d: &ConnectionDescription, host: String, port: u16) -> Result<DatabaseClient, ConnectError> {
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host,
            port: Some(port),
        }];
        options.app_name = Some("connection-service".to_string());
        options.connect_timeout = Some(self.connect_timeout);
        options.server_selection_timeout = Some(self.connect_timeout);
        options.default_database = d.database.clone().filter(|db| !db.is_empty());
        // Single forwarded port: never try to discover other replica-set members.
        options.direct_connection = Some(true);
        if let Some(user) = d.user.as_deref().filter(|u| !u.is_empty()) {
            options.credential = Some(
                Credential::builder()
                    .username(user.to_string())
                    .password(d.password.clone())
                    .build(),
            );
        }
        let client = mongodb::Client::with_options(options).map_err(classify_mongo)?;
        let client = DatabaseClient::MongoDB(client);
        client.ping().await?;
        Ok(client)
    }

    async fn open_elasticsearch(&self, d: &ConnectionDescription, host: String, port: u16) -> Result<DatabaseClient, ConnectError> {
        let http = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.connect_timeout)
            .build()
            .map_err(|e| ConnectError::connection(e.to_string()))?;
        let credentials = d
            .user
            .as_ref()
            .filter(|u| !u.is_empty())
            .map(|user| (user.clone(), d.password.clone()));
        let client = DatabaseClient::Elasticsearch(ElasticsearchClient {
            http,
            base_url: format!("http://{}:{}", host, port),
            credentials,
        });
        client.ping().await?;
        Ok(client)
    }
}

#[async_trait]
impl ClientDriver for NativeDriver {
    async fn open(
        &self,
        description: &ConnectionDescription,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn LiveClient>, ConnectError> {
        let dialect = description.dialect;
        let client = match (dialect, endpoint) {
            (Dialect::Ssh, Endpoint::Session(session)) => DatabaseClient::Ssh(session.clone()),
            (Dialect::SQLite, Endpoint::File(path)) => self.open_sqlite(path).await?,
            (Dialect::Ssh | Dialect::SQLite, _) => {
                return Err(ConnectError::validation(format!(
                    "{} cannot use endpoint {}",
                    dialect,
                    endpoint.address()
                )))
            }
            (Dialect::MySQL, _) => {
                let (host, port) = endpoint.host_port(dialect)?;
                self.open_mysql(description, host, port).await?
            }
            (Dialect::Postgres, _) => {
                let (host, port) = endpoint.host_port(dialect)?;
                self.open_postgres(description, host, port).await?
            }
            (Dialect::Redis, _) => {
                let (host, port) = endpoint.host_port(dialect)?;
                self.open_redis(description, host, port).await?
            }
            (Dialect::MongoDB, _) => {
                let (host, port) = endpoint.host_port(dialect)?;
                self.open_mongo(description, host, port).await?
            }
            (Dialect::Elasticsearch, _) => {
                let (host, port) = endpoint.host_port(dialect)?;
                self.open_elasticsearch(description, host, port).await?
            }
        };
        tracing::debug!(dialect = %dialect, endpoint = %endpoint.address(), "client opened");
        Ok(Arc::new(client))
    }
}

fn build_redis_url(d: &ConnectionDescription, host: &str, port: u16) -> String {
    let db = d
        .database
        .as_deref()
        .and_then(|db| db.parse::<u32>().ok())
        .unwrap_or(0);
    match (d.user.as_deref().filter(|u| !u.is_empty()), d.password.as_deref()) {
        (Some(user), Some(password)) => format!("redis://{}:{}@{}:{}/{}", user, password, host, port, db),
        (None, Some(password)) => format!("redis://:{}@{}:{}/{}", password, host, port, db),
        _ => format!("redis://{}:{}/{}", host, port, db),
    }
}

fn check_es_status(status: reqwest::StatusCode) -> Result<(), ConnectError> {
    match status.as_u16() {
        401 | 403 => Err(ConnectError::authentication(format!("Elasticsearch answered {}", status))),
        s if (200..300).contains(&s) => Ok(()),
        _ => Err(ConnectError::connection(format!("Elasticsearch answered {}", status))),
    }
}

/// SQLSTATE classes (and MySQL's 1045) that mean rejected credentials.
const AUTH_SQLSTATES: &[&str] = &["28000", "28P01", "1045"];

fn classify_sqlx(err: sqlx::Error) -> ConnectError {
    match &err {
        sqlx::Error::Io(e) => ConnectError::network(e.to_string()),
        sqlx::Error::Tls(e) => ConnectError::protocol(e.to_string()),
        sqlx::Error::Protocol(msg) => ConnectError::protocol(msg.clone()),
        sqlx::Error::PoolTimedOut => ConnectError::timeout(err.to_string()),
        sqlx::Error::Configuration(e) => ConnectError::validation(e.to_string()),
        sqlx::Error::Database(db)
            if db.code().is_some_and(|code| AUTH_SQLSTATES.contains(&code.as_ref())) =>
        {
            ConnectError::authentication(db.message().to_string())
        }
        _ => ConnectError::connection(err.to_string()),
    }
}

fn classify_redis(err: redis::RedisError) -> ConnectError {
    if err.is_timeout() {
        ConnectError::timeout(err.to_string())
    } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        ConnectError::network(err.to_string())
    } else if err.kind() == redis::ErrorKind::AuthenticationFailed {
        ConnectError::authentication(err.to_string())
    } else if err.kind() == redis::ErrorKind::InvalidClientConfig {
        ConnectError::validation(err.to_string())
    } else {
        ConnectError::connection(err.to_string())
    }
}

fn classify_mongo(err: mongodb::error::Error) -> ConnectError {
    use mongodb::error::ErrorKind;
    match err.kind.as_ref() {
        ErrorKind::Authentication { message, .. } => ConnectError::authentication(message.clone()),
        ErrorKind::Io(e) => ConnectError::network(e.to_string()),
        ErrorKind::ServerSelection { message, .. } => ConnectError::network(message.clone()),
        ErrorKind::InvalidArgument { message, .. } => ConnectError::validation(message.clone()),
        _ => ConnectError::connection(err.to_string()),
    }
}

fn classify_reqwest(err: reqwest::Error) -> ConnectError {
    if err.is_timeout() {
        ConnectError::timeout(err.to_string())
    } else if err.is_connect() {
        ConnectError::network(err.to_string())
    } else {
        ConnectError::connection(err.to_string())
    }
}
