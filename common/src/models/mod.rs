//! Shared data models.

pub mod connection;
pub mod event;

// Re-export commonly used types
pub use connection::{
    AlgorithmPreferences, Category, ConnectionDescription, ConnectionItem, Dialect,
    SavedConnections, Scope, ScopedConnections, SshAuth, SshDescriptor,
};
pub use event::{ConnectionEvent, TreeNotice};
