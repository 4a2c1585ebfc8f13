//! Messages pushed to the configuration bridge and the tree view.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::connection::{Category, Scope};
use crate::errors::{ConnectError, ErrorKind};

/// Outcome of a connect request, as rendered by the configuration panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ConnectionEvent {
    /// The connection is live.
    Success {
        identity: String,
        #[serde(rename = "displayKey")]
        display_key: String,
    },
    /// The connection failed; the identity stays absent.
    Error { kind: ErrorKind, message: String },
}

impl ConnectionEvent {
    pub fn success(identity: impl Into<String>, display_key: impl Into<String>) -> Self {
        Self::Success {
            identity: identity.into(),
            display_key: display_key.into(),
        }
    }

    pub fn failure(err: &ConnectError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Change notices for the tree view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum TreeNotice {
    /// Make a freshly connected node visible.
    Added {
        identity: String,
        display_key: String,
        scope: Scope,
        category: Category,
    },
    /// Drop a node whose connection was removed.
    Removed { identity: String },
    /// Saved connections were replaced wholesale.
    Refresh,
}
