//! Shared types for the connection lifecycle service: connection models,
//! identities, the error taxonomy, configuration and the HTTP envelope.

pub mod config;
pub mod errors;
pub mod identity;
pub mod middleware;
pub mod models;
pub mod response;
