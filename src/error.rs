//! Error types for mailq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Store or transport unreachable. Fatal for the current run.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A host could not be handed its batch. The host has already been marked `failed`.
    #[error("delegation to host '{host}' failed: {reason}")]
    Delegation { host: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
