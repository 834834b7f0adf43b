//! Drydock: rolling maintenance orchestration for compute clusters
//!
//! A dry dock lifts one ship out of the water while the rest of the fleet
//! keeps sailing. Drydock does the same for compute hosts: a maintenance
//! session negotiates with the tenant projects that own running instances,
//! empties hosts one at a time, runs the host-level maintenance actions,
//! and returns each host to service.

pub mod actions;
pub mod api;
pub mod compute;
pub mod config;
pub mod manager;
pub mod notify;
pub mod session;
pub mod store;
pub mod timer;
pub mod workflow;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DrydockError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Duplicate entry for {columns} in {model}")]
    Duplicate { model: &'static str, columns: String },

    #[error("{model} {id} was not found")]
    NotFound { model: &'static str, id: String },

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Too many sessions")]
    TooManySessions,

    #[error("Compute plane error: {0}")]
    Compute(String),

    #[error("Bad request to compute plane: {0}")]
    BadRequest(String),

    #[error("Action not supported: {0}")]
    UnsupportedAction(String),

    #[error("Project rejected state: {0}")]
    ProjectNack(String),

    #[error("Timed out waiting for project replies: {0}")]
    ProjectTimeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DrydockError>;
