// src/core/errors.rs

//! Defines the primary error type for the allocation daemon.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
#[derive(Error, Debug, Clone)]
pub enum SpallocError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("malformed JSON request: {0}")]
    MalformedJson(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("bad arguments for '{0}': {1}")]
    BadArguments(String, String),

    #[error("unknown job id {0}")]
    UnknownJob(u64),

    #[error("unknown machine '{0}'")]
    UnknownMachine(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for SpallocError {
    fn from(e: std::io::Error) -> Self {
        SpallocError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for SpallocError {
    fn from(e: serde_json::Error) -> Self {
        SpallocError::MalformedJson(e.to_string())
    }
}
