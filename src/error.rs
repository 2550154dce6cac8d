//! Error types

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("address pool {pool} exhausted")]
    PoolExhausted { pool: String },
}

impl Error {
    pub(crate) fn already_exists(kind: &'static str, name: impl ToString) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: impl ToString) -> Self {
        Error::NotFound {
            kind,
            name: name.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
