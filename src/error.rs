//! Error types.
//!
//! Each concern gets its own enum. Only configuration and bind errors are
//! fatal; session errors stop at the connection that produced them.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Failures inside a single session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Read or write on the connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The request line was not valid UTF-8.
    #[error("request line is not valid UTF-8")]
    InvalidUtf8,
}

/// Fatal server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
