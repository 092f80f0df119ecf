//! Error types for the callback endpoint.

use std::net::SocketAddr;

/// Result type alias for webhook operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while starting or running the callback listener.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listen address could not be bound.
    #[error("failed to bind callback listener on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The async runtime could not be created.
    #[error("failed to start callback runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The listener thread exited before reporting its address.
    #[error("callback listener stopped during startup")]
    Stopped,
}
