//! Error types for the chat core.
//!
//! The `Display` text of [`ChatError::Connection`] and [`ChatError::HttpStatus`]
//! is exactly what gets shown to the user in place of a reply, so the
//! wording here is part of the observable behaviour.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// The request never produced a response (refused, timed out, DNS) or the
    /// body could not be read.
    #[error("Connection error: {0}")]
    Connection(#[from] reqwest::Error),

    /// The server answered with something other than 200.
    #[error("Error: HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(reqwest::Error),

    #[error("config error: {reason}")]
    Config { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("message is empty")]
    EmptyMessage,

    #[error("no model selected")]
    NoModelSelected,

    #[error("a reply is already streaming")]
    TurnInProgress,
}

pub type Result<T> = std::result::Result<T, ChatError>;
