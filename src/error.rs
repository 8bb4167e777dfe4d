use std::io;

use thiserror::Error;

/// Errors raised while running a chat turn.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("model backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("model backend returned {status}: {body}")]
    BackendResponse { status: u16, body: String },

    #[error("malformed model stream: {0}")]
    MalformedStream(String),

    #[error("tool '{tool}' failed: {reason}")]
    ToolInvocationFailure { tool: String, reason: String },

    #[error("tool provider protocol error: {0}")]
    ToolProtocolError(String),

    #[error("failed to read input: {0}")]
    InputReadFailure(#[source] io::Error),

    #[error("failed to write to console: {0}")]
    Console(#[from] io::Error),
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::BackendUnreachable(err.to_string())
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
