//! Error types for the control plane.

use std::io;

use glowproto::MessageKind;
use patternette::ScriptError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr} after {attempts} attempts: {source}")]
    Bind {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("no route registered for inbound message type '{0}'")]
    MissingRoute(MessageKind),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Why a zone command was refused. Sent back to the client as an `error`.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("unknown zone '{0}'")]
    UnknownZone(String),

    #[error("unknown effect '{0}' (expected 'beat' or 'flash')")]
    UnknownEffect(String),

    #[error(transparent)]
    Script(#[from] ScriptError),
}
