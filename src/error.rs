use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Errors raised at the FSM/IO boundary — NOTIFICATION sending/receiving and
/// exception handling have their own in-band representation
/// (`session::ExceptKind`/`Exception`) and do not go through this enum.
#[derive(Error, Debug)]
pub enum FsmError {
    #[error("BGP protocol error: {0}")]
    Protocol(String),

    #[error("BGP message error: {0}")]
    Message(String),

    #[error("BGP session error: {0}")]
    Session(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid address: {0}")]
    Address(#[from] AddrParseError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    Missing(String),
}
