use num_derive::FromPrimitive;
use thiserror::Error;

// Constants
pub const MARKER: [u8; 16] = [0xff; 16];
pub const VERSION: u8 = 4;
pub const MAX: usize = 4096;

/// Marker (16) + length (2) + type (1): the smallest legal BGP message is a
/// KEEPALIVE at exactly this many bytes.
pub const MIN_MESSAGE_LENGTH: usize = 19;
pub const MAX_MESSAGE_LENGTH: usize = MAX;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageLengthError {
    #[error("BGP message length {length} is below the minimum of {minimum}")]
    TooShort { length: usize, minimum: usize },
    #[error("BGP message length {length} exceeds the maximum of {maximum}")]
    TooLong { length: usize, maximum: usize },
}

pub fn validate_message_length(length: usize) -> Result<(), MessageLengthError> {
    if length < MIN_MESSAGE_LENGTH {
        return Err(MessageLengthError::TooShort {
            length,
            minimum: MIN_MESSAGE_LENGTH,
        });
    }
    if length > MAX_MESSAGE_LENGTH {
        return Err(MessageLengthError::TooLong {
            length,
            maximum: MAX_MESSAGE_LENGTH,
        });
    }
    Ok(())
}

// Basic enums
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    #[default]
    Update,
    Notification,
    Keepalive,
}

/// RFC 4271 §4.5 NOTIFICATION error codes. Only the codes the FSM itself
/// raises or forwards are named here; UPDATE/header parsing errors belong to
/// the wire decoder and are out of scope for this crate.
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    MessageHeader = 1,
    OpenMessage = 2,
    UpdateMessage = 3,
    HoldTimerExpired = 4,
    FiniteStateMachine = 5,
    Cease = 6,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CeaseSubCode {
    Unspecific = 0,
    AdministrativeShutdown = 2,
    ConnectionCollisionResolution = 7,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FsmSubCode {
    Unspecific = 0,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HoldTimerSubCode {
    Unspecific = 0,
}
