use crate::protocol::{EngineError, SessionHandle, Uuid};
use thiserror::Error;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Message shown to users for failures whose payload means nothing to them.
pub const SERVICE_UNAVAILABLE: &str = "service unavailable, please try again later";

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The engine entry point itself failed (engine gone, channel broken).
    #[error("transport error: {message}")]
    Transport { message: String },
    /// The reply could not be decoded as a tagged result of the declared type.
    #[error("protocol error in {method}: {message}")]
    Protocol { method: String, message: String },
    /// A well-formed `{ok: false}` reply.
    #[error("{0}")]
    Domain(EngineError),
    #[error("engine session is not initialized")]
    Uninitialized,
    /// Initialization failed and the session is terminally unusable.
    /// `channel` is set when the init call itself never got a reply.
    #[error("engine initialization failed: {message}")]
    InitFailed { message: String, channel: bool },
    #[error("session {handle} is no longer valid")]
    InvalidSession { handle: SessionHandle },
    #[error("group {uuid} is not in the group list")]
    UnknownGroup { uuid: Uuid },
}

impl BridgeError {
    pub(crate) fn protocol(method: &str, message: impl Into<String>) -> Self {
        Self::Protocol {
            method: method.to_string(),
            message: message.into(),
        }
    }

    /// True for failures raised by the command channel rather than decoded
    /// from a reply.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Protocol { .. })
    }

    /// Text suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport { .. }
            | Self::Protocol { .. }
            | Self::InitFailed { channel: true, .. } => SERVICE_UNAVAILABLE.to_string(),
            Self::Domain(err) => err.message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        Self::Domain(err)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        Self::Transport {
            message: err.message,
        }
    }
}
