use thiserror::Error;

use crate::codec::CodecError;

/// Everything that can go wrong while servicing a bridge message.
///
/// Dispatch-time variants are turned into an error `CallbackResult` for the
/// calling script; they never unwind across the boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("no object is bound as '{0}'")]
    UnknownBinding(String),
    #[error("object handle {0} is not exposed to this page")]
    UnknownObject(u64),
    #[error("'{target}' has no method '{method}'")]
    UnknownMethod { target: String, method: String },
    #[error("'{method}' expects {expected} argument(s), got {actual}")]
    ArgCountMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("malformed bridge message: {0}")]
    Decode(String),
    #[error("callback owner is gone")]
    StaleCallback,
    #[error("response was already finished")]
    DoubleFinish,
    #[error("binding '{0}' was replaced before the call finished")]
    BindingReplaced(String),
    #[error("{0}")]
    Invocation(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        BridgeError::TypeMismatch(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer endpoint is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}
