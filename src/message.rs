use serde::{Deserialize, Serialize};

use crate::bridge::callback::CallbackId;
use crate::error::BridgeError;
use crate::value::TypedValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Script asks the host to run a bound method.
    ExecuteMethod,
    /// Host calls a script function, or script calls an exposed host function.
    CallbackInvoke,
    /// Completion of an `ExecuteMethod`, addressed to the caller's reply id.
    CallbackResult,
    /// Host installs, replaces or removes a binding on the page.
    SetBinding,
    /// Script drops its reference to an exposed object.
    ReleaseObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
pub enum MessageTarget {
    Binding(String),
    Object(u64),
    Callback(CallbackId),
}

/// One unit of traffic between host and page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    pub kind: MessageKind,
    pub target: MessageTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<CallbackId>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub payload: Vec<TypedValue>,
}

impl BridgeMessage {
    pub fn execute(
        target: MessageTarget,
        method: impl Into<String>,
        payload: Vec<TypedValue>,
        reply_to: Option<CallbackId>,
    ) -> Self {
        Self {
            kind: MessageKind::ExecuteMethod,
            target,
            method: Some(method.into()),
            reply_to,
            is_error: false,
            payload,
        }
    }

    pub fn callback_invoke(id: CallbackId, payload: Vec<TypedValue>, is_error: bool) -> Self {
        Self {
            kind: MessageKind::CallbackInvoke,
            target: MessageTarget::Callback(id),
            method: None,
            reply_to: None,
            is_error,
            payload,
        }
    }

    pub fn callback_result(id: CallbackId, payload: Vec<TypedValue>, is_error: bool) -> Self {
        Self {
            kind: MessageKind::CallbackResult,
            target: MessageTarget::Callback(id),
            method: None,
            reply_to: None,
            is_error,
            payload,
        }
    }

    pub fn error_result(id: CallbackId, err: &BridgeError) -> Self {
        Self::callback_result(id, vec![TypedValue::String(err.to_string())], true)
    }

    pub fn set_binding(name: impl Into<String>, payload: Vec<TypedValue>) -> Self {
        Self {
            kind: MessageKind::SetBinding,
            target: MessageTarget::Binding(name.into()),
            method: None,
            reply_to: None,
            is_error: false,
            payload,
        }
    }

    pub fn release_object(id: u64) -> Self {
        Self {
            kind: MessageKind::ReleaseObject,
            target: MessageTarget::Object(id),
            method: None,
            reply_to: None,
            is_error: false,
            payload: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self).map_err(|err| BridgeError::Decode(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(bytes).map_err(|err| BridgeError::Decode(err.to_string()))
    }
}
