//! Native/script bridge and adaptive message-pump scheduler for embedded
//! browser engines.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod js;
pub mod message;
pub mod pump;
pub mod service;
pub mod value;

// Re-export commonly used types
pub use bridge::{
    CallbackId, ChannelTransport, ContextTransport, HostCallback, Invokable, Manifest, MethodCall,
    MethodSpec, ScriptFunction, ScriptResponse, ScriptingContext, Transport,
};
pub use codec::{BridgeDecode, BridgeEncode, CodecError, ParamKind, ParamSpec};
pub use config::{BridgeConfig, ConfigError, SchedulerConfig};
pub use error::{BridgeError, TransportError};
pub use message::{BridgeMessage, MessageKind, MessageTarget};
pub use pump::{EnginePump, ForcePolicy, MessagePumpScheduler, PumpState};
pub use service::BrowserService;
pub use value::{ObjectHandle, StructValue, TypedValue};
