//! Host side of the native/script bridge.

pub mod callback;
pub mod context;
mod dispatcher;
pub mod invokable;
pub mod objects;
pub mod registry;
pub mod transport;

pub use callback::{CallbackCorrelator, CallbackId, HostCallback, ScriptFunction, ScriptResponse};
pub use context::{ContextOptions, ScriptingContext};
pub use invokable::{Invokable, MethodCall, MethodSpec};
pub use objects::{ObjectTable, Retention};
pub use registry::{Binding, BindingRegistry, BindingTarget, Manifest, ManifestEntry};
pub use transport::{ChannelTransport, ContextTransport, Transport};
