//! QuickJS-backed page runtime used to drive the bridge end to end.

pub mod page;
pub mod runtime;

pub use page::ScriptPage;
pub use runtime::QuickJsEngine;
