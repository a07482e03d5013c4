//! Callback ids and the handles that complete them.
//!
//! A [`ScriptFunction`] may be called any number of times; a
//! [`ScriptResponse`] completes exactly once. Both refer back to their
//! scripting context weakly, so once the page session is gone they quietly do
//! nothing.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{error, trace};
use uuid::Uuid;

use crate::codec::BridgeEncode;
use crate::error::BridgeError;
use crate::value::TypedValue;

use super::context::ScriptingContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(Uuid);

impl CallbackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallbackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for CallbackId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A function living in the page, callable from host code.
#[derive(Clone)]
pub struct ScriptFunction {
    id: CallbackId,
    owner: Weak<ScriptingContext>,
}

impl ScriptFunction {
    pub(crate) fn new(id: CallbackId, owner: Weak<ScriptingContext>) -> Self {
        Self { id, owner }
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// True when the owning context is gone and calls will be dropped.
    pub fn is_detached(&self) -> bool {
        self.owner.strong_count() == 0
    }

    pub fn call(&self, args: Vec<TypedValue>) {
        self.invoke(args, false);
    }

    /// Calls the function with the error flag set, for callbacks that take
    /// `(error)` style completions.
    pub fn call_error(&self, args: Vec<TypedValue>) {
        self.invoke(args, true);
    }

    fn invoke(&self, args: Vec<TypedValue>, is_error: bool) {
        if let Some(context) = self.owner.upgrade() {
            context.invoke_script_function(self.id, args, is_error);
        }
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptFunction")
            .field("id", &self.id)
            .field("detached", &self.is_detached())
            .finish()
    }
}

const PENDING: u8 = 0;
const FINISHED: u8 = 1;
const CANCELLED: u8 = 2;

struct ResponseState {
    id: Option<CallbackId>,
    owner: Weak<ScriptingContext>,
    state: AtomicU8,
}

/// Single-use completion handle for an asynchronous bound method.
///
/// Clones share the same completion state. Finishing twice is a contract
/// violation: it panics in debug builds and is logged and ignored otherwise.
#[derive(Clone)]
pub struct ScriptResponse {
    inner: Arc<ResponseState>,
}

impl ScriptResponse {
    pub(crate) fn new(id: Option<CallbackId>, owner: Weak<ScriptingContext>) -> Self {
        Self {
            inner: Arc::new(ResponseState {
                id,
                owner,
                state: AtomicU8::new(PENDING),
            }),
        }
    }

    /// A response that completes into nothing.
    pub fn detached() -> Self {
        Self::new(None, Weak::new())
    }

    pub fn id(&self) -> Option<CallbackId> {
        self.inner.id
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != PENDING
    }

    pub fn success(&self) {
        self.finish(Vec::new(), false);
    }

    pub fn success_with<T: BridgeEncode + ?Sized>(&self, value: &T) {
        self.finish(vec![value.encode()], false);
    }

    pub fn failure(&self, reason: impl Into<String>) {
        self.finish(vec![TypedValue::String(reason.into())], true);
    }

    fn finish(&self, payload: Vec<TypedValue>, is_error: bool) {
        match self.inner.state.compare_exchange(
            PENDING,
            FINISHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(CANCELLED) => {
                trace!(target: "bridge", "dropping completion of a cancelled response");
                return;
            }
            Err(_) => {
                let err = BridgeError::DoubleFinish;
                if cfg!(debug_assertions) {
                    panic!("{err}");
                }
                error!(target: "bridge", id = ?self.inner.id, %err, "ignoring second completion");
                return;
            }
        }

        let (Some(id), Some(context)) = (self.inner.id, self.inner.owner.upgrade()) else {
            return;
        };
        context.deliver_result(id, payload, is_error);
    }

    /// Marks the response as settled by the bridge; later finishes are dropped.
    pub(crate) fn cancel(&self) -> bool {
        cancel_state(&self.inner)
    }
}

fn cancel_state(state: &ResponseState) -> bool {
    state
        .state
        .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

impl fmt::Debug for ScriptResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptResponse")
            .field("id", &self.inner.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Host code callable from the page through a callback id.
pub trait HostCallback: Send + Sync {
    fn call(&self, args: Vec<TypedValue>, is_error: bool);
}

impl<F> HostCallback for F
where
    F: Fn(Vec<TypedValue>, bool) + Send + Sync,
{
    fn call(&self, args: Vec<TypedValue>, is_error: bool) {
        self(args, is_error)
    }
}

struct InFlight {
    binding: String,
    generation: u64,
    response: Weak<ResponseState>,
}

impl InFlight {
    fn is_pending(&self) -> bool {
        self.response
            .upgrade()
            .is_some_and(|state| state.state.load(Ordering::Acquire) == PENDING)
    }
}

/// Per-context bookkeeping for callbacks that cross the boundary.
#[derive(Default)]
pub struct CallbackCorrelator {
    functions: HashMap<CallbackId, Weak<dyn HostCallback>>,
    in_flight: Vec<InFlight>,
}

impl CallbackCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host function. The correlator only holds it weakly.
    pub fn expose_function(&mut self, function: &Arc<dyn HostCallback>) -> CallbackId {
        let id = CallbackId::new();
        self.functions.insert(id, Arc::downgrade(function));
        id
    }

    /// Looks up a host function, forgetting it if its owner dropped it.
    pub fn resolve_function(&mut self, id: CallbackId) -> Option<Arc<dyn HostCallback>> {
        let function = self.functions.get(&id)?.upgrade();
        if function.is_none() {
            self.functions.remove(&id);
        }
        function
    }

    pub fn forget_function(&mut self, id: CallbackId) -> bool {
        self.functions.remove(&id).is_some()
    }

    pub(crate) fn track(&mut self, binding: &str, generation: u64, response: &ScriptResponse) {
        self.in_flight.retain(InFlight::is_pending);
        self.in_flight.push(InFlight {
            binding: binding.to_string(),
            generation,
            response: Arc::downgrade(&response.inner),
        });
    }

    /// Cancels responses issued against an older generation of `binding` and
    /// returns the reply ids their callers are still waiting on.
    pub(crate) fn supersede(&mut self, binding: &str, current_generation: u64) -> Vec<CallbackId> {
        let mut orphaned = Vec::new();
        self.in_flight.retain(|entry| {
            if entry.binding != binding || entry.generation >= current_generation {
                return true;
            }
            if let Some(state) = entry.response.upgrade() {
                if cancel_state(&state) {
                    orphaned.extend(state.id);
                }
            }
            false
        });
        orphaned
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.iter().filter(|entry| entry.is_pending()).count()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Drops everything; pending responses are cancelled without a reply.
    pub fn clear(&mut self) {
        for entry in self.in_flight.drain(..) {
            if let Some(state) = entry.response.upgrade() {
                cancel_state(&state);
            }
        }
        self.functions.clear();
    }
}
