use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, trace, warn};

use crate::codec::DecodeScope;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::message::{BridgeMessage, MessageKind, MessageTarget};
use crate::pump::MessagePumpScheduler;
use crate::value::{ObjectHandle, TypedValue};

use super::callback::{CallbackCorrelator, CallbackId, HostCallback, ScriptResponse};
use super::dispatcher;
use super::invokable::Invokable;
use super::objects::{ObjectTable, Retention};
use super::registry::{Binding, BindingRegistry, BindingTarget, Manifest};
use super::transport::Transport;

#[derive(Clone)]
pub struct ContextOptions {
    pub lowercase_binding_names: bool,
    /// Poked when a message arrives off the owner thread.
    pub scheduler: Option<Arc<MessagePumpScheduler>>,
    /// Thread that dispatches messages and owns the bound objects. Defaults
    /// to the thread that creates the context.
    pub owner_thread: Option<ThreadId>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            lowercase_binding_names: true,
            scheduler: None,
            owner_thread: None,
        }
    }
}

impl From<&BridgeConfig> for ContextOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            lowercase_binding_names: config.lowercase_binding_names,
            scheduler: None,
            owner_thread: None,
        }
    }
}

struct ContextState {
    registry: BindingRegistry,
    objects: ObjectTable,
    callbacks: CallbackCorrelator,
    transport: Option<Arc<dyn Transport>>,
}

pub(crate) struct ResolvedTarget {
    pub object: Arc<dyn Invokable>,
    /// Binding name and generation when resolved by name.
    pub binding: Option<(String, u64)>,
    pub label: String,
}

/// Host side of one page session.
///
/// Owns the session's bindings, exposed objects and callback bookkeeping,
/// and speaks the bridge protocol over its [`Transport`]. Messages are
/// dispatched on the owner thread (see [`ContextOptions::owner_thread`]);
/// arrivals from other threads are queued until
/// [`process_inbound`](Self::process_inbound) runs there.
pub struct ScriptingContext {
    this: Weak<ScriptingContext>,
    owner_thread: ThreadId,
    lowercase_names: bool,
    scheduler: Option<Arc<MessagePumpScheduler>>,
    state: Mutex<ContextState>,
    inbound: Mutex<VecDeque<BridgeMessage>>,
}

impl ScriptingContext {
    pub fn new(transport: Arc<dyn Transport>, options: ContextOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            owner_thread: options
                .owner_thread
                .unwrap_or_else(|| thread::current().id()),
            lowercase_names: options.lowercase_binding_names,
            scheduler: options.scheduler,
            state: Mutex::new(ContextState {
                registry: BindingRegistry::new(options.lowercase_binding_names),
                objects: ObjectTable::new(),
                callbacks: CallbackCorrelator::new(),
                transport: Some(transport),
            }),
            inbound: Mutex::new(VecDeque::new()),
        })
    }

    /// Binds `object` under `name`, keeping it alive for as long as the
    /// binding exists.
    pub fn bind(&self, name: &str, object: Arc<dyn Invokable>, permanent: bool) {
        let target = BindingTarget::Strong(Arc::clone(&object));
        self.bind_target(name, target, &object, permanent);
    }

    /// Binds an object owned elsewhere. Calls fail with `UnknownBinding` once
    /// it is dropped.
    pub fn bind_weak(&self, name: &str, object: Weak<dyn Invokable>, permanent: bool) {
        let Some(strong) = object.upgrade() else {
            warn!(target: "bridge", name, "not binding an object that is already gone");
            return;
        };
        self.bind_target(name, BindingTarget::Weak(object), &strong, permanent);
    }

    fn bind_target(
        &self,
        name: &str,
        target: BindingTarget,
        object: &Arc<dyn Invokable>,
        permanent: bool,
    ) {
        let (message, orphaned, exposed) = {
            let mut state = self.lock_state();
            if state.transport.is_none() {
                debug!(target: "bridge", name, "ignoring bind on a closed context");
                return;
            }
            let handle = state.objects.expose(object, Retention::Weak);
            let (binding, replaced) = state.registry.bind(name, target, permanent, handle);
            let orphaned = match replaced {
                Some(old) => {
                    forget_binding_handle(&mut state, &old.handle);
                    state.callbacks.supersede(&binding.name, binding.generation)
                }
                None => Vec::new(),
            };
            let message = set_binding_message(&state.registry, &binding);
            (message, orphaned, binding.name)
        };

        debug!(
            target: "bridge",
            name = %exposed,
            permanent,
            superseded = orphaned.len(),
            "bound object"
        );
        let reason = BridgeError::BindingReplaced(exposed);
        for id in orphaned {
            self.post(BridgeMessage::error_result(id, &reason));
        }
        self.post(message);
    }

    /// Removes a binding. Only takes effect when `permanent` matches the
    /// stored binding and, if given, `target` is the bound object.
    pub fn unbind(&self, name: &str, target: Option<&dyn Invokable>, permanent: bool) -> bool {
        let removed = {
            let mut state = self.lock_state();
            let removed = state.registry.unbind(name, target, permanent);
            if let Some(binding) = &removed {
                forget_binding_handle(&mut state, &binding.handle);
            }
            removed
        };
        let Some(binding) = removed else {
            trace!(target: "bridge", name, permanent, "unbind did not match a binding");
            return false;
        };
        debug!(target: "bridge", name = %binding.name, "unbound object");
        self.post(BridgeMessage::set_binding(binding.name, vec![TypedValue::Null]));
        true
    }

    pub fn snapshot_permanent_bindings(&self) -> Manifest {
        self.lock_state().registry.snapshot_permanent()
    }

    /// Replays every live binding into a freshly loaded page.
    pub fn on_page_loaded(&self) {
        let messages: Vec<_> = {
            let state = self.lock_state();
            state
                .registry
                .bindings()
                .into_iter()
                .map(|binding| set_binding_message(&state.registry, binding))
                .collect()
        };
        debug!(target: "bridge", bindings = messages.len(), "page loaded");
        for message in messages {
            self.post(message);
        }
    }

    /// Forgets everything that belonged to the previous page: session
    /// bindings, callbacks, exposed objects and queued messages.
    pub fn on_navigation(&self) {
        let removed = {
            let mut state = self.lock_state();
            let removed = state.registry.clear_session();
            state.callbacks.clear();
            let kept: HashSet<u64> = state
                .registry
                .bindings()
                .iter()
                .map(|binding| binding.handle.id)
                .collect();
            state.objects.retain(|id| kept.contains(&id));
            removed
        };
        self.lock_inbound().clear();
        debug!(target: "bridge", session_bindings = removed.len(), "navigated");
    }

    /// Entry point for bytes posted by the page.
    pub fn on_message_received(&self, bytes: &[u8]) {
        let message = match BridgeMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: "bridge", %err, "dropping malformed bridge message");
                return;
            }
        };

        if self.is_owner_thread() {
            self.dispatch(message);
            return;
        }

        self.lock_inbound().push_back(message);
        if let Some(scheduler) = &self.scheduler {
            scheduler.request_pump(0);
        }
    }

    /// Dispatches messages queued from other threads. Returns how many ran.
    pub fn process_inbound(&self) -> usize {
        if !self.is_owner_thread() {
            debug!(target: "bridge", "process_inbound called off the owner thread");
            return 0;
        }
        let mut handled = 0;
        loop {
            let next = self.lock_inbound().pop_front();
            let Some(message) = next else {
                break;
            };
            self.dispatch(message);
            handled += 1;
        }
        handled
    }

    /// Hands `object` to the page. The context keeps it alive until the page
    /// releases it, navigates, or the context closes.
    pub fn expose_object(&self, object: Arc<dyn Invokable>) -> ObjectHandle {
        self.lock_state()
            .objects
            .expose(&object, Retention::Strong)
    }

    /// Makes a host function callable from the page by id. The context holds
    /// it weakly; calls after the caller drops it are ignored.
    pub fn expose_function(&self, function: &Arc<dyn HostCallback>) -> CallbackId {
        self.lock_state().callbacks.expose_function(function)
    }

    pub fn forget_function(&self, id: CallbackId) -> bool {
        self.lock_state().callbacks.forget_function(id)
    }

    pub fn release_object(&self, id: u64) -> bool {
        let released = self.lock_state().objects.release(id);
        trace!(target: "bridge", id, released, "release object");
        released
    }

    /// Tears the session down. Idempotent.
    pub fn close(&self) {
        let was_open = {
            let mut state = self.lock_state();
            let was_open = state.transport.take().is_some();
            state.registry.clear();
            state.objects.clear();
            state.callbacks.clear();
            was_open
        };
        self.lock_inbound().clear();
        if was_open {
            debug!(target: "bridge", "scripting context closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().transport.is_none()
    }

    pub fn binding_count(&self) -> usize {
        self.lock_state().registry.len()
    }

    pub fn exposed_object_count(&self) -> usize {
        self.lock_state().objects.len()
    }

    pub fn in_flight_responses(&self) -> usize {
        self.lock_state().callbacks.in_flight()
    }

    pub fn pending_inbound(&self) -> usize {
        self.lock_inbound().len()
    }

    pub fn lowercase_names(&self) -> bool {
        self.lowercase_names
    }

    fn dispatch(&self, message: BridgeMessage) {
        match message.kind {
            MessageKind::ExecuteMethod => dispatcher::execute(self, message),
            MessageKind::CallbackInvoke => self.route_host_callback(message),
            MessageKind::ReleaseObject => match message.target {
                MessageTarget::Object(id) => {
                    self.release_object(id);
                }
                other => {
                    warn!(target: "bridge", message_target = ?other, "release of a non-object target")
                }
            },
            MessageKind::CallbackResult | MessageKind::SetBinding => {
                debug!(target: "bridge", kind = ?message.kind, "ignoring page-bound message");
            }
        }
    }

    fn route_host_callback(&self, message: BridgeMessage) {
        let MessageTarget::Callback(id) = message.target else {
            warn!(target: "bridge", "callback invoke without a callback target");
            return;
        };
        let function = self.lock_state().callbacks.resolve_function(id);
        match function {
            Some(function) => function.call(message.payload, message.is_error),
            None => trace!(
                target: "bridge",
                %id,
                err = %BridgeError::StaleCallback,
                "dropping callback invoke"
            ),
        }
    }

    pub(crate) fn resolve_target(&self, target: &MessageTarget) -> Result<ResolvedTarget, BridgeError> {
        let mut state = self.lock_state();
        match target {
            MessageTarget::Binding(name) => {
                let (object, generation, exposed) = state
                    .registry
                    .resolve(name)
                    .ok_or_else(|| BridgeError::UnknownBinding(name.clone()))?;
                Ok(ResolvedTarget {
                    object,
                    label: exposed.clone(),
                    binding: Some((exposed, generation)),
                })
            }
            MessageTarget::Object(id) => {
                let object = state.objects.resolve(*id)?;
                Ok(ResolvedTarget {
                    label: format!("{}#{id}", object.type_name()),
                    object,
                    binding: None,
                })
            }
            MessageTarget::Callback(id) => Err(BridgeError::Decode(format!(
                "cannot execute a method on callback {id}"
            ))),
        }
    }

    pub(crate) fn track_response(&self, binding: &str, generation: u64, response: &ScriptResponse) {
        self.lock_state()
            .callbacks
            .track(binding, generation, response);
    }

    pub(crate) fn decode_scope(&self) -> DecodeScope {
        DecodeScope::for_context(self.this.clone())
    }

    pub(crate) fn weak(&self) -> Weak<ScriptingContext> {
        self.this.clone()
    }

    pub(crate) fn invoke_script_function(&self, id: CallbackId, args: Vec<TypedValue>, is_error: bool) {
        self.post(BridgeMessage::callback_invoke(id, args, is_error));
    }

    pub(crate) fn deliver_result(&self, id: CallbackId, payload: Vec<TypedValue>, is_error: bool) {
        self.post(BridgeMessage::callback_result(id, payload, is_error));
    }

    /// Posts outside of any lock; failures are logged and swallowed.
    pub(crate) fn post(&self, message: BridgeMessage) {
        let transport = self.lock_state().transport.clone();
        let Some(transport) = transport else {
            return;
        };
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "bridge", %err, "failed to encode bridge message");
                return;
            }
        };
        if let Err(err) = transport.post_message(bytes) {
            warn!(target: "bridge", %err, kind = ?message.kind, "failed to post bridge message");
        }
    }

    fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner_thread
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_inbound(&self) -> MutexGuard<'_, VecDeque<BridgeMessage>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drops the object entry of a binding that is gone, unless another binding
/// still shares it.
fn forget_binding_handle(state: &mut ContextState, handle: &ObjectHandle) {
    let shared = state
        .registry
        .bindings()
        .iter()
        .any(|binding| binding.handle.id == handle.id);
    if !shared {
        state.objects.forget_weak(handle.id);
    }
}

fn set_binding_message(registry: &BindingRegistry, binding: &Binding) -> BridgeMessage {
    let entry = registry.manifest_entry(binding);
    let methods = entry.methods.into_iter().map(TypedValue::String).collect();
    BridgeMessage::set_binding(
        entry.name,
        vec![
            TypedValue::Object(entry.handle),
            TypedValue::Array(methods),
            TypedValue::Bool(entry.permanent),
        ],
    )
}
