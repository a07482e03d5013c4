use std::sync::{Arc, Mutex};

use pagebridge::bridge::ContextOptions;
use pagebridge::{
    bridge_object, bridge_struct, BridgeEncode, BridgeError, BridgeMessage, CallbackId,
    ChannelTransport, HostCallback, Invokable, MessageKind, MessagePumpScheduler, MessageTarget,
    MethodCall, MethodSpec, PumpState, ScriptFunction, ScriptResponse, ScriptingContext,
    TypedValue,
};
use tokio::sync::mpsc::UnboundedReceiver;

bridge_struct! {
    #[derive(Debug, Clone)]
    struct Subscription {
        topic: String,
        listener: ScriptFunction,
    }
}

#[derive(Default)]
struct Calc {
    label: &'static str,
    held: Mutex<Vec<ScriptResponse>>,
    listeners: Mutex<Vec<ScriptFunction>>,
    topics: Mutex<Vec<String>>,
}

impl Calc {
    fn named(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            ..Self::default()
        })
    }

    fn add(&self, a: i64, b: i64) -> i64 {
        a.wrapping_add(b)
    }

    fn name(&self) -> String {
        self.label.to_string()
    }

    fn subscribe(&self, listener: ScriptFunction) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn watch(&self, request: Subscription) {
        self.topics.lock().unwrap().push(request.topic);
        self.listeners.lock().unwrap().push(request.listener);
    }

    fn hold(&self, response: ScriptResponse) {
        self.held.lock().unwrap().push(response);
    }

    fn take_held(&self) -> ScriptResponse {
        self.held.lock().unwrap().pop().expect("a held response")
    }
}

bridge_object! {
    impl Calc as "Calc" {
        fn add(a: i64, b: i64) -> i64;
        fn name() -> String;
        fn subscribe(listener: ScriptFunction);
        fn watch(request: Subscription);
        async fn hold();
    }
}

/// Hands out the same child object on every call.
struct Factory {
    child: Arc<Calc>,
}

impl Invokable for Factory {
    fn type_name(&self) -> &'static str {
        "Factory"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        const METHODS: &[MethodSpec] = &[MethodSpec {
            name: "child",
            params: &[],
            response: false,
        }];
        METHODS
    }

    fn invoke(
        &self,
        method: &MethodSpec,
        call: MethodCall,
    ) -> Result<Option<TypedValue>, BridgeError> {
        match method.name {
            "child" => {
                let child: Arc<dyn Invokable> = self.child.clone();
                let handle = call
                    .expose(child)
                    .ok_or_else(|| BridgeError::Invocation("page is gone".into()))?;
                Ok(Some(handle.encode()))
            }
            other => Err(BridgeError::UnknownMethod {
                target: "Factory".into(),
                method: other.into(),
            }),
        }
    }
}

/// Async method that settles its response and then reports a failure.
struct Eager;

impl Invokable for Eager {
    fn type_name(&self) -> &'static str {
        "Eager"
    }

    fn methods(&self) -> &'static [MethodSpec] {
        const METHODS: &[MethodSpec] = &[MethodSpec {
            name: "answer",
            params: &[],
            response: true,
        }];
        METHODS
    }

    fn invoke(
        &self,
        _method: &MethodSpec,
        mut call: MethodCall,
    ) -> Result<Option<TypedValue>, BridgeError> {
        call.take_response().success_with(&1i64);
        Err(BridgeError::Invocation("late failure".into()))
    }
}

struct Harness {
    context: Arc<ScriptingContext>,
    outbox: UnboundedReceiver<Vec<u8>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    fn with_options(options: ContextOptions) -> Self {
        let (transport, outbox) = ChannelTransport::new();
        let context = ScriptingContext::new(Arc::new(transport), options);
        Self { context, outbox }
    }

    fn send(&self, message: &BridgeMessage) {
        self.context
            .on_message_received(&message.to_bytes().expect("encode message"));
    }

    fn call(&self, target: MessageTarget, method: &str, args: Vec<TypedValue>) -> CallbackId {
        let reply_to = CallbackId::new();
        self.send(&BridgeMessage::execute(target, method, args, Some(reply_to)));
        reply_to
    }

    fn drain(&mut self) -> Vec<BridgeMessage> {
        let mut messages = Vec::new();
        while let Ok(bytes) = self.outbox.try_recv() {
            messages.push(BridgeMessage::from_bytes(&bytes).expect("decode message"));
        }
        messages
    }

    fn results_for(&mut self, id: CallbackId) -> Vec<BridgeMessage> {
        self.drain()
            .into_iter()
            .filter(|message| {
                message.kind == MessageKind::CallbackResult
                    && message.target == MessageTarget::Callback(id)
            })
            .collect()
    }

    fn result_for(&mut self, id: CallbackId) -> BridgeMessage {
        self.drain()
            .into_iter()
            .find(|message| {
                message.kind == MessageKind::CallbackResult
                    && message.target == MessageTarget::Callback(id)
            })
            .expect("a result for the call")
    }
}

fn binding(name: &str) -> MessageTarget {
    MessageTarget::Binding(name.to_string())
}

fn error_text(message: &BridgeMessage) -> String {
    assert!(message.is_error, "expected an error result");
    message.payload[0].as_str().expect("error text").to_string()
}

#[test]
fn calc_add_replies_with_sum() {
    let mut harness = Harness::new();
    harness.context.bind("Calc", Calc::named("calc"), true);

    let bound = harness.drain();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].kind, MessageKind::SetBinding);
    assert_eq!(bound[0].target, binding("calc"));

    let id = harness.call(binding("calc"), "add", vec![2.into(), 3.into()]);
    let result = harness.result_for(id);
    assert!(!result.is_error);
    assert_eq!(result.payload, vec![TypedValue::Int(5)]);
}

#[test]
fn names_are_lowered_and_matched_case_insensitively() {
    let mut harness = Harness::new();
    harness.context.bind("Calc", Calc::named("calc"), false);
    harness.drain();

    let id = harness.call(binding("CALC"), "ADD", vec![1.into(), 1.into()]);
    assert_eq!(harness.result_for(id).payload, vec![TypedValue::Int(2)]);

    let mut exact = Harness::with_options(ContextOptions {
        lowercase_binding_names: false,
        ..ContextOptions::default()
    });
    exact.context.bind("Calc", Calc::named("calc"), false);
    let id = exact.call(binding("calc"), "add", vec![1.into(), 1.into()]);
    let result = exact.result_for(id);
    assert_eq!(
        error_text(&result),
        BridgeError::UnknownBinding("calc".into()).to_string()
    );
}

#[test]
fn dispatch_errors_become_error_results() {
    let mut harness = Harness::new();
    harness.context.bind("calc", Calc::named("calc"), false);
    harness.drain();

    let id = harness.call(binding("nope"), "add", Vec::new());
    assert_eq!(
        error_text(&harness.result_for(id)),
        "no object is bound as 'nope'"
    );

    let id = harness.call(binding("calc"), "sub", Vec::new());
    assert_eq!(
        error_text(&harness.result_for(id)),
        "'calc' has no method 'sub'"
    );

    let id = harness.call(binding("calc"), "add", vec![1.into()]);
    assert_eq!(
        error_text(&harness.result_for(id)),
        "'add' expects 2 argument(s), got 1"
    );

    let id = harness.call(binding("calc"), "add", vec![1.into(), "two".into()]);
    assert!(error_text(&harness.result_for(id)).starts_with("type mismatch"));
}

#[test]
fn last_bind_wins() {
    let mut harness = Harness::new();
    harness.context.bind("calc", Calc::named("first"), false);
    harness.context.bind("calc", Calc::named("second"), false);
    assert_eq!(harness.context.binding_count(), 1);

    let id = harness.call(binding("calc"), "name", Vec::new());
    assert_eq!(
        harness.result_for(id).payload,
        vec![TypedValue::String("second".into())]
    );
}

#[test]
fn unbind_of_a_replaced_target_keeps_the_new_binding() {
    let mut harness = Harness::new();
    let first = Calc::named("first");
    let second = Calc::named("second");
    harness.context.bind("x", first.clone(), false);
    harness.context.bind("x", second.clone(), false);
    harness.drain();

    assert!(!harness.context.unbind("x", Some(&*first), false));
    assert!(!harness.context.unbind("x", Some(&*second), true));
    assert_eq!(harness.context.binding_count(), 1);
    assert!(harness.drain().is_empty());

    assert!(harness.context.unbind("x", Some(&*second), false));
    let removal = harness.drain();
    assert_eq!(removal.len(), 1);
    assert_eq!(removal[0].kind, MessageKind::SetBinding);
    assert_eq!(removal[0].payload, vec![TypedValue::Null]);
}

#[test]
fn weak_binding_fails_once_the_object_is_dropped() {
    let mut harness = Harness::new();
    let calc = Calc::named("weak");
    harness.context.bind_weak("calc", Arc::<Calc>::downgrade(&calc), false);

    let id = harness.call(binding("calc"), "name", Vec::new());
    assert!(!harness.result_for(id).is_error);

    drop(calc);
    let id = harness.call(binding("calc"), "name", Vec::new());
    assert!(harness.result_for(id).is_error);
}

#[test]
fn script_functions_post_callback_invokes() {
    let mut harness = Harness::new();
    let calc = Calc::named("calc");
    harness.context.bind("calc", calc.clone(), false);
    harness.drain();

    let listener = CallbackId::new();
    let id = harness.call(
        binding("calc"),
        "subscribe",
        vec![TypedValue::String(listener.to_string())],
    );
    assert!(harness.result_for(id).payload.is_empty());

    let function = calc.listeners.lock().unwrap()[0].clone();
    assert_eq!(function.id(), listener);
    function.call(vec![7.into()]);
    function.call_error(vec!["bad".into()]);

    let invokes = harness.drain();
    assert_eq!(invokes.len(), 2);
    assert!(invokes
        .iter()
        .all(|message| message.kind == MessageKind::CallbackInvoke
            && message.target == MessageTarget::Callback(listener)));
    assert_eq!(invokes[0].payload, vec![TypedValue::Int(7)]);
    assert!(!invokes[0].is_error);
    assert!(invokes[1].is_error);
}

#[test]
fn functions_nested_in_structs_are_bound_to_the_context() {
    let mut harness = Harness::new();
    let calc = Calc::named("calc");
    harness.context.bind("calc", calc.clone(), false);
    harness.drain();

    let listener = CallbackId::new();
    let mut request = std::collections::BTreeMap::new();
    request.insert("topic".to_string(), TypedValue::String("ticks".into()));
    request.insert(
        "listener".to_string(),
        TypedValue::String(listener.to_string()),
    );
    let id = harness.call(binding("calc"), "watch", vec![TypedValue::Map(request)]);
    assert!(!harness.result_for(id).is_error);
    assert_eq!(*calc.topics.lock().unwrap(), ["ticks"]);

    let function = calc.listeners.lock().unwrap()[0].clone();
    assert!(!function.is_detached());
    function.call(Vec::new());
    assert_eq!(harness.drain()[0].target, MessageTarget::Callback(listener));
}

#[test]
fn stale_callbacks_are_silent() {
    let mut harness = Harness::new();
    let calc = Calc::named("calc");
    harness.context.bind("calc", calc.clone(), false);
    harness.call(
        binding("calc"),
        "subscribe",
        vec![TypedValue::String(CallbackId::new().to_string())],
    );
    harness.call(binding("calc"), "hold", Vec::new());
    harness.drain();

    harness.context.close();
    harness.context.close();
    let function = calc.listeners.lock().unwrap()[0].clone();
    function.call(vec![1.into()]);
    calc.take_held().success();
    assert!(harness.drain().is_empty());

    let Harness { context, .. } = harness;
    drop(context);
    assert!(function.is_detached());
    function.call(vec![2.into()]);
}

#[test]
fn async_methods_reply_when_finished() {
    let mut harness = Harness::new();
    let calc = Calc::named("calc");
    harness.context.bind("calc", calc.clone(), false);
    harness.drain();

    let id = harness.call(binding("calc"), "hold", Vec::new());
    assert!(harness.drain().is_empty());
    assert_eq!(harness.context.in_flight_responses(), 1);

    calc.take_held().success_with(&9i64);
    let result = harness.result_for(id);
    assert_eq!(result.payload, vec![TypedValue::Int(9)]);
    assert_eq!(harness.context.in_flight_responses(), 0);

    let id = harness.call(binding("calc"), "hold", Vec::new());
    calc.take_held().failure("no luck");
    assert_eq!(error_text(&harness.result_for(id)), "no luck");
}

#[test]
fn async_response_settles_exactly_once() {
    let mut harness = Harness::new();
    let calc = Calc::named("calc");
    harness.context.bind("calc", calc.clone(), false);
    harness.drain();

    let id = harness.call(binding("calc"), "hold", Vec::new());
    let response = calc.take_held();
    response.success();
    let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| response.failure("x")));
    assert_eq!(second.is_err(), cfg!(debug_assertions));

    let results = harness.results_for(id);
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_error);
    assert_eq!(harness.context.in_flight_responses(), 0);
}

#[test]
fn failure_after_finishing_does_not_reply_twice() {
    let mut harness = Harness::new();
    harness.context.bind("eager", Arc::new(Eager), false);
    harness.drain();

    let id = harness.call(binding("eager"), "answer", Vec::new());
    let results = harness.results_for(id);
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_error);
    assert_eq!(results[0].payload, vec![TypedValue::Int(1)]);
}

#[test]
fn rebinding_does_not_accumulate_object_entries() {
    let mut harness = Harness::new();
    let kept = Calc::named("kept");
    harness.context.bind("kept", kept.clone(), false);
    for label in ["a", "b", "c", "d"] {
        harness.context.bind("calc", Calc::named(label), false);
    }
    assert_eq!(harness.context.exposed_object_count(), 2);

    harness.context.bind("alias", kept.clone(), false);
    assert_eq!(harness.context.exposed_object_count(), 2);
    assert!(harness.context.unbind("alias", None, false));
    assert_eq!(harness.context.exposed_object_count(), 2);
    let id = harness.call(binding("kept"), "name", Vec::new());
    assert!(!harness.result_for(id).is_error);

    assert!(harness.context.unbind("calc", None, false));
    assert_eq!(harness.context.exposed_object_count(), 1);
}

#[test]
fn rebind_fails_in_flight_calls_and_drops_late_finishes() {
    let mut harness = Harness::new();
    let old = Calc::named("old");
    harness.context.bind("calc", old.clone(), false);
    let id = harness.call(binding("calc"), "hold", Vec::new());
    harness.drain();

    harness.context.bind("calc", Calc::named("new"), false);
    let messages = harness.drain();
    let failure = messages
        .iter()
        .find(|message| message.target == MessageTarget::Callback(id))
        .expect("in-flight call is failed");
    assert_eq!(
        error_text(failure),
        BridgeError::BindingReplaced("calc".into()).to_string()
    );

    old.take_held().success_with(&1i64);
    assert!(harness.drain().is_empty());
}

#[test]
fn navigation_keeps_only_permanent_bindings() {
    let mut harness = Harness::new();
    let calc = Calc::named("calc");
    harness.context.bind("Zeta", Calc::named("zeta"), true);
    harness.context.bind("calc", calc.clone(), true);
    harness.context.bind("temp", Calc::named("temp"), false);
    harness.call(binding("temp"), "hold", Vec::new());
    harness.drain();

    harness.context.on_navigation();
    assert_eq!(harness.context.binding_count(), 2);
    assert_eq!(harness.context.in_flight_responses(), 0);

    let manifest = harness.context.snapshot_permanent_bindings();
    assert_eq!(manifest.names(), ["calc", "zeta"]);
    assert!(manifest.bindings[0].methods.contains(&"add".to_string()));

    let id = harness.call(binding("temp"), "name", Vec::new());
    assert!(harness.result_for(id).is_error);

    harness.context.on_page_loaded();
    let replayed = harness.drain();
    assert_eq!(replayed.len(), 2);
    assert!(replayed
        .iter()
        .all(|message| message.kind == MessageKind::SetBinding));
}

#[test]
fn exposed_objects_keep_identity_until_released() {
    let mut harness = Harness::new();
    let factory = Arc::new(Factory {
        child: Calc::named("child"),
    });
    harness.context.bind("factory", factory, false);
    harness.drain();

    let first = harness.call(binding("factory"), "child", Vec::new());
    let first = harness.result_for(first).payload[0].clone();
    let second = harness.call(binding("factory"), "child", Vec::new());
    let second = harness.result_for(second).payload[0].clone();
    assert_eq!(first, second);

    let TypedValue::Object(handle) = first else {
        panic!("expected an object handle, got {first:?}");
    };
    assert_eq!(handle.type_tag, "Calc");

    let id = harness.call(MessageTarget::Object(handle.id), "name", Vec::new());
    assert_eq!(
        harness.result_for(id).payload,
        vec![TypedValue::String("child".into())]
    );

    harness.send(&BridgeMessage::release_object(handle.id));
    let id = harness.call(MessageTarget::Object(handle.id), "name", Vec::new());
    assert_eq!(
        error_text(&harness.result_for(id)),
        BridgeError::UnknownObject(handle.id).to_string()
    );
}

#[test]
fn host_functions_route_until_dropped() {
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let function: Arc<dyn HostCallback> = Arc::new(move |args: Vec<TypedValue>, is_error: bool| {
        sink.lock().unwrap().push((args, is_error));
    });
    let id = harness.context.expose_function(&function);

    harness.send(&BridgeMessage::callback_invoke(id, vec!["ping".into()], false));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(vec![TypedValue::String("ping".into())], false)]
    );

    drop(function);
    harness.send(&BridgeMessage::callback_invoke(id, vec!["late".into()], false));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn messages_from_other_threads_wait_for_the_owner() {
    let scheduler = Arc::new(MessagePumpScheduler::new());
    let mut harness = Harness::with_options(ContextOptions {
        scheduler: Some(Arc::clone(&scheduler)),
        ..ContextOptions::default()
    });
    harness.context.bind("calc", Calc::named("calc"), false);
    harness.drain();

    let reply_to = CallbackId::new();
    let bytes = BridgeMessage::execute(
        binding("calc"),
        "add",
        vec![20.into(), 22.into()],
        Some(reply_to),
    )
    .to_bytes()
    .expect("encode message");
    let context = Arc::clone(&harness.context);
    std::thread::spawn(move || context.on_message_received(&bytes))
        .join()
        .expect("sender thread");

    assert_eq!(harness.context.pending_inbound(), 1);
    assert_eq!(scheduler.state(), PumpState::DuePump);
    assert!(harness.drain().is_empty());

    assert_eq!(harness.context.process_inbound(), 1);
    assert_eq!(harness.result_for(reply_to).payload, vec![TypedValue::Int(42)]);
}

#[test]
fn large_sums_wrap_instead_of_panicking() {
    let mut harness = Harness::new();
    harness.context.bind("calc", Calc::named("calc"), false);
    harness.drain();

    let big = 1i64 << 62;
    let id = harness.call(binding("calc"), "add", vec![big.into(), big.into()]);
    assert_eq!(harness.result_for(id).payload, vec![TypedValue::Int(i64::MIN)]);
}

#[test]
fn malformed_messages_are_dropped() {
    let mut harness = Harness::new();
    harness.context.on_message_received(b"{\"kind\":\"Nope\"}");
    harness.context.on_message_received(b"\xff\xfe");
    assert!(harness.drain().is_empty());
    assert!(!harness.context.is_closed());
}
