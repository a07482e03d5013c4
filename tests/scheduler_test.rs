use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use pagebridge::{
    bridge_object, BridgeConfig, BridgeMessage, BrowserService, CallbackId, ChannelTransport,
    MessageKind, MessagePumpScheduler, MessageTarget, PumpState, SchedulerConfig, TypedValue,
};

const MS: Duration = Duration::from_millis(1);

struct Echo;

impl Echo {
    fn echo(&self, text: String) -> String {
        text
    }
}

bridge_object! {
    impl Echo as "Echo" {
        fn echo(text: String) -> String;
    }
}

fn service(min_hz: u32, max_forced_hz: u32, force: bool) -> BrowserService {
    BrowserService::new(BridgeConfig {
        scheduler: SchedulerConfig {
            min_message_loop_hz: min_hz,
            max_forced_message_loop_hz: max_forced_hz,
            force_message_loop: force,
        },
        ..BridgeConfig::default()
    })
}

fn count_pumps(service: &BrowserService, delta: Duration, ticks: usize) -> usize {
    let pumps = Cell::new(0);
    let pump = || pumps.set(pumps.get() + 1);
    for _ in 0..ticks {
        service.tick(delta, &pump);
    }
    pumps.get()
}

#[test]
fn minimum_rate_holds_for_any_frame_length() {
    let fine = service(10, 15, false);
    assert_eq!(count_pumps(&fine, MS, 1000), 10);

    let coarse = service(10, 15, false);
    assert_eq!(count_pumps(&coarse, 10 * MS, 100), 10);
}

#[test]
fn later_request_replaces_the_pending_one() {
    let scheduler = MessagePumpScheduler::new();
    let pumps = Cell::new(0);
    let pump = || pumps.set(pumps.get() + 1);

    scheduler.request_pump(20);
    for _ in 0..9 {
        assert!(!scheduler.tick(MS, false, &pump));
    }
    scheduler.request_pump(2);
    assert!(!scheduler.tick(MS, false, &pump));
    assert!(scheduler.tick(MS, false, &pump));

    for _ in 0..30 {
        scheduler.tick(MS, false, &pump);
    }
    assert_eq!(pumps.get(), 1);
    assert_eq!(scheduler.state(), PumpState::Idle);
}

#[test]
fn request_made_during_a_pump_survives() {
    let scheduler = Arc::new(MessagePumpScheduler::new());
    let engine = {
        let scheduler = Arc::clone(&scheduler);
        move || scheduler.request_pump(5)
    };

    scheduler.request_pump(0);
    assert!(scheduler.tick(MS, false, &engine));
    assert_eq!(scheduler.state(), PumpState::Counting(5 * MS));
}

#[test]
fn forced_loop_runs_at_the_maximum_forced_rate() {
    let service = service(1, 15, true);
    assert_eq!(count_pumps(&service, MS, 1000), 14);
}

#[test]
fn closing_the_last_session_stops_forcing() {
    let service = service(1, 15, false);
    let (transport, _outbox) = ChannelTransport::new();
    let context = service.create_context(Arc::new(transport));
    assert_eq!(count_pumps(&service, MS, 1000), 14);

    context.close();
    assert_eq!(service.active_sessions(), 0);
    assert_eq!(count_pumps(&service, MS, 1000), 1);
}

#[test]
fn pump_delivers_messages_posted_from_other_threads() {
    let service = service(1, 15, false);
    let (transport, mut outbox) = ChannelTransport::new();
    let context = service.create_context(Arc::new(transport));
    context.bind("echo", Arc::new(Echo), false);
    while outbox.try_recv().is_ok() {}

    let reply_to = CallbackId::new();
    let bytes = BridgeMessage::execute(
        MessageTarget::Binding("echo".into()),
        "echo",
        vec!["hi".into()],
        Some(reply_to),
    )
    .to_bytes()
    .expect("encode message");
    let sender = Arc::clone(&context);
    std::thread::spawn(move || sender.on_message_received(&bytes))
        .join()
        .expect("sender thread");

    assert_eq!(service.scheduler().state(), PumpState::DuePump);
    assert!(outbox.try_recv().is_err());

    assert!(service.tick(MS, &|| {}));
    assert_eq!(context.pending_inbound(), 0);

    let reply = BridgeMessage::from_bytes(&outbox.try_recv().expect("a reply"))
        .expect("decode reply");
    assert_eq!(reply.kind, MessageKind::CallbackResult);
    assert_eq!(reply.target, MessageTarget::Callback(reply_to));
    assert_eq!(reply.payload, vec![TypedValue::String("hi".into())]);
}

#[test]
fn sessions_created_off_thread_dispatch_on_the_ticking_thread() {
    let service = service(1, 15, false);
    let (transport, mut outbox) = ChannelTransport::new();
    let context = std::thread::scope(|scope| {
        scope
            .spawn(|| {
                let context = service.create_context(Arc::new(transport));
                context.bind("echo", Arc::new(Echo), false);
                context
            })
            .join()
            .expect("session thread")
    });
    while outbox.try_recv().is_ok() {}

    let direct = CallbackId::new();
    context.on_message_received(
        &BridgeMessage::execute(
            MessageTarget::Binding("echo".into()),
            "echo",
            vec!["hi".into()],
            Some(direct),
        )
        .to_bytes()
        .expect("encode message"),
    );

    let queued = CallbackId::new();
    let bytes = BridgeMessage::execute(
        MessageTarget::Binding("echo".into()),
        "echo",
        vec!["there".into()],
        Some(queued),
    )
    .to_bytes()
    .expect("encode message");
    let sender = Arc::clone(&context);
    std::thread::spawn(move || sender.on_message_received(&bytes))
        .join()
        .expect("sender thread");
    assert_eq!(context.pending_inbound(), 1);

    assert!(service.tick(MS, &|| {}));
    assert_eq!(context.pending_inbound(), 0);

    let replies: Vec<BridgeMessage> = std::iter::from_fn(|| outbox.try_recv().ok())
        .map(|bytes| BridgeMessage::from_bytes(&bytes).expect("decode reply"))
        .collect();
    let targets: Vec<_> = replies.iter().map(|reply| reply.target.clone()).collect();
    assert_eq!(
        targets,
        [MessageTarget::Callback(direct), MessageTarget::Callback(queued)]
    );
    assert_eq!(replies[1].payload, vec![TypedValue::String("there".into())]);
}
