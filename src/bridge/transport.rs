use std::sync::{Arc, Weak};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::TransportError;
use crate::pump::MessagePumpScheduler;

use super::context::ScriptingContext;

/// Posts encoded bridge messages to the other side of the boundary.
pub trait Transport: Send + Sync {
    fn post_message(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// In-process transport over an unbounded tokio channel.
///
/// When a scheduler is attached every post also requests an immediate pump,
/// mirroring an engine that wakes its loop whenever a message is queued.
pub struct ChannelTransport {
    sender: UnboundedSender<Vec<u8>>,
    scheduler: Option<Arc<MessagePumpScheduler>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, UnboundedReceiver<Vec<u8>>) {
        let (sender, receiver) = unbounded_channel();
        (
            Self {
                sender,
                scheduler: None,
            },
            receiver,
        )
    }

    pub fn with_scheduler(mut self, scheduler: Arc<MessagePumpScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

impl Transport for ChannelTransport {
    fn post_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.sender
            .send(bytes)
            .map_err(|_| TransportError::Closed)?;
        if let Some(scheduler) = &self.scheduler {
            scheduler.request_pump(0);
        }
        Ok(())
    }
}

/// Page-to-host direction: hands posted bytes to a scripting context as if
/// they had crossed a process boundary.
pub struct ContextTransport {
    context: Weak<ScriptingContext>,
}

impl ContextTransport {
    pub fn new(context: &Arc<ScriptingContext>) -> Self {
        Self {
            context: Arc::downgrade(context),
        }
    }
}

impl Transport for ContextTransport {
    fn post_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let context = self.context.upgrade().ok_or(TransportError::Closed)?;
        if context.is_closed() {
            return Err(TransportError::Closed);
        }
        context.on_message_received(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::PumpState;

    #[test]
    fn delivers_in_order_and_requests_a_pump() {
        let scheduler = Arc::new(MessagePumpScheduler::new());
        let (transport, mut receiver) = ChannelTransport::new();
        let transport = transport.with_scheduler(Arc::clone(&scheduler));

        transport.post_message(b"one".to_vec()).unwrap();
        transport.post_message(b"two".to_vec()).unwrap();
        assert_eq!(receiver.try_recv().unwrap(), b"one");
        assert_eq!(receiver.try_recv().unwrap(), b"two");
        assert_eq!(scheduler.state(), PumpState::DuePump);
    }

    #[test]
    fn closed_receiver_is_reported() {
        let (transport, receiver) = ChannelTransport::new();
        drop(receiver);
        assert_eq!(
            transport.post_message(Vec::new()),
            Err(TransportError::Closed)
        );
    }
}
