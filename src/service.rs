use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, trace};

use crate::bridge::{ContextOptions, ScriptingContext, Transport};
use crate::config::BridgeConfig;
use crate::pump::{EnginePump, ForcePolicy, MessagePumpScheduler};

/// Owns the message-pump scheduler and tracks live page sessions.
///
/// Construct one per embedded engine on the thread that will call
/// [`tick`](Self::tick) once per host frame. That thread owns every session's
/// bound objects, wherever the session itself was created.
pub struct BrowserService {
    config: BridgeConfig,
    owner_thread: ThreadId,
    scheduler: Arc<MessagePumpScheduler>,
    policy: ForcePolicy,
    contexts: Mutex<Vec<Weak<ScriptingContext>>>,
}

impl BrowserService {
    pub fn new(config: BridgeConfig) -> Self {
        let config = BridgeConfig {
            scheduler: config.scheduler.clamped(),
            ..config
        };
        let policy = ForcePolicy::new(&config.scheduler);
        Self {
            config,
            owner_thread: thread::current().id(),
            scheduler: Arc::new(MessagePumpScheduler::new()),
            policy,
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<MessagePumpScheduler> {
        &self.scheduler
    }

    /// Starts a page session. May be called from any thread; messages are
    /// still dispatched on the ticking thread.
    pub fn create_context(&self, transport: Arc<dyn Transport>) -> Arc<ScriptingContext> {
        let options = ContextOptions {
            scheduler: Some(Arc::clone(&self.scheduler)),
            owner_thread: Some(self.owner_thread),
            ..ContextOptions::from(&self.config)
        };
        let context = ScriptingContext::new(transport, options);
        let mut contexts = self.lock_contexts();
        contexts.retain(|weak| weak.strong_count() > 0);
        contexts.push(Arc::downgrade(&context));
        debug!(target: "bridge", sessions = contexts.len(), "page session started");
        context
    }

    /// Live, open sessions.
    pub fn active_sessions(&self) -> usize {
        self.live_contexts().len()
    }

    /// Engine hook: "run my loop after `delay_ms`".
    pub fn request_pump(&self, delay_ms: i64) {
        self.scheduler.request_pump(delay_ms);
    }

    /// Per-frame driver. Runs the engine pump when requested or forced, then
    /// drains messages queued for each session. Returns whether it pumped.
    pub fn tick(&self, delta: Duration, engine: &dyn EnginePump) -> bool {
        let contexts = self.live_contexts();
        let force = self.policy.advance(delta, contexts.len());
        let pumped = self.scheduler.tick(delta, force, engine);
        if !pumped {
            return false;
        }

        self.policy.on_pump();
        let handled: usize = contexts
            .iter()
            .map(|context| context.process_inbound())
            .sum();
        trace!(target: "pump", force, handled, "pumped");
        true
    }

    /// Copies strong refs out under the lock so callers never hold it while
    /// calling into a context.
    fn live_contexts(&self) -> Vec<Arc<ScriptingContext>> {
        let mut contexts = self.lock_contexts();
        contexts.retain(|weak| weak.strong_count() > 0);
        contexts
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|context| !context.is_closed())
            .collect()
    }

    fn lock_contexts(&self) -> MutexGuard<'_, Vec<Weak<ScriptingContext>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BrowserService {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}
