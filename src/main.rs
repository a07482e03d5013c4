use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pagebridge::js::ScriptPage;
use pagebridge::{
    bridge_object, BridgeConfig, BrowserService, ChannelTransport, ContextTransport,
    ScriptResponse,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const FRAME: Duration = Duration::from_millis(16);
const MAX_FRAMES: usize = 600;

const DEMO_SCRIPT: &str = r#"
bridge.calc.add(2, 3).then((sum) => console.log('calc.add(2, 3) =', sum));
bridge.calc.add('two', 3).catch((err) => console.warn('rejected:', err.message));
bridge.calc.delayed_add(40, 2).then((sum) => {
    console.log('calc.delayed_add(40, 2) =', sum);
    globalThis.demoDone = true;
});
"#;

/// Demo object: `delayed_add` answers a few frames later.
#[derive(Default)]
struct Calculator {
    deferred: Mutex<Vec<(u32, i64, ScriptResponse)>>,
}

impl Calculator {
    fn add(&self, a: i64, b: i64) -> i64 {
        a.wrapping_add(b)
    }

    fn multiply(&self, a: f64, b: f64) -> f64 {
        a * b
    }

    fn delayed_add(&self, a: i64, b: i64, response: ScriptResponse) {
        if let Ok(mut deferred) = self.deferred.lock() {
            deferred.push((10, a.wrapping_add(b), response));
        }
    }

    fn finish_due(&self) {
        let Ok(mut deferred) = self.deferred.lock() else {
            return;
        };
        deferred.retain_mut(|(frames, value, response)| {
            *frames = frames.saturating_sub(1);
            if *frames == 0 {
                response.success_with(&*value);
                return false;
            }
            true
        });
    }
}

bridge_object! {
    impl Calculator as "Calc" {
        fn add(a: i64, b: i64) -> i64;
        fn multiply(a: f64, b: f64) -> f64;
        async fn delayed_add(a: i64, b: i64);
    }
}

fn main() {
    let script_path = std::env::args().nth(1).map(PathBuf::from);

    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let config = BridgeConfig::load(BridgeConfig::default_path()).unwrap_or_else(|err| {
        eprintln!("Failed to load bridge configuration: {err}. Using defaults.");
        BridgeConfig::default()
    });

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = rt.block_on(run(config, script_path)) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(config: BridgeConfig, script_path: Option<PathBuf>) -> Result<()> {
    let service = BrowserService::new(config);
    let (transport, inbox) = ChannelTransport::new();
    let transport = transport.with_scheduler(Arc::clone(service.scheduler()));
    let context = service.create_context(Arc::new(transport));

    let calculator = Arc::new(Calculator::default());
    context.bind("Calc", calculator.clone(), true);

    let page = ScriptPage::new(
        inbox,
        Arc::new(ContextTransport::new(&context)),
        &context.snapshot_permanent_bindings(),
    )?;
    context.on_page_loaded();

    let source = match &script_path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => DEMO_SCRIPT.to_string(),
    };
    let filename = script_path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "demo.js".to_string());
    page.eval(&source, &filename)?;

    let mut frames = tokio::time::interval(FRAME);
    let mut last = Instant::now();
    let mut pumps = 0;
    for _ in 0..MAX_FRAMES {
        frames.tick().await;
        let now = Instant::now();
        let delta = now - last;
        last = now;

        calculator.finish_due();
        if service.tick(delta, &page) {
            pumps += 1;
        }
        if page.eval_with::<bool>("globalThis.demoDone === true", "probe.js")? {
            break;
        }
    }

    info!(pumps, pending = page.pending_calls()?, "demo finished");
    context.close();
    Ok(())
}
