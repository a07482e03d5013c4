use anyhow::{Context as AnyhowContext, Result};
use rquickjs::{Context, Ctx, Error as JsError, Function, Runtime, Value};

const MAX_JOBS_PER_DRAIN: usize = 1000;

/// JavaScript runtime backed by QuickJS.
///
/// Owns the QuickJS runtime and context, evaluates scripts and drains the
/// promise job queue. `console.*` is forwarded to `tracing`.
pub struct QuickJsEngine {
    runtime: Runtime,
    context: Context,
}

impl QuickJsEngine {
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        let engine = Self { runtime, context };
        engine.init_console()?;
        Ok(engine)
    }

    /// Evaluate a script and discard the result.
    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.eval_with::<()>(source, filename)
    }

    /// Evaluate a script, convert the result into `V`, then run the promise
    /// jobs it queued.
    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let script = Self::with_source_url(source, filename);
        let eval_result = self.context.with(|ctx| ctx.eval::<V, _>(script.clone()));

        let value = match eval_result {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => {
                let message = self
                    .context
                    .with(|ctx| capture_exception_message(&ctx))
                    .unwrap_or_else(|| "QuickJS exception".to_string());
                Err(anyhow::anyhow!(message))
            }
            Err(err) => Err(anyhow::Error::from(err)),
        }
        .with_context(|| format!("failed to evaluate {filename}"))?;

        self.drain_jobs()?;
        Ok(value)
    }

    /// Runs queued promise continuations. Returns whether any ran.
    ///
    /// A job that throws is logged and ends the drain; the rest stay queued
    /// for the next call.
    pub fn drain_jobs(&self) -> Result<bool> {
        let mut job_count = 0;

        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {
                    job_count += 1;
                    if job_count >= MAX_JOBS_PER_DRAIN {
                        tracing::warn!(
                            target: "quickjs",
                            "stopped processing jobs after {} iterations",
                            MAX_JOBS_PER_DRAIN
                        );
                        break;
                    }
                }
                Ok(false) => break,
                Err(job_exception) => {
                    tracing::error!(
                        target: "quickjs",
                        "job execution error: {:?}",
                        job_exception
                    );
                    break;
                }
            }
        }

        if job_count > 0 {
            tracing::trace!(target: "quickjs", jobs = job_count, "drained pending jobs");
        }
        Ok(job_count > 0)
    }

    /// Access to the underlying QuickJS context for installing bindings.
    pub fn with_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.context.with(f).map_err(anyhow::Error::from)
    }

    fn init_console(&self) -> Result<()> {
        self.context
            .with(|ctx| {
                let global = ctx.globals();
                let log_fn =
                    Function::new(ctx.clone(), log_from_js)?.with_name("__pagebridge_log")?;
                global.set("__pagebridge_log", log_fn)?;
                ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())
            })
            .map_err(anyhow::Error::from)
    }

    fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
        let mut script = String::with_capacity(source.len() + filename.len() + 32);
        script.push_str(source);
        if !source.ends_with('\n') {
            script.push('\n');
        }
        script.push_str("//# sourceURL=");
        script.push_str(filename);
        script.push('\n');
        script.into_bytes()
    }
}

fn log_from_js(level: String, message: String) -> rquickjs::Result<()> {
    match level.as_str() {
        "error" => tracing::error!(target: "quickjs", message = %message),
        "warn" => tracing::warn!(target: "quickjs", message = %message),
        "debug" => tracing::debug!(target: "quickjs", message = %message),
        _ => tracing::info!(target: "quickjs", message = %message),
    }
    Ok(())
}

pub(crate) fn capture_exception_message(ctx: &Ctx<'_>) -> Option<String> {
    let exception: Value = ctx.catch();

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            if let Ok(stack) = obj.get::<_, String>("stack") {
                return Some(format!("Error: {}\nStack: {}", message, stack));
            }
            return Some(format!("Error: {}", message));
        }
    }

    Some(format!("{:?}", exception))
}

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const logAt = (level) => (...args) => {
        try {
            global.__pagebridge_log(level, args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    if (typeof global.console !== 'object' || global.console === null) {
        global.console = {};
    }

    global.console.log = logAt('info');
    global.console.info = logAt('info');
    global.console.warn = logAt('warn');
    global.console.error = logAt('error');
    global.console.debug = logAt('debug');
})();
"#;
