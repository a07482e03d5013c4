//! Script side of the bridge, running in QuickJS.
//!
//! A [`ScriptPage`] installs two globals:
//!
//! - `bridge`: one object per binding, each exposing the binding's methods.
//!   Every call posts an `ExecuteMethod` and returns a promise settled by the
//!   matching `CallbackResult`.
//! - `__bridge`: plumbing (`receive`, `install`, `release(obj)`,
//!   `invokeHost(id, ...args)`, `pendingCount()`).
//!
//! Functions passed as arguments travel as callback ids; objects returned by
//! the host come back as proxies whose method calls target the object handle.

use std::cell::RefCell;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use rquickjs::{Function, Object};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;
use uuid::Uuid;

use crate::bridge::{Manifest, Transport};
use crate::pump::EnginePump;

use super::runtime::QuickJsEngine;

pub struct ScriptPage {
    engine: QuickJsEngine,
    inbox: RefCell<UnboundedReceiver<Vec<u8>>>,
}

impl ScriptPage {
    /// Creates the page and installs `manifest` before any page script runs.
    ///
    /// `inbox` receives host-to-page messages; page-to-host messages go out
    /// through `outbound`.
    pub fn new(
        inbox: UnboundedReceiver<Vec<u8>>,
        outbound: Arc<dyn Transport>,
        manifest: &Manifest,
    ) -> Result<Self> {
        let engine = QuickJsEngine::new()?;
        install_bridge(&engine, outbound)?;

        let manifest_json =
            serde_json::to_string(manifest).context("failed to encode binding manifest")?;
        engine
            .with_context(|ctx| {
                let api: Object = ctx.globals().get("__bridge")?;
                let install: Function = api.get("install")?;
                install.call::<_, ()>((manifest_json,))
            })
            .context("failed to install binding manifest")?;

        Ok(Self {
            engine,
            inbox: RefCell::new(inbox),
        })
    }

    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.engine.eval(source, filename)
    }

    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        self.engine.eval_with(source, filename)
    }

    /// Feeds every queued host message to the page and runs the promise jobs
    /// they trigger. Returns how many messages were delivered.
    pub fn deliver_pending(&self) -> Result<usize> {
        let mut delivered = 0;
        loop {
            let next = self.inbox.borrow_mut().try_recv();
            let Ok(bytes) = next else {
                break;
            };
            let json = String::from_utf8(bytes).context("bridge message is not UTF-8")?;
            self.engine
                .with_context(|ctx| {
                    let api: Object = ctx.globals().get("__bridge")?;
                    let receive: Function = api.get("receive")?;
                    receive.call::<_, ()>((json,))
                })
                .context("page failed to handle bridge message")?;
            delivered += 1;
        }
        self.engine.drain_jobs()?;
        Ok(delivered)
    }

    /// Calls still waiting for a `CallbackResult`.
    pub fn pending_calls(&self) -> Result<usize> {
        self.engine
            .eval_with::<u32>("__bridge.pendingCount()", "pending.js")
            .map(|count| count as usize)
    }

    pub fn engine(&self) -> &QuickJsEngine {
        &self.engine
    }
}

impl EnginePump for ScriptPage {
    fn run_pump_once(&self) {
        if let Err(err) = self.deliver_pending() {
            warn!(target: "quickjs", error = %format!("{err:#}"), "page pump failed");
        }
    }
}

fn install_bridge(engine: &QuickJsEngine, outbound: Arc<dyn Transport>) -> Result<()> {
    engine.with_context(|ctx| {
        let global = ctx.globals();

        let post = Function::new(ctx.clone(), move |json: String| -> rquickjs::Result<()> {
            if let Err(err) = outbound.post_message(json.into_bytes()) {
                warn!(target: "quickjs", %err, "page could not post bridge message");
            }
            Ok(())
        })?
        .with_name("__bridge_post")?;
        global.set("__bridge_post", post)?;

        let new_id = Function::new(ctx.clone(), || -> rquickjs::Result<String> {
            Ok(Uuid::new_v4().to_string())
        })?
        .with_name("__bridge_new_id")?;
        global.set("__bridge_new_id", new_id)?;

        match ctx.eval::<(), _>(BRIDGE_BOOTSTRAP.as_bytes()) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let rquickjs::Error::Exception = err {
                    let message = super::runtime::capture_exception_message(&ctx);
                    tracing::error!(target: "quickjs", exception = ?message, "bridge bootstrap failed");
                }
                Err(err)
            }
        }
    })
}

const BRIDGE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const HANDLE = Symbol('bridge.handle');
    const pending = new Map();
    const functions = new Map();
    const functionIds = new WeakMap();
    const proxies = new Map();
    const bridge = {};

    const post = (message) => global.__bridge_post(JSON.stringify(message));

    const registerFunction = (fn) => {
        const known = functionIds.get(fn);
        if (known) {
            return known;
        }
        const id = global.__bridge_new_id();
        functions.set(id, fn);
        functionIds.set(fn, id);
        return id;
    };

    const encode = (value) => {
        if (value === null || value === undefined) {
            return { t: 'Null' };
        }
        switch (typeof value) {
            case 'boolean':
                return { t: 'Bool', v: value };
            case 'number':
                if (!Number.isFinite(value)) {
                    return { t: 'Null' };
                }
                return Number.isSafeInteger(value) ? { t: 'Int', v: value } : { t: 'Float', v: value };
            case 'bigint':
                return { t: 'Int', v: Number(value) };
            case 'string':
                return { t: 'String', v: value };
            case 'function':
                return { t: 'String', v: registerFunction(value) };
        }
        const handle = value[HANDLE];
        if (handle) {
            return { t: 'Object', v: handle };
        }
        if (Array.isArray(value)) {
            return { t: 'Array', v: value.map(encode) };
        }
        const entries = {};
        for (const key of Object.keys(value)) {
            entries[key] = encode(value[key]);
        }
        return { t: 'Map', v: entries };
    };

    const decode = (value) => {
        if (!value) {
            return null;
        }
        switch (value.t) {
            case 'Bool':
            case 'Int':
            case 'Float':
            case 'String':
                return value.v;
            case 'Object':
                return proxyFor(value.v);
            case 'Struct': {
                const out = {};
                for (const [key, field] of value.v.fields) {
                    out[key] = decode(field);
                }
                return out;
            }
            case 'Array':
                return value.v.map(decode);
            case 'Map': {
                const out = {};
                for (const key of Object.keys(value.v)) {
                    out[key] = decode(value.v[key]);
                }
                return out;
            }
            default:
                return null;
        }
    };

    const call = (target, method, args) => new Promise((resolve, reject) => {
        const replyTo = global.__bridge_new_id();
        pending.set(replyTo, { resolve, reject });
        post({
            kind: 'ExecuteMethod',
            target,
            method,
            replyTo,
            isError: false,
            payload: args.map(encode),
        });
    });

    const proxyFor = (handle) => {
        const known = proxies.get(handle.id);
        if (known) {
            return known;
        }
        const proxy = new Proxy({}, {
            get(_target, prop) {
                if (prop === HANDLE) {
                    return handle;
                }
                // Not thenable, so a proxy can be a promise's result.
                if (typeof prop === 'symbol' || prop === 'then' || prop === 'toJSON') {
                    return undefined;
                }
                return (...args) => call({ type: 'Object', id: handle.id }, prop, args);
            },
        });
        proxies.set(handle.id, proxy);
        return proxy;
    };

    const setBinding = (name, payload) => {
        const head = payload && payload[0];
        if (!head || head.t !== 'Object') {
            delete bridge[name];
            return;
        }
        const methods = ((payload[1] && payload[1].v) || []).map((method) => method.v);
        const binding = {};
        for (const method of methods) {
            binding[method] = (...args) => call({ type: 'Binding', id: name }, method, args);
        }
        Object.defineProperty(binding, HANDLE, { value: head.v });
        bridge[name] = binding;
    };

    const settle = (message) => {
        const entry = pending.get(message.target.id);
        if (!entry) {
            return;
        }
        pending.delete(message.target.id);
        const values = (message.payload || []).map(decode);
        if (message.isError) {
            entry.reject(new Error(values.length > 0 ? String(values[0]) : 'bridge call failed'));
        } else {
            entry.resolve(values.length > 1 ? values : values[0]);
        }
    };

    const invokeFunction = (message) => {
        const fn = functions.get(message.target.id);
        if (!fn) {
            return;
        }
        const values = (message.payload || []).map(decode);
        try {
            if (message.isError) {
                fn(new Error(values.length > 0 ? String(values[0]) : 'callback error'));
            } else {
                fn(...values);
            }
        } catch (err) {
            console.error('bridge callback threw:', String(err));
        }
    };

    global.bridge = bridge;
    global.__bridge = {
        receive(json) {
            const message = JSON.parse(json);
            switch (message.kind) {
                case 'CallbackResult':
                    settle(message);
                    break;
                case 'CallbackInvoke':
                    invokeFunction(message);
                    break;
                case 'SetBinding':
                    setBinding(message.target.id, message.payload);
                    break;
                default:
                    console.warn('unexpected bridge message', message.kind);
            }
        },
        install(manifestJson) {
            const manifest = JSON.parse(manifestJson);
            for (const entry of manifest.bindings) {
                setBinding(entry.name, [
                    { t: 'Object', v: entry.handle },
                    { t: 'Array', v: entry.methods.map((method) => ({ t: 'String', v: method })) },
                ]);
            }
        },
        release(obj) {
            const handle = obj && obj[HANDLE];
            if (!handle) {
                return false;
            }
            proxies.delete(handle.id);
            post({ kind: 'ReleaseObject', target: { type: 'Object', id: handle.id }, isError: false, payload: [] });
            return true;
        },
        invokeHost(id, ...args) {
            post({ kind: 'CallbackInvoke', target: { type: 'Callback', id }, isError: false, payload: args.map(encode) });
        },
        pendingCount() {
            return pending.size;
        },
    };
})();
"#;
