//! Context handle for namespace-isolated execution.

use crate::runtime::callback::{CallbackArgs, HostFunction};
use crate::runtime::conversion;
use crate::runtime::error::{Error, Result};
use crate::runtime::isolate::Isolate;
use crate::runtime::js_value::HostValue;
use crate::runtime::registry::ContextId;
use crate::runtime::runner::{self, StoredRef};
use crate::runtime::value::Value;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Sandboxed global scope inside an [`Isolate`].
///
/// Each context has its own global object and maintains independent state.
/// All operations are delegated to the isolate thread.
///
/// ```no_run
/// # fn main() -> jsbridge::Result<()> {
/// let isolate = jsbridge::Isolate::new()?;
/// let ctx1 = isolate.new_context()?;
/// let ctx2 = isolate.new_context()?;
///
/// ctx1.eval("var x = 10", "one.js")?;
/// ctx2.eval("var x = 20", "two.js")?;
///
/// assert_eq!(ctx1.eval("x", "one.js")?.to_i64()?, 10);
/// assert_eq!(ctx2.eval("x", "two.js")?.to_i64()?, 20);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

/// State owned by host-facing [`Context`] handles only. Bound closures live
/// here, so a closure that keeps a [`Value`] of its own context does not keep
/// the context alive.
pub(crate) struct ContextInner {
    core: Arc<ContextCore>,
    callbacks: RwLock<HashMap<u32, HostFunction>>,
    next_callback_id: AtomicU32,
}

/// What values and the registry keep alive: the id, the isolate and the
/// release flag. Dropping the last reference releases the native context.
pub(crate) struct ContextCore {
    pub(crate) id: ContextId,
    isolate: Isolate,
    released: AtomicBool,
    handle: Weak<ContextInner>,
}

impl Context {
    pub(crate) fn create_in(isolate: &Isolate) -> Result<Context> {
        if isolate.is_released() {
            return Err(Error::Released("isolate"));
        }
        let inner = Arc::new_cyclic(|handle| ContextInner {
            core: isolate.registry().register(|id| ContextCore {
                id,
                isolate: isolate.clone(),
                released: AtomicBool::new(false),
                handle: handle.clone(),
            }),
            callbacks: RwLock::new(HashMap::new()),
            next_callback_id: AtomicU32::new(1),
        });
        let context = Context { inner };

        let id = context.id();
        let bootstrap = isolate.config().bootstrap_script.clone();
        let created = isolate.run(move |scope| runner::create_context(scope, id, bootstrap.as_deref()));
        if let Err(err) = created {
            // Nothing was stored on the isolate thread.
            context.inner.core.released.store(true, Ordering::SeqCst);
            isolate.registry().unregister(id);
            return Err(err);
        }
        debug!(context = id, "context created");
        Ok(context)
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Context {
        Context { inner }
    }

    pub fn id(&self) -> ContextId {
        self.inner.core.id
    }

    pub fn isolate(&self) -> &Isolate {
        &self.inner.core.isolate
    }

    pub fn is_released(&self) -> bool {
        self.inner.core.is_released()
    }

    /// Release the native context and every value it owns. Idempotent.
    pub fn release(&self) {
        self.inner.core.release();
        // Callbacks may own values of this context.
        let callbacks = std::mem::take(&mut *self.inner.callbacks.write());
        drop(callbacks);
    }

    /// Interrupt the script running in this context's isolate.
    pub fn terminate(&self) {
        self.isolate().terminate();
    }

    /// Compile and run `source`; `filename` appears in stack traces.
    pub fn eval(&self, source: &str, filename: &str) -> Result<Value> {
        let (source, filename) = (source.to_string(), filename.to_string());
        let id = self.id();
        let stored = self.run(move |tc| {
            let result = runner::execute(tc, &source, &filename)?;
            runner::stash(tc, id, result)
        })?;
        Ok(self.wrap(stored))
    }

    /// Like [`Context::eval`], resolved through a future instead of blocking.
    pub async fn eval_async(&self, source: &str, filename: &str) -> Result<Value> {
        self.inner.core.ensure_live()?;
        let (source, filename) = (source.to_string(), filename.to_string());
        let id = self.id();
        let registry = self.isolate().registry().clone();
        let _pinned = registry.enter(&self.inner.core);
        let stored = self
            .isolate()
            .run_async(move |scope| {
                runner::in_context(scope, id, |tc| {
                    let result = runner::execute(tc, &source, &filename)?;
                    runner::stash(tc, id, result)
                })
            })
            .await?;
        Ok(self.wrap(stored))
    }

    /// The context's global object.
    pub fn global(&self) -> Result<Value> {
        let id = self.id();
        let stored = self.run(move |tc| {
            let global = tc.get_current_context().global(tc);
            runner::stash(tc, id, global.into())
        })?;
        Ok(self.wrap(stored))
    }

    /// Create a VM function that calls `f`. The function is not attached to
    /// any scope; assign it with [`Value::set`].
    ///
    /// `f` receives this context as [`CallbackArgs::context`]. A closure that
    /// captures a `Context` clone of its own context keeps that context alive
    /// until it is released explicitly.
    pub fn bind<F>(&self, name: &str, f: F) -> Result<Value>
    where
        F: Fn(CallbackArgs) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.bind_function(HostFunction::named(name, f))
    }

    pub fn bind_function(&self, function: HostFunction) -> Result<Value> {
        self.inner.core.ensure_live()?;
        let name = function.name().to_string();
        let token = self.register_callback(function);
        let id = self.id();
        let stored = self.run(move |tc| {
            let function = crate::runtime::callback::new_function(tc, &name, &token)?;
            runner::stash(tc, id, function.into())
        })?;
        Ok(self.wrap(stored))
    }

    /// Convert a host value into a VM value owned by this context.
    ///
    /// See the crate documentation for the type mapping.
    pub fn create<T: Serialize + ?Sized>(&self, value: &T) -> Result<Value> {
        self.inner.core.ensure_live()?;
        let host = conversion::to_host_value(self, value)?;
        self.materialize(host)
    }

    /// Move `bytes` into a new `ArrayBuffer` without copying them.
    pub fn create_array_buffer(&self, bytes: Vec<u8>) -> Result<Value> {
        self.inner.core.ensure_live()?;
        self.materialize(HostValue::Bytes(bytes))
    }

    /// Parse `text` with the VM's `JSON.parse`.
    pub fn parse_json(&self, text: &str) -> Result<Value> {
        let text = text.to_string();
        let id = self.id();
        let stored = self.run(move |tc| {
            let source = runner::new_string(tc, &text)?;
            let parsed = rusty_v8::json::parse(tc, source)
                .ok_or_else(|| Error::Engine("JSON.parse returned nothing".to_string()))?;
            runner::stash(tc, id, parsed)
        })?;
        Ok(self.wrap(stored))
    }

    fn materialize(&self, host: HostValue) -> Result<Value> {
        let id = self.id();
        let stored = self.run(move |tc| {
            let local = conversion::materialize(tc, host)?;
            runner::stash(tc, id, local)
        })?;
        Ok(self.wrap(stored))
    }

    fn wrap(&self, stored: StoredRef) -> Value {
        self.inner.core.wrap(stored)
    }

    fn run<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'a, 'b, 's> FnOnce(&'a mut rusty_v8::TryCatch<'b, rusty_v8::HandleScope<'s>>) -> Result<R>
            + Send
            + 'static,
    {
        self.inner.core.run(f)
    }

    /// Add `function` to the callback table and return its dispatch token.
    pub(crate) fn register_callback(&self, function: HostFunction) -> String {
        let callback_id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.write().insert(callback_id, function);
        format!("{}:{}", self.id(), callback_id)
    }

    pub(crate) fn callback(&self, id: u32) -> Option<HostFunction> {
        self.inner.callbacks.read().get(&id).cloned()
    }
}

impl ContextCore {
    pub(crate) fn isolate(&self) -> &Isolate {
        &self.isolate
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// The host handle, while any [`Context`] for this context exists.
    pub(crate) fn context(&self) -> Option<Context> {
        self.handle.upgrade().map(Context::from_inner)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(Error::Released("context"));
        }
        Ok(())
    }

    pub(crate) fn wrap(self: &Arc<Self>, stored: StoredRef) -> Value {
        Value::from_stored(self.clone(), stored)
    }

    /// Run `f` inside this context, pinned in the registry while it runs.
    pub(crate) fn run<R, F>(self: &Arc<Self>, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'a, 'b, 's> FnOnce(&'a mut rusty_v8::TryCatch<'b, rusty_v8::HandleScope<'s>>) -> Result<R>
            + Send
            + 'static,
    {
        self.ensure_live()?;
        let registry = self.isolate.registry().clone();
        let _pinned = registry.enter(self);
        let id = self.id;
        self.isolate
            .run(move |scope| runner::in_context(scope, id, f))
    }

    /// Release one value slot owned by this context.
    pub(crate) fn release_slot(&self, slot: u64) {
        if self.is_released() {
            return;
        }
        let isolate = &self.isolate;
        if runner::on_isolate_thread(isolate.id()) && runner::release_value(slot) {
            return;
        }
        let _ = isolate.post(Box::new(move |_| {
            runner::release_value(slot);
        }));
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.id;
        if !(runner::on_isolate_thread(self.isolate.id()) && runner::release_context(id)) {
            let _ = self.isolate.post(Box::new(move |_| {
                runner::release_context(id);
            }));
        }
        self.isolate.registry().unregister(id);
    }
}

impl Drop for ContextCore {
    fn drop(&mut self) {
        self.release();
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("isolate", self.isolate())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandleRegistry, IsolateConfig, Kind};
    use std::collections::HashSet;

    fn slot_counts(isolate: &Isolate) -> (usize, usize) {
        isolate.run(|_| runner::slot_counts()).unwrap()
    }

    #[test]
    fn test_contexts_are_isolated() {
        let isolate = Isolate::new().unwrap();
        let ctx1 = isolate.new_context().unwrap();
        let ctx2 = isolate.new_context().unwrap();

        ctx1.eval("var x = 10", "one.js").unwrap();
        ctx2.eval("var x = 20", "two.js").unwrap();

        assert_eq!(ctx1.eval("x", "one.js").unwrap().to_i64().unwrap(), 10);
        assert_eq!(ctx2.eval("x", "two.js").unwrap().to_i64().unwrap(), 20);
        assert_ne!(ctx1, ctx2);
    }

    #[test]
    fn test_state_persists_between_calls() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();

        assert_eq!(ctx.eval("var counter = 0; counter", "c.js").unwrap().to_i64().unwrap(), 0);
        assert_eq!(ctx.eval("++counter", "c.js").unwrap().to_i64().unwrap(), 1);
        assert_eq!(ctx.eval("counter", "c.js").unwrap().to_i64().unwrap(), 1);
    }

    #[test]
    fn test_syntax_error() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();

        let err = ctx
            .eval("functin broken(a, b) { return a + b; }", "broken.js")
            .unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, Error::Script(_)));
        assert!(
            message.starts_with("Uncaught exception: SyntaxError"),
            "{}",
            message
        );
        assert!(message.contains("at broken.js:1:"), "{}", message);
    }

    #[test]
    fn test_thrown_values_are_reported() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();

        let err = ctx.eval("throw 'badness'", "throw.js").unwrap_err();
        assert!(err.to_string().starts_with("Uncaught exception: badness"));

        let err = ctx
            .eval("function f() { throw new Error('ooopsie'); }\nf();", "throw.js")
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("Uncaught exception: Error: ooopsie"), "{}", err);
        assert!(err.contains("\nat throw.js:1:"), "{}", err);
        assert!(err.contains("^"), "{}", err);
        assert!(err.contains("Stack trace: Error: ooopsie"), "{}", err);
    }

    #[test]
    fn test_bootstrap_runs_in_every_context() {
        let config = crate::IsolateConfig::new().with_bootstrap("globalThis.VERSION = '1.0.0';");
        let isolate = Isolate::with_config(config).unwrap();

        for _ in 0..2 {
            let ctx = isolate.new_context().unwrap();
            let version = ctx.eval("globalThis.VERSION", "v.js").unwrap();
            assert_eq!(version.to_string().unwrap(), "1.0.0");
        }
    }

    #[test]
    fn test_broken_bootstrap_fails_context_creation() {
        let config = crate::IsolateConfig::new().with_bootstrap("throw new Error('nope')");
        let isolate = Isolate::with_config(config).unwrap();
        let err = isolate.new_context().unwrap_err();
        assert!(err.to_string().contains("Error: nope"), "{}", err);
    }

    #[test]
    fn test_release_is_idempotent() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let value = ctx.eval("({ a: 1 })", "v.js").unwrap();

        ctx.release();
        ctx.release();
        assert!(ctx.is_released());
        assert!(matches!(ctx.eval("1", "v.js"), Err(Error::Released("context"))));
        assert!(matches!(value.get("a"), Err(Error::Released("context"))));

        // Releasing a value after its context is a no-op.
        value.release();
        value.release();
    }

    #[test]
    fn test_values_shared_between_contexts() {
        let isolate = Isolate::new().unwrap();
        let ctx1 = isolate.new_context().unwrap();
        let ctx2 = isolate.new_context().unwrap();

        let foo = ctx1.eval("var foo = { x: 1 }; foo", "one.js").unwrap();
        ctx2.global().unwrap().set("bar", &foo).unwrap();

        ctx2.eval("bar.x = 2", "two.js").unwrap();
        assert_eq!(ctx1.eval("foo.x", "one.js").unwrap().to_i64().unwrap(), 2);

        ctx1.eval("foo.y = 'shared'", "one.js").unwrap();
        assert_eq!(
            ctx2.eval("bar.y", "two.js").unwrap().to_string().unwrap(),
            "shared"
        );
    }

    #[test]
    fn test_parse_json() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();

        let value = ctx.parse_json(r#"{"a": [1, 2, {"b": null}]}"#).unwrap();
        assert!(value.is_kind(Kind::Object));
        assert_eq!(value.to_json().unwrap(), r#"{"a":[1,2,{"b":null}]}"#);

        let err = ctx.parse_json("{not json").unwrap_err().to_string();
        assert!(err.starts_with("Uncaught exception: SyntaxError"), "{}", err);
    }

    #[test]
    fn test_create_array_buffer_moves_bytes() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();

        let buffer = ctx.create_array_buffer(vec![1, 2, 3, 250]).unwrap();
        assert!(buffer.is_kind(Kind::ArrayBuffer));
        assert_eq!(buffer.to_bytes().unwrap(), Some(vec![1, 2, 3, 250]));
        ctx.global().unwrap().set("buf", &buffer).unwrap();
        let sum = ctx
            .eval("new Uint8Array(buf).reduce((a, b) => a + b, 0)", "buf.js")
            .unwrap();
        assert_eq!(sum.to_i64().unwrap(), 256);

        let empty = ctx.create_array_buffer(Vec::new()).unwrap();
        assert_eq!(empty.to_bytes().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_many_contexts_from_many_threads() {
        let isolate = Isolate::new().unwrap();
        let threads: Vec<_> = (0..100)
            .map(|i| {
                let isolate = isolate.clone();
                std::thread::spawn(move || {
                    let ctx = isolate.new_context().unwrap();
                    let throws = i % 5 == 0;
                    ctx.eval(&format!("var seed = {}; var throws = {};", i, throws), "seed.js")
                        .unwrap();
                    for _ in 0..3 {
                        let result = ctx.eval(
                            "function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); }\n\
                             if (throws) throw new Error('context ' + seed + ' failed');\n\
                             fib(15) + seed",
                            "fib.js",
                        );
                        if throws {
                            let err = result.unwrap_err();
                            assert!(matches!(err, Error::Script(_)), "{:?}", err);
                            assert!(
                                err.to_string().contains(&format!("context {} failed", i)),
                                "{}",
                                err
                            );
                        } else {
                            assert_eq!(result.unwrap().to_i64().unwrap() - i, 610);
                        }
                    }
                    ctx.id()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for t in threads {
            assert!(ids.insert(t.join().unwrap()));
        }
    }

    #[test]
    fn test_closure_holding_own_value_does_not_leak_context() {
        let registry = Arc::new(HandleRegistry::new());
        let isolate = Isolate::with_registry(IsolateConfig::default(), registry.clone()).unwrap();
        let sender = isolate.sender().unwrap();
        let ctx = isolate.new_context().unwrap();

        let cached = ctx.eval("({ n: 1 })", "cached.js").unwrap();
        let get = ctx
            .bind("get", move |_| Ok(Some(cached.get("n")?)))
            .unwrap();
        ctx.global().unwrap().set("get", &get).unwrap();
        assert_eq!(ctx.eval("get()", "get.js").unwrap().to_i64().unwrap(), 1);
        assert_eq!(registry.live_contexts(), 1);

        drop(isolate);
        drop(get);
        drop(ctx);
        assert_eq!(registry.live_contexts(), 0);
        assert!(sender.is_closed());
    }

    #[test]
    fn test_values_outlive_dropped_context_handle() {
        let registry = Arc::new(HandleRegistry::new());
        let isolate = Isolate::with_registry(IsolateConfig::default(), registry.clone()).unwrap();
        let ctx = isolate.new_context().unwrap();
        let object = ctx.eval("({ kept: 'yes' })", "kept.js").unwrap();
        let array = ctx.eval("[1, 2]", "kept.js").unwrap();
        assert_eq!(slot_counts(&isolate), (1, 2));

        drop(ctx);
        assert_eq!(registry.live_contexts(), 1);
        assert!(matches!(object.context(), Err(Error::Released("context"))));
        assert_eq!(object.get("kept").unwrap().to_string().unwrap(), "yes");
        assert_eq!(slot_counts(&isolate), (1, 2));

        drop(array);
        assert_eq!(registry.live_contexts(), 1);
        assert_eq!(slot_counts(&isolate), (1, 1));

        drop(object);
        assert_eq!(registry.live_contexts(), 0);
        assert_eq!(slot_counts(&isolate), (0, 0));
    }

    #[test]
    fn test_eval_async() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let value = rt
            .block_on(ctx.eval_async("[1, 2, 3].map(x => x * 2).join(',')", "async.js"))
            .unwrap();
        assert_eq!(value.to_string().unwrap(), "2,4,6");

        let err = rt
            .block_on(ctx.eval_async("nope(", "async.js"))
            .unwrap_err();
        assert!(matches!(err, Error::Script(_)));
    }

    #[test]
    fn test_microtasks_drain_before_return() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();

        ctx.eval("var done = false; Promise.resolve().then(() => { done = true; });", "m.js")
            .unwrap();
        assert_eq!(ctx.eval("done", "m.js").unwrap().to_string().unwrap(), "true");
    }
}
