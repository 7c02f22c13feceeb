//! Isolate thread backed by a raw `rusty_v8::OwnedIsolate`.
//!
//! Each isolate lives on a dedicated OS thread driving a single-threaded Tokio
//! runtime. Host handles forward work through [`IsolateCommand`] and the thread
//! executes it sequentially. Persistent handles for contexts and values live in
//! a thread-local [`IsolateState`] and are addressed from the host by integer
//! slot, so no V8 handle ever leaves the isolate thread.
//!
//! While a host callback runs, the callback's scope is pushed on a thread-local
//! stack. Host calls made from inside the callback find it there and run inline
//! instead of queueing behind the job that is waiting on them.

use crate::runtime::config::IsolateConfig;
use crate::runtime::error::{Error, MarshalError, Result};
use crate::runtime::kind::{classify, KindMask};
use crate::runtime::registry::{ContextId, HandleRegistry};
use crate::runtime::snapshot::Snapshot;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver as StdReceiver, Sender as StdSender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) type IsolateId = u64;

/// Work executed on the isolate thread with a fresh top-level scope.
pub(crate) type Job = Box<dyn FnOnce(&mut rusty_v8::HandleScope<'_, ()>) + Send>;

type InitSignalChannel = (
    StdSender<Result<rusty_v8::IsolateHandle>>,
    StdReceiver<Result<rusty_v8::IsolateHandle>>,
);

/// Commands sent to the isolate thread.
pub(crate) enum IsolateCommand {
    Run(Job),
    Shutdown { responder: StdSender<()> },
}

/// Where a value was stored, plus its kinds, as returned to the host.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StoredRef {
    pub(crate) slot: u64,
    pub(crate) kinds: KindMask,
}

struct StoredValue {
    context: ContextId,
    value: rusty_v8::Global<rusty_v8::Value>,
}

/// Persistent handles owned by one isolate thread.
pub(crate) struct IsolateState {
    isolate_id: IsolateId,
    contexts: HashMap<ContextId, rusty_v8::Global<rusty_v8::Context>>,
    values: HashMap<u64, StoredValue>,
    next_slot: u64,
    registry: Arc<HandleRegistry>,
    watchdog: Option<Arc<Watchdog>>,
}

/// A callback's scope, published while the callback runs. The lifetime is
/// erased to `'static`; the pointer is only dereferenced between the push and
/// pop in `with_active_scope`, while the real borrow is still live.
struct ActiveScope {
    isolate: IsolateId,
    scope: *mut rusty_v8::HandleScope<'static, ()>,
}

thread_local! {
    static STATE: RefCell<Option<IsolateState>> = const { RefCell::new(None) };
    static CURRENT_ISOLATE: Cell<Option<IsolateId>> = const { Cell::new(None) };
    static ACTIVE: RefCell<Vec<ActiveScope>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn spawn_isolate_thread(
    isolate_id: IsolateId,
    config: &IsolateConfig,
    snapshot: Option<Snapshot>,
    registry: Arc<HandleRegistry>,
) -> Result<(mpsc::UnboundedSender<IsolateCommand>, rusty_v8::IsolateHandle)> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<IsolateCommand>();
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();

    let prefix = config
        .thread_name
        .clone()
        .unwrap_or_else(|| "jsbridge-isolate".to_string());
    let thread_name = format!("{}-{}", prefix, isolate_id);
    let config = config.clone();

    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(Error::Spawn(err)));
                    return;
                }
            };

            let params = match &snapshot {
                Some(snapshot) => config
                    .create_params()
                    .snapshot_blob(snapshot.as_bytes().to_vec()),
                None => config.create_params(),
            };
            let mut isolate = rusty_v8::Isolate::new(params);
            isolate.set_microtasks_policy(rusty_v8::MicrotasksPolicy::Explicit);
            isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);
            let handle = isolate.thread_safe_handle();

            let watchdog = match config.execution_timeout {
                Some(limit) => match Watchdog::spawn(limit, handle.clone(), &thread_name) {
                    Ok(watchdog) => Some(watchdog),
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                },
                None => None,
            };

            CURRENT_ISOLATE.with(|current| current.set(Some(isolate_id)));
            STATE.with(|state| {
                *state.borrow_mut() = Some(IsolateState {
                    isolate_id,
                    contexts: HashMap::new(),
                    values: HashMap::new(),
                    next_slot: 1,
                    registry,
                    watchdog: watchdog.clone(),
                });
            });
            debug!(isolate = isolate_id, "isolate thread started");
            let _ = init_tx.send(Ok(handle));

            let responder = tokio_rt.block_on(run(&mut isolate, cmd_rx, watchdog.as_deref()));

            // Globals must be dropped while the isolate is still alive.
            let leftover = STATE.with(|state| state.borrow_mut().take());
            if let Some(state) = leftover {
                if !state.values.is_empty() {
                    warn!(
                        isolate = isolate_id,
                        leaked = state.values.len(),
                        "value handles not released before shutdown"
                    );
                }
                drop(state);
            }
            if let Some(watchdog) = watchdog {
                watchdog.stop();
            }
            CURRENT_ISOLATE.with(|current| current.set(None));
            drop(isolate);
            debug!(isolate = isolate_id, "isolate thread stopped");

            if let Some(responder) = responder {
                let _ = responder.send(());
            }
        })?;

    match init_rx.recv() {
        Ok(Ok(handle)) => Ok((cmd_tx, handle)),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(Error::Engine(
            "Isolate thread initialization failed".to_string(),
        )),
    }
}

async fn run(
    isolate: &mut rusty_v8::OwnedIsolate,
    mut rx: mpsc::UnboundedReceiver<IsolateCommand>,
    watchdog: Option<&Watchdog>,
) -> Option<StdSender<()>> {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            IsolateCommand::Run(job) => {
                if let Some(watchdog) = watchdog {
                    watchdog.arm();
                }
                {
                    let scope = &mut rusty_v8::HandleScope::new(&mut *isolate);
                    job(scope);
                }
                if let Some(watchdog) = watchdog {
                    watchdog.disarm();
                    // Fired between the job finishing and disarming.
                    if watchdog.take_fired() {
                        isolate.cancel_terminate_execution();
                    }
                }
            }
            IsolateCommand::Shutdown { responder } => return Some(responder),
        }
    }
    None
}

/// Whether the calling thread is the thread of `isolate`.
pub(crate) fn on_isolate_thread(isolate: IsolateId) -> bool {
    CURRENT_ISOLATE.with(|current| current.get() == Some(isolate))
}

fn with_state<R>(f: impl FnOnce(&mut IsolateState) -> R) -> Result<R> {
    STATE.with(|state| {
        let mut state = state.try_borrow_mut().map_err(|_| {
            Error::Engine("isolate state is already borrowed".to_string())
        })?;
        let state = state.as_mut().ok_or(Error::Disconnected)?;
        Ok(f(state))
    })
}

pub(crate) fn registry() -> Result<Arc<HandleRegistry>> {
    with_state(|state| state.registry.clone())
}

pub(crate) fn current_isolate_id() -> Result<IsolateId> {
    with_state(|state| state.isolate_id)
}

/// Run `f` inline on the innermost callback scope of `isolate`, or hand the
/// closure back when no callback of that isolate is running on this thread.
pub(crate) fn try_run_nested<R, F>(isolate: IsolateId, f: F) -> std::result::Result<R, F>
where
    F: FnOnce(&mut rusty_v8::HandleScope<'_, ()>) -> R,
{
    let scope = ACTIVE.with(|active| {
        active
            .borrow()
            .last()
            .filter(|entry| entry.isolate == isolate)
            .map(|entry| entry.scope)
    });
    match scope {
        // SAFETY: the entry was pushed by `with_active_scope` from a live
        // `&mut HandleScope` that it holds for as long as the entry is on the
        // stack, and it only calls the callback in that window. The callback
        // dispatcher does not touch its `scope` between push and pop, so this
        // is the only `&mut` in use. It is not stored: it lives for the call to
        // `f` on this thread and ends before `f` returns. Only the innermost
        // entry is used, and inner callbacks push and pop above it in stack
        // order.
        Some(scope) => Ok(f(unsafe { &mut *scope })),
        None => Err(f),
    }
}

/// Publish `scope` as the current callback scope for the duration of `f`.
pub(crate) fn with_active_scope<R>(
    isolate: IsolateId,
    scope: &mut rusty_v8::HandleScope<'_, ()>,
    f: impl FnOnce() -> R,
) -> R {
    struct Pop;
    impl Drop for Pop {
        fn drop(&mut self) {
            ACTIVE.with(|active| {
                active.borrow_mut().pop();
            });
        }
    }

    // The caller's `scope` stays mutably borrowed by this call until `f` has
    // returned and the entry is popped, so nothing else can use it while
    // `try_run_nested` hands out the pointer.
    let raw: *mut rusty_v8::HandleScope<'_, ()> = scope;
    ACTIVE.with(|active| {
        active.borrow_mut().push(ActiveScope {
            isolate,
            scope: raw.cast(),
        })
    });
    let _pop = Pop;
    f()
}

fn is_top_level() -> bool {
    ACTIVE.with(|active| active.borrow().is_empty())
}

pub(crate) fn new_string<'s>(
    scope: &mut rusty_v8::HandleScope<'s, ()>,
    text: &str,
) -> Result<rusty_v8::Local<'s, rusty_v8::String>> {
    rusty_v8::String::new(scope, text)
        .ok_or(Error::Marshal(MarshalError::StringTooLong { length: text.len() }))
}

/// Persist `value` in the slot table, owned by `context`.
pub(crate) fn stash(
    isolate: &mut rusty_v8::Isolate,
    context: ContextId,
    value: rusty_v8::Local<'_, rusty_v8::Value>,
) -> Result<StoredRef> {
    let kinds = classify(value);
    let global = rusty_v8::Global::new(isolate, value);
    with_state(|state| {
        let slot = state.next_slot;
        state.next_slot += 1;
        state.values.insert(
            slot,
            StoredValue {
                context,
                value: global,
            },
        );
        StoredRef { slot, kinds }
    })
}

pub(crate) fn value_local<'s>(
    scope: &mut rusty_v8::HandleScope<'s, ()>,
    slot: u64,
) -> Result<rusty_v8::Local<'s, rusty_v8::Value>> {
    with_state(|state| {
        state
            .values
            .get(&slot)
            .map(|stored| rusty_v8::Local::new(scope, &stored.value))
    })?
    .ok_or(Error::Released("value"))
}

fn context_local<'s>(
    scope: &mut rusty_v8::HandleScope<'s, ()>,
    context: ContextId,
) -> Result<rusty_v8::Local<'s, rusty_v8::Context>> {
    with_state(|state| {
        state
            .contexts
            .get(&context)
            .map(|global| rusty_v8::Local::new(scope, global))
    })?
    .ok_or(Error::Released("context"))
}

/// Drop one value slot. Returns `false` when the state could not be reached
/// from this call site.
pub(crate) fn release_value(slot: u64) -> bool {
    match with_state(|state| state.values.remove(&slot)) {
        Ok(removed) => {
            drop(removed);
            true
        }
        Err(_) => false,
    }
}

/// Drop a context and every value slot it owns.
pub(crate) fn release_context(context: ContextId) -> bool {
    let removed = with_state(|state| {
        let global = state.contexts.remove(&context);
        let before = state.values.len();
        state.values.retain(|_, stored| stored.context != context);
        (global, before - state.values.len())
    });
    match removed {
        Ok((global, released)) => {
            drop(global);
            debug!(context, released, "context released");
            true
        }
        Err(_) => false,
    }
}

/// Number of stored contexts and values on this isolate thread.
#[cfg(test)]
pub(crate) fn slot_counts() -> Result<(usize, usize)> {
    with_state(|state| (state.contexts.len(), state.values.len()))
}

/// Create a native context, register it under `id` and run the bootstrap
/// script in it.
pub(crate) fn create_context(
    scope: &mut rusty_v8::HandleScope<'_, ()>,
    id: ContextId,
    bootstrap: Option<&str>,
) -> Result<()> {
    {
        let scope = &mut rusty_v8::HandleScope::new(scope);
        let context = rusty_v8::Context::new(scope, Default::default());
        let global = rusty_v8::Global::new(scope, context);
        with_state(|state| state.contexts.insert(id, global))?;
    }

    if let Some(source) = bootstrap {
        let outcome = in_context(scope, id, |tc| execute(tc, source, "<bootstrap>").map(|_| ()));
        if outcome.is_err() {
            release_context(id);
        }
        outcome?;
    }
    Ok(())
}

/// Enter `context` and run `f` under a `TryCatch`.
///
/// Exceptions caught by the `TryCatch` take precedence over `f`'s own result.
/// At the top level the microtask queue is drained afterwards and a pending
/// termination is cancelled so the isolate stays usable.
pub(crate) fn in_context<R, F>(
    scope: &mut rusty_v8::HandleScope<'_, ()>,
    context: ContextId,
    f: F,
) -> Result<R>
where
    F: for<'a, 'b, 's> FnOnce(&'a mut rusty_v8::TryCatch<'b, rusty_v8::HandleScope<'s>>) -> Result<R>,
{
    let scope = &mut rusty_v8::HandleScope::new(scope);
    let local = context_local(scope, context)?;
    let scope = &mut rusty_v8::ContextScope::new(scope, local);
    let tc = &mut rusty_v8::TryCatch::new(scope);
    let top_level = is_top_level();

    let result = f(tc);
    if top_level && !tc.has_terminated() {
        tc.perform_microtask_checkpoint();
    }

    if tc.has_terminated() {
        if !top_level {
            return Err(Error::Terminated);
        }
        tc.cancel_terminate_execution();
        let watchdog = with_state(|state| state.watchdog.clone()).ok().flatten();
        return match watchdog {
            Some(watchdog) if watchdog.take_fired() => Err(Error::Timeout(watchdog.limit)),
            _ => Err(Error::Terminated),
        };
    }
    if tc.has_caught() {
        return Err(Error::Script(report_exception(tc)));
    }
    result
}

/// Compile and run `source` in the entered context.
pub(crate) fn execute<'s>(
    scope: &mut rusty_v8::HandleScope<'s>,
    source: &str,
    filename: &str,
) -> Result<rusty_v8::Local<'s, rusty_v8::Value>> {
    let code = new_string(scope, source)?;
    let name = new_string(scope, filename)?;
    let origin = rusty_v8::ScriptOrigin::new(
        scope,
        name.into(),
        0,
        0,
        false,
        0,
        None,
        false,
        false,
        false,
        None,
    );
    let script = rusty_v8::Script::compile(scope, code, Some(&origin))
        .ok_or_else(|| Error::Engine(format!("Failed to compile {}", filename)))?;
    script
        .run(scope)
        .ok_or_else(|| Error::Engine(format!("Failed to run {}", filename)))
}

/// Format the caught exception with its location, source line and stack.
pub(crate) fn report_exception(tc: &mut rusty_v8::TryCatch<rusty_v8::HandleScope>) -> String {
    let exception = match tc.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc),
        None => String::new(),
    };
    let mut out = format!("Uncaught exception: {}", exception);

    if let Some(message) = tc.message() {
        if let Some(resource) = message.get_script_resource_name(tc) {
            if !resource.is_undefined() {
                let file = resource.to_rust_string_lossy(tc);
                let line = message.get_line_number(tc).unwrap_or(0);
                let start = message.get_start_column();
                let end = message.get_end_column();
                let source_line = message
                    .get_source_line(tc)
                    .map(|line| line.to_rust_string_lossy(tc))
                    .unwrap_or_default();
                out.push_str(&format!(
                    "\nat {}:{}:{}\n  {}\n  {}{}",
                    file,
                    line,
                    start,
                    source_line,
                    " ".repeat(start),
                    "^".repeat(end.saturating_sub(start)),
                ));
            }
        }
    }

    if let Some(stack) = tc.stack_trace() {
        let stack = stack.to_rust_string_lossy(tc);
        if !stack.is_empty() {
            out.push_str("\nStack trace: ");
            out.push_str(&stack);
        }
    }
    out
}

/// Terminates a top-level job that runs past the configured limit.
pub(crate) struct Watchdog {
    limit: Duration,
    handle: rusty_v8::IsolateHandle,
    state: Mutex<WatchdogState>,
    wake: Condvar,
    fired: AtomicBool,
}

#[derive(Default)]
struct WatchdogState {
    deadline: Option<Instant>,
    stopped: bool,
}

impl Watchdog {
    fn spawn(
        limit: Duration,
        handle: rusty_v8::IsolateHandle,
        isolate_thread: &str,
    ) -> Result<Arc<Watchdog>> {
        let watchdog = Arc::new(Watchdog {
            limit,
            handle,
            state: Mutex::new(WatchdogState::default()),
            wake: Condvar::new(),
            fired: AtomicBool::new(false),
        });
        let worker = watchdog.clone();
        std::thread::Builder::new()
            .name(format!("{}-watchdog", isolate_thread))
            .spawn(move || worker.watch())?;
        Ok(watchdog)
    }

    fn arm(&self) {
        let mut state = self.state.lock();
        state.deadline = Some(Instant::now() + self.limit);
        self.wake.notify_one();
    }

    fn disarm(&self) {
        self.state.lock().deadline = None;
    }

    fn take_fired(&self) -> bool {
        self.fired.swap(false, Ordering::SeqCst)
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
        self.wake.notify_one();
    }

    fn watch(&self) {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return;
            }
            match state.deadline {
                None => self.wake.wait(&mut state),
                Some(deadline) if Instant::now() >= deadline => {
                    state.deadline = None;
                    self.fired.store(true, Ordering::SeqCst);
                    warn!(
                        limit_ms = self.limit.as_millis() as u64,
                        "execution timeout reached, terminating"
                    );
                    self.handle.terminate_execution();
                }
                Some(deadline) => {
                    let _ = self.wake.wait_until(&mut state, deadline);
                }
            }
        }
    }
}
