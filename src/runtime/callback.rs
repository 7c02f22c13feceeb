//! Host functions exposed to JavaScript.
//!
//! Bound functions carry a `"<context id>:<callback id>"` token as their V8
//! data value. When script calls one, [`dispatch`] resolves the context through
//! the [`HandleRegistry`](crate::HandleRegistry), looks up the callback, and
//! runs it with panics contained.

use crate::runtime::context::Context;
use crate::runtime::error::{Error, Result};
use crate::runtime::placeholder::{self, Placeholder, FUNCTION_TOKEN};
use crate::runtime::registry::{ContextId, Resolved};
use crate::runtime::runner;
use crate::runtime::value::Value;
use serde::ser::{Error as _, SerializeMap};
use serde::{Serialize, Serializer};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};

/// Host callback signature.
///
/// Returning `Ok(None)` yields `undefined`; an `Err` is thrown into the VM as
/// an `Error` carrying the message.
pub type Callback = Arc<dyn Fn(CallbackArgs) -> anyhow::Result<Option<Value>> + Send + Sync>;

/// Location of the script frame that invoked a callback.
///
/// Empty when the callback was invoked directly by host code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Loc {
    pub function: String,
    pub file: String,
    pub line: usize,
    pub column: usize,
}

/// Arguments handed to a [`Callback`].
pub struct CallbackArgs {
    pub caller: Loc,
    pub args: Vec<Value>,
    /// The context the callback was bound in. Use this rather than a
    /// `Context` captured by the closure, which would keep the context alive.
    pub context: Context,
}

impl CallbackArgs {
    /// Argument `n`, or `None` when fewer were passed.
    pub fn arg(&self, n: usize) -> Option<&Value> {
        self.args.get(n)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// A named host callback.
///
/// Passing one through [`Context::create`] binds it automatically.
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    callback: Callback,
}

impl HostFunction {
    /// Wrap `f`, naming it after the Rust item it was defined in.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(CallbackArgs) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        Self::named(derive_name(std::any::type_name::<F>()), f)
    }

    pub fn named<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallbackArgs) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, args: CallbackArgs) -> anyhow::Result<Option<Value>> {
        (self.callback)(args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Serialize for HostFunction {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let index = placeholder::stash(Placeholder::Function(self.clone())).ok_or_else(|| {
            S::Error::custom("HostFunction can only be serialized by Context::create")
        })?;
        serializer.serialize_newtype_struct(FUNCTION_TOKEN, &index)
    }
}

/// Last meaningful path segment of a Rust type name.
///
/// `my_crate::handlers::add` becomes `add`; closures are named after the
/// function that defines them.
fn derive_name(type_name: &str) -> String {
    type_name
        .split("::")
        .filter(|segment| !segment.starts_with("{{") && !segment.starts_with('<'))
        .last()
        .unwrap_or(type_name)
        .to_string()
}

/// Named host functions exposed as properties of a marshalled struct.
///
/// Flatten it into a struct to put the functions after the fields:
///
/// ```ignore
/// #[derive(Serialize)]
/// struct Api {
///     version: u32,
///     #[serde(flatten)]
///     methods: Methods,
/// }
/// ```
#[derive(Clone, Debug, Default)]
pub struct Methods(Vec<HostFunction>);

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(CallbackArgs) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.0.push(HostFunction::named(name, f));
        self
    }

    pub fn push(&mut self, function: HostFunction) {
        self.0.push(function);
    }
}

impl Serialize for Methods {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        // Unknown length keeps declaration order in the VM object.
        let mut map = serializer.serialize_map(None)?;
        for function in &self.0 {
            map.serialize_entry(function.name(), function)?;
        }
        map.end()
    }
}

/// Create a VM function that dispatches to callback `token`.
pub(crate) fn new_function<'s>(
    scope: &mut rusty_v8::HandleScope<'s>,
    name: &str,
    token: &str,
) -> Result<rusty_v8::Local<'s, rusty_v8::Function>> {
    let data = runner::new_string(scope, token)?;
    let function = rusty_v8::Function::builder(dispatch)
        .data(data.into())
        .build(scope)
        .ok_or_else(|| Error::Engine(format!("Failed to create function {}", name)))?;
    let name = runner::new_string(scope, name)?;
    function.set_name(name);
    Ok(function)
}

fn parse_token(token: &str) -> Option<(ContextId, u32)> {
    let (context, callback) = token.split_once(':')?;
    Some((context.parse().ok()?, callback.parse().ok()?))
}

fn fatal(message: String) -> ! {
    error!("{}", message);
    std::process::abort()
}

fn throw_error(scope: &mut rusty_v8::HandleScope, message: &str) {
    if scope.is_execution_terminating() {
        return;
    }
    let message = match rusty_v8::String::new(scope, message) {
        Some(message) => message,
        None => rusty_v8::String::empty(scope),
    };
    let exception = rusty_v8::Exception::error(scope, message);
    scope.throw_exception(exception);
}

fn caller_location(scope: &mut rusty_v8::HandleScope) -> Loc {
    let Some(trace) = rusty_v8::StackTrace::current_stack_trace(scope, 1) else {
        return Loc::default();
    };
    if trace.get_frame_count() == 0 {
        return Loc::default();
    }
    let Some(frame) = trace.get_frame(scope, 0) else {
        return Loc::default();
    };
    Loc {
        function: frame
            .get_function_name(scope)
            .map(|name| name.to_rust_string_lossy(scope))
            .unwrap_or_default(),
        file: frame
            .get_script_name(scope)
            .map(|name| name.to_rust_string_lossy(scope))
            .unwrap_or_default(),
        line: frame.get_line_number(),
        column: frame.get_column(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Entry point V8 calls for every bound host function.
fn dispatch(
    scope: &mut rusty_v8::HandleScope,
    args: rusty_v8::FunctionCallbackArguments,
    mut rv: rusty_v8::ReturnValue,
) {
    let token = args.data().to_rust_string_lossy(scope);
    let Some((context_id, callback_id)) = parse_token(&token) else {
        fatal(format!("Malformed callback token {:?}", token));
    };

    let registry = match runner::registry() {
        Ok(registry) => registry,
        Err(err) => fatal(format!("Callback invoked outside an isolate thread: {}", err)),
    };
    let core = match registry.resolve(context_id) {
        Resolved::Live(core) => core,
        Resolved::Released => {
            throw_error(scope, "Callback context has been released");
            return;
        }
        Resolved::Unknown => fatal(format!("Unknown context id {} in callback token", context_id)),
    };
    // Values can outlive every host handle; the callback table goes with them.
    let Some(context) = core.context() else {
        throw_error(scope, "Callback context has been released");
        return;
    };
    let Some(function) = context.callback(callback_id) else {
        // Release clears the table; any other miss is a corrupt token.
        if context.is_released() {
            throw_error(scope, "Callback context has been released");
            return;
        }
        fatal(format!("Unknown callback {} in context {}", callback_id, context_id));
    };
    trace!(context = context_id, callback = function.name(), "dispatching callback");

    let caller = caller_location(scope);
    let mut values = Vec::with_capacity(args.length().max(0) as usize);
    for i in 0..args.length() {
        match runner::stash(scope, context_id, args.get(i)) {
            Ok(stored) => values.push(Value::from_stored(core.clone(), stored)),
            Err(err) => {
                throw_error(scope, &err.to_string());
                return;
            }
        }
    }

    let isolate_id = context.isolate().id();
    let call_args = CallbackArgs {
        caller,
        args: values,
        context: context.clone(),
    };
    // `scope` is lent to the active stack until the callback returns; nested
    // host calls reach it only through there.
    let outcome = runner::with_active_scope(isolate_id, scope, || {
        panic::catch_unwind(AssertUnwindSafe(|| function.invoke(call_args)))
    });

    match outcome {
        Ok(Ok(None)) => rv.set_undefined(),
        Ok(Ok(Some(value))) => {
            if value.isolate_id() != isolate_id {
                throw_error(
                    scope,
                    &format!(
                        "Callback {} returned a value from another isolate.",
                        function.name()
                    ),
                );
                return;
            }
            match value.slot().and_then(|slot| runner::value_local(scope, slot)) {
                Ok(local) => rv.set(local),
                Err(_) => throw_error(
                    scope,
                    &format!("Callback {} returned a released value.", function.name()),
                ),
            }
        }
        Ok(Err(err)) => throw_error(scope, &format!("{:#}", err)),
        Err(payload) => throw_error(
            scope,
            &format!(
                "Panic during callback {:?}: {}",
                function.name(),
                panic_message(payload.as_ref())
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Isolate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token("12:3"), Some((12, 3)));
        assert_eq!(parse_token("12"), None);
        assert_eq!(parse_token("a:3"), None);
        assert_eq!(parse_token("1:-3"), None);
    }

    #[test]
    fn test_derive_name() {
        assert_eq!(derive_name("my_crate::handlers::add"), "add");
        assert_eq!(
            derive_name("my_crate::tests::test_bind::{{closure}}"),
            "test_bind"
        );
        assert_eq!(derive_name("add"), "add");
    }

    fn sum(args: CallbackArgs) -> anyhow::Result<Option<Value>> {
        let mut total = 0.0;
        for arg in &args.args {
            total += arg.to_f64()?;
        }
        Ok(Some(args.context.create(&total)?))
    }

    #[test]
    fn test_bind_sums_arguments() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let add = ctx.bind("add", sum).unwrap();
        ctx.global().unwrap().set("add", &add).unwrap();

        let result = ctx.eval("add(1, 2, 3, 4, 5)", "add.js").unwrap();
        assert_eq!(result.to_f64().unwrap(), 15.0);
    }

    #[test]
    fn test_bind_reports_caller_location() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(None));

        let captured = seen.clone();
        let last = ctx
            .bind("last", move |args: CallbackArgs| {
                *captured.lock() = Some(args.caller.clone());
                Ok(args.args.into_iter().last())
            })
            .unwrap();
        ctx.global().unwrap().set("last", &last).unwrap();

        let result = ctx
            .eval(
                "function doit() {\n  return last(1, 2, 3);\n}\ndoit();",
                "somefile.js",
            )
            .unwrap();
        assert_eq!(result.to_string().unwrap(), "3");

        let loc = seen.lock().clone().unwrap();
        assert_eq!(loc.function, "doit");
        assert_eq!(loc.file, "somefile.js");
        assert_eq!(loc.line, 2);
        assert_eq!(loc.column, 10);

        // Direct host calls have no script frame.
        last.call(None, &[]).unwrap();
        assert_eq!(seen.lock().clone().unwrap(), Loc::default());
    }

    #[test]
    fn test_bound_function_name() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let xyz = ctx.bind("xyz", |_| Ok(None)).unwrap();
        assert_eq!(
            xyz.to_string().unwrap(),
            "function xyz() { [native code] }"
        );
    }

    #[test]
    fn test_callback_error_becomes_exception() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let fails = ctx
            .bind("fails", |_| Err(anyhow::anyhow!("borked")))
            .unwrap();
        ctx.global().unwrap().set("fails", &fails).unwrap();

        let err = ctx.eval("fails()", "fails.js").unwrap_err();
        assert!(
            err.to_string().starts_with("Uncaught exception: Error: borked"),
            "{}",
            err
        );

        // The script can catch it like any other error.
        let caught = ctx
            .eval("try { fails(); } catch (e) { e.message }", "fails.js")
            .unwrap();
        assert_eq!(caught.to_string().unwrap(), "borked");
    }

    #[test]
    fn test_callback_panic_becomes_exception() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let panics = ctx
            .bind("panics", |_| -> anyhow::Result<Option<Value>> {
                panic!("aaaah!!");
            })
            .unwrap();
        ctx.global().unwrap().set("panics", &panics).unwrap();

        let err = ctx.eval("panics()", "panics.js").unwrap_err().to_string();
        assert!(err.contains("Panic during callback \"panics\""), "{}", err);
        assert!(err.contains("aaaah!!"), "{}", err);

        // The isolate is still usable afterwards.
        let ok = ctx.eval("1 + 1", "after.js").unwrap();
        assert_eq!(ok.to_i64().unwrap(), 2);
    }

    #[test]
    fn test_callback_rejects_foreign_isolate_value() {
        let isolate = Isolate::new().unwrap();
        let other = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let foreign_ctx = other.new_context().unwrap();
        let foreign = Arc::new(foreign_ctx.create(&"elsewhere").unwrap());

        let returned = foreign.clone();
        let leak = ctx
            .bind("leak", move |_| {
                let value = returned.context()?.create(&"copy")?;
                Ok(Some(value))
            })
            .unwrap();
        ctx.global().unwrap().set("leak", &leak).unwrap();

        let err = ctx.eval("leak()", "leak.js").unwrap_err().to_string();
        assert!(
            err.contains("Callback leak returned a value from another isolate."),
            "{}",
            err
        );
    }

    #[test]
    fn test_undefined_and_missing_arguments() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let noop = ctx
            .bind("noop", move |args: CallbackArgs| {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(args.len(), 1);
                assert!(args.arg(1).is_none());
                Ok(None)
            })
            .unwrap();
        ctx.global().unwrap().set("noop", &noop).unwrap();

        let result = ctx.eval("noop('x')", "noop.js").unwrap();
        assert!(result.is_kind(crate::Kind::Undefined));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_calls_from_callback() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let nested = ctx
            .bind("nested", |args: CallbackArgs| {
                let inner = args.context.eval("21 * 2", "inner.js")?;
                let global = args.context.global()?;
                global.set("fromCallback", &inner)?;
                Ok(Some(inner))
            })
            .unwrap();
        ctx.global().unwrap().set("nested", &nested).unwrap();

        let result = ctx.eval("nested() + fromCallback", "outer.js").unwrap();
        assert_eq!(result.to_i64().unwrap(), 84);
    }

    #[test]
    fn test_callback_sees_pinned_context() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let registry = isolate.registry().clone();
        let context_id = ctx.id();

        let pinned = ctx
            .bind("pinned", move |args: CallbackArgs| {
                let refs = registry.in_flight(context_id);
                Ok(Some(args.context.create(&(refs as f64))?))
            })
            .unwrap();
        ctx.global().unwrap().set("pinned", &pinned).unwrap();

        let result = ctx.eval("pinned()", "pinned.js").unwrap();
        assert!(result.to_f64().unwrap() >= 1.0);
        assert_eq!(isolate.registry().in_flight(context_id), 0);
    }

    #[test]
    fn test_bound_function_outliving_context_handles_throws() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let answer = ctx
            .bind("answer", |args: CallbackArgs| Ok(Some(args.context.create(&42)?)))
            .unwrap();
        assert_eq!(answer.call(None, &[]).unwrap().to_i64().unwrap(), 42);

        drop(ctx);
        assert!(matches!(answer.context(), Err(Error::Released("context"))));
        let err = answer.call(None, &[]).unwrap_err().to_string();
        assert!(err.contains("Callback context has been released"), "{}", err);
    }
}
