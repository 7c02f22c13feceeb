//! Embed V8 isolates in Rust programs.
//!
//! An [`Isolate`] is a V8 engine instance running on its own thread. It hosts
//! any number of [`Context`]s, each a separate global scope. Scripts run with
//! [`Context::eval`], host data enters the VM through [`Context::create`]
//! (anything that implements `serde::Serialize`), and every VM value is handed
//! back as a [`Value`] that can be inspected, called or passed along.
//!
//! ```no_run
//! use jsbridge::{CallbackArgs, Isolate, Value};
//!
//! fn double(args: CallbackArgs) -> anyhow::Result<Option<Value>> {
//!     let n = args.arg(0).map(|v| v.to_f64()).transpose()?.unwrap_or(0.0);
//!     Ok(Some(args.context.create(&(n * 2.0))?))
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let isolate = Isolate::new()?;
//! let ctx = isolate.new_context()?;
//! let function = ctx.bind("double", double)?;
//! ctx.global()?.set("double", &function)?;
//! assert_eq!(ctx.eval("double(21)", "main.js")?.to_i64()?, 42);
//! # Ok(())
//! # }
//! ```
//!
//! Host functions run on the isolate thread and may call back into the same
//! isolate. Values are released when dropped; releasing a context releases
//! every value it produced.

mod runtime;

pub use runtime::{
    date, engine_version, initialize_platform_once, is_platform_initialized, raw_buffer, Callback,
    CallbackArgs, Context, ContextId, Date, Error, HandleRegistry, HeapStatistics, HostFunction,
    Isolate, IsolateConfig, Kind, KindMask, Loc, MarshalError, Methods, PromiseInfo, PromiseState,
    RawBuffer, Result, Snapshot, Value, MAX_JS_DEPTH,
};
