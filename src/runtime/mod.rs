//! Thread-per-isolate V8 embedding.
//!
//! Each [`Isolate`] owns a V8 isolate running on a dedicated OS thread with a
//! single-threaded Tokio runtime. Contexts and values are host-side handles
//! that route work to that thread.

pub mod callback;
pub mod config;
pub mod context;
mod conversion;
pub mod error;
pub mod isolate;
mod js_value;
pub mod kind;
mod placeholder;
pub mod promise;
pub mod registry;
mod runner;
pub mod snapshot;
pub mod types;
pub mod value;

use once_cell::sync::OnceCell;

/// Global V8 platform instance.
///
/// V8 requires exactly one platform to be initialized before creating isolates.
static V8_PLATFORM: OnceCell<rusty_v8::SharedRef<rusty_v8::Platform>> = OnceCell::new();

/// Initialize the V8 platform exactly once.
///
/// Safe to call multiple times; isolates and snapshots call it themselves.
pub fn initialize_platform_once() {
    V8_PLATFORM.get_or_init(|| {
        // Lets scripts force a collection with gc().
        rusty_v8::V8::set_flags_from_string("--expose-gc");

        let platform = rusty_v8::new_default_platform(0, false).make_shared();
        rusty_v8::V8::initialize_platform(platform.clone());
        rusty_v8::V8::initialize();
        tracing::debug!(version = rusty_v8::V8::get_version(), "V8 platform initialized");

        platform
    });
}

pub fn is_platform_initialized() -> bool {
    V8_PLATFORM.get().is_some()
}

/// Version string of the embedded V8.
pub fn engine_version() -> &'static str {
    rusty_v8::V8::get_version()
}

pub use callback::{Callback, CallbackArgs, HostFunction, Loc, Methods};
pub use config::IsolateConfig;
pub use context::Context;
pub use error::{Error, MarshalError, Result};
pub use isolate::{HeapStatistics, Isolate};
pub use js_value::MAX_JS_DEPTH;
pub use kind::{Kind, KindMask};
pub use promise::{PromiseInfo, PromiseState};
pub use registry::{ContextId, HandleRegistry};
pub use snapshot::Snapshot;
pub use types::{date, raw_buffer, Date, RawBuffer};
pub use value::Value;
