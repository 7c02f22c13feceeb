//! Host-side handle to an isolate thread.

use crate::runtime::config::IsolateConfig;
use crate::runtime::context::Context;
use crate::runtime::error::{Error, Result};
use crate::runtime::initialize_platform_once;
use crate::runtime::registry::HandleRegistry;
use crate::runtime::runner::{self, IsolateCommand, IsolateId, Job};
use crate::runtime::snapshot::Snapshot;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::oneshot;
use tracing::debug;

static NEXT_ISOLATE_ID: AtomicU64 = AtomicU64::new(1);

/// Heap usage reported by V8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStatistics {
    pub total_heap_size: usize,
    pub total_heap_size_executable: usize,
    pub total_physical_size: usize,
    pub total_available_size: usize,
    pub used_heap_size: usize,
    pub heap_size_limit: usize,
    pub malloced_memory: usize,
    pub peak_malloced_memory: usize,
    pub external_memory: usize,
    pub number_of_native_contexts: usize,
    pub number_of_detached_contexts: usize,
    pub does_zap_garbage: bool,
}

/// A single-threaded V8 engine instance.
///
/// The engine runs on its own OS thread; every operation is forwarded there
/// and the caller blocks until it completes. Handles are cheap to clone. The
/// thread shuts down when the last handle (including the ones held by
/// contexts and values) is dropped, or on [`Isolate::release`].
#[derive(Clone)]
pub struct Isolate {
    inner: Arc<IsolateInner>,
}

pub(crate) struct IsolateInner {
    id: IsolateId,
    tx: Mutex<Option<async_mpsc::UnboundedSender<IsolateCommand>>>,
    handle: rusty_v8::IsolateHandle,
    registry: Arc<HandleRegistry>,
    config: IsolateConfig,
    // Kept for the lifetime of the isolate.
    _snapshot: Option<Snapshot>,
}

impl Isolate {
    pub fn new() -> Result<Self> {
        Self::spawn(IsolateConfig::default(), None, HandleRegistry::global())
    }

    pub fn with_config(config: IsolateConfig) -> Result<Self> {
        Self::spawn(config, None, HandleRegistry::global())
    }

    /// Start an isolate whose new contexts restore the snapshot's globals.
    pub fn with_snapshot(snapshot: &Snapshot) -> Result<Self> {
        Self::spawn(
            IsolateConfig::default(),
            Some(snapshot.clone()),
            HandleRegistry::global(),
        )
    }

    /// Start an isolate that registers its contexts in `registry` instead of
    /// the process-wide one.
    pub fn with_registry(config: IsolateConfig, registry: Arc<HandleRegistry>) -> Result<Self> {
        Self::spawn(config, None, registry)
    }

    pub fn spawn(
        config: IsolateConfig,
        snapshot: Option<Snapshot>,
        registry: Arc<HandleRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        initialize_platform_once();

        let id = NEXT_ISOLATE_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, handle) =
            runner::spawn_isolate_thread(id, &config, snapshot.clone(), registry.clone())?;
        debug!(isolate = id, "isolate created");

        Ok(Self {
            inner: Arc::new(IsolateInner {
                id,
                tx: Mutex::new(Some(tx)),
                handle,
                registry,
                config,
                _snapshot: snapshot,
            }),
        })
    }

    pub(crate) fn id(&self) -> IsolateId {
        self.inner.id
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &IsolateConfig {
        &self.inner.config
    }

    /// Create a new sandboxed global scope in this isolate.
    pub fn new_context(&self) -> Result<Context> {
        Context::create_in(self)
    }

    /// Interrupt whatever script is running. Safe to call from any thread.
    ///
    /// The interrupted call returns [`Error::Terminated`]; the isolate remains
    /// usable.
    pub fn terminate(&self) {
        self.inner.handle.terminate_execution();
    }

    pub fn heap_statistics(&self) -> Result<HeapStatistics> {
        self.run(|scope| {
            let mut stats = rusty_v8::HeapStatistics::default();
            scope.get_heap_statistics(&mut stats);
            Ok(HeapStatistics {
                total_heap_size: stats.total_heap_size(),
                total_heap_size_executable: stats.total_heap_size_executable(),
                total_physical_size: stats.total_physical_size(),
                total_available_size: stats.total_available_size(),
                used_heap_size: stats.used_heap_size(),
                heap_size_limit: stats.heap_size_limit(),
                malloced_memory: stats.malloced_memory(),
                peak_malloced_memory: stats.peak_malloced_memory(),
                external_memory: stats.external_memory(),
                number_of_native_contexts: stats.number_of_native_contexts(),
                number_of_detached_contexts: stats.number_of_detached_contexts(),
                does_zap_garbage: stats.does_zap_garbage() != 0,
            })
        })
    }

    /// Ask V8 to free as much memory as it can.
    pub fn send_low_memory_notification(&self) -> Result<()> {
        self.run(|scope| {
            scope.low_memory_notification();
            Ok(())
        })
    }

    pub fn is_released(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    /// Shut the isolate thread down. Idempotent.
    ///
    /// Contexts and values of a released isolate report
    /// [`Error::Released`] from every operation.
    pub fn release(&self) {
        self.inner.shutdown();
    }

    pub(crate) fn sender(&self) -> Result<async_mpsc::UnboundedSender<IsolateCommand>> {
        self.inner
            .tx
            .lock()
            .as_ref()
            .cloned()
            .ok_or(Error::Released("isolate"))
    }

    /// Run `f` on the isolate thread and wait for its result.
    pub(crate) fn run<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut rusty_v8::HandleScope<'_, ()>) -> Result<R> + Send + 'static,
    {
        let f = match runner::try_run_nested(self.id(), f) {
            Ok(result) => return result,
            Err(f) => f,
        };
        if runner::on_isolate_thread(self.id()) {
            return Err(Error::Engine(
                "Isolate re-entered outside of a callback".to_string(),
            ));
        }

        let sender = self.sender()?;
        let (result_tx, result_rx) = mpsc::channel();
        let job: Job = Box::new(move |scope| {
            let _ = result_tx.send(f(scope));
        });
        sender
            .send(IsolateCommand::Run(job))
            .map_err(|_| Error::Disconnected)?;

        result_rx.recv().map_err(|_| Error::Disconnected)?
    }

    /// Async variant of [`Isolate::run`].
    pub(crate) async fn run_async<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut rusty_v8::HandleScope<'_, ()>) -> Result<R> + Send + 'static,
    {
        let f = match runner::try_run_nested(self.id(), f) {
            Ok(result) => return result,
            Err(f) => f,
        };

        let sender = self.sender()?;
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move |scope| {
            let _ = result_tx.send(f(scope));
        });
        sender
            .send(IsolateCommand::Run(job))
            .map_err(|_| Error::Disconnected)?;

        result_rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Queue `job` without waiting for it.
    pub(crate) fn post(&self, job: Job) -> Result<()> {
        self.sender()?
            .send(IsolateCommand::Run(job))
            .map_err(|_| Error::Disconnected)
    }
}

impl IsolateInner {
    fn shutdown(&self) {
        let Some(tx) = self.tx.lock().take() else {
            return;
        };

        let (result_tx, result_rx) = mpsc::channel();
        if tx
            .send(IsolateCommand::Shutdown {
                responder: result_tx,
            })
            .is_err()
        {
            return;
        }
        // The isolate thread cannot wait for itself; it exits after the
        // current job.
        if !runner::on_isolate_thread(self.id) {
            let _ = result_rx.recv();
        }
        debug!(isolate = self.id, "isolate released");
    }
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PartialEq for Isolate {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Isolate {}

impl fmt::Debug for Isolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.inner.id)
            .field("released", &self.is_released())
            .finish()
    }
}
