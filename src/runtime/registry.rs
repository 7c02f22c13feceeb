//! Refcounted table that resolves integer context ids back to contexts.
//!
//! Native callback trampolines cannot carry host pointers, so every bound
//! function is tagged with a `"<context id>:<callback id>"` token instead. The
//! dispatcher resolves the context id through this registry. Every host→VM
//! call holds an [`EntryGuard`] for the duration of native execution, which
//! keeps the context resolvable even if the host drops its last handle while
//! the VM is still running.

use crate::runtime::context::ContextCore;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub type ContextId = u64;

static GLOBAL_REGISTRY: Lazy<Arc<HandleRegistry>> = Lazy::new(|| Arc::new(HandleRegistry::new()));

/// Outcome of resolving an id.
#[derive(Debug)]
pub(crate) enum Resolved<T> {
    Live(Arc<T>),
    /// The id was handed out but its entry is gone.
    Released,
    /// The id was never allocated by this table.
    Unknown,
}

struct InFlight<T> {
    entry: Arc<T>,
    refcount: usize,
}

struct TableState<T> {
    next_id: u64,
    live: HashMap<u64, Weak<T>>,
    in_flight: HashMap<u64, InFlight<T>>,
}

/// The id-keyed table behind [`HandleRegistry`], generic so its refcount
/// rules can be exercised without an engine.
pub(crate) struct RefTable<T> {
    state: RwLock<TableState<T>>,
}

impl<T> RefTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(TableState {
                next_id: 1,
                live: HashMap::new(),
                in_flight: HashMap::new(),
            }),
        }
    }

    /// Allocate an id and record a weak entry for the value built from it.
    pub(crate) fn register(&self, build: impl FnOnce(u64) -> T) -> Arc<T> {
        let mut state = self.state.write();
        let id = state.next_id;
        state.next_id += 1;
        let entry = Arc::new(build(id));
        state.live.insert(id, Arc::downgrade(&entry));
        entry
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.state.write().live.remove(&id);
    }

    /// Pin `entry` under `id` until the returned guard drops. Nested calls
    /// bump the refcount.
    pub(crate) fn enter(&self, id: u64, entry: &Arc<T>) -> TableGuard<'_, T> {
        let mut state = self.state.write();
        state
            .in_flight
            .entry(id)
            .and_modify(|slot| slot.refcount += 1)
            .or_insert_with(|| InFlight {
                entry: entry.clone(),
                refcount: 1,
            });
        TableGuard { table: self, id }
    }

    fn leave(&self, id: u64) {
        // The pinned Arc may be the last strong reference; drop it after the
        // lock is released so the entry's destructor can take the lock again.
        let removed = {
            let mut state = self.state.write();
            match state.in_flight.get_mut(&id) {
                Some(slot) if slot.refcount > 1 => {
                    slot.refcount -= 1;
                    None
                }
                Some(_) => state.in_flight.remove(&id),
                None => None,
            }
        };
        drop(removed);
    }

    pub(crate) fn resolve(&self, id: u64) -> Resolved<T> {
        let state = self.state.read();
        if let Some(slot) = state.in_flight.get(&id) {
            return Resolved::Live(slot.entry.clone());
        }
        if let Some(entry) = state.live.get(&id).and_then(Weak::upgrade) {
            return Resolved::Live(entry);
        }
        if id == 0 || id >= state.next_id {
            Resolved::Unknown
        } else {
            Resolved::Released
        }
    }

    pub(crate) fn refcount(&self, id: u64) -> usize {
        self.state
            .read()
            .in_flight
            .get(&id)
            .map_or(0, |slot| slot.refcount)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.state.read().live.len()
    }
}

/// Releases one in-flight reference when dropped.
pub(crate) struct TableGuard<'a, T> {
    table: &'a RefTable<T>,
    id: u64,
}

impl<T> Drop for TableGuard<'_, T> {
    fn drop(&mut self) {
        self.table.leave(self.id);
    }
}

pub(crate) type EntryGuard<'a> = TableGuard<'a, ContextCore>;

/// Maps context ids to live contexts for the callback dispatcher.
///
/// Isolates use [`HandleRegistry::global`] unless one is injected with
/// [`Isolate::with_registry`](crate::Isolate::with_registry).
pub struct HandleRegistry {
    table: RefTable<ContextCore>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            table: RefTable::new(),
        }
    }

    /// The process-wide default registry.
    pub fn global() -> Arc<HandleRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    /// Number of in-flight host→VM calls currently pinning `id`.
    pub fn in_flight(&self, id: ContextId) -> usize {
        self.table.refcount(id)
    }

    /// Number of contexts registered and not yet released.
    pub fn live_contexts(&self) -> usize {
        self.table.live_count()
    }

    pub(crate) fn register(&self, build: impl FnOnce(ContextId) -> ContextCore) -> Arc<ContextCore> {
        self.table.register(build)
    }

    pub(crate) fn unregister(&self, id: ContextId) {
        self.table.unregister(id);
    }

    pub(crate) fn enter(&self, context: &Arc<ContextCore>) -> EntryGuard<'_> {
        self.table.enter(context.id, context)
    }

    pub(crate) fn resolve(&self, id: ContextId) -> Resolved<ContextCore> {
        self.table.resolve(id)
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live_contexts", &self.live_contexts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let table: RefTable<String> = RefTable::new();
        let a = table.register(|id| format!("ctx-{}", id));
        let b = table.register(|id| format!("ctx-{}", id));
        assert_eq!(a.as_str(), "ctx-1");
        assert_eq!(b.as_str(), "ctx-2");
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn test_refcount_nests_and_clears() {
        let table: RefTable<String> = RefTable::new();
        let entry = table.register(|_| "ctx".to_string());

        let outer = table.enter(1, &entry);
        assert_eq!(table.refcount(1), 1);
        {
            let _inner = table.enter(1, &entry);
            assert_eq!(table.refcount(1), 2);
        }
        assert_eq!(table.refcount(1), 1);
        drop(outer);
        assert_eq!(table.refcount(1), 0);
    }

    #[test]
    fn test_in_flight_entry_outlives_host_handle() {
        let table: RefTable<String> = RefTable::new();
        let entry = table.register(|_| "ctx".to_string());
        let guard = table.enter(1, &entry);
        drop(entry);

        assert!(matches!(table.resolve(1), Resolved::Live(ref s) if s.as_str() == "ctx"));
        drop(guard);
        assert!(matches!(table.resolve(1), Resolved::Released));
    }

    #[test]
    fn test_resolve_distinguishes_unknown_ids() {
        let table: RefTable<String> = RefTable::new();
        let entry = table.register(|_| "ctx".to_string());
        assert!(matches!(table.resolve(1), Resolved::Live(_)));
        assert!(matches!(table.resolve(0), Resolved::Unknown));
        assert!(matches!(table.resolve(7), Resolved::Unknown));

        table.unregister(1);
        drop(entry);
        assert!(matches!(table.resolve(1), Resolved::Released));
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_concurrent_enter_leave() {
        let table: Arc<RefTable<String>> = Arc::new(RefTable::new());
        let entry = table.register(|_| "ctx".to_string());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let entry = entry.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = table.enter(1, &entry);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(table.refcount(1), 0);
    }
}
