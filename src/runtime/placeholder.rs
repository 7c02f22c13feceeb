//! Side channel that lets handles travel through serde.
//!
//! serde has no notion of a VM value or a host closure, so [`Value`] and
//! [`HostFunction`] serialize as a newtype struct with a reserved name whose
//! payload is an index into a thread-local stash. The marshaller recognizes
//! the reserved names and takes the real handle out of the stash. Outside of a
//! marshalling pass nothing is stashed and serialization fails instead.
//!
//! [`Value`]: crate::Value
//! [`HostFunction`]: crate::HostFunction

use crate::runtime::callback::HostFunction;
use crate::runtime::runner::IsolateId;
use std::cell::RefCell;

pub(crate) const VALUE_TOKEN: &str = "$jsbridge::private::Value";
pub(crate) const FUNCTION_TOKEN: &str = "$jsbridge::private::Function";
pub(crate) const DATE_TOKEN: &str = "$jsbridge::private::Date";

pub(crate) enum Placeholder {
    Value {
        isolate: IsolateId,
        slot: u64,
        released: bool,
    },
    Function(HostFunction),
}

#[derive(Default)]
struct Stash {
    depth: usize,
    entries: Vec<Option<Placeholder>>,
}

thread_local! {
    static STASH: RefCell<Stash> = RefCell::new(Stash::default());
}

/// Store `placeholder` for the marshalling pass running on this thread.
/// Returns `None` when no pass is running.
pub(crate) fn stash(placeholder: Placeholder) -> Option<u64> {
    STASH.with(|stash| {
        let mut stash = stash.borrow_mut();
        if stash.depth == 0 {
            return None;
        }
        stash.entries.push(Some(placeholder));
        Some((stash.entries.len() - 1) as u64)
    })
}

pub(crate) fn take(index: u64) -> Option<Placeholder> {
    STASH.with(|stash| {
        stash
            .borrow_mut()
            .entries
            .get_mut(index as usize)
            .and_then(Option::take)
    })
}

/// Marks a marshalling pass; the stash is cleared when the outermost pass
/// ends.
pub(crate) struct StashScope(());

impl StashScope {
    pub(crate) fn enter() -> Self {
        STASH.with(|stash| stash.borrow_mut().depth += 1);
        StashScope(())
    }
}

impl Drop for StashScope {
    fn drop(&mut self) {
        // Entries hold host closures; run their destructors after the borrow
        // ends.
        let leftover = STASH.with(|stash| {
            let mut stash = stash.borrow_mut();
            stash.depth -= 1;
            if stash.depth == 0 {
                std::mem::take(&mut stash.entries)
            } else {
                Vec::new()
            }
        });
        drop(leftover);
    }
}
