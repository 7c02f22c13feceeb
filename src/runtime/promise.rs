use crate::runtime::error::{Error, Result};
use crate::runtime::kind::Kind;
use crate::runtime::runner;
use crate::runtime::value::Value;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseState {
    Pending,
    Resolved,
    Rejected,
}

/// Snapshot of a promise's settlement. `result` is `None` while pending.
#[derive(Debug)]
pub struct PromiseInfo {
    pub state: PromiseState,
    pub result: Option<Value>,
}

impl Value {
    /// Inspect the state of a promise without waiting on it.
    pub fn promise_info(&self) -> Result<PromiseInfo> {
        if !self.is_kind(Kind::Promise) {
            return Err(Error::NotAPromise);
        }
        let slot = self.slot()?;
        let context_id = self.core().id;
        let (state, stored) = self.core().run(move |tc| {
            let local = runner::value_local(tc, slot)?;
            let promise = rusty_v8::Local::<rusty_v8::Promise>::try_from(local)
                .map_err(|_| Error::NotAPromise)?;
            let state = match promise.state() {
                rusty_v8::PromiseState::Pending => return Ok((PromiseState::Pending, None)),
                rusty_v8::PromiseState::Fulfilled => PromiseState::Resolved,
                rusty_v8::PromiseState::Rejected => PromiseState::Rejected,
            };
            let result = promise.result(tc);
            Ok((state, Some(runner::stash(tc, context_id, result)?)))
        })?;
        Ok(PromiseInfo {
            state,
            result: stored.map(|stored| self.core().wrap(stored)),
        })
    }
}
