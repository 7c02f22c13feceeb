//! Pre-initialized heap blobs.

use crate::runtime::error::{Error, Result};
use crate::runtime::initialize_platform_once;
use crate::runtime::runner;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Serialized heap state. Isolates started from a snapshot restore its
/// globals in every new context.
#[derive(Clone)]
pub struct Snapshot {
    blob: Arc<[u8]>,
}

impl Snapshot {
    /// Run `source` in a fresh isolate and capture the resulting heap.
    pub fn create(source: &str) -> Result<Snapshot> {
        initialize_platform_once();
        let source = source.to_string();
        std::thread::Builder::new()
            .name("jsbridge-snapshot".to_string())
            .spawn(move || build_blob(&source))?
            .join()
            .map_err(|_| Error::Engine("Snapshot thread panicked".to_string()))?
    }

    /// Copy of the blob, suitable for [`Snapshot::restore`].
    pub fn export(&self) -> Vec<u8> {
        self.blob.to_vec()
    }

    pub fn restore(bytes: impl Into<Vec<u8>>) -> Snapshot {
        Snapshot {
            blob: Arc::from(bytes.into()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    pub fn len(&self) -> usize {
        self.blob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }
}

fn build_blob(source: &str) -> Result<Snapshot> {
    let mut creator = rusty_v8::Isolate::snapshot_creator(None, None);
    let outcome = {
        let scope = &mut rusty_v8::HandleScope::new(&mut creator);
        let context = rusty_v8::Context::new(scope, Default::default());
        let outcome = {
            let scope = &mut rusty_v8::ContextScope::new(scope, context);
            let tc = &mut rusty_v8::TryCatch::new(scope);
            match runner::execute(tc, source, "<snapshot>") {
                Ok(_) => Ok(()),
                Err(_) if tc.has_caught() => Err(Error::Script(runner::report_exception(tc))),
                Err(err) => Err(err),
            }
        };
        scope.set_default_context(context);
        outcome
    };

    // The creator must always produce a blob before it is dropped.
    let blob = creator.create_blob(rusty_v8::FunctionCodeHandling::Keep);
    outcome?;
    let blob = blob.ok_or_else(|| Error::Engine("Failed to create snapshot".to_string()))?;
    debug!(bytes = blob.len(), "snapshot created");
    Ok(Snapshot::restore(blob.to_vec()))
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Isolate;

    #[test]
    fn test_snapshot_restores_globals() {
        let snapshot = Snapshot::create("var zzz = 'from snapshot'; function twice(x) { return x * 2; }")
            .unwrap();
        assert!(!snapshot.is_empty());

        let restored = Snapshot::restore(snapshot.export());
        assert_eq!(restored.len(), snapshot.len());

        let isolate = Isolate::with_snapshot(&restored).unwrap();
        let ctx = isolate.new_context().unwrap();
        assert_eq!(ctx.eval("zzz", "s.js").unwrap().to_string().unwrap(), "from snapshot");
        assert_eq!(ctx.eval("twice(21)", "s.js").unwrap().to_i64().unwrap(), 42);

        let other = isolate.new_context().unwrap();
        assert_eq!(other.eval("typeof zzz", "s.js").unwrap().to_string().unwrap(), "string");
    }

    #[test]
    fn test_bad_snapshot_source_fails() {
        let err = Snapshot::create("var a = ;").unwrap_err().to_string();
        assert!(err.starts_with("Uncaught exception: SyntaxError"), "{}", err);

        let err = Snapshot::create("throw new Error('no snapshot')").unwrap_err().to_string();
        assert!(err.contains("Error: no snapshot"), "{}", err);
    }
}
