//! Error types shared by every part of the bridge.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by isolate, context and value operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A script failed to compile or threw. The message starts with
    /// `Uncaught exception:` and carries location and stack details when V8
    /// provides them.
    #[error("{0}")]
    Script(String),

    /// Execution was interrupted with [`Isolate::terminate`](crate::Isolate::terminate).
    #[error("Execution terminated")]
    Terminated,

    /// Execution exceeded the configured `execution_timeout`.
    #[error("Evaluation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// A host value could not be converted into a VM value.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error("Value is not an object")]
    NotAnObject,

    #[error("Value is not a function")]
    NotAFunction,

    #[error("Value is not a promise")]
    NotAPromise,

    #[error("Value is not a date")]
    NotADate,

    #[error("Index {index} is out of range for a buffer of length {length}")]
    IndexOutOfRange { index: u32, length: usize },

    /// A value belonging to one isolate was handed to another.
    #[error("Value belongs to a different isolate")]
    ForeignIsolate,

    /// The named handle kind (`"value"`, `"context"`, `"isolate"`) was used
    /// after release.
    #[error("The {0} has already been released")]
    Released(&'static str),

    /// The isolate thread is no longer accepting work.
    #[error("Isolate thread is not running")]
    Disconnected,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to spawn isolate thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// A V8 primitive produced no result without throwing.
    #[error("{0}")]
    Engine(String),
}

/// Errors raised while converting host data into VM values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// Map keys must serialize as strings.
    #[error("Map keys must be strings, got {kind}")]
    NonStringKey { kind: &'static str },

    #[error("Depth exceeded maximum limit of {limit}")]
    DepthExceeded { limit: usize },

    #[error("String of {length} bytes is too long for the VM")]
    StringTooLong { length: usize },

    /// A `Value` or `HostFunction` placeholder was serialized outside of
    /// [`Context::create`](crate::Context::create) or consumed twice.
    #[error("Placeholder {0} is no longer available")]
    StalePlaceholder(u64),

    #[error("Value belongs to a different isolate")]
    ForeignIsolate,

    #[error("Value has already been released")]
    ReleasedValue,

    #[error("{0}")]
    Custom(String),

    /// A nested failure, with the fields, indexes and map keys leading to it,
    /// outermost first.
    #[error("{}: {source}", .path.join(": "))]
    At {
        path: Vec<String>,
        source: Box<MarshalError>,
    },
}

impl MarshalError {
    /// Prefix the error's path with `segment`.
    pub(crate) fn at(self, segment: String) -> Self {
        match self {
            MarshalError::At { mut path, source } => {
                path.insert(0, segment);
                MarshalError::At { path, source }
            }
            other => MarshalError::At {
                path: vec![segment],
                source: Box::new(other),
            },
        }
    }

    /// The error without any path.
    pub fn root_cause(&self) -> &MarshalError {
        match self {
            MarshalError::At { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl serde::ser::Error for MarshalError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        MarshalError::Custom(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = Error::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Evaluation timed out after 250ms");
    }

    #[test]
    fn test_marshal_error_converts() {
        let err: Error = MarshalError::NonStringKey { kind: "i32" }.into();
        assert_eq!(err.to_string(), "Map keys must be strings, got i32");
        assert!(matches!(err, Error::Marshal(_)));
    }

    #[test]
    fn test_path_segments_nest_outermost_first() {
        let err = MarshalError::NonStringKey { kind: "number" }
            .at("index 2".to_string())
            .at("field \"entries\"".to_string());
        assert_eq!(
            err.to_string(),
            "field \"entries\": index 2: Map keys must be strings, got number"
        );
        assert_eq!(err.root_cause(), &MarshalError::NonStringKey { kind: "number" });
    }
}
