use thiserror::Error;

use crate::capture::HeapId;

#[derive(Error, Debug)]
pub enum HeapSiftError {
    #[error("input file `{name:?}` not found")]
    InputFileNotFound { name: String },
    #[error("invalid argument `{name}` - {message}")]
    InvalidArgument { name: String, message: String },
    #[error("invalid trace file at line {line} - {message}")]
    InvalidTraceFile { line: usize, message: String },
    #[error("invalid filter pattern - {e}")]
    InvalidFilterPattern { e: regex::Error },
    #[error("unknown heap `{heap_id}`")]
    UnknownHeap { heap_id: HeapId },
    #[error("capture failed to load - {message}")]
    CaptureLoadError { message: String },
    #[error("timed out waiting for the capture to load")]
    WaitTimeout,
    #[error("capture worker is gone")]
    WorkerDisconnected,
    #[error("standard I/O error - {e}")]
    StdIoError { e: std::io::Error },
    #[error("standard thread error - {e:?}")]
    StdThreadError { e: Box<dyn std::any::Any + Send> },
}

impl From<std::io::Error> for HeapSiftError {
    fn from(e: std::io::Error) -> Self {
        HeapSiftError::StdIoError { e }
    }
}

impl From<regex::Error> for HeapSiftError {
    fn from(e: regex::Error) -> Self {
        HeapSiftError::InvalidFilterPattern { e }
    }
}

/// Failure reported by an [`AllocationEventSource`](crate::source::AllocationEventSource).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The requested range has not been flushed by the producer yet.
    #[error("data not available yet")]
    NotReady,
    #[error("event source failure - {0}")]
    Failed(String),
}

/// Terminal failure of a live capture load.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("gave up after waiting {waited_ms} ms for {what}")]
    Timeout { what: &'static str, waited_ms: u128 },
    #[error("interrupted while waiting for {what}")]
    Interrupted { what: &'static str },
    #[error(transparent)]
    Source(#[from] SourceError),
}
