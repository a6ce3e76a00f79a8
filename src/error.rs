//! Error types for the frame relay.
//!
//! Construction and `start` failures are returned synchronously. Faults that
//! happen on the controller thread after `start` has returned (stderr output,
//! a failed automatic restart, a non-zero exit) are delivered to subscribers
//! as `StreamEvent::Error` carrying a `StreamFault`.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("no `input` parameter")]
    MissingInput,

    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),

    /// The decoder executable could not be located. Never retried.
    #[error("decoder executable `{cmd}` wasn't found; install it or set `cmd`")]
    ExecutableNotFound { cmd: String },

    #[error("failed to spawn decoder `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    /// The decoder wrote to its error stream.
    #[error("decoder error output: {0}")]
    Stderr(String),

    /// The decoder exited with a non-zero status or was killed by a signal.
    #[error("decoder exited with status {}", fmt_code(.code))]
    ProcessFailed { code: Option<i32> },

    #[error("stream controller thread is gone")]
    ControllerGone,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl StreamError {
    /// True for errors that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::MissingInput
                | StreamError::InvalidConfig(_)
                | StreamError::ExecutableNotFound { .. }
        )
    }
}

/// Cloneable handle to an asynchronous fault, shared by every subscriber.
#[derive(Clone, Debug)]
pub struct StreamFault(Arc<StreamError>);

impl StreamFault {
    pub fn error(&self) -> &StreamError {
        &self.0
    }
}

impl From<StreamError> for StreamFault {
    fn from(err: StreamError) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Display for StreamFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for StreamFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}
