use std::fmt;

/// Errors that can terminate a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A generator step failed
    GeneratorFault { reason: String },
    /// A user-supplied operator function failed
    TransformFault { reason: String },
    /// A bounded retry gave up
    RetryExhausted {
        attempts: u32,
        last: Box<StreamError>,
    },
    /// Propagated unchanged from an inner, merged or zipped stream
    UpstreamError { reason: String },
    /// The subscribe/request/cancel protocol was used incorrectly
    IllegalState { reason: String },
}

impl StreamError {
    pub fn generator(reason: impl Into<String>) -> Self {
        StreamError::GeneratorFault {
            reason: reason.into(),
        }
    }

    pub fn transform(reason: impl Into<String>) -> Self {
        StreamError::TransformFault {
            reason: reason.into(),
        }
    }

    pub fn upstream(reason: impl Into<String>) -> Self {
        StreamError::UpstreamError {
            reason: reason.into(),
        }
    }

    pub fn illegal_state(reason: impl Into<String>) -> Self {
        StreamError::IllegalState {
            reason: reason.into(),
        }
    }

    pub fn retry_exhausted(attempts: u32, last: StreamError) -> Self {
        StreamError::RetryExhausted {
            attempts,
            last: Box::new(last),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::GeneratorFault { reason } => {
                write!(f, "Generator step failed: {}", reason)
            }
            StreamError::TransformFault { reason } => {
                write!(f, "Transform failed: {}", reason)
            }
            StreamError::RetryExhausted { attempts, last } => {
                write!(f, "Retry exhausted after {} attempts: {}", attempts, last)
            }
            StreamError::UpstreamError { reason } => {
                write!(f, "Upstream error: {}", reason)
            }
            StreamError::IllegalState { reason } => {
                write!(f, "Illegal stream state: {}", reason)
            }
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::RetryExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Raised by a [`SignalSink`](super::sink::SignalSink) that can no longer accept items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    pub reason: String,
}

impl SinkError {
    pub fn new(reason: impl Into<String>) -> Self {
        SinkError {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sink rejected item: {}", self.reason)
    }
}

impl std::error::Error for SinkError {}

/// Why forwarding a stream into a sink stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The sink failed; the stream was cancelled
    Sink(SinkError),
    /// The stream ended with an error
    Stream(StreamError),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::Sink(e) => write!(f, "Forwarding stopped by sink: {}", e),
            ForwardError::Stream(e) => write!(f, "Forwarding stopped by stream: {}", e),
        }
    }
}

impl std::error::Error for ForwardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ForwardError::Sink(e) => Some(e),
            ForwardError::Stream(e) => Some(e),
        }
    }
}

impl From<SinkError> for ForwardError {
    fn from(err: SinkError) -> Self {
        ForwardError::Sink(err)
    }
}

impl From<StreamError> for ForwardError {
    fn from(err: StreamError) -> Self {
        ForwardError::Stream(err)
    }
}
