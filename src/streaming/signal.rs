use super::error::StreamError;

/// One event carried on a stream to a subscriber.
///
/// At most one terminal signal (`Error` or `Complete`) reaches a subscriber,
/// and nothing follows it.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    Next(T),
    Error(StreamError),
    Complete,
}

impl<T> Signal<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Signal::Complete | Signal::Error(_))
    }

    pub fn as_next(&self) -> Option<&T> {
        match self {
            Signal::Next(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_next(self) -> Option<T> {
        match self {
            Signal::Next(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&StreamError> {
        match self {
            Signal::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Signal<U> {
        match self {
            Signal::Next(value) => Signal::Next(f(value)),
            Signal::Error(error) => Signal::Error(error),
            Signal::Complete => Signal::Complete,
        }
    }
}
