use std::fmt::Display;

/// emberdb errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// An IO error, carrying the operation that failed and the OS detail.
    IO(String),
    /// The requested key has no live entry.
    NotFound(String),
    /// Internal sentinel: the entry resolved from the index is a tombstone.
    /// Mapped to `NotFound` at the `get` boundary, never returned to callers.
    RemoveOrder,
    /// Invalid user input, typically malformed orders or bad ranges.
    InvalidArgument(String),
    /// Invalid on-disk or in-flight data: decoding errors, corruption,
    /// unexpected internal values.
    InvalidData(String),
    /// A write was attempted on a read-only engine.
    ReadOnly,
}

impl Error {
    /// Constructs an IO error from an operation message and a detail string,
    /// usually the underlying OS error.
    pub fn io(message: impl Display, detail: impl Display) -> Self {
        Error::IO(format!("{message}: {detail}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_remove_order(&self) -> bool {
        matches!(self, Error::RemoveOrder)
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::RemoveOrder => write!(f, "entry is a remove order"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only engine"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)) };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_constructor_joins_message_and_detail() {
        let err = Error::io("could not open segment", "permission denied");
        assert_eq!(
            err,
            Error::IO("could not open segment: permission denied".to_string())
        );
    }

    #[test]
    fn test_remove_order_is_internal() {
        let err = Error::RemoveOrder;
        assert!(err.is_remove_order());
        assert!(!err.is_not_found());
    }
}
