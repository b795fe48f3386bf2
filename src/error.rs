use std::fmt::Display;

/// Stonetable errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A system call failed, or a read/write transferred fewer bytes than
    /// requested. Fatal for the operation in progress; a builder removes its
    /// temporary file before propagating.
    Io(String),
    /// The file contents are invalid: bad magic, unsupported version,
    /// corrupt varint, or a record that does not fit its declared bounds.
    Format(String),
    /// The API was misused: writing to a reader, seeking out of range,
    /// oversized keys or values, or an unknown backend or flag.
    Usage(String),
    /// The file declares a compression method this build cannot decode.
    Codec(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Format(msg) => write!(f, "format error: {msg}"),
            Error::Usage(msg) => write!(f, "usage error: {msg}"),
            Error::Codec(msg) => write!(f, "codec error: {msg}"),
        }
    }
}

/// Constructs an Error::Format for the given format string.
#[macro_export]
macro_rules! errfmt {
    ($($args:tt)*) => { $crate::error::Error::Format(format!($($args)*)).into() };
}

/// Constructs an Error::Usage for the given format string.
#[macro_export]
macro_rules! errusage {
    ($($args:tt)*) => { $crate::error::Error::Usage(format!($($args)*)).into() };
}

/// A stonetable Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
