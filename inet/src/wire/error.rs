use core::fmt;

/// The error type for parsing segments off the wire.
///
/// None of these ever reach a client. A segment that fails to parse is dropped, possibly after
/// logging why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The segment is shorter than its header claims, or shorter than any header.
    Truncated,

    /// The segment was recognized but is self-contradictory.
    ///
    /// Examples: a header length below the minimum, a zero port, an option whose length field
    /// disagrees with its kind.
    Malformed,
}

/// The result type for parsing.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated segment"),
            Error::Malformed => write!(f, "malformed segment"),
        }
    }
}
