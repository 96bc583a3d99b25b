//! The process logic of protocol layers.
//!
//! The packet logic lives in `wire`, the state and processing in this module. The IP layer is an
//! external collaborator; [`ip`] only states the contract the TCP engine expects of it. The
//! [`tcp`] engine consumes that contract below and is driven by a dispatch layer above, whose
//! requests all answer with the client-visible [`Error`] defined here.
//!
//! [`ip`]: ip/index.html
//! [`tcp`]: tcp/index.html
//! [`Error`]: enum.Error.html
use core::fmt;

pub mod ip;
pub mod tcp;

pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported to the clients of a layer.
///
/// Each client operation is answered exactly once, either with its result or with one of these.
/// Failures of lower layers are translated into these at the boundary where they can be related
/// to a particular connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The peer answered a connection request with a reset.
    ConnRefused,

    /// The connection was reset, by the peer or by a local abort.
    ConnReset,

    /// The peer stopped acknowledging and the connection gave up.
    TimedOut,

    /// The IP layer reported the destination as unreachable.
    HostUnreachable,

    /// No route to the destination network exists.
    NetUnreachable,

    /// The requested address or four-tuple is already taken.
    AddrInUse,

    /// The handle is not configured for the operation.
    ///
    /// Connecting without a local port or remote address, or setting a port of zero.
    BadMode,

    /// The request is not known to this layer.
    BadIoctl,

    /// An argument is invalid for the current state.
    Invalid,

    /// The handle has no connection to operate on.
    NotConnected,

    /// The handle already has a connection and can not be reconfigured.
    AlreadyConnected,

    /// Writing after the send side has been shut down.
    Shutdown,

    /// The operation was cancelled before it completed.
    Interrupted,

    /// A fixed size table is full; try again later.
    Again,

    /// Another operation of the same kind is still outstanding on the handle.
    InProgress,

    /// Urgent data is pending and must be read in urgent mode first.
    Urgent,

    /// Reading in urgent mode while no urgent data is pending.
    NoUrgent,

    /// The connection was closed to reclaim buffers for others.
    OutOfBuffers,

    /// The handle does not refer to an open client.
    BadHandle,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Error::ConnRefused => "connection refused",
            Error::ConnReset => "connection reset",
            Error::TimedOut => "connection timed out",
            Error::HostUnreachable => "destination host unreachable",
            Error::NetUnreachable => "destination network unreachable",
            Error::AddrInUse => "address in use",
            Error::BadMode => "bad mode",
            Error::BadIoctl => "bad ioctl",
            Error::Invalid => "invalid argument",
            Error::NotConnected => "not connected",
            Error::AlreadyConnected => "already connected",
            Error::Shutdown => "send side shut down",
            Error::Interrupted => "interrupted",
            Error::Again => "resource temporarily unavailable",
            Error::InProgress => "operation in progress",
            Error::Urgent => "urgent data pending",
            Error::NoUrgent => "no urgent data pending",
            Error::OutOfBuffers => "out of buffers",
            Error::BadHandle => "bad handle",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
