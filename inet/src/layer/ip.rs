//! The contract between the TCP engine and the IP layer below it.
//!
//! The IP layer is not part of this crate. It hands reassembled, verified datagrams to the
//! engine together with the header fields the pseudo header checksum needs, and accepts
//! segments for transmission through [`IpLayer`]. Routing feedback such as ICMP errors is
//! forwarded as a [`Report`].
//!
//! [`IpLayer`]: trait.IpLayer.html
//! [`Report`]: enum.Report.html
use core::fmt;

use crate::buf::Chain;
use crate::wire::{IpProtocol, Ipv4Address};

/// The largest time to live an IP header can carry.
pub const MAX_TTL: u8 = 255;

/// Per-datagram parameters of an outgoing segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SendInfo {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub protocol: IpProtocol,
    pub ttl: u8,
    pub tos: u8,
    /// Set the don't fragment bit, for path MTU discovery.
    pub dont_fragment: bool,
}

/// The header fields of an arriving datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Arrival {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub protocol: IpProtocol,
}

/// Why the IP layer did not take a segment.
#[derive(Debug)]
pub enum SendError {
    /// The layer is busy. The segment is handed back; the engine keeps it and retries once the
    /// layer reports that it is writable again.
    WouldBlock(Chain),

    /// The destination is known to be unreachable.
    Unreachable,

    /// The datagram exceeds the MTU of the outgoing link while fragmentation is forbidden.
    TooBig {
        /// The permitted datagram size, if the layer knows it.
        mtu: Option<u16>,
    },

    /// There is no route towards the destination.
    NoRoute,
}

/// Asynchronous feedback about earlier datagrams, typically from ICMP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Report {
    /// A router could not deliver to `dst`, for example because the time to live ran out.
    Unreachable {
        src: Ipv4Address,
        dst: Ipv4Address,
        src_port: u16,
        dst_port: u16,
    },

    /// A router needed to fragment a datagram towards `dst` but was not allowed to.
    TooBig {
        src: Ipv4Address,
        dst: Ipv4Address,
        src_port: u16,
        dst_port: u16,
        /// The next-hop MTU from the report, if the router included one.
        mtu: Option<u16>,
    },
}

/// The sending half of an IP layer.
pub trait IpLayer {
    /// Queue a transport segment for delivery.
    ///
    /// Succeeds when the layer took ownership of the segment. The datagram length is the segment
    /// length plus the IP header.
    fn send(&mut self, info: SendInfo, segment: Chain) -> Result<(), SendError>;
}

impl<T: IpLayer + ?Sized> IpLayer for &'_ mut T {
    fn send(&mut self, info: SendInfo, segment: Chain) -> Result<(), SendError> {
        (**self).send(info, segment)
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SendError::WouldBlock(_) => write!(f, "would block"),
            SendError::Unreachable => write!(f, "destination unreachable"),
            SendError::TooBig { mtu: Some(mtu) } => write!(f, "packet too big, mtu {}", mtu),
            SendError::TooBig { mtu: None } => write!(f, "packet too big"),
            SendError::NoRoute => write!(f, "no route"),
        }
    }
}
