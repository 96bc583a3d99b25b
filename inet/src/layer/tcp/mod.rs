//! The TCP connection engine.
//!
//! An [`Endpoint`] owns a fixed table of connections, a fixed table of client handles and one
//! [`IpLayer`] per attached interface. It is driven from four directions, all on the same thread:
//!
//! * the dispatch layer opens handles and issues reads, writes, control requests and cancels,
//! * the IP layer delivers datagrams ([`Endpoint::receive`]), reports routing trouble
//!   ([`Endpoint::report`]) and announces when it can take segments again
//!   ([`Endpoint::writable`]),
//! * the host clock advances timers ([`Endpoint::advance`]),
//! * the segment pool calls back into the engine when it runs low.
//!
//! Requests that can be answered right away return `Poll::Ready`. All others return
//! `Poll::Pending` and their single reply is queued as a [`Completion`], to be drained with
//! [`Endpoint::completions`].
//!
//! ## States
//!
//! The classic closing states are folded into one: `Closing` covers everything after the local
//! side has shut down, and flags record whether the FIN was sent, acknowledged and whether the
//! peer's FIN arrived. There is no TIME-WAIT. Instead, a four-tuple that is reused within the
//! quiet period gets an initial sequence number beyond everything its previous incarnation sent.
//!
//! ## Buffers
//!
//! Data is never copied on its way through the engine. A write hands over a chain which is
//! appended to the send queue; segments are cuts of that queue behind a fresh header. Arriving
//! payload is cut out of the datagram and appended to the receive queue. Only one out-of-order
//! region is kept per connection, other disjoint early segments are dropped.
//!
//! [`Endpoint`]: struct.Endpoint.html
//! [`IpLayer`]: ../ip/trait.IpLayer.html
//! [`Completion`]: struct.Completion.html
//! [`Endpoint::receive`]: struct.Endpoint.html#method.receive
//! [`Endpoint::report`]: struct.Endpoint.html#method.report
//! [`Endpoint::writable`]: struct.Endpoint.html#method.writable
//! [`Endpoint::advance`]: struct.Endpoint.html#method.advance
//! [`Endpoint::completions`]: struct.Endpoint.html#method.completions
use core::fmt;

use crate::wire::Ipv4Address;

mod config;
mod connection;
mod endpoint;
mod recv;
mod send;
mod siphash;
mod user;

#[cfg(test)]
mod tests;

pub use self::config::Config;
pub use self::endpoint::{Endpoint, PortId};
pub use self::user::{
    Access,
    ClientConfig,
    Completion,
    Handle,
    Ioctl,
    IoctlReply,
    LocalPort,
    Op,
    Options,
    Remote,
    Reply,
    Settings};

/// Index into the connection table.
pub(crate) type ConnId = usize;

/// The state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    /// Shut down locally, or abandoned by its client, and draining.
    Closing,
}

/// The addresses and ports identifying a connection.
///
/// A listening connection uses an unspecified remote address and a zero remote port as
/// wildcards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local_addr: Ipv4Address,
    pub local_port: u16,
    pub remote_addr: Ipv4Address,
    pub remote_port: u16,
}

/// Reclamation priorities the engine registers with its pool, tried in this order.
pub mod priority {
    use crate::buf::Priority;

    /// Segments held back because the IP layer was busy.
    pub const FRAG2SEND: Priority = Priority(10);
    /// Out-of-order data.
    pub const CONN_EXTRA: Priority = Priority(20);
    /// Connections whose client has closed its handle.
    pub const CONN_WITHOUT_USER: Priority = Priority(30);
    /// Any connection holding data.
    pub const CONN_IN_USE: Priority = Priority(40);
}

impl State {
    /// Whether data may flow in this state.
    pub fn is_synchronized(self) -> bool {
        match self {
            State::Established | State::Closing => true,
            _ => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::Closing => write!(f, "CLOSING"),
        }
    }
}

impl fmt::Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}-{}:{}", self.local_addr, self.local_port,
            self.remote_addr, self.remote_port)
    }
}
