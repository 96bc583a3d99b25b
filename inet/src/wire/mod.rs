/*! Low-level segment access and construction.

Two levels of functionality, as for every protocol handled here.

 * [`TcpPacket`] extracts fields from and inserts fields into a sequence of octets. It never
   allocates and, once `check_len` succeeded, none of its accessors panic.
 * [`TcpRepr`] is the compact, high-level representation of a header. It is parsed from a packet
   and emitted into one.

Segments handled by the engine live in pool chains, which are not necessarily contiguous. The
engine therefore aligns the header into the first window of a chain before wrapping it in a
packet, and computes checksums with [`checksum::chain`] rather than over a single slice.

[`TcpPacket`]: struct.TcpPacket.html
[`TcpRepr`]: struct.TcpRepr.html
[`checksum::chain`]: checksum/fn.chain.html
*/

mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
}

mod error;
mod ip;
mod tcp;

pub use self::error::{
    Error,
    Result};

pub use self::ip::{
    checksum,
    Address as Ipv4Address,
    Protocol as IpProtocol,
    MIN_MTU as IPV4_MIN_MTU,
    HEADER_LEN as IPV4_HEADER_LEN};

pub use self::tcp::{
    SeqNumber as TcpSeqNumber,
    Flags as TcpFlags,
    Packet as TcpPacket,
    Repr as TcpRepr,
    TcpOption,
    HEADER_LEN as TCP_HEADER_LEN,
    MAX_HEADER_LEN as TCP_MAX_HEADER_LEN};
