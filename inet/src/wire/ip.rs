use core::fmt;

/// The minimum MTU every IPv4 host must accept, also the floor of path MTU discovery.
pub const MIN_MTU: usize = 576;

/// Length of an IPv4 header without options.
pub const HEADER_LEN: usize = 20;

/// A four-octet IPv4 address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub [u8; 4]);

impl Address {
    /// An unspecified address.
    pub const UNSPECIFIED: Address = Address([0x00; 4]);

    /// Construct an IPv4 address from parts.
    pub const fn new(a0: u8, a1: u8, a2: u8, a3: u8) -> Address {
        Address([a0, a1, a2, a3])
    }

    /// Return an IPv4 address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode the address into a `u32` in network endian byte order.
    pub fn to_network_integer(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Query whether the address falls into the "unspecified" range.
    pub fn is_unspecified(&self) -> bool {
        self.0[0] == 0
    }
}

#[cfg(feature = "std")]
impl From<::std::net::Ipv4Addr> for Address {
    fn from(x: ::std::net::Ipv4Addr) -> Address {
        Address(x.octets())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

enum_with_unknown! {
    /// IP datagram encapsulated protocol.
    pub enum Protocol(u8) {
        Icmp = 0x01,
        Tcp  = 0x06,
        Udp  = 0x11,
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{:02x}", id),
        }
    }
}

/// RFC 1071 internet checksums.
pub mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::{Address, Protocol};
    use crate::buf::Chain;

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0;

        // For each 32-byte chunk...
        const CHUNK_SIZE: usize = 32;
        while data.len() >= CHUNK_SIZE {
            let mut d = &data[..CHUNK_SIZE];
            // ... take by 2 bytes and sum them.
            while d.len() >= 2 {
                accum += NetworkEndian::read_u16(d) as u32;
                d = &d[2..];
            }

            data = &data[CHUNK_SIZE..];
        }

        // Sum the rest that does not fit the last 32-byte chunk,
        // taking by 2 bytes.
        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // Add the last remaining odd byte, if any.
        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Compute the IPv4 pseudo header checksum.
    pub fn pseudo_header(src_addr: Address, dst_addr: Address, protocol: Protocol, length: u32) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = protocol.into();
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(src_addr.as_bytes()),
            data(dst_addr.as_bytes()),
            data(&proto_len[..])
        ])
    }

    /// Checksum over all windows of a chain, as if it was one contiguous slice.
    ///
    /// Windows of odd length shift the byte pairing of everything after them.
    pub fn chain(chain: &Chain) -> u16 {
        let (sum, odd) = chain.fold((0u16, None), |(sum, odd): (u16, Option<u8>), mut bytes| {
            let mut sum = sum;
            if let Some(high) = odd {
                match bytes.split_first() {
                    Some((&low, rest)) => {
                        sum = combine(&[sum, u16::from_be_bytes([high, low])]);
                        bytes = rest;
                    },
                    None => return (sum, Some(high)),
                }
            }
            let even = bytes.len() & !1;
            sum = combine(&[sum, data(&bytes[..even])]);
            (sum, bytes.get(even).copied())
        });
        match odd {
            Some(high) => combine(&[sum, u16::from(high) << 8]),
            None => sum,
        }
    }

    /// Sum over the pseudo header and a complete segment held in a chain.
    ///
    /// A received segment verifies if this is `!0`. Before sending, the complement of the sum is
    /// written into the zeroed checksum field.
    pub fn segment(src_addr: Address, dst_addr: Address, protocol: Protocol, segment: &Chain) -> u16 {
        combine(&[
            pseudo_header(src_addr, dst_addr, protocol, segment.len() as u32),
            chain(segment),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::{Class, Config, Pool};

    #[test]
    fn chain_checksum_matches_contiguous() {
        let pool = Pool::new(&Config {
            classes: vec![Class { size: 8, count: 16 }],
            nodes: 32,
        });
        let bytes: Vec<u8> = (0..37u8).map(|b| b.wrapping_mul(29)).collect();
        // 8 byte segments, then shifted by an odd cut so windows have odd lengths.
        let chain = pool.alloc_from(&bytes);
        assert_eq!(checksum::chain(&chain), checksum::data(&bytes));
        let odd = chain.cut(3, 31);
        assert_eq!(checksum::chain(&odd), checksum::data(&bytes[3..34]));
    }

    #[test]
    fn protocol_roundtrip() {
        assert_eq!(Protocol::from(6u8), Protocol::Tcp);
        assert_eq!(u8::from(Protocol::Unknown(0x99)), 0x99);
        assert_eq!(format!("{}", Address::new(10, 0, 0, 1)), "10.0.0.1");
    }
}
