//! Initial sequence numbers, as recommended by rfc6528.
//!
//! A keyed SipHash-2-4 of the four-tuple plus a clock that advances one step every 4ms. The hash
//! keeps the sequence spaces of different tuples unpredictable, the clock keeps successive
//! incarnations of the same tuple moving forward.
use super::FourTuple;
use crate::time::Instant;
use crate::wire::TcpSeqNumber;

pub(crate) struct IsnGenerator {
    keys: (u64, u64),
}

// Yes, that's the initial values.
const IV: [&[u8; 8]; 4] = [
    b"somepseu",
    b"dorandom",
    b"lygenera",
    b"tedbytes"];

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl IsnGenerator {
    pub(crate) fn new(keys: (u64, u64)) -> Self {
        IsnGenerator { keys }
    }

    /// Get the initial sequence number for a connection.
    pub(crate) fn get_isn(&self, tuple: FourTuple, time: Instant) -> TcpSeqNumber {
        let mut state = State::init(self.keys.0, self.keys.1);

        let m = u64::from(tuple.local_addr.to_network_integer())
            | u64::from(tuple.remote_addr.to_network_integer()) << 32;
        let p = u64::from(tuple.local_port)
            | u64::from(tuple.remote_port) << 16
            // Message length = 12
            | 12_u64 << 56;
        state.absorb(m);
        state.absorb(p);
        let hash = state.finalize() as u32;

        let ticks = (time.total_millis() / 4) as u32;
        TcpSeqNumber(hash.wrapping_add(ticks))
    }
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single portion of the message.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Ipv4Address;

    /// See the paper, Appendix A.
    #[test]
    fn manual_test_vectors() {
        let k0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        let k1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());

        let mut state = State::init(k0, k1);
        let m0 = u64::from_le_bytes(0x0001020304050607_u64.to_be_bytes());
        state.absorb(m0);
        let m1 = u64::from_le_bytes(0x08090a0b0c0d0e0f_u64.to_be_bytes());
        state.absorb(m1);

        assert_eq!(state.finalize(), 0xa129ca6149be45e5);
    }

    #[test]
    fn isn_depends_on_tuple_and_advances() {
        let isn = IsnGenerator::new((1, 2));
        let tuple = FourTuple {
            local_addr: Ipv4Address::new(10, 0, 0, 1),
            local_port: 80,
            remote_addr: Ipv4Address::new(10, 0, 0, 2),
            remote_port: 40000,
        };
        let other = FourTuple { remote_port: 40001, ..tuple };

        let start = Instant::from_millis(0);
        let first = isn.get_isn(tuple, start);
        assert_eq!(first, isn.get_isn(tuple, start));
        assert_ne!(first, isn.get_isn(other, start));
        assert_eq!(isn.get_isn(tuple, Instant::from_millis(400)), first + 100);
    }
}
