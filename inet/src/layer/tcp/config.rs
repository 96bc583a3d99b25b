use crate::time::Duration;
use crate::wire::IPV4_MIN_MTU;

/// Dimensions and protocol constants of an [`Endpoint`].
///
/// The defaults follow the classic BSD and RFC constants and are fine for most uses. Only the ISN
/// keys should always be replaced by random values.
///
/// [`Endpoint`]: struct.Endpoint.html
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of connection slots, shared by all ports.
    pub connections: usize,
    /// Number of client handles.
    pub clients: usize,
    /// Entries of the most-recently-used four-tuple lookup cache.
    pub lookup_cache: usize,

    /// Segment size assumed when the peer offers no MSS option.
    pub default_mss: usize,
    /// Bytes a connection queues for sending before a write has to wait.
    pub send_buffer: usize,
    /// Receive window offered to the peer.
    pub recv_window: usize,
    /// Extra window opened while urgent data is pending unread.
    pub urgent_window: usize,

    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,

    /// Give up a connection request that is not answered in time.
    pub connect_timeout: Duration,
    /// Give up a passively opened connection that does not complete its handshake.
    pub handshake_timeout: Duration,
    /// Give up an established connection whose data is not acknowledged for this long.
    pub established_timeout: Duration,
    /// Give up a closing connection whose FIN is not acknowledged for this long.
    pub closing_timeout: Duration,
    /// After a close, the same four-tuple gets a sequence space strictly beyond the old one
    /// for this long.
    pub quiet_period: Duration,

    pub probe_min: Duration,
    pub probe_max: Duration,

    /// Largest path MTU ever tried.
    pub max_mtu: usize,
    /// Interval without a too-big report after which the path MTU is raised again.
    pub pmtu_interval: Duration,
    /// The path MTU grows by this fraction of itself, `mtu / pmtu_fraction`.
    pub pmtu_fraction: usize,
    /// Retransmitting with the don't fragment bit for this long counts as a black hole.
    pub blackhole: Duration,
    /// How long path MTU discovery stays off after a black hole.
    pub df_reenable: Duration,

    pub default_ttl: u8,
    /// The time to live after the first unreachable report; it doubles on later ones.
    pub ttl_next: u8,
    pub tos: u8,

    /// Secret of the initial sequence number generator.
    pub isn_keys: (u64, u64),
}

impl Config {
    /// The smallest MTU discovery falls back to.
    pub const MIN_MTU: usize = IPV4_MIN_MTU;
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connections: 32,
            clients: 64,
            lookup_cache: 4,
            default_mss: 536,
            send_buffer: 16 * 1024,
            recv_window: 8 * 1024,
            urgent_window: 1024,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(75),
            handshake_timeout: Duration::from_secs(75),
            established_timeout: Duration::from_secs(20 * 60),
            closing_timeout: Duration::from_secs(2 * 60),
            quiet_period: Duration::from_secs(2 * 30),
            probe_min: Duration::from_secs(1),
            probe_max: Duration::from_secs(5 * 60),
            max_mtu: 1500,
            pmtu_interval: Duration::from_secs(60),
            pmtu_fraction: 100,
            blackhole: Duration::from_secs(10),
            df_reenable: Duration::from_secs(5 * 60),
            default_ttl: 5,
            ttl_next: 30,
            tos: 0,
            isn_keys: (0x7465_6b65_6e5f_6b30, 0x7465_6b65_6e5f_6b31),
        }
    }
}
