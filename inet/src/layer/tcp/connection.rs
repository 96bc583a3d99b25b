use core::cmp;

use super::{Config, FourTuple, Handle, PortId, State};
use crate::buf::Chain;
use crate::layer::Error;
use crate::layer::ip::{SendInfo, MAX_TTL};
use crate::time::{Duration, Instant};
use crate::wire::{IpProtocol, TcpRepr, TcpSeqNumber as SeqNumber};
use crate::wire::{IPV4_HEADER_LEN, TCP_HEADER_LEN};

/// Common link MTUs, tried in turn when a too-big report carries no MTU (RFC 1191).
const PLATEAUS: [usize; 10] = [65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 508, 296];

/// Sequence space between the last byte of an incarnation and the ISN of the next one.
const REINCARNATION_GAP: usize = 1 << 16;

/// Bytes from `lo` up to `hi`, zero unless `hi` is after `lo`.
pub(crate) fn span(lo: SeqNumber, hi: SeqNumber) -> usize {
    if hi > lo { hi - lo } else { 0 }
}

/// One slot of the connection table.
pub(crate) struct Connection {
    pub(crate) in_use: bool,
    pub(crate) state: State,
    pub(crate) port: PortId,
    pub(crate) tuple: FourTuple,
    /// The wildcard filter a passive open started from.
    pub(crate) listen: Option<FourTuple>,
    pub(crate) owner: Option<Handle>,
    pub(crate) error: Option<Error>,

    pub(crate) iss: SeqNumber,
    /// Oldest unacknowledged sequence number.
    pub(crate) snd_una: SeqNumber,
    /// Next sequence number to transmit. Rewound to `snd_una` to retransmit.
    pub(crate) snd_trm: SeqNumber,
    /// End of the queued data.
    pub(crate) snd_nxt: SeqNumber,
    /// Highest sequence number ever transmitted.
    pub(crate) snd_max: SeqNumber,
    pub(crate) snd_up: SeqNumber,
    pub(crate) snd_psh: SeqNumber,
    pub(crate) snd_wnd: usize,
    pub(crate) snd_wl1: SeqNumber,
    pub(crate) snd_wl2: SeqNumber,
    /// Queued data, starting at the first unacknowledged data byte.
    pub(crate) send_data: Option<Chain>,
    /// A built segment the IP layer could not take yet.
    pub(crate) frag2send: Option<(SendInfo, Chain)>,
    /// Sequence number of our FIN, once the send side is shut down.
    pub(crate) fin_seq: Option<SeqNumber>,

    pub(crate) cwnd: usize,
    pub(crate) ssthresh: usize,
    cinc: usize,
    pub(crate) dupacks: u8,
    pub(crate) mss: usize,

    srtt: Option<u64>,
    rttvar: u64,
    pub(crate) rto: Duration,
    pub(crate) rt_sample: Option<(SeqNumber, Instant)>,
    pub(crate) rt_at: Option<Instant>,
    /// Start of the current wait for an acknowledgement.
    pub(crate) stt: Option<Instant>,
    pub(crate) probe_at: Option<Instant>,
    probe_interval: Duration,
    pub(crate) probe_due: bool,

    pub(crate) mtu: usize,
    mtu_time: Instant,
    pub(crate) dont_fragment: bool,
    df_at: Option<Instant>,
    pub(crate) ttl: u8,
    tos: u8,

    pub(crate) irs: SeqNumber,
    /// First byte not yet read by the client.
    pub(crate) rcv_lo: SeqNumber,
    pub(crate) rcv_nxt: SeqNumber,
    /// Right edge of the advertised window. Never moves left.
    pub(crate) rcv_hi: SeqNumber,
    /// One past the last urgent byte.
    pub(crate) rcv_up: SeqNumber,
    pub(crate) rcvd_data: Option<Chain>,
    pub(crate) reordered: Option<Reordered>,
    pub(crate) fin_received: bool,
    pub(crate) send_ack: bool,
    pub(crate) bsd_urgent: bool,

    pub(crate) last: Option<Incarnation>,
}

/// The single region of data received ahead of `rcv_nxt`.
pub(crate) struct Reordered {
    pub(crate) seq: SeqNumber,
    pub(crate) data: Chain,
    /// The peer's FIN directly follows the data.
    pub(crate) fin: bool,
}

/// What is remembered of a closed connection for the quiet period.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Incarnation {
    pub(crate) tuple: FourTuple,
    pub(crate) snd_max: SeqNumber,
    pub(crate) until: Instant,
}

/// A reset answering a segment, with the tuple seen from our side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Reset {
    pub(crate) tuple: FourTuple,
    pub(crate) seq: SeqNumber,
    pub(crate) ack: Option<SeqNumber>,
}

/// The result of trying to read from a connection.
pub(crate) enum Delivery {
    Data(Chain),
    Eof,
    Wait,
    Failed(Error),
}

impl Connection {
    pub(crate) fn vacant() -> Self {
        let zero = SeqNumber(0);
        Connection {
            in_use: false,
            state: State::Closed,
            port: 0,
            tuple: FourTuple {
                local_addr: Default::default(),
                local_port: 0,
                remote_addr: Default::default(),
                remote_port: 0,
            },
            listen: None,
            owner: None,
            error: None,
            iss: zero,
            snd_una: zero,
            snd_trm: zero,
            snd_nxt: zero,
            snd_max: zero,
            snd_up: zero,
            snd_psh: zero,
            snd_wnd: 0,
            snd_wl1: zero,
            snd_wl2: zero,
            send_data: None,
            frag2send: None,
            fin_seq: None,
            cwnd: 0,
            ssthresh: 0,
            cinc: 0,
            dupacks: 0,
            mss: 0,
            srtt: None,
            rttvar: 0,
            rto: Duration::from_secs(1),
            rt_sample: None,
            rt_at: None,
            stt: None,
            probe_at: None,
            probe_interval: Duration::from_secs(1),
            probe_due: false,
            mtu: 0,
            mtu_time: Instant::default(),
            dont_fragment: true,
            df_at: None,
            ttl: 0,
            tos: 0,
            irs: zero,
            rcv_lo: zero,
            rcv_nxt: zero,
            rcv_hi: zero,
            rcv_up: zero,
            rcvd_data: None,
            reordered: None,
            fin_received: false,
            send_ack: false,
            bsd_urgent: false,
            last: None,
        }
    }

    /// Reinitialize the slot for a new connection, keeping only the quiet period record.
    fn setup(&mut self, port: PortId, tuple: FourTuple, owner: Handle, iss: SeqNumber,
        now: Instant, config: &Config)
    {
        let last = self.last.take();
        *self = Connection::vacant();
        self.last = last;

        self.in_use = true;
        self.port = port;
        self.tuple = tuple;
        self.owner = Some(owner);
        self.reset_send(iss);

        self.mss = config.default_mss;
        self.cwnd = 2 * self.mss;
        self.ssthresh = config.send_buffer;
        self.cinc = self.mss * self.mss / config.send_buffer.max(1) + 1;
        self.snd_wnd = config.send_buffer;
        self.rto = config.initial_rto;
        self.probe_interval = config.probe_min;
        self.mtu = config.max_mtu;
        self.mtu_time = now;
        self.ttl = config.default_ttl;
        self.tos = config.tos;
    }

    pub(crate) fn reset_send(&mut self, iss: SeqNumber) {
        self.iss = iss;
        self.snd_una = iss;
        self.snd_trm = iss;
        self.snd_nxt = iss + 1;
        self.snd_max = iss;
        self.snd_up = iss;
        self.snd_psh = iss;
        self.snd_wl1 = SeqNumber(0);
        self.snd_wl2 = iss;
    }

    /// Start an active open.
    pub(crate) fn open_active(&mut self, port: PortId, tuple: FourTuple, owner: Handle,
        iss: SeqNumber, now: Instant, config: &Config)
    {
        self.setup(port, tuple, owner, iss, now, config);
        self.state = State::SynSent;
        net_debug!("tcp {}: connecting, iss {}", tuple, iss);
    }

    /// Wait for a connection request matching `filter`.
    pub(crate) fn open_passive(&mut self, port: PortId, filter: FourTuple, owner: Handle,
        now: Instant, config: &Config)
    {
        self.setup(port, filter, owner, SeqNumber(0), now, config);
        self.listen = Some(filter);
        self.state = State::Listen;
        net_debug!("tcp {}: listening", filter);
    }

    /// Go back to listening after a half-open connection was reset.
    pub(crate) fn relisten(&mut self, now: Instant, config: &Config) {
        let (port, owner, filter) = match (self.owner, self.listen) {
            (Some(owner), Some(filter)) => (self.port, owner, filter),
            _ => return,
        };
        self.open_passive(port, filter, owner, now, config);
    }

    /// The ISN for a tuple, moved past a recent incarnation of the same tuple.
    pub(crate) fn past_incarnation(&self, tuple: FourTuple, isn: SeqNumber, now: Instant)
        -> SeqNumber
    {
        match self.last {
            Some(last) if last.tuple == tuple && now < last.until && !(isn > last.snd_max) =>
                last.snd_max + REINCARNATION_GAP,
            _ => isn,
        }
    }

    /// Whether the slot is free and holds no unexpired quiet period.
    pub(crate) fn is_fresh(&self, now: Instant) -> bool {
        !self.in_use && self.last.map_or(true, |last| last.until <= now)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.in_use && self.state != State::Closed
    }

    /// The first sequence number occupied by data.
    pub(crate) fn data_start(&self) -> SeqNumber {
        if self.snd_una == self.iss { self.iss + 1 } else { self.snd_una }
    }

    pub(crate) fn fin_sent(&self) -> bool {
        self.fin_seq.map_or(false, |fin| self.snd_max > fin)
    }

    pub(crate) fn fin_acked(&self) -> bool {
        self.fin_seq.map_or(false, |fin| self.snd_una > fin)
    }

    pub(crate) fn queued(&self) -> usize {
        self.send_data.as_ref().map_or(0, Chain::len)
    }

    pub(crate) fn unread(&self) -> usize {
        self.rcvd_data.as_ref().map_or(0, Chain::len)
    }

    /// Live and holding buffers a reclaim could free.
    pub(crate) fn holds_data(&self) -> bool {
        self.is_live() && (self.queued() > 0 || self.unread() > 0)
    }

    /// Payload bytes per segment on the current path.
    pub(crate) fn seg_size(&self) -> usize {
        let path = self.mtu.saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN);
        cmp::min(self.mss, path).max(1)
    }

    /// The MSS we offer, from the largest MTU we try.
    pub(crate) fn offered_mss(&self, config: &Config) -> u16 {
        let mss = config.max_mtu.saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN);
        cmp::min(mss, usize::from(u16::max_value())) as u16
    }

    /// Take the peer's MSS option into account.
    pub(crate) fn negotiate_mss(&mut self, offered: Option<u16>, config: &Config) {
        self.mss = match offered {
            Some(mss) if mss > 0 => usize::from(mss),
            _ => config.default_mss,
        };
        self.cwnd = 2 * self.mss;
        self.cinc = self.mss * self.mss / config.send_buffer.max(1) + 1;
    }

    /// The window to advertise.
    pub(crate) fn window(&self, config: &Config) -> u16 {
        let window = match self.state {
            State::SynSent => config.recv_window,
            _ => span(self.rcv_nxt, self.rcv_hi),
        };
        cmp::min(window, usize::from(u16::max_value())) as u16
    }

    /// Start the receive sequence space at the peer's SYN.
    pub(crate) fn synchronize(&mut self, repr: &TcpRepr, config: &Config) {
        self.irs = repr.seq_number;
        self.rcv_nxt = self.irs + 1;
        self.rcv_lo = self.rcv_nxt;
        self.rcv_up = self.rcv_nxt;
        self.rcv_hi = self.rcv_lo + config.recv_window;
        self.snd_wnd = usize::from(repr.window_len);
        self.snd_wl1 = repr.seq_number;
        self.negotiate_mss(repr.max_seg_size, config);
        self.cap_window();
    }

    /// Move the right window edge after the client consumed data.
    pub(crate) fn open_window(&mut self, config: &Config) {
        let extra = if self.rcv_up > self.rcv_lo { config.urgent_window } else { 0 };
        let hi = self.rcv_lo + (config.recv_window + extra);
        if hi > self.rcv_hi {
            let before = span(self.rcv_nxt, self.rcv_hi);
            self.rcv_hi = hi;
            let after = span(self.rcv_nxt, hi);
            if after - before >= cmp::min(self.mss, config.recv_window / 2).max(1) {
                self.send_ack = true;
            }
        }
    }

    /// Hand out up to `max` received bytes.
    ///
    /// Pending urgent data has to be read in urgent mode, and urgent mode only reads urgent data.
    pub(crate) fn take(&mut self, max: usize, urgent_mode: bool, config: &Config) -> Delivery {
        if self.state == State::Closed {
            if let Some(error) = self.error {
                return Delivery::Failed(error);
            }
        }

        let urgent = self.rcv_up > self.rcv_lo;
        if urgent && !urgent_mode {
            return Delivery::Failed(Error::Urgent);
        }
        if !urgent && urgent_mode {
            return Delivery::Failed(Error::NoUrgent);
        }

        let available = self.unread();
        if available == 0 {
            return if self.fin_received {
                Delivery::Eof
            } else if self.state == State::Closed {
                Delivery::Failed(self.error.unwrap_or(Error::NotConnected))
            } else {
                Delivery::Wait
            };
        }

        let limit = if urgent { cmp::min(max, span(self.rcv_lo, self.rcv_up)) } else { max };
        let count = cmp::min(limit, available);
        if count == 0 {
            return Delivery::Wait;
        }

        let data = match self.rcvd_data.take() {
            Some(data) => data,
            None => return Delivery::Wait,
        };
        let chunk = if count == available {
            data
        } else {
            let chunk = data.cut(0, count);
            self.rcvd_data = Some(data.delete_head(count));
            chunk
        };
        self.rcv_lo += count;
        self.open_window(config);
        Delivery::Data(chunk)
    }

    /// Append client data to the send queue as far as the send buffer allows.
    ///
    /// Returns the number of bytes taken and what is left of `data`.
    pub(crate) fn queue(&mut self, data: Chain, urgent: bool, config: &Config)
        -> (usize, Option<Chain>)
    {
        let room = config.send_buffer.saturating_sub(self.queued());
        let total = data.len();
        let count = cmp::min(room, total);
        if count == 0 {
            return (0, if total == 0 { None } else { Some(data) });
        }

        let (head, rest) = if count == total {
            (data, None)
        } else {
            let head = data.cut(0, count);
            (head, Some(data.delete_head(count)))
        };
        self.send_data = Some(match self.send_data.take() {
            Some(queued) => queued.append(head),
            None => head,
        });
        self.snd_nxt += count;
        if urgent {
            self.snd_up = self.snd_nxt;
        }
        (count, rest)
    }

    /// Queue a FIN behind all data.
    pub(crate) fn shutdown(&mut self) -> Result<(), Error> {
        match self.state {
            State::Established => {
                self.fin_seq = Some(self.snd_nxt);
                self.state = State::Closing;
                net_debug!("tcp {}: shutdown, fin at {}", self.tuple, self.snd_nxt);
                Ok(())
            },
            State::Closing => Ok(()),
            State::Closed => Err(self.error.unwrap_or(Error::NotConnected)),
            _ => Err(Error::NotConnected),
        }
    }

    /// Mark all queued data as pushed.
    pub(crate) fn push(&mut self) {
        self.snd_psh = self.snd_nxt;
    }

    /// Close once both directions are done, or the client no longer cares about ours.
    pub(crate) fn check_finished(&mut self, now: Instant, config: &Config) {
        if self.state == State::Closing && self.fin_acked()
            && (self.fin_received || self.owner.is_none())
        {
            self.close(None, now, config);
        }
    }

    /// Enter `Closed`, dropping everything that can not be delivered anymore.
    pub(crate) fn close(&mut self, error: Option<Error>, now: Instant, config: &Config) {
        if self.state == State::Closed {
            return;
        }
        match error {
            Some(error) => net_debug!("tcp {}: closed in {}: {}", self.tuple, self.state, error),
            None => net_debug!("tcp {}: closed in {}", self.tuple, self.state),
        }

        if self.state != State::Listen && self.snd_max != self.iss {
            self.last = Some(Incarnation {
                tuple: self.tuple,
                snd_max: self.snd_max,
                until: now + config.quiet_period,
            });
        }
        self.state = State::Closed;
        self.error = error;
        self.send_data = None;
        self.frag2send = None;
        self.reordered = None;
        if error.is_some() || self.owner.is_none() {
            self.rcvd_data = None;
        }
        self.rt_at = None;
        self.rt_sample = None;
        self.probe_at = None;
        self.stt = None;
        if error.is_some() {
            self.send_ack = false;
        }
    }

    /// Return the slot to the table.
    pub(crate) fn release(&mut self) {
        let last = self.last.take();
        *self = Connection::vacant();
        self.last = last;
    }

    /// Process an acknowledgement of new data, `snd_una < ack <= snd_max`.
    pub(crate) fn acknowledge(&mut self, ack: SeqNumber, now: Instant, config: &Config) {
        let mut data_acked = ack - self.snd_una;
        if self.snd_una == self.iss {
            // The SYN.
            data_acked -= 1;
        }
        if let Some(fin) = self.fin_seq {
            if ack > fin {
                data_acked -= 1;
            }
        }
        if data_acked > 0 {
            if let Some(data) = self.send_data.take() {
                let len = data.len();
                if data_acked < len {
                    self.send_data = Some(data.delete_head(data_acked));
                }
            }
        }

        self.snd_una = ack;
        if self.snd_trm < ack {
            self.snd_trm = ack;
        }
        if self.snd_up < ack {
            self.snd_up = ack;
        }
        if self.snd_psh < ack {
            self.snd_psh = ack;
        }
        self.dupacks = 0;

        if let Some((seq, sent)) = self.rt_sample {
            if ack >= seq {
                self.rt_sample = None;
                self.sample_rtt(now.saturating_since(sent), config);
            }
        }

        self.grow_window();

        if self.snd_una == self.snd_max {
            self.rt_at = None;
            self.stt = None;
        } else {
            self.rt_at = Some(now + self.rto);
            self.stt = Some(now);
        }
    }

    /// Update the estimators from an unambiguous round trip sample (RFC 6298).
    fn sample_rtt(&mut self, rtt: Duration, config: &Config) {
        let rtt = rtt.as_millis() as u64;
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            },
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (3 * self.rttvar + delta) / 4;
                self.srtt = Some((7 * srtt + rtt) / 8);
            },
        }
        let srtt = self.srtt.unwrap_or(rtt);
        let rto = Duration::from_millis(srtt + cmp::max(4 * self.rttvar, 1));
        self.rto = cmp::min(cmp::max(rto, config.min_rto), config.max_rto);
        net_trace!("tcp {}: rtt {}ms, srtt {}ms, rto {:?}", self.tuple, rtt, srtt, self.rto);
    }

    /// Slow start below the threshold, small linear steps of the threshold above it.
    fn grow_window(&mut self) {
        if self.cwnd < self.ssthresh {
            self.cwnd = cmp::min(self.cwnd + self.mss, self.ssthresh);
        } else {
            self.ssthresh = cmp::min(self.ssthresh + self.cinc, 1 << 30);
            self.cwnd = self.ssthresh;
        }
        self.cap_window();
    }

    /// The congestion window never exceeds the peer's window, but never drops below a segment.
    pub(crate) fn cap_window(&mut self) {
        let cap = cmp::max(self.snd_wnd, self.mss);
        if self.cwnd > cap {
            self.cwnd = cap;
        }
    }

    /// Count a duplicate acknowledgement, retransmitting fast on the third.
    pub(crate) fn duplicate_ack(&mut self) {
        self.dupacks = self.dupacks.saturating_add(1);
        if self.dupacks == 3 {
            let flight = cmp::min(self.cwnd, self.ssthresh);
            self.ssthresh = cmp::max(flight / 2, 2 * self.mss);
            self.cwnd = self.ssthresh;
            self.cap_window();
            self.snd_trm = self.snd_una;
            self.rt_sample = None;
            net_debug!("tcp {}: fast retransmit from {}, ssthresh {}",
                self.tuple, self.snd_una, self.ssthresh);
        }
    }

    /// Arm or disarm the zero window probe.
    pub(crate) fn update_probe(&mut self, now: Instant, config: &Config) {
        let waiting = self.data_start() < self.snd_nxt && self.state.is_synchronized();
        if self.snd_wnd == 0 && waiting {
            if self.probe_at.is_none() {
                self.probe_at = Some(now + self.probe_interval);
            }
        } else {
            self.probe_at = None;
            self.probe_due = false;
            self.probe_interval = config.probe_min;
        }
    }

    fn dead_after(&self, config: &Config) -> Duration {
        match self.state {
            State::SynSent => config.connect_timeout,
            State::SynReceived => config.handshake_timeout,
            State::Closing => config.closing_timeout,
            _ => config.established_timeout,
        }
    }

    /// The next moment the connection needs its timer.
    pub(crate) fn deadline(&self, config: &Config) -> Option<Instant> {
        if !self.in_use {
            return None;
        }
        match self.state {
            State::Closed | State::Listen => return None,
            _ => (),
        }
        let dead = self.stt.map(|start| start + self.dead_after(config));
        [self.rt_at, self.probe_at, dead].iter()
            .filter_map(|at| *at)
            .min()
    }

    /// Handle an expired timer. Returns the error to close with when the peer is gone.
    pub(crate) fn on_timer(&mut self, now: Instant, config: &Config) -> Option<Error> {
        if !self.in_use {
            return None;
        }
        match self.state {
            State::Closed | State::Listen => return None,
            _ => (),
        }

        if let Some(start) = self.stt {
            if now >= start + self.dead_after(config) {
                return Some(Error::TimedOut);
            }
        }

        if let Some(at) = self.probe_at {
            if now >= at {
                self.probe_due = true;
                self.probe_interval = cmp::min(self.probe_interval * 2, config.probe_max);
                self.probe_at = Some(now + self.probe_interval);
                net_trace!("tcp {}: zero window probe, next in {:?}", self.tuple, self.probe_interval);
            }
        }

        if let Some(at) = self.rt_at {
            if now >= at {
                self.retransmit_timeout(now, config);
            }
        }
        None
    }

    fn retransmit_timeout(&mut self, now: Instant, config: &Config) {
        if self.snd_una == self.snd_max {
            self.rt_at = None;
            return;
        }

        self.rto = cmp::min(self.rto * 2, config.max_rto);
        self.rt_at = Some(now + self.rto);
        self.rt_sample = None;
        self.ssthresh = cmp::max(self.cwnd / 2, 2 * self.mss);
        self.cwnd = self.mss;
        self.dupacks = 0;
        self.snd_trm = self.snd_una;
        net_debug!("tcp {}: retransmit from {}, rto {:?}", self.tuple, self.snd_una, self.rto);

        let stalled = self.stt.map_or(false, |start| now.saturating_since(start) >= config.blackhole);
        if self.dont_fragment && stalled && self.mtu > Config::MIN_MTU {
            self.mtu = Config::MIN_MTU;
            self.dont_fragment = false;
            self.df_at = Some(now + config.df_reenable);
            net_debug!("tcp {}: path mtu black hole, mtu {} without df", self.tuple, self.mtu);
        }
    }

    /// Grow the path MTU again after a quiet interval, and end a black hole fallback.
    pub(crate) fn pmtu_tick(&mut self, now: Instant, config: &Config) {
        if !self.dont_fragment {
            if self.df_at.map_or(false, |at| now >= at) {
                self.dont_fragment = true;
                self.df_at = None;
                self.mtu_time = now;
            }
            return;
        }

        if self.mtu < config.max_mtu && now >= self.mtu_time + config.pmtu_interval {
            let step = cmp::max(self.mtu / config.pmtu_fraction.max(1), 1);
            self.mtu = cmp::min(self.mtu + step, config.max_mtu);
            self.mtu_time = now;
            net_trace!("tcp {}: trying path mtu {}", self.tuple, self.mtu);
        }
    }

    /// Shrink the path MTU after a too-big report. Returns whether it changed.
    pub(crate) fn too_big(&mut self, reported: Option<u16>, now: Instant) -> bool {
        let reported = reported.map(usize::from).filter(|&mtu| mtu < self.mtu);
        let next = match reported {
            Some(mtu) => mtu,
            None => PLATEAUS.iter()
                .cloned()
                .find(|&plateau| plateau < self.mtu)
                .unwrap_or(Config::MIN_MTU),
        };
        let next = cmp::max(next, Config::MIN_MTU);
        if next >= self.mtu {
            return false;
        }

        net_debug!("tcp {}: path mtu {} -> {}", self.tuple, self.mtu, next);
        self.mtu = next;
        self.mtu_time = now;
        self.snd_trm = self.snd_una;
        self.rt_sample = None;
        true
    }

    /// A router could not deliver our segments. Try with a larger time to live.
    ///
    /// Returns the error to close with once that is exhausted during the handshake.
    pub(crate) fn unreachable(&mut self, config: &Config) -> Option<Error> {
        if self.ttl == MAX_TTL {
            return match self.state {
                State::SynSent => Some(Error::HostUnreachable),
                _ => None,
            };
        }
        self.ttl = if self.ttl == config.default_ttl {
            config.ttl_next
        } else {
            cmp::min(u16::from(self.ttl) * 2, u16::from(MAX_TTL)) as u8
        };
        net_debug!("tcp {}: unreachable, ttl now {}", self.tuple, self.ttl);
        self.stt = None;
        self.snd_trm = self.snd_una;
        None
    }

    pub(crate) fn send_info(&self) -> SendInfo {
        SendInfo {
            src: self.tuple.local_addr,
            dst: self.tuple.remote_addr,
            protocol: IpProtocol::Tcp,
            ttl: self.ttl,
            tos: self.tos,
            dont_fragment: self.dont_fragment,
        }
    }

    /// A reset for the current connection.
    pub(crate) fn reset(&self) -> Reset {
        Reset {
            tuple: self.tuple,
            seq: self.snd_max.later(self.snd_trm),
            ack: None,
        }
    }
}

impl Reset {
    /// The reset answering `repr` when there is no connection to take it.
    pub(crate) fn refusing(tuple: FourTuple, repr: &TcpRepr) -> Self {
        match repr.ack_number {
            Some(ack) => Reset { tuple, seq: ack, ack: None },
            None => Reset {
                tuple,
                seq: SeqNumber(0),
                ack: Some(repr.seq_number + repr.sequence_len()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Ipv4Address, TcpFlags};

    fn established(config: &Config) -> Connection {
        let tuple = FourTuple {
            local_addr: Ipv4Address::new(10, 0, 0, 1),
            local_port: 1000,
            remote_addr: Ipv4Address::new(10, 0, 0, 2),
            remote_port: 2000,
        };
        let mut conn = Connection::vacant();
        let now = Instant::from_millis(0);
        conn.open_active(0, tuple, Handle(0), SeqNumber(1000), now, config);
        conn.state = State::Established;
        conn.snd_una = SeqNumber(1001);
        conn.snd_trm = SeqNumber(1001);
        conn.snd_max = SeqNumber(1001);
        conn.mss = 500;
        conn.cwnd = 1000;
        conn.snd_wnd = 4000;
        conn
    }

    #[test]
    fn slow_start_is_capped_by_window() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.ssthresh = 100_000;
        let mut ack = conn.snd_una;
        for _ in 0..20 {
            conn.snd_max = ack + 100;
            ack += 100;
            conn.acknowledge(ack, Instant::from_millis(10), &config);
            assert!(conn.cwnd <= conn.snd_wnd);
        }
        assert_eq!(conn.cwnd, 4000);
    }

    #[test]
    fn threshold_grows_linearly() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.ssthresh = 1200;
        conn.snd_max = conn.snd_una + 300;
        conn.acknowledge(conn.snd_una + 100, Instant::from_millis(1), &config);
        assert_eq!(conn.cwnd, 1200);
        conn.acknowledge(conn.snd_una + 100, Instant::from_millis(2), &config);
        assert!(conn.ssthresh > 1200 && conn.ssthresh < 1300);
        assert_eq!(conn.cwnd, conn.ssthresh);
    }

    #[test]
    fn third_duplicate_rewinds() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.snd_trm = conn.snd_una + 800;
        conn.snd_max = conn.snd_trm;
        conn.ssthresh = 3000;
        conn.cwnd = 3000;
        conn.duplicate_ack();
        conn.duplicate_ack();
        assert_eq!(conn.snd_trm, conn.snd_una + 800);
        conn.duplicate_ack();
        assert_eq!(conn.snd_trm, conn.snd_una);
        assert_eq!(conn.ssthresh, 1500);
        assert_eq!(conn.cwnd, 1500);
    }

    #[test]
    fn rto_follows_samples_and_backs_off() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.sample_rtt(Duration::from_millis(100), &config);
        assert_eq!(conn.rto, Duration::from_millis(300));

        conn.snd_max = conn.snd_una + 10;
        conn.retransmit_timeout(Instant::from_millis(500), &config);
        assert_eq!(conn.rto, Duration::from_millis(600));
        assert_eq!(conn.cwnd, conn.mss);
        for _ in 0..10 {
            conn.retransmit_timeout(Instant::from_millis(500), &config);
        }
        assert_eq!(conn.rto, config.max_rto);
    }

    #[test]
    fn rtt_estimator_smooths_samples() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.sample_rtt(Duration::from_millis(100), &config);
        assert_eq!((conn.srtt, conn.rttvar), (Some(100), 50));
        assert_eq!(conn.rto, Duration::from_millis(300));

        conn.sample_rtt(Duration::from_millis(200), &config);
        assert_eq!((conn.srtt, conn.rttvar), (Some(112), 62));
        assert_eq!(conn.rto, Duration::from_millis(112 + 4 * 62));
    }

    #[test]
    fn retransmitted_segment_gives_no_sample() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.sent(SeqNumber(1001), 100, Instant::from_millis(0));
        assert_eq!(conn.rt_sample, Some((SeqNumber(1101), Instant::from_millis(0))));

        conn.snd_trm = conn.snd_una;
        conn.sent(SeqNumber(1001), 100, Instant::from_millis(1000));
        assert_eq!(conn.rt_sample, None);
        conn.acknowledge(SeqNumber(1101), Instant::from_millis(1010), &config);
        assert_eq!(conn.srtt, None);
        assert_eq!(conn.rto, config.initial_rto);

        // New data is timed again.
        conn.sent(SeqNumber(1101), 100, Instant::from_millis(1010));
        conn.acknowledge(SeqNumber(1201), Instant::from_millis(1050), &config);
        assert_eq!(conn.srtt, Some(40));
    }

    #[test]
    fn rto_is_clamped() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.sample_rtt(Duration::from_millis(10), &config);
        assert_eq!(conn.rto, config.min_rto);

        let mut conn = established(&config);
        conn.sample_rtt(Duration::from_secs(100), &config);
        assert_eq!(conn.srtt, Some(100_000));
        assert_eq!(conn.rto, config.max_rto);
    }

    #[test]
    fn handshake_window_caps_initial_cwnd() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.state = State::Listen;
        let syn = TcpRepr {
            src_port: 2000,
            dst_port: 1000,
            flags: TcpFlags::SYN,
            seq_number: SeqNumber(7000),
            ack_number: None,
            window_len: 700,
            urgent_at: 0,
            max_seg_size: Some(500),
            payload_len: 0,
        };
        conn.accept_syn(conn.tuple, &syn, SeqNumber(1000), &config);
        assert_eq!(conn.mss, 500);
        assert_eq!(conn.cwnd, 700);

        let tiny = TcpRepr { window_len: 100, ..syn };
        conn.accept_syn(conn.tuple, &tiny, SeqNumber(1000), &config);
        assert_eq!(conn.cwnd, 500);
    }

    #[test]
    fn path_mtu_shrinks_and_grows() {
        let config = Config::default();
        let mut conn = established(&config);
        assert_eq!(conn.seg_size(), 500);
        assert!(conn.too_big(None, Instant::from_millis(0)));
        assert_eq!(conn.mtu, 1492);
        assert!(conn.too_big(Some(1000), Instant::from_millis(0)));
        assert_eq!(conn.mtu, 1000);
        // Not below the current value, so the next plateau is tried instead.
        assert!(conn.too_big(Some(1200), Instant::from_millis(0)));
        assert_eq!(conn.mtu, Config::MIN_MTU);
        assert!(!conn.too_big(Some(100), Instant::from_millis(0)));

        conn.pmtu_tick(Instant::from_secs(30), &config);
        assert_eq!(conn.mtu, Config::MIN_MTU);
        conn.pmtu_tick(Instant::from_secs(61), &config);
        assert_eq!(conn.mtu, Config::MIN_MTU + 5);
    }

    #[test]
    fn ttl_escalates_until_unreachable() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.state = State::SynSent;
        assert_eq!(conn.unreachable(&config), None);
        assert_eq!(conn.ttl, config.ttl_next);
        let mut rounds = 0;
        while conn.unreachable(&config).is_none() {
            rounds += 1;
            assert!(rounds < 10);
        }
        assert_eq!(conn.ttl, MAX_TTL);
    }
}
