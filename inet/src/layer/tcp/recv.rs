use super::connection::{span, Connection, Reordered, Reset};
use super::endpoint::Endpoint;
use super::{Config, FourTuple, PortId, State};
use crate::buf::Chain;
use crate::layer::Error;
use crate::layer::ip::{Arrival, IpLayer};
use crate::time::Instant;
use crate::wire::{checksum, IpProtocol, TcpPacket, TcpRepr, TcpSeqNumber as SeqNumber};
use crate::wire::TCP_HEADER_LEN;

impl Connection {
    /// Whether a segment of `len` sequence numbers at `seq` falls into the receive window.
    pub(crate) fn acceptable(&self, seq: SeqNumber, len: usize, urgent: bool) -> bool {
        let mut window = span(self.rcv_nxt, self.rcv_hi);
        if urgent {
            window += 1;
        }
        let within = |seq: SeqNumber| seq >= self.rcv_nxt && seq < self.rcv_nxt + window;

        match (len, window) {
            (0, 0) => seq == self.rcv_nxt,
            (0, _) => within(seq),
            (_, 0) => false,
            (_, _) => {
                let last = seq + (len - 1);
                within(seq) || within(last) || (seq < self.rcv_nxt && last >= self.rcv_nxt + window)
            },
        }
    }

    /// A SYN arrived for this listening connection.
    pub(crate) fn accept_syn(&mut self, tuple: FourTuple, repr: &TcpRepr, iss: SeqNumber,
        config: &Config)
    {
        self.tuple = tuple;
        self.reset_send(iss);
        self.synchronize(repr, config);
        self.state = State::SynReceived;
        net_debug!("tcp {}: syn received at {}, iss {}, mss {}", tuple, repr.seq_number, iss, self.mss);
    }

    /// A segment for a connection waiting for the answer to its SYN.
    pub(crate) fn syn_sent(&mut self, repr: &TcpRepr, payload: Chain, now: Instant, config: &Config)
        -> Option<Reset>
    {
        let acked = repr.ack_number.map(|ack| (ack, ack > self.iss && !(ack > self.snd_max)));
        if let Some((ack, false)) = acked {
            if repr.flags.rst() {
                return None;
            }
            return Some(Reset { tuple: self.tuple, seq: ack, ack: None });
        }

        if repr.flags.rst() {
            if acked.is_some() {
                self.close(Some(Error::ConnRefused), now, config);
            }
            return None;
        }
        if !repr.flags.syn() {
            return None;
        }

        self.synchronize(repr, config);
        match acked {
            Some((ack, _)) => {
                self.acknowledge(ack, now, config);
                self.snd_wl2 = ack;
                self.state = State::Established;
                self.send_ack = true;
                net_debug!("tcp {}: established, mss {}", self.tuple, self.mss);
                if repr.payload_len > 0 || repr.flags.fin() {
                    self.receive_data(repr.seq_number + 1, payload, repr.flags.fin(), config);
                }
            },
            None => {
                // Simultaneous open, our SYN goes out again with an ACK.
                self.state = State::SynReceived;
                self.snd_trm = self.iss;
                net_debug!("tcp {}: simultaneous open", self.tuple);
            },
        }
        None
    }

    /// A segment for a synchronized connection, or one that waits for the ACK of its SYN.
    pub(crate) fn process(&mut self, repr: &TcpRepr, payload: Chain, now: Instant, config: &Config)
        -> Option<Reset>
    {
        let seq = repr.seq_number;
        if !self.acceptable(seq, repr.sequence_len(), repr.flags.urg()) {
            net_trace!("tcp {}: segment at {} outside window {}..{}",
                self.tuple, seq, self.rcv_nxt, self.rcv_hi);
            if !repr.flags.rst() {
                self.send_ack = true;
            }
            return None;
        }

        if repr.flags.rst() {
            match self.state {
                State::SynReceived if self.listen.is_some() => {
                    net_debug!("tcp {}: reset while half open, listening again", self.tuple);
                    self.relisten(now, config);
                },
                State::SynReceived => self.close(Some(Error::ConnRefused), now, config),
                _ => self.close(Some(Error::ConnReset), now, config),
            }
            return None;
        }

        if repr.flags.syn() {
            let reset = self.reset();
            self.close(Some(Error::ConnReset), now, config);
            return Some(reset);
        }

        let ack = repr.ack_number?;
        if self.state == State::SynReceived {
            if !(ack > self.snd_una && !(ack > self.snd_max)) {
                return Some(Reset { tuple: self.tuple, seq: ack, ack: None });
            }
            self.state = State::Established;
            net_debug!("tcp {}: established", self.tuple);
        }

        if ack > self.snd_max {
            net_trace!("tcp {}: ack {} for unsent data", self.tuple, ack);
            self.send_ack = true;
            return None;
        }

        let window = usize::from(repr.window_len);
        let fin = repr.flags.fin();
        if ack > self.snd_una {
            self.acknowledge(ack, now, config);
        } else if ack == self.snd_una && repr.payload_len == 0 && !fin
            && window == self.snd_wnd && self.snd_max > self.snd_una
        {
            self.duplicate_ack();
        }

        if self.snd_wl1 < seq || (self.snd_wl1 == seq && !(ack < self.snd_wl2)) {
            self.snd_wnd = window;
            self.snd_wl1 = seq;
            self.snd_wl2 = ack;
            self.cap_window();
        }

        if repr.flags.urg() {
            let extra = if self.bsd_urgent { 0 } else { 1 };
            let up = seq + (usize::from(repr.urgent_at) + extra);
            if up > self.rcv_up {
                self.rcv_up = up;
            }
        }

        if repr.payload_len > 0 || fin {
            self.receive_data(seq, payload, fin, config);
            self.send_ack = true;
        }

        self.check_finished(now, config);
        None
    }

    /// Take data and a FIN occupying the sequence space from `seq`.
    fn receive_data(&mut self, seq: SeqNumber, payload: Chain, fin: bool, config: &Config) {
        if self.fin_received {
            return;
        }
        let (mut seq, mut data, mut fin) = (seq, payload, fin);

        let room = span(seq, self.rcv_hi);
        if data.len() > room {
            data = data.cut(0, room);
            fin = false;
        }

        if seq < self.rcv_nxt {
            let old = self.rcv_nxt - seq;
            if old > data.len() || (old == data.len() && !fin) {
                return;
            }
            data = data.delete_head(old);
            seq = self.rcv_nxt;
        }

        if seq != self.rcv_nxt {
            self.store_early(seq, data, fin);
            return;
        }

        self.deliver(data, config);
        if fin {
            self.end_of_stream();
            return;
        }

        let region = match self.reordered.take() {
            Some(region) => region,
            None => return,
        };
        if region.seq > self.rcv_nxt {
            self.reordered = Some(region);
            return;
        }
        let covered = self.rcv_nxt - region.seq;
        let len = region.data.len();
        if covered < len {
            self.deliver(region.data.delete_head(covered), config);
        }
        if region.fin && covered <= len {
            self.end_of_stream();
        }
    }

    /// Keep data that arrived ahead of `rcv_nxt`, merging it with the region already held.
    ///
    /// Only a single region is kept. Early data disjoint from it is dropped.
    fn store_early(&mut self, seq: SeqNumber, data: Chain, fin: bool) {
        let region = match self.reordered.take() {
            None => {
                net_trace!("tcp {}: holding {} bytes at {} out of order", self.tuple, data.len(), seq);
                self.reordered = Some(Reordered { seq, data, fin });
                return;
            },
            Some(region) => region,
        };

        let region_end = region.seq + region.data.len();
        let end = seq + data.len();
        if seq > region_end || end < region.seq {
            net_trace!("tcp {}: dropping {} bytes at {}, disjoint from held data",
                self.tuple, data.len(), seq);
            self.reordered = Some(region);
            return;
        }

        let fin = if end > region_end {
            fin
        } else if end < region_end {
            region.fin
        } else {
            fin || region.fin
        };
        let merged = if seq < region.seq {
            if region_end > end {
                let skip = end - region.seq;
                Reordered { seq, data: data.append(region.data.delete_head(skip)), fin }
            } else {
                Reordered { seq, data, fin }
            }
        } else if end > region_end {
            let skip = region_end - seq;
            Reordered { seq: region.seq, data: region.data.append(data.delete_head(skip)), fin }
        } else {
            Reordered { fin, ..region }
        };
        self.reordered = Some(merged);
    }

    /// Append in-order data to the receive queue.
    fn deliver(&mut self, data: Chain, config: &Config) {
        let len = data.len();
        if len == 0 {
            return;
        }
        self.rcv_nxt += len;
        if self.owner.is_none() {
            // Nobody will read it.
            self.rcv_lo += len;
            self.open_window(config);
            return;
        }
        self.rcvd_data = Some(match self.rcvd_data.take() {
            Some(queued) => queued.append(data),
            None => data,
        });
    }

    fn end_of_stream(&mut self) {
        self.fin_received = true;
        self.rcv_nxt += 1;
        self.reordered = None;
        net_debug!("tcp {}: fin received", self.tuple);
    }
}

impl<I: IpLayer> Endpoint<I> {
    /// Take a datagram for the transport layer.
    ///
    /// The segment is verified and parsed in place. Its payload is cut out of the chain and handed
    /// to the connection without copying.
    pub fn receive(&mut self, port: PortId, arrival: Arrival, segment: Chain) {
        if arrival.protocol != IpProtocol::Tcp || port >= self.ports.len() {
            net_debug!("tcp: dropping {} datagram on port {}", arrival.protocol, port);
            return;
        }
        let len = segment.len();
        if len < TCP_HEADER_LEN {
            net_debug!("tcp: dropping truncated segment from {}", arrival.src);
            return;
        }
        if checksum::segment(arrival.src, arrival.dst, IpProtocol::Tcp, &segment) != !0 {
            net_debug!("tcp: dropping segment with bad checksum from {}", arrival.src);
            return;
        }

        let segment = segment.align(TCP_HEADER_LEN, 4);
        let header_len = segment.with_head(|bytes| {
            usize::from(TcpPacket::new_unchecked(bytes).header_len())
        });
        if header_len < TCP_HEADER_LEN || header_len > len {
            net_debug!("tcp: dropping segment with header length {} from {}", header_len, arrival.src);
            return;
        }
        let segment = segment.align(header_len, 4);
        let parsed = segment.with_head(|bytes| TcpRepr::parse(&TcpPacket::new_unchecked(bytes), len));
        let repr = match parsed {
            Ok(repr) => repr,
            Err(err) => {
                net_debug!("tcp: dropping segment from {}: {}", arrival.src, err);
                return;
            },
        };
        let payload = segment.delete_head(header_len);

        let tuple = FourTuple {
            local_addr: arrival.dst,
            local_port: repr.dst_port,
            remote_addr: arrival.src,
            remote_port: repr.src_port,
        };
        net_trace!("tcp {}: received {}", tuple, repr);
        self.segment_arrived(port, tuple, &repr, payload);
        self.collect_reaped();
    }

    fn segment_arrived(&mut self, port: PortId, tuple: FourTuple, repr: &TcpRepr, payload: Chain) {
        let syn = repr.flags.syn() && repr.ack_number.is_none() && !repr.flags.rst();
        let id = match self.lookup(port, tuple, syn) {
            Some(id) => id,
            None => return self.no_connection(port, tuple, repr),
        };

        let table = self.table.clone();
        let config = &table.config;
        let now = self.now;
        let state = table.conns[id].borrow().state;
        let reset = match state {
            State::Listen => {
                if repr.flags.rst() {
                    return;
                }
                if let Some(ack) = repr.ack_number {
                    self.send_reset(port, Reset { tuple, seq: ack, ack: None });
                    return;
                }
                if !repr.flags.syn() {
                    return;
                }
                let iss = self.initial_seq(tuple);
                table.conns[id].borrow_mut().accept_syn(tuple, repr, iss, config);
                None
            },
            State::SynSent => table.conns[id].borrow_mut().syn_sent(repr, payload, now, config),
            _ => table.conns[id].borrow_mut().process(repr, payload, now, config),
        };

        if let Some(reset) = reset {
            self.send_reset(port, reset);
        }
        self.wake(id);
    }

    /// Answer a segment that matches no connection.
    fn no_connection(&mut self, port: PortId, tuple: FourTuple, repr: &TcpRepr) {
        if repr.flags.rst() {
            return;
        }
        if repr.flags.syn() && repr.ack_number.is_none() && self.delays_reset(port, tuple.local_port) {
            net_debug!("tcp {}: no listener yet, holding back reset", tuple);
            return;
        }
        net_trace!("tcp {}: no connection, refusing", tuple);
        self.send_reset(port, Reset::refusing(tuple, repr));
    }
}
