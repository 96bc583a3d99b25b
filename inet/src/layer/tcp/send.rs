use core::cmp;

use super::connection::{span, Connection, Reset};
use super::endpoint::Endpoint;
use super::{Config, ConnId, PortId, State};
use crate::buf::{Chain, Pool};
use crate::layer::Error;
use crate::layer::ip::{IpLayer, SendError, SendInfo};
use crate::time::Instant;
use crate::wire::{checksum, IpProtocol, TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber as SeqNumber};

/// A segment chosen for transmission, before its header is built.
pub(crate) struct Outgoing {
    pub(crate) info: SendInfo,
    pub(crate) repr: TcpRepr,
    pub(crate) payload: Option<Chain>,
}

/// Put a header in front of `payload`.
///
/// The checksum is computed before the payload is linked behind the header, the payload itself is
/// never written and stays shared with the send queue.
pub(crate) fn build_segment(pool: &Pool, info: &SendInfo, repr: &TcpRepr, payload: Option<Chain>)
    -> Chain
{
    let header_len = repr.header_len();
    let mut header = pool.alloc(header_len).pack();
    header.with_head_mut(|bytes| {
        let bytes = &mut bytes[..header_len];
        for byte in bytes.iter_mut() {
            *byte = 0;
        }
        repr.emit(&mut TcpPacket::new_unchecked(bytes));
    });

    let total = header_len + payload.as_ref().map_or(0, Chain::len);
    let sum = checksum::combine(&[
        checksum::pseudo_header(info.src, info.dst, IpProtocol::Tcp, total as u32),
        checksum::chain(&header),
        payload.as_ref().map_or(0, checksum::chain),
    ]);
    header.with_head_mut(|bytes| TcpPacket::new_unchecked(bytes).set_checksum(!sum));

    match payload {
        Some(payload) => header.append(payload),
        None => header,
    }
}

impl Connection {
    /// Choose the next segment to send, if there is anything to send right now.
    ///
    /// The sendable range starts at `snd_trm` and is bounded by the queued data, the peer's window,
    /// the congestion window and one segment on the current path.
    pub(crate) fn next_segment(&mut self, now: Instant, config: &Config) -> Option<Outgoing> {
        if !self.in_use {
            return None;
        }
        match self.state {
            State::Listen => return None,
            State::Closed => return self.final_ack(config),
            State::SynSent | State::SynReceived => return self.next_handshake(now, config),
            State::Established | State::Closing => (),
        }

        let mut seq = self.snd_trm;
        let data_end = self.snd_nxt;
        let window_end = self.snd_una + cmp::min(self.snd_wnd, self.cwnd);

        let mut len = if data_end > seq {
            cmp::min(span(seq, window_end.earlier(data_end)), self.seg_size())
        } else {
            0
        };
        // Probes repeat the first unacknowledged byte.
        let probe = len == 0 && self.probe_due && self.snd_wnd == 0 && data_end > self.data_start();
        if probe {
            seq = self.data_start();
            len = 1;
        }

        let end = seq + len;
        let fin = self.fin_seq == Some(end);
        if len == 0 && !fin && !self.send_ack {
            return None;
        }

        let mut flags = TcpFlags::default();
        flags.set_fin(fin);
        if len > 0 && ((self.snd_psh > seq && !(self.snd_psh > end)) || end == data_end) {
            flags.set_psh(true);
        }
        let mut urgent_at = 0;
        if self.snd_up > seq {
            flags.set_urg(true);
            let up = cmp::min(self.snd_up - seq, usize::from(u16::max_value()));
            urgent_at = (if self.bsd_urgent { up } else { up - 1 }) as u16;
        }

        let payload = if len > 0 {
            let offset = seq - self.data_start();
            self.send_data.as_ref().map(|data| data.cut(offset, len))
        } else {
            None
        };

        let repr = TcpRepr {
            src_port: self.tuple.local_port,
            dst_port: self.tuple.remote_port,
            flags,
            seq_number: seq,
            ack_number: Some(self.rcv_nxt),
            window_len: self.window(config),
            urgent_at,
            max_seg_size: None,
            payload_len: payload.as_ref().map_or(0, Chain::len),
        };

        if probe {
            net_trace!("tcp {}: probing zero window at {}", self.tuple, seq);
            self.probe_due = false;
        }
        self.sent(seq, repr.sequence_len(), now);
        Some(Outgoing { info: self.send_info(), repr, payload })
    }

    /// Our SYN, or SYN+ACK, while the handshake is incomplete.
    fn next_handshake(&mut self, now: Instant, config: &Config) -> Option<Outgoing> {
        let synack = self.state == State::SynReceived;
        if synack && self.send_ack {
            self.snd_trm = self.iss;
        }
        if self.snd_trm != self.iss {
            return None;
        }

        let repr = TcpRepr {
            src_port: self.tuple.local_port,
            dst_port: self.tuple.remote_port,
            flags: TcpFlags::SYN,
            seq_number: self.iss,
            ack_number: if synack { Some(self.rcv_nxt) } else { None },
            window_len: self.window(config),
            urgent_at: 0,
            max_seg_size: Some(self.offered_mss(config)),
            payload_len: 0,
        };
        self.sent(self.iss, 1, now);
        Some(Outgoing { info: self.send_info(), repr, payload: None })
    }

    /// Acknowledge the peer's FIN after a graceful close.
    fn final_ack(&mut self, config: &Config) -> Option<Outgoing> {
        if !self.send_ack || self.error.is_some() {
            return None;
        }
        self.send_ack = false;
        let repr = TcpRepr {
            src_port: self.tuple.local_port,
            dst_port: self.tuple.remote_port,
            flags: TcpFlags::default(),
            seq_number: self.snd_max,
            ack_number: Some(self.rcv_nxt),
            window_len: self.window(config),
            urgent_at: 0,
            max_seg_size: None,
            payload_len: 0,
        };
        Some(Outgoing { info: self.send_info(), repr, payload: None })
    }

    /// Account for a segment covering `len` sequence numbers from `seq`.
    pub(crate) fn sent(&mut self, seq: SeqNumber, len: usize, now: Instant) {
        self.send_ack = false;
        if len == 0 {
            return;
        }

        let end = seq + len;
        if seq < self.snd_max {
            // Karn: a retransmission makes the pending sample ambiguous.
            self.rt_sample = None;
        } else if self.rt_sample.is_none() {
            self.rt_sample = Some((end, now));
        }
        if end > self.snd_max {
            self.snd_max = end;
        }
        if end > self.snd_trm {
            self.snd_trm = end;
        }
        if self.rt_at.is_none() {
            self.rt_at = Some(now + self.rto);
        }
        if self.stt.is_none() {
            self.stt = Some(now);
        }
    }
}

impl<I: IpLayer> Endpoint<I> {
    /// Send whatever the connection has to send, then rearm its timer.
    pub(crate) fn transmit(&mut self, id: ConnId) {
        let table = self.table.clone();
        let config = &table.config;
        let now = self.now;
        let port = table.conns[id].borrow().port;

        if self.ports.get(port).map_or(true, |port| port.blocked) {
            if let Some(port) = self.ports.get_mut(port) {
                port.output.enqueue(id);
            }
            self.rearm(id);
            return;
        }

        let held = table.conns[id].borrow_mut().frag2send.take();
        if let Some((info, segment)) = held {
            if let Err(err) = self.ports[port].ip.send(info, segment) {
                if self.send_failed(id, port, info, err) {
                    self.rearm(id);
                    return;
                }
            }
        }

        loop {
            let outgoing = table.conns[id].borrow_mut().next_segment(now, config);
            let Outgoing { info, repr, payload } = match outgoing {
                Some(outgoing) => outgoing,
                None => break,
            };
            net_trace!("tcp {}: sending {}", table.conns[id].borrow().tuple, repr);
            let segment = build_segment(&self.pool, &info, &repr, payload);
            if let Err(err) = self.ports[port].ip.send(info, segment) {
                if self.send_failed(id, port, info, err) {
                    break;
                }
            }
        }

        table.conns[id].borrow_mut().update_probe(now, config);
        self.rearm(id);
    }

    /// Translate a refused send into connection state. Returns whether to stop sending.
    fn send_failed(&mut self, id: ConnId, port: PortId, info: SendInfo, err: SendError) -> bool {
        let table = self.table.clone();
        let config = &table.config;
        let now = self.now;
        let mut conn = table.conns[id].borrow_mut();

        let err = match err {
            SendError::WouldBlock(segment) => {
                conn.frag2send = Some((info, segment));
                let port = &mut self.ports[port];
                port.blocked = true;
                port.output.enqueue(id);
                return true;
            },
            other => other,
        };

        let closed = match err {
            SendError::WouldBlock(_) => None,
            SendError::TooBig { mtu } => {
                if conn.too_big(mtu, now) {
                    return false;
                }
                None
            },
            SendError::Unreachable => conn.unreachable(config).map(|error| {
                conn.close(Some(error), now, config);
            }),
            SendError::NoRoute => match conn.state {
                State::SynSent => {
                    conn.close(Some(Error::NetUnreachable), now, config);
                    Some(())
                },
                _ => None,
            },
        };

        net_debug!("tcp {}: send failed: {}", conn.tuple, err);
        drop(conn);
        if closed.is_some() {
            self.wake(id);
        }
        true
    }

    /// Send a reset through the port's reset slot.
    ///
    /// While the port is blocked one reset is held back, later ones are dropped.
    pub(crate) fn send_reset(&mut self, port: PortId, reset: Reset) {
        let config = &self.table.config;
        let repr = TcpRepr {
            src_port: reset.tuple.local_port,
            dst_port: reset.tuple.remote_port,
            flags: TcpFlags::RST,
            seq_number: reset.seq,
            ack_number: reset.ack,
            window_len: 0,
            urgent_at: 0,
            max_seg_size: None,
            payload_len: 0,
        };
        let info = SendInfo {
            src: reset.tuple.local_addr,
            dst: reset.tuple.remote_addr,
            protocol: IpProtocol::Tcp,
            ttl: config.default_ttl,
            tos: config.tos,
            dont_fragment: false,
        };

        let port = match self.ports.get_mut(port) {
            Some(port) => port,
            None => return,
        };
        if port.rst.is_some() {
            net_debug!("tcp {}: reset slot busy, dropping reset", reset.tuple);
            return;
        }
        net_trace!("tcp {}: sending {}", reset.tuple, repr);
        let segment = build_segment(&self.pool, &info, &repr, None);
        if port.blocked {
            port.rst = Some((info, segment));
            return;
        }
        match port.ip.send(info, segment) {
            Ok(()) => (),
            Err(SendError::WouldBlock(segment)) => {
                port.rst = Some((info, segment));
                port.blocked = true;
            },
            Err(err) => net_debug!("tcp {}: reset not sent: {}", reset.tuple, err),
        }
    }

    /// The IP layer of `port` can take segments again.
    ///
    /// Sends the held back reset first, then lets the waiting connections transmit in the order
    /// they were blocked.
    pub fn writable(&mut self, port: PortId) {
        let held = match self.ports.get_mut(port) {
            Some(port) => {
                port.blocked = false;
                port.rst.take()
            },
            None => return,
        };

        if let Some((info, segment)) = held {
            let port = &mut self.ports[port];
            match port.ip.send(info, segment) {
                Ok(()) => (),
                Err(SendError::WouldBlock(segment)) => {
                    port.rst = Some((info, segment));
                    port.blocked = true;
                    return;
                },
                Err(err) => net_debug!("tcp: held reset not sent: {}", err),
            }
        }

        while !self.ports[port].blocked {
            match self.ports[port].output.pop() {
                Some(id) => self.transmit(id),
                None => break,
            }
        }
        self.collect_reaped();
    }
}
