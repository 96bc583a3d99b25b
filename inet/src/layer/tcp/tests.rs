use core::task::Poll;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::vec::Vec;

use super::*;
use super::send::build_segment;
use crate::buf::{self, Chain, Class, Pool};
use crate::layer::Error;
use crate::layer::ip::{Arrival, IpLayer, Report, SendError, SendInfo};
use crate::time::Instant;
use crate::wire::{checksum, IpProtocol, Ipv4Address, TcpFlags, TcpPacket, TcpRepr};
use crate::wire::TcpSeqNumber as SeqNumber;

const LOCAL: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
const REMOTE: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
const LOCAL_PORT: u16 = 80;
const REMOTE_PORT: u16 = 4000;

/// An IP layer that records what it is given.
#[derive(Clone, Default)]
struct Wire {
    sent: Rc<RefCell<Vec<(SendInfo, Chain)>>>,
    blocked: Rc<Cell<bool>>,
}

impl IpLayer for Wire {
    fn send(&mut self, info: SendInfo, segment: Chain) -> Result<(), SendError> {
        if self.blocked.get() {
            return Err(SendError::WouldBlock(segment));
        }
        self.sent.borrow_mut().push((info, segment));
        Ok(())
    }
}

struct Harness {
    endpoint: Endpoint<Wire>,
    wire: Wire,
    port: PortId,
    now: Instant,
}

fn peer(flags: TcpFlags, seq: u32, ack: Option<SeqNumber>) -> TcpRepr {
    TcpRepr {
        src_port: REMOTE_PORT,
        dst_port: LOCAL_PORT,
        flags,
        seq_number: SeqNumber(seq),
        ack_number: ack,
        window_len: 8192,
        urgent_at: 0,
        max_seg_size: None,
        payload_len: 0,
    }
}

fn ack() -> TcpFlags {
    TcpFlags::default()
}

impl Harness {
    fn new() -> Self {
        Harness::with_pool(Pool::new(&buf::Config::default()))
    }

    fn with_pool(pool: Pool) -> Self {
        let wire = Wire::default();
        let mut endpoint = Endpoint::new(pool, Config::default());
        let port = endpoint.add_port(LOCAL, wire.clone());
        Harness { endpoint, wire, port, now: Instant::from_millis(0) }
    }

    fn advance(&mut self, millis: i64) {
        self.now = Instant::from_millis(self.now.total_millis() + millis);
        self.endpoint.advance(self.now);
    }

    /// Segments sent since the last call, verified and parsed.
    fn sent(&mut self) -> Vec<(TcpRepr, Vec<u8>)> {
        let sent: Vec<_> = self.wire.sent.borrow_mut().drain(..).collect();
        sent.into_iter().map(|(info, chain)| {
            assert_eq!(info.protocol, IpProtocol::Tcp);
            assert_eq!(checksum::segment(info.src, info.dst, IpProtocol::Tcp, &chain), !0);
            let bytes = chain.to_vec();
            let packet = TcpPacket::new_checked(&bytes[..]).expect("header");
            let repr = TcpRepr::parse(&packet, bytes.len()).expect("segment");
            let header_len = usize::from(packet.header_len());
            (repr, bytes[header_len..].to_vec())
        }).collect()
    }

    fn deliver(&mut self, repr: TcpRepr, payload: &[u8]) {
        let info = SendInfo {
            src: REMOTE,
            dst: LOCAL,
            protocol: IpProtocol::Tcp,
            ttl: 64,
            tos: 0,
            dont_fragment: false,
        };
        let repr = TcpRepr { payload_len: payload.len(), ..repr };
        let data = if payload.is_empty() {
            None
        } else {
            Some(self.endpoint.pool().alloc_from(payload))
        };
        let segment = build_segment(self.endpoint.pool(), &info, &repr, data);
        let arrival = Arrival { src: REMOTE, dst: LOCAL, protocol: IpProtocol::Tcp };
        self.endpoint.receive(self.port, arrival, segment);
    }

    fn completions(&mut self) -> Vec<Completion> {
        self.endpoint.completions().collect()
    }

    fn configure(&mut self, handle: Handle, settings: Settings) {
        assert_eq!(
            self.endpoint.ioctl(handle, Ioctl::SetConfig(settings)),
            Poll::Ready(Ok(IoctlReply::Done)));
    }

    fn listen(&mut self) -> Handle {
        let handle = self.endpoint.open(self.port).unwrap();
        self.configure(handle, Settings {
            local_port: Some(LocalPort::Set(LOCAL_PORT)),
            ..Settings::default()
        });
        assert_eq!(self.endpoint.ioctl(handle, Ioctl::Listen), Poll::Pending);
        handle
    }

    /// Complete a passive open from a peer starting at `peer_isn`. Returns our ISS.
    fn accept(&mut self, peer_isn: u32) -> (Handle, SeqNumber) {
        self.accept_from(REMOTE_PORT, peer_isn)
    }

    fn accept_from(&mut self, remote_port: u16, peer_isn: u32) -> (Handle, SeqNumber) {
        let handle = self.listen();
        let syn = TcpRepr {
            src_port: remote_port,
            max_seg_size: Some(1460),
            ..peer(TcpFlags::SYN, peer_isn, None)
        };
        self.deliver(syn, &[]);

        let sent = self.sent();
        assert_eq!(sent.len(), 1);
        let synack = sent[0].0;
        assert!(synack.flags.syn());
        assert_eq!(synack.ack_number, Some(SeqNumber(peer_isn) + 1));
        assert_eq!(synack.max_seg_size, Some(1460));
        assert_eq!(self.endpoint.state(handle), Some(State::SynReceived));

        let iss = synack.seq_number;
        let established = peer(ack(), peer_isn.wrapping_add(1), Some(iss + 1));
        self.deliver(TcpRepr { src_port: remote_port, ..established }, &[]);
        assert_eq!(self.endpoint.state(handle), Some(State::Established));
        assert!(self.sent().is_empty());
        let done = self.completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].handle, handle);
        match done[0].reply {
            Reply::Ioctl(Ok(IoctlReply::Done)) => (),
            ref other => panic!("listen completed with {:?}", other),
        }
        (handle, iss)
    }

    /// Start an active open. Returns the ISS of the SYN.
    fn connect(&mut self) -> (Handle, SeqNumber) {
        let handle = self.endpoint.open(self.port).unwrap();
        self.configure(handle, Settings {
            local_port: Some(LocalPort::Set(LOCAL_PORT)),
            remote_addr: Some(Remote::Only(REMOTE)),
            remote_port: Some(Remote::Only(REMOTE_PORT)),
            ..Settings::default()
        });
        assert_eq!(self.endpoint.ioctl(handle, Ioctl::Connect), Poll::Pending);
        assert_eq!(self.endpoint.state(handle), Some(State::SynSent));

        let sent = self.sent();
        assert_eq!(sent.len(), 1);
        let syn = sent[0].0;
        assert!(syn.flags.syn());
        assert_eq!(syn.ack_number, None);
        assert_eq!(syn.max_seg_size, Some(1460));
        (handle, syn.seq_number)
    }

    fn read_bytes(&mut self, handle: Handle, max: usize) -> Vec<u8> {
        match self.endpoint.read(handle, max) {
            Poll::Ready(Ok(Some(data))) => data.to_vec(),
            other => panic!("expected data, got {:?}", other),
        }
    }

    fn write_bytes(&mut self, handle: Handle, data: &[u8]) -> Poll<crate::layer::Result<usize>> {
        let chain = self.endpoint.pool().alloc_from(data);
        self.endpoint.write(handle, chain)
    }

    fn conn_id(&self, handle: Handle) -> ConnId {
        self.endpoint.clients[handle.0].as_ref()
            .and_then(|client| client.conn)
            .expect("handle with connection")
    }

    fn conn(&self, handle: Handle) -> core::cell::Ref<connection::Connection> {
        self.endpoint.table.conns[self.conn_id(handle)].borrow()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 + 1) as u8).collect()
}

#[test]
fn passive_open_and_receive() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(100);

    h.deliver(peer(TcpFlags::PSH, 101, Some(iss + 1)), b"0123456789");
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.ack_number, Some(SeqNumber(111)));
    assert_eq!(sent[0].0.seq_number, iss + 1);
    assert!(sent[0].1.is_empty());

    assert_eq!(h.read_bytes(handle, 100), b"0123456789");
    assert!(h.endpoint.read(handle, 100).is_pending());
}

#[test]
fn active_open() {
    let mut h = Harness::new();
    let (handle, iss) = h.connect();

    let synack = TcpRepr { max_seg_size: Some(1000), ..peer(TcpFlags::SYN, 7000, Some(iss + 1)) };
    h.deliver(synack, &[]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.seq_number, iss + 1);
    assert_eq!(sent[0].0.ack_number, Some(SeqNumber(7001)));
    assert!(!sent[0].0.flags.syn());

    assert_eq!(h.endpoint.state(handle), Some(State::Established));
    assert_eq!(h.conn(handle).mss, 1000);
    let done = h.completions();
    assert_eq!(done.len(), 1);
    match done[0].reply {
        Reply::Ioctl(Ok(IoctlReply::Done)) => (),
        ref other => panic!("connect completed with {:?}", other),
    }
}

#[test]
fn refused_connect() {
    let mut h = Harness::new();
    let (handle, iss) = h.connect();

    h.deliver(peer(TcpFlags::RST, 0, Some(iss + 1)), &[]);
    let done = h.completions();
    assert_eq!(done.len(), 1);
    match done[0].reply {
        Reply::Ioctl(Err(Error::ConnRefused)) => (),
        ref other => panic!("connect completed with {:?}", other),
    }
    assert_eq!(h.endpoint.state(handle), None);
    assert!(h.sent().is_empty());
}

#[test]
fn reset_with_unacceptable_ack_is_ignored() {
    let mut h = Harness::new();
    let (handle, iss) = h.connect();
    h.deliver(peer(TcpFlags::RST, 0, Some(iss + 100)), &[]);
    assert!(h.completions().is_empty());
    assert_eq!(h.endpoint.state(handle), Some(State::SynSent));
}

#[test]
fn reordered_data_is_joined() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(1000);
    let data = pattern(100);

    h.deliver(peer(ack(), 1051, Some(iss + 1)), &data[50..]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.ack_number, Some(SeqNumber(1001)));
    assert!(h.conn(handle).reordered.is_some());
    assert!(h.endpoint.read(handle, 200).is_pending());

    h.deliver(peer(ack(), 1001, Some(iss + 1)), &data[..50]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.ack_number, Some(SeqNumber(1101)));
    assert!(h.conn(handle).reordered.is_none());

    let done = h.completions();
    assert_eq!(done.len(), 1);
    match done[0].reply {
        Reply::Read(Ok(Some(ref chain))) => assert_eq!(chain.to_vec(), data),
        ref other => panic!("read completed with {:?}", other),
    }
}

#[test]
fn sequence_numbers_wrap() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0xffff_fff0);
    let data = pattern(32);

    h.deliver(peer(ack(), 0xffff_fff1, Some(iss + 1)), &data);
    let sent = h.sent();
    assert_eq!(sent[0].0.ack_number, Some(SeqNumber(0x11)));
    assert_eq!(h.read_bytes(handle, 64), data);
}

#[test]
fn graceful_close() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(5000);

    h.deliver(peer(ack(), 5001, Some(iss + 1)), &[1; 20]);
    h.sent();
    assert_eq!(h.read_bytes(handle, 100), [1; 20]);

    assert_eq!(h.write_bytes(handle, &[2; 30]), Poll::Ready(Ok(30)));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.seq_number, iss + 1);
    assert!(sent[0].0.flags.psh());
    assert_eq!(sent[0].1, [2; 30]);
    h.deliver(peer(ack(), 5021, Some(iss + 31)), &[]);
    assert!(h.conn(handle).send_data.is_none());

    assert_eq!(h.endpoint.ioctl(handle, Ioctl::Shutdown), Poll::Ready(Ok(IoctlReply::Done)));
    assert_eq!(h.endpoint.state(handle), Some(State::Closing));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.flags.fin());
    assert_eq!(sent[0].0.seq_number, iss + 31);
    assert_eq!(
        h.write_bytes(handle, &[3; 4]),
        Poll::Ready(Err(Error::Shutdown)));

    h.deliver(peer(TcpFlags::FIN, 5021, Some(iss + 32)), &[]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.ack_number, Some(SeqNumber(5022)));
    assert_eq!(h.endpoint.state(handle), Some(State::Closed));

    {
        let conn = h.conn(handle);
        assert!(conn.send_data.is_none());
        assert!(conn.reordered.is_none());
        assert_eq!(conn.unread(), 0);
        assert_eq!(conn.error, None);
    }
    match h.endpoint.read(handle, 10) {
        Poll::Ready(Ok(None)) => (),
        other => panic!("expected end of stream, got {:?}", other),
    }
    assert_eq!(h.endpoint.next_deadline(), crate::time::Expiration::Never);
}

#[test]
fn peer_closes_first() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(300);

    h.deliver(peer(TcpFlags::FIN, 301, Some(iss + 1)), b"bye");
    let sent = h.sent();
    assert_eq!(sent[0].0.ack_number, Some(SeqNumber(305)));
    assert_eq!(h.read_bytes(handle, 10), b"bye");
    match h.endpoint.read(handle, 10) {
        Poll::Ready(Ok(None)) => (),
        other => panic!("expected end of stream, got {:?}", other),
    }
    assert_eq!(h.endpoint.state(handle), Some(State::Established));

    // Half closed, sending still works.
    assert_eq!(h.write_bytes(handle, b"ok"), Poll::Ready(Ok(2)));
    assert_eq!(h.sent()[0].1, b"ok");
}

#[test]
fn congestion_window_within_offered_window() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);
    h.deliver(TcpRepr { window_len: 3000, ..peer(ack(), 1, Some(iss + 1)) }, &[]);
    assert!(h.conn(handle).cwnd <= 3000);
    let data = pattern(10_000);
    assert_eq!(h.write_bytes(handle, &data), Poll::Ready(Ok(10_000)));

    let mut received = Vec::new();
    let end = iss + 1 + 10_000;
    let mut acked = iss + 1;
    while acked != end {
        let sent = h.sent();
        assert!(!sent.is_empty());
        let flight: usize = sent.iter().map(|(_, payload)| payload.len()).sum();
        assert!(flight <= 3000, "flight of {} bytes", flight);
        for (repr, payload) in sent {
            assert!(payload.len() <= 1460);
            assert_eq!(repr.seq_number, iss + 1 + received.len());
            received.extend_from_slice(&payload);
            acked = repr.seq_number + payload.len();
        }

        let window = TcpRepr { window_len: 3000, ..peer(ack(), 1, Some(acked)) };
        h.deliver(window, &[]);
        let conn = h.conn(handle);
        assert!(conn.cwnd <= conn.snd_wnd.max(conn.mss));
        assert_eq!(conn.snd_wnd, 3000);
    }
    assert_eq!(received, data);
}

#[test]
fn fast_retransmit_on_third_duplicate() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);
    let data = pattern(4 * 1460);
    assert_eq!(h.write_bytes(handle, &data), Poll::Ready(Ok(data.len())));

    let first = h.sent();
    assert!(first.len() >= 2);
    let lost = iss + 1 + 1460;
    h.deliver(peer(ack(), 1, Some(lost)), &[]);
    h.sent();
    let (ssthresh, cwnd) = {
        let conn = h.conn(handle);
        (conn.ssthresh, conn.cwnd)
    };

    h.deliver(peer(ack(), 1, Some(lost)), &[]);
    h.deliver(peer(ack(), 1, Some(lost)), &[]);
    assert!(h.sent().is_empty());
    assert_eq!(h.conn(handle).dupacks, 2);

    h.deliver(peer(ack(), 1, Some(lost)), &[]);
    let sent = h.sent();
    assert!(!sent.is_empty());
    assert_eq!(sent[0].0.seq_number, lost);
    assert_eq!(sent[0].1, &data[1460..2920]);

    let conn = h.conn(handle);
    assert_eq!(conn.ssthresh, (cwnd.min(ssthresh) / 2).max(2 * conn.mss));
    assert_eq!(conn.cwnd, conn.ssthresh);
}

#[test]
fn retransmission_backs_off() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);
    assert_eq!(h.write_bytes(handle, &[7; 100]), Poll::Ready(Ok(100)));
    assert_eq!(h.sent().len(), 1);
    let rto = h.conn(handle).rto;

    let mut retransmits = Vec::new();
    for _ in 0..30 {
        h.advance(100);
        for (repr, payload) in h.sent() {
            assert_eq!(repr.seq_number, iss + 1);
            assert_eq!(payload, [7; 100]);
            retransmits.push(h.now);
        }
    }
    assert!(retransmits.len() >= 3);
    // Each wait is about twice the previous one.
    let mut last = (0, 0);
    for at in retransmits {
        let gap = at.total_millis() - last.0;
        assert!(gap >= 2 * last.1 - 100, "waited {} after {}", gap, last.1);
        last = (at.total_millis(), gap);
    }
    assert!(h.conn(handle).rto > rto);

    h.deliver(peer(ack(), 1, Some(iss + 101)), &[]);
    assert!(h.conn(handle).rt_at.is_none());
    h.advance(10_000);
    assert!(h.sent().is_empty());
}

#[test]
fn connect_times_out() {
    let mut h = Harness::new();
    let (handle, iss) = h.connect();

    let mut syns = 0;
    let mut failed = None;
    for _ in 0..80 {
        h.advance(1000);
        for (repr, _) in h.sent() {
            assert!(repr.flags.syn());
            assert_eq!(repr.seq_number, iss);
            syns += 1;
        }
        for done in h.completions() {
            failed = Some((h.now, done));
        }
    }
    assert!(syns >= 3);
    let (at, done) = failed.expect("connect to fail");
    assert_eq!(at, Instant::from_secs(75));
    assert_eq!(done.handle, handle);
    match done.reply {
        Reply::Ioctl(Err(Error::TimedOut)) => (),
        ref other => panic!("connect completed with {:?}", other),
    }
    assert_eq!(h.endpoint.state(handle), None);
}

#[test]
fn no_listener_resets() {
    let mut h = Harness::new();

    h.deliver(TcpRepr { dst_port: 81, ..peer(TcpFlags::SYN, 300, None) }, &[]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.flags.rst());
    assert_eq!(sent[0].0.seq_number, SeqNumber(0));
    assert_eq!(sent[0].0.ack_number, Some(SeqNumber(301)));
    assert_eq!(sent[0].0.src_port, 81);

    h.deliver(TcpRepr { dst_port: 81, ..peer(ack(), 300, Some(SeqNumber(999))) }, b"xy");
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.flags.rst());
    assert_eq!(sent[0].0.seq_number, SeqNumber(999));
    assert_eq!(sent[0].0.ack_number, None);

    // Never answer a reset with a reset.
    h.deliver(TcpRepr { dst_port: 81, ..peer(TcpFlags::RST, 300, None) }, &[]);
    assert!(h.sent().is_empty());
}

#[test]
fn delayed_reset_option() {
    let mut h = Harness::new();
    let handle = h.endpoint.open(h.port).unwrap();
    h.configure(handle, Settings { local_port: Some(LocalPort::Set(81)), ..Settings::default() });
    let options = Options { delay_rst: true, ..Options::default() };
    assert_eq!(h.endpoint.ioctl(handle, Ioctl::SetOptions(options)), Poll::Ready(Ok(IoctlReply::Done)));

    h.deliver(TcpRepr { dst_port: 81, ..peer(TcpFlags::SYN, 300, None) }, &[]);
    assert!(h.sent().is_empty());
}

#[test]
fn bad_checksum_is_dropped() {
    let mut h = Harness::new();
    let info = SendInfo {
        src: REMOTE,
        dst: LOCAL,
        protocol: IpProtocol::Tcp,
        ttl: 64,
        tos: 0,
        dont_fragment: false,
    };
    let repr = peer(TcpFlags::SYN, 300, None);
    let mut segment = build_segment(h.endpoint.pool(), &info, &repr, None);
    segment.write_at(4, &[0xff]);
    h.endpoint.receive(h.port, Arrival { src: REMOTE, dst: LOCAL, protocol: IpProtocol::Tcp }, segment);
    assert!(h.sent().is_empty());
}

#[test]
fn most_specific_listener_wins() {
    let mut h = Harness::new();
    let wild = h.endpoint.open(h.port).unwrap();
    let narrow = h.endpoint.open(h.port).unwrap();
    h.configure(wild, Settings {
        access: Some(Access::Shared),
        local_port: Some(LocalPort::Set(LOCAL_PORT)),
        ..Settings::default()
    });
    h.configure(narrow, Settings {
        access: Some(Access::Shared),
        local_port: Some(LocalPort::Set(LOCAL_PORT)),
        remote_addr: Some(Remote::Only(REMOTE)),
        ..Settings::default()
    });
    assert_eq!(h.endpoint.ioctl(wild, Ioctl::Listen), Poll::Pending);
    assert_eq!(h.endpoint.ioctl(narrow, Ioctl::Listen), Poll::Pending);

    h.deliver(peer(TcpFlags::SYN, 10, None), &[]);
    assert_eq!(h.endpoint.state(narrow), Some(State::SynReceived));
    assert_eq!(h.endpoint.state(wild), Some(State::Listen));
}

#[test]
fn exclusive_port_conflicts() {
    let mut h = Harness::new();
    let first = h.endpoint.open(h.port).unwrap();
    let second = h.endpoint.open(h.port).unwrap();
    h.configure(first, Settings { local_port: Some(LocalPort::Set(LOCAL_PORT)), ..Settings::default() });
    let settings = Settings {
        access: Some(Access::Shared),
        local_port: Some(LocalPort::Set(LOCAL_PORT)),
        ..Settings::default()
    };
    assert_eq!(
        h.endpoint.ioctl(second, Ioctl::SetConfig(settings)),
        Poll::Ready(Err(Error::AddrInUse)));

    let select = Settings { local_port: Some(LocalPort::Select), ..Settings::default() };
    h.configure(second, select);
    match h.endpoint.ioctl(second, Ioctl::GetConfig) {
        Poll::Ready(Ok(IoctlReply::Config(config))) => match config.local_port {
            LocalPort::Set(port) => assert!(port >= user::EPHEMERAL),
            other => panic!("no port selected: {:?}", other),
        },
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn reset_while_half_open_listens_again() {
    let mut h = Harness::new();
    let handle = h.listen();
    h.deliver(peer(TcpFlags::SYN, 10, None), &[]);
    assert_eq!(h.endpoint.state(handle), Some(State::SynReceived));
    h.sent();

    h.deliver(peer(TcpFlags::RST, 11, None), &[]);
    assert_eq!(h.endpoint.state(handle), Some(State::Listen));
    assert!(h.completions().is_empty());

    h.deliver(peer(TcpFlags::SYN, 500, None), &[]);
    assert_eq!(h.endpoint.state(handle), Some(State::SynReceived));
    assert_eq!(h.sent()[0].0.ack_number, Some(SeqNumber(501)));
}

#[test]
fn cancel_pending_read() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);
    assert!(h.endpoint.read(handle, 10).is_pending());
    match h.endpoint.read(handle, 10) {
        Poll::Ready(Err(Error::InProgress)) => (),
        other => panic!("second read gave {:?}", other),
    }

    h.endpoint.cancel(handle, Op::Read).unwrap();
    let done = h.completions();
    assert_eq!(done.len(), 1);
    match done[0].reply {
        Reply::Read(Err(Error::Interrupted)) => (),
        ref other => panic!("read completed with {:?}", other),
    }

    // Nothing pending anymore.
    h.endpoint.cancel(handle, Op::Read).unwrap();
    assert!(h.completions().is_empty());
    h.deliver(peer(ack(), 1, Some(iss + 1)), b"late");
    assert!(h.completions().is_empty());
    assert_eq!(h.read_bytes(handle, 10), b"late");
}

#[test]
fn cancel_listen() {
    let mut h = Harness::new();
    let handle = h.listen();
    h.endpoint.cancel(handle, Op::Ioctl).unwrap();
    let done = h.completions();
    match done[0].reply {
        Reply::Ioctl(Err(Error::Interrupted)) => (),
        ref other => panic!("listen completed with {:?}", other),
    }
    assert_eq!(h.endpoint.state(handle), None);

    h.deliver(peer(TcpFlags::SYN, 10, None), &[]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.flags.rst());
}

#[test]
fn urgent_data_is_read_separately() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);

    let urgent = TcpRepr { urgent_at: 3, ..peer(TcpFlags::URG, 1, Some(iss + 1)) };
    h.deliver(urgent, b"!!!!normal");
    h.sent();

    match h.endpoint.read(handle, 100) {
        Poll::Ready(Err(Error::Urgent)) => (),
        other => panic!("plain read gave {:?}", other),
    }

    let options = Options { recv_urgent: true, ..Options::default() };
    assert_eq!(h.endpoint.ioctl(handle, Ioctl::SetOptions(options)), Poll::Ready(Ok(IoctlReply::Done)));
    assert_eq!(h.read_bytes(handle, 100), b"!!!!");
    match h.endpoint.read(handle, 100) {
        Poll::Ready(Err(Error::NoUrgent)) => (),
        other => panic!("urgent read gave {:?}", other),
    }

    assert_eq!(h.endpoint.ioctl(handle, Ioctl::SetOptions(Options::default())), Poll::Ready(Ok(IoctlReply::Done)));
    assert_eq!(h.read_bytes(handle, 100), b"normal");
}

#[test]
fn urgent_data_is_marked() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);
    let options = Options { send_urgent: true, ..Options::default() };
    assert_eq!(h.endpoint.ioctl(handle, Ioctl::SetOptions(options)), Poll::Ready(Ok(IoctlReply::Done)));

    assert_eq!(h.write_bytes(handle, b"abc"), Poll::Ready(Ok(3)));
    let sent = h.sent();
    assert!(sent[0].0.flags.urg());
    assert_eq!(sent[0].0.seq_number, iss + 1);
    // Points at the last urgent byte.
    assert_eq!(sent[0].0.urgent_at, 2);
}

#[test]
fn blocked_layer_resumes_when_writable() {
    let mut h = Harness::new();
    let (handle, _) = h.accept(0);

    h.wire.blocked.set(true);
    assert_eq!(h.write_bytes(handle, &[9; 100]), Poll::Ready(Ok(100)));
    assert!(h.sent().is_empty());
    assert!(h.conn(handle).frag2send.is_some());

    // Only one reset is held while blocked.
    h.deliver(TcpRepr { dst_port: 81, ..peer(TcpFlags::SYN, 1, None) }, &[]);
    h.deliver(TcpRepr { dst_port: 82, ..peer(TcpFlags::SYN, 1, None) }, &[]);

    h.wire.blocked.set(false);
    let port = h.port;
    h.endpoint.writable(port);
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].0.flags.rst());
    assert_eq!(sent[0].0.src_port, 81);
    assert_eq!(sent[1].1, [9; 100]);
    assert!(h.conn(handle).frag2send.is_none());
}

#[test]
fn zero_window_is_probed() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);
    h.deliver(TcpRepr { window_len: 0, ..peer(ack(), 1, Some(iss + 1)) }, &[]);
    assert_eq!(h.conn(handle).snd_wnd, 0);

    assert_eq!(h.write_bytes(handle, b"waiting"), Poll::Ready(Ok(7)));
    assert!(h.sent().is_empty());
    assert!(h.conn(handle).probe_at.is_some());

    h.advance(1000);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.seq_number, iss + 1);
    assert_eq!(sent[0].1, b"w");

    // The window opens with the probe byte accepted.
    h.deliver(peer(ack(), 1, Some(iss + 2)), &[]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.seq_number, iss + 2);
    assert_eq!(sent[0].1, b"aiting");
    assert!(h.conn(handle).probe_at.is_none());
}

#[test]
fn probe_repeats_first_unacknowledged_byte() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);
    assert_eq!(h.write_bytes(handle, b"abcdef"), Poll::Ready(Ok(6)));
    assert_eq!(h.sent().len(), 1);
    h.deliver(TcpRepr { window_len: 0, ..peer(ack(), 1, Some(iss + 1)) }, &[]);
    assert_eq!(h.conn(handle).snd_wnd, 0);
    assert!(h.conn(handle).probe_at.is_some());

    let id = h.conn_id(handle);
    let config = Config::default();
    for _ in 0..2 {
        let mut conn = h.endpoint.table.conns[id].borrow_mut();
        conn.probe_due = true;
        let probe = conn.next_segment(h.now, &config).expect("probe");
        assert_eq!(probe.repr.seq_number, iss + 1);
        assert_eq!(probe.payload.map(|data| data.to_vec()), Some(b"a".to_vec()));
        assert_eq!(conn.snd_trm, iss + 7);
    }
}

#[test]
fn too_big_report_shrinks_segments() {
    let mut h = Harness::new();
    let (handle, _) = h.accept(0);
    let report = Report::TooBig {
        src: LOCAL,
        dst: REMOTE,
        src_port: LOCAL_PORT,
        dst_port: REMOTE_PORT,
        mtu: Some(1000),
    };
    let port = h.port;
    h.endpoint.report(port, report);
    assert_eq!(h.conn(handle).mtu, 1000);

    assert_eq!(h.write_bytes(handle, &pattern(2000)), Poll::Ready(Ok(2000)));
    let sizes: Vec<_> = h.sent().iter().map(|(_, payload)| payload.len()).collect();
    assert_eq!(sizes, [960, 960, 80]);
}

#[test]
fn abort_resets_peer() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);
    assert_eq!(h.endpoint.ioctl(handle, Ioctl::Abort), Poll::Ready(Ok(IoctlReply::Done)));

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.flags.rst());
    assert_eq!(sent[0].0.seq_number, iss + 1);
    assert_eq!(h.endpoint.state(handle), Some(State::Closed));
    match h.endpoint.read(handle, 10) {
        Poll::Ready(Err(Error::ConnReset)) => (),
        other => panic!("read after abort gave {:?}", other),
    }
}

#[test]
fn peer_reset_fails_operations() {
    let mut h = Harness::new();
    let (handle, _) = h.accept(0);
    assert!(h.endpoint.read(handle, 10).is_pending());

    h.deliver(peer(TcpFlags::RST, 1, None), &[]);
    let done = h.completions();
    assert_eq!(done.len(), 1);
    match done[0].reply {
        Reply::Read(Err(Error::ConnReset)) => (),
        ref other => panic!("read completed with {:?}", other),
    }
    assert!(h.sent().is_empty());
}

#[test]
fn pending_write_completes_as_room_frees() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);
    let data = pattern(20_000);
    assert!(h.write_bytes(handle, &data).is_pending());
    assert_eq!(h.conn(handle).queued(), Config::default().send_buffer);

    let mut acked = iss + 1;
    let mut done = Vec::new();
    while done.is_empty() {
        for (repr, payload) in h.sent() {
            acked = repr.seq_number + payload.len();
        }
        h.deliver(peer(ack(), 1, Some(acked)), &[]);
        done = h.completions();
    }
    match done[0].reply {
        Reply::Write(Ok(20_000)) => (),
        ref other => panic!("write completed with {:?}", other),
    }
}

#[test]
fn quiet_period_moves_initial_sequence() {
    let mut h = Harness::new();
    let (handle, iss) = h.connect();
    h.deliver(peer(TcpFlags::SYN, 7000, Some(iss + 1)), &[]);
    h.completions();
    assert_eq!(h.endpoint.ioctl(handle, Ioctl::Abort), Poll::Ready(Ok(IoctlReply::Done)));
    h.endpoint.close(handle).unwrap();
    h.sent();

    let (_, again) = h.connect();
    assert_eq!(again, iss + 1 + 0x1_0000);
}

#[test]
fn reclaim_levels() {
    let mut h = Harness::new();
    let (idle, _) = h.accept_from(REMOTE_PORT + 1, 500);
    h.endpoint.close(idle).unwrap();
    assert!(h.sent()[0].0.flags.fin());
    let idle_tuple = FourTuple {
        local_addr: LOCAL,
        local_port: LOCAL_PORT,
        remote_addr: REMOTE,
        remote_port: REMOTE_PORT + 1,
    };
    let (handle, iss) = h.accept(0);

    h.deliver(peer(ack(), 11, Some(iss + 1)), b"later");
    assert!(h.conn(handle).reordered.is_some());
    h.endpoint.table.reclaim(priority::CONN_EXTRA);
    assert!(h.conn(handle).reordered.is_none());
    assert_eq!(h.endpoint.state(handle), Some(State::Established));

    h.deliver(peer(ack(), 1, Some(iss + 1)), b"unread");
    h.endpoint.table.reclaim(priority::CONN_WITHOUT_USER);
    assert_eq!(h.endpoint.state(handle), Some(State::Established));
    // Abandoned but holding no buffers, so it finishes its close.
    let idle = h.endpoint.find_exact(idle_tuple).expect("idle connection kept");
    assert_eq!(h.endpoint.table.conns[idle].borrow().state, State::Closing);

    h.endpoint.table.reclaim(priority::CONN_IN_USE);
    h.endpoint.collect_reaped();
    assert_eq!(h.endpoint.state(handle), Some(State::Closed));
    match h.endpoint.read(handle, 10) {
        Poll::Ready(Err(Error::OutOfBuffers)) => (),
        other => panic!("read after reclaim gave {:?}", other),
    }
}

#[test]
fn exhausted_pool_reclaims_held_segments() {
    let pool = Pool::new(&buf::Config {
        classes: vec![
            Class { size: 512, count: 8 },
            Class { size: 2048, count: 4 },
        ],
        nodes: 128,
    });
    let mut h = Harness::with_pool(pool.clone());
    let (handle, iss) = h.accept(0);
    h.deliver(peer(ack(), 11, Some(iss + 1)), b"out of order");
    h.sent();
    assert!(h.conn(handle).reordered.is_some());

    let mut hoard = Vec::new();
    for class in pool.stats().classes {
        for _ in 0..class.free {
            hoard.push(pool.alloc(class.size));
        }
    }
    assert!(pool.stats().classes.iter().all(|class| class.free == 0));

    hoard.push(pool.alloc(1));
    assert!(h.conn(handle).reordered.is_none());
    assert_eq!(h.endpoint.state(handle), Some(State::Established));
}

#[test]
fn listener_takes_over_abandoned_tuple() {
    let mut h = Harness::new();
    let (old, iss) = h.accept(100);
    h.endpoint.close(old).unwrap();
    let fin = h.sent();
    assert_eq!(fin.len(), 1);
    assert!(fin[0].0.flags.fin());

    let handle = h.listen();
    let syn = TcpRepr { max_seg_size: Some(1460), ..peer(TcpFlags::SYN, 900_000, None) };
    h.deliver(syn, &[]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let synack = sent[0].0;
    assert!(synack.flags.syn());
    assert_eq!(synack.ack_number, Some(SeqNumber(900_001)));
    // Past everything the old connection sent, SYN and FIN included.
    assert_eq!(synack.seq_number, iss + 2 + 0x1_0000);
    assert_eq!(h.endpoint.state(handle), Some(State::SynReceived));

    h.deliver(peer(ack(), 900_001, Some(synack.seq_number + 1)), &[]);
    assert_eq!(h.endpoint.state(handle), Some(State::Established));
    assert_eq!(h.completions().len(), 1);
    let live = h.endpoint.table.conns.iter().filter(|cell| cell.borrow().is_live()).count();
    assert_eq!(live, 1);
}

#[test]
fn owned_connection_keeps_its_tuple() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(100);
    let listener = h.listen();

    h.deliver(peer(TcpFlags::SYN, 900_000, None), &[]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].0.flags.syn());
    assert_eq!(sent[0].0.seq_number, iss + 1);
    assert_eq!(sent[0].0.ack_number, Some(SeqNumber(101)));
    assert_eq!(h.endpoint.state(handle), Some(State::Established));
    assert_eq!(h.endpoint.state(listener), Some(State::Listen));
}

#[test]
fn segment_beyond_window_is_acked_and_dropped() {
    let mut h = Harness::new();
    let (handle, iss) = h.accept(0);
    let window = Config::default().recv_window as u32;

    h.deliver(peer(ack(), 1 + window, Some(iss + 1)), b"too far");
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.ack_number, Some(SeqNumber(1)));
    assert_eq!(sent[0].0.seq_number, iss + 1);
    assert!(sent[0].1.is_empty());
    assert!(h.conn(handle).reordered.is_none());
    assert!(h.endpoint.read(handle, 100).is_pending());

    h.deliver(peer(ack(), 1, Some(iss + 1)), b"fits");
    h.sent();
    assert_eq!(h.read_bytes(handle, 100), b"fits");
}
