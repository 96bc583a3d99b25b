use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use super::connection::Connection;
use super::siphash::IsnGenerator;
use super::user::{Client, Completion};
use super::{priority, Config, ConnId, FourTuple, State};
use crate::buf::{Chain, Pool, Priority};
use crate::event::{Events, Timers};
use crate::layer::Error;
use crate::layer::ip::{IpLayer, Report, SendInfo};
use crate::time::{Expiration, Instant};
use crate::wire::{Ipv4Address, TcpSeqNumber};

/// Index of an attached IP interface.
pub type PortId = usize;

/// An attached IP interface.
pub(crate) struct Port<I> {
    pub(crate) address: Ipv4Address,
    pub(crate) ip: I,
    /// The layer refused a segment and has not reported to be writable since.
    pub(crate) blocked: bool,
    /// A reset waiting for the layer to become writable.
    pub(crate) rst: Option<(SendInfo, Chain)>,
    /// Connections with segments to send once the layer is writable.
    pub(crate) output: Events<ConnId>,
}

/// The connection table, shared with the reclamation callbacks of the pool.
pub(crate) struct Table {
    pub(crate) config: Config,
    pub(crate) conns: Box<[RefCell<Connection>]>,
    /// Connections closed by reclamation whose clients were not told yet.
    pub(crate) reaped: RefCell<Vec<ConnId>>,
    pub(crate) now: Cell<Instant>,
}

/// A TCP engine over a set of IP interfaces.
///
/// All buffers are drawn from one [`Pool`], which the endpoint may drain by closing connections
/// when it runs low. Time only advances through [`advance`]; every other entry point uses the time
/// last passed there.
///
/// [`Pool`]: ../../buf/struct.Pool.html
/// [`advance`]: #method.advance
pub struct Endpoint<I> {
    pub(crate) pool: Pool,
    pub(crate) ports: Vec<Port<I>>,
    pub(crate) table: Rc<Table>,
    pub(crate) clients: Vec<Option<Client>>,
    /// Most recently used exact matches, most recent first.
    pub(crate) cache: Vec<ConnId>,
    pub(crate) timers: Timers<ConnId>,
    pub(crate) replies: VecDeque<Completion>,
    pub(crate) isn: IsnGenerator,
    pub(crate) now: Instant,
}

impl Table {
    /// Give up buffers at `level`. Connections borrowed elsewhere are being processed and skipped.
    pub(crate) fn reclaim(&self, level: Priority) {
        let now = self.now.get();
        for (id, cell) in self.conns.iter().enumerate() {
            let mut conn = match cell.try_borrow_mut() {
                Ok(conn) => conn,
                Err(_) => continue,
            };
            if !conn.in_use {
                continue;
            }

            let close = match level {
                priority::FRAG2SEND => {
                    conn.frag2send = None;
                    false
                },
                priority::CONN_EXTRA => {
                    conn.reordered = None;
                    false
                },
                priority::CONN_WITHOUT_USER => conn.owner.is_none() && conn.holds_data(),
                _ => conn.holds_data(),
            };
            if close {
                net_debug!("tcp {}: closing to reclaim buffers", conn.tuple);
                conn.close(Some(Error::OutOfBuffers), now, &self.config);
                self.reaped.borrow_mut().push(id);
            }
        }
    }
}

impl<I: IpLayer> Endpoint<I> {
    /// Create an endpoint without interfaces.
    ///
    /// Registers the reclamation callbacks of the engine with `pool`.
    pub fn new(pool: Pool, config: Config) -> Self {
        let conns: Vec<_> = (0..config.connections)
            .map(|_| RefCell::new(Connection::vacant()))
            .collect();
        let clients = (0..config.clients).map(|_| None).collect();
        let isn = IsnGenerator::new(config.isn_keys);
        let table = Rc::new(Table {
            config,
            conns: conns.into_boxed_slice(),
            reaped: RefCell::new(Vec::new()),
            now: Cell::new(Instant::default()),
        });

        let levels = [
            priority::FRAG2SEND,
            priority::CONN_EXTRA,
            priority::CONN_WITHOUT_USER,
            priority::CONN_IN_USE,
        ];
        for &level in levels.iter() {
            let table = Rc::downgrade(&table);
            pool.register(level, move || {
                if let Some(table) = table.upgrade() {
                    table.reclaim(level);
                }
            });
        }

        Endpoint {
            pool,
            ports: Vec::new(),
            table,
            clients,
            cache: Vec::new(),
            timers: Timers::new(),
            replies: VecDeque::new(),
            isn,
            now: Instant::default(),
        }
    }

    /// Attach an IP interface with its local address.
    pub fn add_port(&mut self, address: Ipv4Address, ip: I) -> PortId {
        self.ports.push(Port {
            address,
            ip,
            blocked: false,
            rst: None,
            output: Events::new(),
        });
        self.ports.len() - 1
    }

    pub fn ip(&self, port: PortId) -> Option<&I> {
        self.ports.get(port).map(|port| &port.ip)
    }

    pub fn ip_mut(&mut self, port: PortId) -> Option<&mut I> {
        self.ports.get_mut(port).map(|port| &mut port.ip)
    }

    pub fn address(&self, port: PortId) -> Option<Ipv4Address> {
        self.ports.get(port).map(|port| port.address)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.table.config
    }

    /// The engine time, as last passed to `advance`.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Move the clock to `now` and handle all timers that expired.
    pub fn advance(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
            self.table.now.set(now);
        }
        let now = self.now;
        let table = self.table.clone();
        let config = &table.config;

        while let Some(id) = self.timers.expire(now) {
            let dead = {
                let mut conn = table.conns[id].borrow_mut();
                match conn.on_timer(now, config) {
                    Some(error) => {
                        conn.close(Some(error), now, config);
                        true
                    },
                    None => false,
                }
            };
            if dead {
                self.wake(id);
            } else {
                self.transmit(id);
            }
        }

        for cell in table.conns.iter() {
            let mut conn = cell.borrow_mut();
            if conn.is_live() && conn.state.is_synchronized() {
                conn.pmtu_tick(now, config);
            }
        }
        self.collect_reaped();
    }

    /// The earliest moment `advance` has work to do.
    pub fn next_deadline(&self) -> Expiration {
        self.timers.next()
    }

    /// Take routing feedback about one of our segments.
    pub fn report(&mut self, port: PortId, report: Report) {
        let (tuple, too_big) = match report {
            Report::Unreachable { src, dst, src_port, dst_port } =>
                (FourTuple { local_addr: src, local_port: src_port, remote_addr: dst, remote_port: dst_port }, None),
            Report::TooBig { src, dst, src_port, dst_port, mtu } =>
                (FourTuple { local_addr: src, local_port: src_port, remote_addr: dst, remote_port: dst_port }, Some(mtu)),
        };
        let id = match self.find_exact(tuple) {
            Some(id) if self.table.conns[id].borrow().port == port => id,
            _ => {
                net_trace!("tcp {}: report without connection", tuple);
                return;
            },
        };

        let table = self.table.clone();
        let config = &table.config;
        let now = self.now;
        let closed = {
            let mut conn = table.conns[id].borrow_mut();
            match too_big {
                Some(mtu) => {
                    conn.too_big(mtu, now);
                    false
                },
                None => match conn.unreachable(config) {
                    Some(error) => {
                        conn.close(Some(error), now, config);
                        true
                    },
                    None => false,
                },
            }
        };

        if closed {
            self.wake(id);
        } else {
            self.transmit(id);
        }
        self.collect_reaped();
    }

    /// Drain the replies of operations that did not complete right away.
    pub fn completions(&mut self) -> impl Iterator<Item=Completion> + '_ {
        self.replies.drain(..)
    }

    /// Find the connection for an arriving segment.
    ///
    /// An exact match of a connection beyond `Listen` wins. Otherwise the listening connection with
    /// the most specific remote filter takes it. A connection without client only counts for a
    /// fresh `syn` while no listener wants it. Otherwise the listener takes over the tuple and the
    /// old connection is closed.
    pub(crate) fn lookup(&mut self, port: PortId, tuple: FourTuple, syn: bool) -> Option<ConnId> {
        let conns = &self.table.conns;
        let cached = self.cache.iter().position(|&id| {
            let conn = conns[id].borrow();
            conn.is_live() && conn.state != State::Listen && conn.port == port && conn.tuple == tuple
                && !(syn && conn.owner.is_none())
        });
        if let Some(pos) = cached {
            let id = self.cache.remove(pos);
            self.cache.insert(0, id);
            return Some(id);
        }

        let mut best: Option<(ConnId, u8)> = None;
        let mut orphan = None;
        for (id, cell) in conns.iter().enumerate() {
            let conn = cell.borrow();
            if !conn.is_live() || conn.port != port {
                continue;
            }
            if conn.state != State::Listen {
                if conn.tuple != tuple {
                    continue;
                }
                if syn && conn.owner.is_none() {
                    orphan = Some(id);
                    continue;
                }
                best = Some((id, 3));
                break;
            }

            let filter = conn.tuple;
            if filter.local_port != tuple.local_port || filter.local_addr != tuple.local_addr {
                continue;
            }
            let addr_ok = filter.remote_addr.is_unspecified() || filter.remote_addr == tuple.remote_addr;
            let port_ok = filter.remote_port == 0 || filter.remote_port == tuple.remote_port;
            if !(addr_ok && port_ok) {
                continue;
            }
            let score = u8::from(!filter.remote_addr.is_unspecified()) + u8::from(filter.remote_port != 0);
            if best.map_or(true, |(_, best)| score > best) {
                best = Some((id, score));
            }
        }

        match (best, orphan) {
            (Some((id, 3)), _) | (None, Some(id)) => {
                self.cache.retain(|&cached| cached != id);
                self.cache.insert(0, id);
                self.cache.truncate(self.table.config.lookup_cache);
                Some(id)
            },
            (Some((id, _)), Some(old)) => {
                self.take_over(old);
                Some(id)
            },
            (Some((id, _)), None) => Some(id),
            (None, None) => None,
        }
    }

    /// Close and free a connection without client whose tuple a listener now serves.
    ///
    /// Its incarnation stays recorded in the slot, so the listener's ISS lands past it.
    fn take_over(&mut self, id: ConnId) {
        let table = self.table.clone();
        {
            let mut conn = table.conns[id].borrow_mut();
            net_debug!("tcp {}: new syn, listener takes over", conn.tuple);
            conn.close(Some(Error::ConnReset), self.now, &table.config);
            conn.release();
        }
        self.cache.retain(|&cached| cached != id);
        self.timers.cancel(id);
    }

    /// A live connection beyond `Listen` with exactly this four-tuple.
    pub(crate) fn find_exact(&self, tuple: FourTuple) -> Option<ConnId> {
        self.table.conns.iter().position(|cell| {
            let conn = cell.borrow();
            conn.is_live() && conn.state != State::Listen && conn.tuple == tuple
        })
    }

    /// A free slot, preferring those without a recent incarnation.
    pub(crate) fn find_empty(&self) -> Option<ConnId> {
        let now = self.now;
        let conns = &self.table.conns;
        conns.iter().position(|cell| cell.borrow().is_fresh(now))
            .or_else(|| conns.iter().position(|cell| !cell.borrow().in_use))
    }

    /// The initial sequence number for a new connection on `tuple`.
    ///
    /// No connection may be borrowed while this runs.
    pub(crate) fn initial_seq(&self, tuple: FourTuple) -> TcpSeqNumber {
        let now = self.now;
        let isn = self.isn.get_isn(tuple, now);
        self.table.conns.iter()
            .fold(isn, |isn, cell| cell.borrow().past_incarnation(tuple, isn, now))
    }

    /// Arm the timer of a connection for its next deadline.
    pub(crate) fn rearm(&mut self, id: ConnId) {
        let deadline = self.table.conns[id].borrow().deadline(&self.table.config);
        match deadline {
            Some(deadline) => self.timers.set(id, deadline),
            None => {
                self.timers.cancel(id);
            },
        }
    }

    /// Tell the clients of connections that reclamation closed.
    pub(crate) fn collect_reaped(&mut self) {
        loop {
            let id = match self.table.reaped.borrow_mut().pop() {
                Some(id) => id,
                None => break,
            };
            self.wake(id);
        }
    }
}
