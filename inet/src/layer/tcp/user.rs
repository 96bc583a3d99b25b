//! The client side of the engine: handles and the operations issued on them.
use core::task::Poll;

use super::connection::Delivery;
use super::endpoint::{Endpoint, PortId};
use super::{ConnId, FourTuple, State};
use crate::buf::Chain;
use crate::layer::{Error, Result};
use crate::layer::ip::IpLayer;
use crate::wire::Ipv4Address;

/// First port handed out for `LocalPort::Select`.
pub(crate) const EPHEMERAL: u16 = 49152;

/// A client handle, returned by [`Endpoint::open`].
///
/// [`Endpoint::open`]: struct.Endpoint.html#method.open
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) usize);

/// How a handle shares its local port with others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    /// No other handle may use the port.
    Exclusive,
    /// Other non-exclusive handles may use the port.
    Shared,
    /// Like `Shared`.
    Copy,
}

/// The local port of a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocalPort {
    Unset,
    /// Pick an unused ephemeral port.
    Select,
    Set(u16),
}

/// A filter on the remote side of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Remote<T> {
    Any,
    Only(T),
}

/// A configuration change. Fields left at `None` keep their value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Settings {
    pub access: Option<Access>,
    pub local_port: Option<LocalPort>,
    pub remote_addr: Option<Remote<Ipv4Address>>,
    pub remote_port: Option<Remote<u16>>,
}

/// The configuration of a handle. Once connected it shows the addresses actually in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientConfig {
    pub access: Access,
    pub local_addr: Ipv4Address,
    pub local_port: LocalPort,
    pub remote_addr: Remote<Ipv4Address>,
    pub remote_port: Remote<u16>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Options {
    /// Data written is urgent.
    pub send_urgent: bool,
    /// Reads consume urgent data.
    pub recv_urgent: bool,
    /// The urgent pointer points one past the last urgent byte instead of at it.
    pub bsd_urgent: bool,
    /// A SYN to this port without a listener is dropped instead of reset.
    pub delay_rst: bool,
}

/// Control requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ioctl {
    SetConfig(Settings),
    GetConfig,
    SetOptions(Options),
    GetOptions,
    /// Open a connection to the configured remote.
    Connect,
    /// Wait for a connection matching the configured remote filter.
    Listen,
    /// Send a FIN after all written data.
    Shutdown,
    /// Send all written data right away, and mark it pushed.
    Push,
    /// Reset the connection.
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoctlReply {
    Done,
    Config(ClientConfig),
    Options(Options),
}

/// The kind of operation to cancel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Write,
    Ioctl,
}

/// The answer to an operation.
#[derive(Debug)]
pub enum Reply {
    /// Data, or `None` at the end of the stream.
    Read(Result<Option<Chain>>),
    /// The number of bytes written.
    Write(Result<usize>),
    Ioctl(Result<IoctlReply>),
}

/// The late reply to an operation that returned `Poll::Pending`.
#[derive(Debug)]
pub struct Completion {
    pub handle: Handle,
    pub reply: Reply,
}

pub(crate) struct Client {
    pub(crate) port: PortId,
    access: Access,
    local_port: Option<u16>,
    remote_addr: Remote<Ipv4Address>,
    remote_port: Remote<u16>,
    pub(crate) options: Options,
    pub(crate) conn: Option<ConnId>,
    read: Option<usize>,
    write: Option<PendingWrite>,
    ioctl: Option<Waiting>,
}

struct PendingWrite {
    rest: Chain,
    done: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Waiting {
    Connect,
    Listen,
    Shutdown,
}

impl Client {
    fn new(port: PortId) -> Self {
        Client {
            port,
            access: Access::Exclusive,
            local_port: None,
            remote_addr: Remote::Any,
            remote_port: Remote::Any,
            options: Options::default(),
            conn: None,
            read: None,
            write: None,
            ioctl: None,
        }
    }

    fn exclusive(&self) -> bool {
        self.access == Access::Exclusive
    }
}

fn delivered(delivery: Delivery) -> Poll<Result<Option<Chain>>> {
    match delivery {
        Delivery::Data(data) => Poll::Ready(Ok(Some(data))),
        Delivery::Eof => Poll::Ready(Ok(None)),
        Delivery::Wait => Poll::Pending,
        Delivery::Failed(error) => Poll::Ready(Err(error)),
    }
}

impl<I: IpLayer> Endpoint<I> {
    /// Claim a handle on an interface.
    pub fn open(&mut self, port: PortId) -> Result<Handle> {
        if port >= self.ports.len() {
            return Err(Error::Invalid);
        }
        let idx = self.clients.iter()
            .position(Option::is_none)
            .ok_or(Error::Again)?;
        self.clients[idx] = Some(Client::new(port));
        Ok(Handle(idx))
    }

    /// Give up a handle.
    ///
    /// Pending operations are dropped without a reply. An established connection is shut down and
    /// continues without its client until the peer acknowledged everything, any other connection
    /// is dropped.
    pub fn close(&mut self, handle: Handle) -> Result<()> {
        let client = self.clients.get_mut(handle.0)
            .and_then(Option::take)
            .ok_or(Error::BadHandle)?;
        let id = match client.conn {
            Some(id) => id,
            None => return Ok(()),
        };

        let table = self.table.clone();
        let config = &table.config;
        let now = self.now;
        {
            let mut conn = table.conns[id].borrow_mut();
            conn.owner = None;
            match conn.state {
                State::Established | State::Closing => {
                    // Unread data is lost, keep the window open for what still arrives.
                    let unread = conn.unread();
                    conn.rcvd_data = None;
                    conn.rcv_lo += unread;
                    conn.open_window(config);
                    let _ = conn.shutdown();
                    conn.check_finished(now, config);
                    net_debug!("tcp {}: abandoned by its client", conn.tuple);
                },
                _ => conn.release(),
            }
        }
        self.wake(id);
        self.collect_reaped();
        Ok(())
    }

    /// The state of the handle's connection.
    pub fn state(&self, handle: Handle) -> Option<State> {
        let id = self.client(handle).ok()?.conn?;
        let conn = self.table.conns[id].borrow();
        if conn.in_use { Some(conn.state) } else { None }
    }

    /// Read up to `max` bytes.
    ///
    /// With the `recv_urgent` option only urgent data is returned, otherwise reading fails while
    /// urgent data is pending.
    pub fn read(&mut self, handle: Handle, max: usize) -> Poll<Result<Option<Chain>>> {
        let client = self.client(handle)?;
        if client.read.is_some() {
            return Poll::Ready(Err(Error::InProgress));
        }
        if max == 0 {
            return Poll::Ready(Err(Error::Invalid));
        }
        let id = client.conn.ok_or(Error::NotConnected)?;
        let urgent = client.options.recv_urgent;

        let table = self.table.clone();
        let delivery = table.conns[id].borrow_mut().take(max, urgent, &table.config);
        match delivered(delivery) {
            Poll::Pending => {
                self.client_mut(handle)?.read = Some(max);
                Poll::Pending
            },
            ready => {
                self.transmit(id);
                ready
            },
        }
    }

    /// Queue `data` for sending.
    ///
    /// Takes as much as the send buffer has room for. The rest is taken as room frees up and the
    /// reply counts all of `data`.
    pub fn write(&mut self, handle: Handle, data: Chain) -> Poll<Result<usize>> {
        let client = self.client(handle)?;
        if client.write.is_some() {
            return Poll::Ready(Err(Error::InProgress));
        }
        let id = client.conn.ok_or(Error::NotConnected)?;
        let urgent = client.options.send_urgent;
        if !data.pool().same(&self.pool) {
            return Poll::Ready(Err(Error::Invalid));
        }

        let table = self.table.clone();
        let total = data.len();
        let rest = {
            let mut conn = table.conns[id].borrow_mut();
            match conn.state {
                State::SynSent | State::SynReceived | State::Established => (),
                State::Closing => return Poll::Ready(Err(Error::Shutdown)),
                State::Closed => return Poll::Ready(Err(conn.error.unwrap_or(Error::NotConnected))),
                State::Listen => return Poll::Ready(Err(Error::NotConnected)),
            }
            if total == 0 {
                return Poll::Ready(Ok(0));
            }
            let (done, rest) = conn.queue(data, urgent, &table.config);
            rest.map(|rest| PendingWrite { rest, done })
        };
        self.transmit(id);

        match rest {
            None => Poll::Ready(Ok(total)),
            Some(pending) => {
                self.client_mut(handle)?.write = Some(pending);
                Poll::Pending
            },
        }
    }

    /// Configure the handle or control its connection.
    pub fn ioctl(&mut self, handle: Handle, request: Ioctl) -> Poll<Result<IoctlReply>> {
        if self.client(handle)?.ioctl.is_some() {
            return Poll::Ready(Err(Error::InProgress));
        }
        match request {
            Ioctl::SetConfig(settings) => Poll::Ready(self.set_config(handle, settings)),
            Ioctl::GetConfig => Poll::Ready(self.get_config(handle)),
            Ioctl::SetOptions(options) => Poll::Ready(self.set_options(handle, options)),
            Ioctl::GetOptions => Poll::Ready(Ok(IoctlReply::Options(self.client(handle)?.options))),
            Ioctl::Connect => self.connect(handle),
            Ioctl::Listen => self.listen(handle),
            Ioctl::Shutdown => self.shutdown(handle),
            Ioctl::Push => {
                let id = self.client(handle)?.conn.ok_or(Error::NotConnected)?;
                self.table.conns[id].borrow_mut().push();
                self.transmit(id);
                Poll::Ready(Ok(IoctlReply::Done))
            },
            Ioctl::Abort => self.abort(handle),
        }
    }

    /// Cancel a pending operation.
    ///
    /// Its reply is posted as a completion: a write that moved some bytes reports their number,
    /// everything else fails with `Interrupted`. Operations that already completed are not
    /// affected.
    pub fn cancel(&mut self, handle: Handle, op: Op) -> Result<()> {
        let client = self.clients.get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(Error::BadHandle)?;

        let reply = match op {
            Op::Read => client.read.take().map(|_| Reply::Read(Err(Error::Interrupted))),
            Op::Write => client.write.take().map(|pending| Reply::Write(match pending.done {
                0 => Err(Error::Interrupted),
                done => Ok(done),
            })),
            Op::Ioctl => match client.ioctl.take() {
                Some(Waiting::Connect) | Some(Waiting::Listen) => {
                    if let Some(id) = client.conn.take() {
                        self.table.conns[id].borrow_mut().release();
                        self.timers.cancel(id);
                    }
                    Some(Reply::Ioctl(Err(Error::Interrupted)))
                },
                Some(Waiting::Shutdown) => Some(Reply::Ioctl(Err(Error::Interrupted))),
                None => None,
            },
        };

        if let Some(reply) = reply {
            self.replies.push_back(Completion { handle, reply });
        }
        Ok(())
    }

    fn client(&self, handle: Handle) -> Result<&Client> {
        self.clients.get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(Error::BadHandle)
    }

    fn client_mut(&mut self, handle: Handle) -> Result<&mut Client> {
        self.clients.get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(Error::BadHandle)
    }

    fn set_config(&mut self, handle: Handle, settings: Settings) -> Result<IoctlReply> {
        let client = self.client(handle)?;
        if client.conn.is_some() {
            return Err(Error::AlreadyConnected);
        }
        if let Some(LocalPort::Set(0)) = settings.local_port {
            return Err(Error::BadMode);
        }
        if let Some(Remote::Only(0)) = settings.remote_port {
            return Err(Error::BadMode);
        }
        if let Some(Remote::Only(addr)) = settings.remote_addr {
            if addr.is_unspecified() {
                return Err(Error::BadMode);
            }
        }

        let port = client.port;
        let access = settings.access.unwrap_or(client.access);
        let exclusive = access == Access::Exclusive;
        let local_port = match settings.local_port {
            None => client.local_port,
            Some(LocalPort::Unset) => None,
            Some(LocalPort::Set(local)) => Some(local),
            Some(LocalPort::Select) => Some(self.select_port(handle, port)?),
        };
        if let Some(local) = local_port {
            let conflict = self.clients.iter().enumerate().any(|(idx, other)| match other {
                Some(other) if idx != handle.0 && other.port == port =>
                    other.local_port == Some(local) && (exclusive || other.exclusive()),
                _ => false,
            });
            if conflict {
                return Err(Error::AddrInUse);
            }
        }

        let client = self.client_mut(handle)?;
        client.access = access;
        client.local_port = local_port;
        if let Some(remote_addr) = settings.remote_addr {
            client.remote_addr = remote_addr;
        }
        if let Some(remote_port) = settings.remote_port {
            client.remote_port = remote_port;
        }
        Ok(IoctlReply::Done)
    }

    /// An ephemeral port unused on `port`, preferring one derived from the handle.
    fn select_port(&self, handle: Handle, port: PortId) -> Result<u16> {
        let in_use = |candidate: u16| self.clients.iter().enumerate().any(|(idx, other)| match other {
            Some(other) => idx != handle.0 && other.port == port && other.local_port == Some(candidate),
            None => false,
        });

        let range = u32::from(u16::max_value()) - u32::from(EPHEMERAL) + 1;
        let preferred = u32::from(EPHEMERAL) + (handle.0 as u32) % range;
        (0..range)
            .map(|step| (u32::from(EPHEMERAL) + (preferred - u32::from(EPHEMERAL) + step) % range) as u16)
            .find(|&candidate| !in_use(candidate))
            .ok_or(Error::AddrInUse)
    }

    fn get_config(&self, handle: Handle) -> Result<IoctlReply> {
        let client = self.client(handle)?;
        let mut config = ClientConfig {
            access: client.access,
            local_addr: self.ports[client.port].address,
            local_port: client.local_port.map_or(LocalPort::Unset, LocalPort::Set),
            remote_addr: client.remote_addr,
            remote_port: client.remote_port,
        };
        if let Some(id) = client.conn {
            let conn = self.table.conns[id].borrow();
            if conn.state != State::Listen && conn.in_use {
                config.local_addr = conn.tuple.local_addr;
                config.local_port = LocalPort::Set(conn.tuple.local_port);
                config.remote_addr = Remote::Only(conn.tuple.remote_addr);
                config.remote_port = Remote::Only(conn.tuple.remote_port);
            }
        }
        Ok(IoctlReply::Config(config))
    }

    fn set_options(&mut self, handle: Handle, options: Options) -> Result<IoctlReply> {
        let client = self.client_mut(handle)?;
        if options.bsd_urgent && client.conn.is_none() {
            return Err(Error::Invalid);
        }
        client.options = options;
        if let Some(id) = client.conn {
            self.table.conns[id].borrow_mut().bsd_urgent = options.bsd_urgent;
        }
        Ok(IoctlReply::Done)
    }

    /// Whether a client on `port` wants SYNs to `local_port` dropped instead of reset.
    pub(crate) fn delays_reset(&self, port: PortId, local_port: u16) -> bool {
        self.clients.iter().flatten().any(|client| {
            client.port == port && client.local_port == Some(local_port) && client.options.delay_rst
        })
    }

    fn connect(&mut self, handle: Handle) -> Poll<Result<IoctlReply>> {
        let client = self.client(handle)?;
        if client.conn.is_some() {
            return Poll::Ready(Err(Error::AlreadyConnected));
        }
        let tuple = match (client.local_port, client.remote_addr, client.remote_port) {
            (Some(local_port), Remote::Only(remote_addr), Remote::Only(remote_port)) => FourTuple {
                local_addr: self.ports[client.port].address,
                local_port,
                remote_addr,
                remote_port,
            },
            _ => return Poll::Ready(Err(Error::BadMode)),
        };
        let (port, bsd_urgent) = (client.port, client.options.bsd_urgent);
        if self.find_exact(tuple).is_some() {
            return Poll::Ready(Err(Error::AddrInUse));
        }
        let id = self.find_empty().ok_or(Error::Again)?;

        let iss = self.initial_seq(tuple);
        {
            let mut conn = self.table.conns[id].borrow_mut();
            conn.open_active(port, tuple, handle, iss, self.now, &self.table.config);
            conn.bsd_urgent = bsd_urgent;
        }
        let client = self.client_mut(handle)?;
        client.conn = Some(id);
        client.ioctl = Some(Waiting::Connect);
        self.transmit(id);
        Poll::Pending
    }

    fn listen(&mut self, handle: Handle) -> Poll<Result<IoctlReply>> {
        let client = self.client(handle)?;
        if client.conn.is_some() {
            return Poll::Ready(Err(Error::AlreadyConnected));
        }
        let local_port = client.local_port.ok_or(Error::BadMode)?;
        let filter = FourTuple {
            local_addr: self.ports[client.port].address,
            local_port,
            remote_addr: match client.remote_addr {
                Remote::Only(addr) => addr,
                Remote::Any => Ipv4Address::UNSPECIFIED,
            },
            remote_port: match client.remote_port {
                Remote::Only(port) => port,
                Remote::Any => 0,
            },
        };
        let (port, bsd_urgent) = (client.port, client.options.bsd_urgent);
        let id = self.find_empty().ok_or(Error::Again)?;

        {
            let mut conn = self.table.conns[id].borrow_mut();
            conn.open_passive(port, filter, handle, self.now, &self.table.config);
            conn.bsd_urgent = bsd_urgent;
        }
        let client = self.client_mut(handle)?;
        client.conn = Some(id);
        client.ioctl = Some(Waiting::Listen);
        Poll::Pending
    }

    fn shutdown(&mut self, handle: Handle) -> Poll<Result<IoctlReply>> {
        let client = self.client(handle)?;
        let id = client.conn.ok_or(Error::NotConnected)?;
        if client.write.is_some() {
            self.client_mut(handle)?.ioctl = Some(Waiting::Shutdown);
            return Poll::Pending;
        }
        self.table.conns[id].borrow_mut().shutdown()?;
        self.transmit(id);
        Poll::Ready(Ok(IoctlReply::Done))
    }

    fn abort(&mut self, handle: Handle) -> Poll<Result<IoctlReply>> {
        let id = self.client(handle)?.conn.ok_or(Error::NotConnected)?;
        let table = self.table.clone();
        let (port, reset) = {
            let mut conn = table.conns[id].borrow_mut();
            let reset = match conn.state {
                State::SynReceived | State::Established | State::Closing => Some(conn.reset()),
                _ => None,
            };
            conn.close(Some(Error::ConnReset), self.now, &table.config);
            (conn.port, reset)
        };
        if let Some(reset) = reset {
            self.send_reset(port, reset);
        }
        self.wake(id);
        Poll::Ready(Ok(IoctlReply::Done))
    }

    /// Progress the operations waiting on a connection after its state changed, then let it send.
    pub(crate) fn wake(&mut self, id: ConnId) {
        let table = self.table.clone();
        let (in_use, owner, state) = {
            let conn = table.conns[id].borrow();
            (conn.in_use, conn.owner, conn.state)
        };
        if !in_use {
            self.timers.cancel(id);
            return;
        }

        if let Some(handle) = owner {
            self.wake_client(handle, id);
        }
        self.transmit(id);

        if owner.is_none() && state == State::Closed {
            table.conns[id].borrow_mut().release();
            self.timers.cancel(id);
        }
    }

    fn wake_client(&mut self, handle: Handle, id: ConnId) {
        let table = self.table.clone();
        let config = &table.config;
        let client = match self.clients.get_mut(handle.0).and_then(Option::as_mut) {
            Some(client) => client,
            None => return,
        };
        if client.conn != Some(id) {
            return;
        }
        let replies = &mut self.replies;
        let mut reply = |reply| replies.push_back(Completion { handle, reply });
        let mut conn = table.conns[id].borrow_mut();

        if let Some(Waiting::Connect) | Some(Waiting::Listen) = client.ioctl {
            match conn.state {
                State::Established | State::Closing => {
                    client.ioctl = None;
                    reply(Reply::Ioctl(Ok(IoctlReply::Done)));
                },
                State::Closed => {
                    client.ioctl = None;
                    client.conn = None;
                    let error = conn.error.unwrap_or(Error::ConnReset);
                    conn.release();
                    reply(Reply::Ioctl(Err(error)));
                    return;
                },
                _ => (),
            }
        }

        if let Some(pending) = client.write.take() {
            if conn.state == State::Closed {
                let error = conn.error.unwrap_or(Error::NotConnected);
                reply(Reply::Write(if pending.done > 0 { Ok(pending.done) } else { Err(error) }));
            } else {
                let (taken, rest) = conn.queue(pending.rest, client.options.send_urgent, config);
                let done = pending.done + taken;
                match rest {
                    None => reply(Reply::Write(Ok(done))),
                    Some(rest) => client.write = Some(PendingWrite { rest, done }),
                }
            }
        }

        if client.write.is_none() && client.ioctl == Some(Waiting::Shutdown) {
            client.ioctl = None;
            reply(Reply::Ioctl(conn.shutdown().map(|()| IoctlReply::Done)));
        }

        if let Some(max) = client.read {
            if let Poll::Ready(result) = delivered(conn.take(max, client.options.recv_urgent, config)) {
                client.read = None;
                reply(Reply::Read(result));
            }
        }
    }
}
