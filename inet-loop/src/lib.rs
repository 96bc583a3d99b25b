//! Runs two engines against each other over simulated links.
//!
//! The client connects, writes its bytes in chunks and shuts its side down. The server reads until
//! the end of the stream and checks every byte against the pattern the client sent. Time is
//! simulated: a round of deliveries takes the configured latency, and while both links are idle
//! the clock jumps to the next timer of either engine.
mod link;
mod logger;
mod score;

pub mod config;

pub use link::Link;
pub use logger::init as init_logger;
pub use score::Score;

use std::{cmp, fmt};
use std::task::Poll;

use inet::buf::{Chain, Pool};
use inet::layer::{self, tcp};
use inet::layer::tcp::{Completion, Endpoint, Handle, Ioctl, IoctlReply, LocalPort, Remote, Reply, Settings};
use inet::time::{Duration, Instant};
use inet::wire::Ipv4Address;

pub const CLIENT: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
pub const SERVER: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

/// Why a transfer failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// An operation of either engine failed.
    Tcp(layer::Error),
    /// The server read something else than what was sent at `offset`.
    Corrupted { offset: u64 },
    /// The stream ended after `received` bytes.
    Truncated { received: u64 },
    /// The simulated time ran out.
    TimedOut,
}

impl From<layer::Error> for Error {
    fn from(err: layer::Error) -> Self {
        Error::Tcp(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Tcp(err) => write!(f, "tcp: {}", err),
            Error::Corrupted { offset } => write!(f, "corrupted byte at offset {}", offset),
            Error::Truncated { received } => write!(f, "stream ended after {} bytes", received),
            Error::TimedOut => write!(f, "transfer timed out"),
        }
    }
}

impl std::error::Error for Error {}

fn byte_at(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Wait for a request that never blocks.
fn immediate(poll: Poll<layer::Result<IoctlReply>>) -> Result<IoctlReply, Error> {
    match poll {
        Poll::Ready(result) => Ok(result?),
        Poll::Pending => Err(Error::Tcp(layer::Error::InProgress)),
    }
}

struct Sender {
    handle: Handle,
    chunk: usize,
    total: u64,
    written: u64,
    connected: bool,
    writing: bool,
    shut: bool,
}

struct Receiver {
    handle: Handle,
    chunk: usize,
    received: u64,
    accepted: bool,
    reading: bool,
    eof: bool,
}

impl Sender {
    fn completed(&mut self, completion: Completion) -> Result<(), Error> {
        match completion.reply {
            Reply::Ioctl(Ok(_)) => self.connected = true,
            Reply::Write(Ok(_)) => self.writing = false,
            Reply::Read(Ok(_)) => (),
            Reply::Ioctl(Err(err)) | Reply::Write(Err(err)) | Reply::Read(Err(err)) =>
                return Err(err.into()),
        }
        Ok(())
    }

    fn progress(&mut self, endpoint: &mut Endpoint<Link>) -> Result<(), Error> {
        if !self.connected || self.writing || self.shut {
            return Ok(());
        }
        while self.written < self.total {
            let len = cmp::min(self.chunk as u64, self.total - self.written) as usize;
            let data: Vec<u8> = (0..len).map(|i| byte_at(self.written + i as u64)).collect();
            let data = endpoint.pool().alloc_from(&data);
            self.written += len as u64;
            match endpoint.write(self.handle, data) {
                Poll::Ready(result) => {
                    result?;
                },
                Poll::Pending => {
                    self.writing = true;
                    return Ok(());
                },
            }
        }
        immediate(endpoint.ioctl(self.handle, Ioctl::Shutdown))?;
        log::info!("client: all {} bytes written, shut down", self.total);
        self.shut = true;
        Ok(())
    }
}

impl Receiver {
    fn completed(&mut self, completion: Completion) -> Result<(), Error> {
        match completion.reply {
            Reply::Ioctl(Ok(_)) => self.accepted = true,
            Reply::Read(Ok(data)) => {
                self.reading = false;
                self.consume(data)?;
            },
            Reply::Write(Ok(_)) => (),
            Reply::Ioctl(Err(err)) | Reply::Write(Err(err)) | Reply::Read(Err(err)) =>
                return Err(err.into()),
        }
        Ok(())
    }

    fn consume(&mut self, data: Option<Chain>) -> Result<(), Error> {
        let data = match data {
            Some(data) => data,
            None => {
                log::info!("server: end of stream after {} bytes", self.received);
                self.eof = true;
                return Ok(());
            },
        };
        let (_, corrupted) = data.fold((self.received, None), |(offset, bad), bytes| {
            let bad = bad.or_else(|| bytes.iter()
                .enumerate()
                .find(|&(idx, &byte)| byte != byte_at(offset + idx as u64))
                .map(|(idx, _)| offset + idx as u64));
            (offset + bytes.len() as u64, bad)
        });
        if let Some(offset) = corrupted {
            return Err(Error::Corrupted { offset });
        }
        self.received += data.len() as u64;
        Ok(())
    }

    fn progress(&mut self, endpoint: &mut Endpoint<Link>) -> Result<(), Error> {
        if !self.accepted || self.reading {
            return Ok(());
        }
        while !self.eof {
            match endpoint.read(self.handle, self.chunk) {
                Poll::Ready(result) => self.consume(result?)?,
                Poll::Pending => {
                    self.reading = true;
                    break;
                },
            }
        }
        Ok(())
    }
}

/// Transfer `config.bytes` from a client engine to a server engine.
pub fn run(config: &config::Config) -> Result<Score, Error> {
    let pool = Pool::new(&config.pool());
    let forward = Link::new(config.mtu, config.queue, config.drop_every);
    let backward = Link::new(config.mtu, config.queue, config.drop_every);

    let mut client = Endpoint::new(pool.clone(), tcp::Config::default());
    let client_port = client.add_port(CLIENT, forward.clone());
    let mut server = Endpoint::new(pool, tcp::Config::default());
    let server_port = server.add_port(SERVER, backward.clone());

    let listener = server.open(server_port)?;
    immediate(server.ioctl(listener, Ioctl::SetConfig(Settings {
        local_port: Some(LocalPort::Set(config.port)),
        ..Settings::default()
    })))?;
    if let Poll::Ready(result) = server.ioctl(listener, Ioctl::Listen) {
        result?;
    }

    let handle = client.open(client_port)?;
    immediate(client.ioctl(handle, Ioctl::SetConfig(Settings {
        local_port: Some(LocalPort::Select),
        remote_addr: Some(Remote::Only(SERVER)),
        remote_port: Some(Remote::Only(config.port)),
        ..Settings::default()
    })))?;
    if let Poll::Ready(result) = client.ioctl(handle, Ioctl::Connect) {
        result?;
    }

    let mut sender = Sender {
        handle,
        chunk: config.chunk.max(1),
        total: config.bytes as u64,
        written: 0,
        connected: false,
        writing: false,
        shut: false,
    };
    let mut receiver = Receiver {
        handle: listener,
        chunk: config.chunk.max(1),
        received: 0,
        accepted: false,
        reading: false,
        eof: false,
    };

    let start = Instant::from_millis(0);
    let deadline = start + Duration::from_secs(config.timeout.into());
    let latency = Duration::from_millis(config.latency.into());
    let mut now = start;

    loop {
        let done: Vec<_> = client.completions().collect();
        for completion in done {
            sender.completed(completion)?;
        }
        let done: Vec<_> = server.completions().collect();
        for completion in done {
            receiver.completed(completion)?;
        }
        sender.progress(&mut client)?;
        receiver.progress(&mut server)?;
        if receiver.eof {
            break;
        }

        let idle = forward.is_empty() && backward.is_empty();
        forward.pump(&mut client, client_port, &mut server, server_port);
        backward.pump(&mut server, server_port, &mut client, client_port);

        now += latency;
        if idle {
            let next = cmp::min(client.next_deadline(), server.next_deadline());
            if let Some(at) = next.when() {
                now = cmp::max(now, at);
            }
        }
        if now > deadline {
            log::warn!("gave up at {} with {} bytes received", now, receiver.received);
            return Err(Error::TimedOut);
        }
        client.advance(now);
        server.advance(now);
    }

    if receiver.received != sender.total {
        return Err(Error::Truncated { received: receiver.received });
    }
    Ok(Score {
        data_len: receiver.received,
        time: now - start,
        segments: forward.sent.get() + backward.sent.get(),
        dropped: forward.dropped.get() + backward.dropped.get(),
    })
}
