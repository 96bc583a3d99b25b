use std::cell::{Cell, RefCell};
use std::rc::Rc;

use inet::buf::{Chain, ChainQueue};
use inet::layer::ip::{Arrival, IpLayer, SendError, SendInfo};
use inet::layer::tcp::{Endpoint, PortId};
use inet::wire::{IpProtocol, Ipv4Address, IPV4_HEADER_LEN};

/// One direction of a point-to-point link.
///
/// Clones share the queue, the sending engine owns one and the driver another.
#[derive(Clone)]
pub struct Link {
    queue: Rc<RefCell<ChainQueue>>,
    mtu: usize,
    capacity: usize,
    /// Refused a segment since the last pump.
    blocked: Rc<Cell<bool>>,
    drop_every: usize,
    pub(crate) sent: Rc<Cell<u32>>,
    pub(crate) dropped: Rc<Cell<u32>>,
}

impl Link {
    pub fn new(mtu: usize, capacity: usize, drop_every: usize) -> Self {
        Link {
            queue: Rc::new(RefCell::new(ChainQueue::new())),
            mtu,
            capacity,
            blocked: Rc::new(Cell::new(false)),
            drop_every,
            sent: Rc::new(Cell::new(0)),
            dropped: Rc::new(Cell::new(0)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Deliver everything queued to `to`, then tell `from` the link has room again.
    pub fn pump(&self,
        from: &mut Endpoint<Link>, from_port: PortId,
        to: &mut Endpoint<Link>, to_port: PortId,
    ) {
        let arrival = Arrival {
            src: address(from, from_port),
            dst: address(to, to_port),
            protocol: IpProtocol::Tcp,
        };
        loop {
            let segment = match self.queue.borrow_mut().pop() {
                Some(segment) => segment,
                None => break,
            };
            let count = self.sent.get() + 1;
            self.sent.set(count);
            if self.drop_every > 0 && count as usize % self.drop_every == 0 {
                log::debug!("link {} -> {}: dropping segment {}", arrival.src, arrival.dst, count);
                self.dropped.set(self.dropped.get() + 1);
                continue;
            }
            to.receive(to_port, arrival, segment);
        }

        if self.blocked.replace(false) {
            from.writable(from_port);
        }
    }
}

fn address(endpoint: &Endpoint<Link>, port: PortId) -> Ipv4Address {
    endpoint.address(port).unwrap_or(Ipv4Address::UNSPECIFIED)
}

impl IpLayer for Link {
    fn send(&mut self, info: SendInfo, segment: Chain) -> Result<(), SendError> {
        if info.dont_fragment && segment.len() + IPV4_HEADER_LEN > self.mtu {
            return Err(SendError::TooBig { mtu: Some(self.mtu as u16) });
        }
        let mut queue = self.queue.borrow_mut();
        if queue.len() >= self.capacity {
            self.blocked.set(true);
            return Err(SendError::WouldBlock(segment));
        }
        queue.push(segment);
        Ok(())
    }
}
