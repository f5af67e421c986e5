// virtual_bus.rs - in-process loopback channel
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::bus::{BusOpener, CanBus};
use super::frame::{timestamp_now_us, CanMessage};

type Queue = Arc<Mutex<VecDeque<CanMessage>>>;

/// One end of a virtual CAN cable.
///
/// Frames written on one end are received on the other. Both ends share a
/// link flag; pulling the link makes every I/O call fail with
/// `NotConnected`, the way a removed USB dongle would.
#[derive(Clone)]
pub struct VirtualBus {
    inbox: Queue,
    peer_inbox: Queue,
    link_up: Arc<AtomicBool>,
}

impl VirtualBus {
    /// Create both ends of a connected virtual cable
    pub fn pair() -> (Self, Self) {
        let a: Queue = Arc::new(Mutex::new(VecDeque::new()));
        let b: Queue = Arc::new(Mutex::new(VecDeque::new()));
        let link_up = Arc::new(AtomicBool::new(true));

        (
            Self {
                inbox: a.clone(),
                peer_inbox: b.clone(),
                link_up: link_up.clone(),
            },
            Self {
                inbox: b,
                peer_inbox: a,
                link_up,
            },
        )
    }

    pub fn set_link(&self, up: bool) {
        self.link_up.store(up, Ordering::Release);
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    /// Number of frames waiting to be read on this end
    pub fn pending(&self) -> usize {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drain everything waiting on this end
    pub fn drain(&self) -> Vec<CanMessage> {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// An opener handing out this end, failing while the link is down
    pub fn opener(&self) -> impl BusOpener {
        let bus = self.clone();
        move || -> io::Result<Arc<dyn CanBus>> {
            if bus.is_link_up() {
                Ok(Arc::new(bus.clone()))
            } else {
                Err(io::Error::new(io::ErrorKind::NotFound, "virtual CAN link is down"))
            }
        }
    }

    fn ensure_link(&self) -> io::Result<()> {
        if self.is_link_up() {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::NotConnected))
        }
    }
}

impl CanBus for VirtualBus {
    fn write_frame(&self, frame: &CanMessage) -> io::Result<()> {
        self.ensure_link()?;
        let stamped = frame.with_timestamp(timestamp_now_us());
        self.peer_inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(stamped);
        Ok(())
    }

    fn read_frame(&self) -> io::Result<Option<CanMessage>> {
        self.ensure_link()?;
        Ok(self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front())
    }

    fn check(&self) -> io::Result<()> {
        self.ensure_link()
    }
}
