// socket.rs - Linux SocketCAN backend
use socketcan::{CanFrame, CanSocket, Socket};
use std::io;
use std::time::Duration;
use tracing::{debug, trace};

use super::bus::CanBus;
use super::frame::{timestamp_now_us, CanMessage};

/// Sends attempted while the kernel TX queue stays full
const WRITE_ATTEMPTS: u32 = 20;
const WRITE_RETRY_DELAY: Duration = Duration::from_micros(250);

// errno for a full TX queue on a non-blocking CAN socket
const ENOBUFS: i32 = 105;

/// Raw SocketCAN socket bound to one interface (e.g. `can0`, `vcan0`).
///
/// Reads never block. Writes wait out a full TX queue for a few
/// milliseconds before giving up. The bit rate is configured at the OS level
/// (`ip link set can0 type can bitrate 250000`), not through this handle.
pub struct SocketCanBus {
    socket: CanSocket,
    interface: String,
}

impl SocketCanBus {
    pub fn open(interface: &str) -> io::Result<Self> {
        let socket = CanSocket::open(interface)?;
        socket.set_nonblocking(true)?;
        debug!("Opened SocketCAN interface {}", interface);

        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl CanBus for SocketCanBus {
    fn write_frame(&self, frame: &CanMessage) -> io::Result<()> {
        let frame = CanFrame::try_from(frame)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        send_with_retry(|| self.socket.write_frame(&frame))
    }

    fn read_frame(&self) -> io::Result<Option<CanMessage>> {
        match self.socket.read_frame() {
            Ok(CanFrame::Error(_)) => {
                // Bus error frames are below the protocol layer
                trace!("{}: ignoring error frame", self.interface);
                Ok(None)
            }
            // Stamped on dequeue, so the value includes time spent queued in the socket
            Ok(frame) => Ok(Some(CanMessage::from_frame(&frame, timestamp_now_us()))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn tx_queue_full(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(ENOBUFS)
}

/// Run `send` until it gets past a full TX queue or runs out of attempts
fn send_with_retry(mut send: impl FnMut() -> io::Result<()>) -> io::Result<()> {
    let mut attempt = 1;
    loop {
        match send() {
            Err(err) if tx_queue_full(&err) && attempt < WRITE_ATTEMPTS => {
                attempt += 1;
                std::thread::sleep(WRITE_RETRY_DELAY);
            }
            result => return result,
        }
    }
}
