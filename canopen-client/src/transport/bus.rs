// bus.rs - the raw frame interface every CAN backend implements
use std::io;
use std::sync::Arc;

use super::frame::CanMessage;

/// A physical or virtual CAN channel.
///
/// Individual reads and writes must be atomic at the driver boundary: the
/// handle is shared between the monitor task, foreground SDO/NMT calls and
/// the PDO outbound queue.
pub trait CanBus: Send + Sync {
    /// Blocking send of one frame
    fn write_frame(&self, frame: &CanMessage) -> io::Result<()>;

    /// Single non-blocking poll. `Ok(None)` means nothing is pending.
    fn read_frame(&self) -> io::Result<Option<CanMessage>>;

    /// Liveness probe run by the monitor while the channel is ready
    fn check(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens a fresh bus handle. Called repeatedly by the monitor until it succeeds.
pub trait BusOpener: Send + Sync + 'static {
    fn open(&self) -> io::Result<Arc<dyn CanBus>>;

    /// Human readable channel name for log output
    fn describe(&self) -> String {
        "CAN bus".to_string()
    }
}

impl<F> BusOpener for F
where
    F: Fn() -> io::Result<Arc<dyn CanBus>> + Send + Sync + 'static,
{
    fn open(&self) -> io::Result<Arc<dyn CanBus>> {
        self()
    }
}

// errno values reported by SocketCAN when the device disappears
const ENXIO: i32 = 6;
const ENODEV: i32 = 19;
const ENETDOWN: i32 = 100;

/// Errors after which the handle is unusable and the channel must be re-opened
pub fn is_fatal_io_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    ) || matches!(err.raw_os_error(), Some(ENXIO | ENODEV | ENETDOWN))
}
