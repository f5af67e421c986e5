// mod.rs - CAN transport layer
mod bus;
mod channel;
mod frame;
mod socket;
mod virtual_bus;

pub use bus::{is_fatal_io_error, BusOpener, CanBus};
pub use channel::{CanChannel, ChannelState, TransportError};
pub use frame::{timestamp_now_us, CanMessage, FrameError, CAN_EFF_MASK, CAN_MAX_DLEN, CAN_SFF_MASK};
pub use socket::SocketCanBus;
pub use virtual_bus::VirtualBus;
