// frame.rs - CAN frame value type shared by every bus implementation
use socketcan::{CanFrame, EmbeddedFrame, ExtendedId, Id, StandardId};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Maximum payload of a classic CAN frame
pub const CAN_MAX_DLEN: usize = 8;
/// Largest 11-bit identifier
pub const CAN_SFF_MASK: u32 = 0x7FF;
/// Largest 29-bit identifier
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("CAN identifier 0x{id:X} out of range (extended: {extended})")]
    InvalidId { id: u32, extended: bool },
    #[error("CAN payload of {0} bytes exceeds 8 bytes")]
    PayloadTooLong(usize),
}

/// A single classic CAN frame.
///
/// Created per I/O call and never persisted. `timestamp_us` is wall-clock
/// microseconds since the Unix epoch, zero for outbound frames. SocketCAN
/// stamps a frame when it is dequeued from the socket, not with the kernel
/// receive time, so it includes any delay before the read. `VirtualBus`
/// stamps on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanMessage {
    pub id: u32,
    pub extended: bool,
    pub len: u8,
    pub data: [u8; CAN_MAX_DLEN],
    pub timestamp_us: u64,
}

impl CanMessage {
    /// Create a frame, validating the identifier and payload length
    pub fn new(id: u32, extended: bool, payload: &[u8]) -> Result<Self, FrameError> {
        let mask = if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        if id > mask {
            return Err(FrameError::InvalidId { id, extended });
        }
        if payload.len() > CAN_MAX_DLEN {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }

        let mut data = [0u8; CAN_MAX_DLEN];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            id,
            extended,
            len: payload.len() as u8,
            data,
            timestamp_us: 0,
        })
    }

    /// Full 8-byte standard frame. The identifier is masked to 11 bits.
    pub fn standard(id: u16, data: [u8; CAN_MAX_DLEN]) -> Self {
        Self {
            id: u32::from(id) & CAN_SFF_MASK,
            extended: false,
            len: CAN_MAX_DLEN as u8,
            data,
            timestamp_us: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// The valid part of the payload
    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len).min(CAN_MAX_DLEN)]
    }

    /// True for a standard frame carrying exactly this identifier
    pub fn has_standard_id(&self, id: u16) -> bool {
        !self.extended && self.id == u32::from(id)
    }

    /// Convert a received SocketCAN frame
    pub fn from_frame(frame: &CanFrame, timestamp_us: u64) -> Self {
        let (id, extended) = match frame.id() {
            Id::Standard(std_id) => (u32::from(std_id.as_raw()), false),
            Id::Extended(ext_id) => (ext_id.as_raw(), true),
        };

        let payload = frame.data();
        let len = payload.len().min(CAN_MAX_DLEN);
        let mut data = [0u8; CAN_MAX_DLEN];
        data[..len].copy_from_slice(&payload[..len]);

        Self {
            id,
            extended,
            len: len as u8,
            data,
            timestamp_us,
        }
    }
}

impl TryFrom<&CanMessage> for CanFrame {
    type Error = FrameError;

    fn try_from(message: &CanMessage) -> Result<Self, FrameError> {
        let invalid = || FrameError::InvalidId {
            id: message.id,
            extended: message.extended,
        };

        let id: Id = if message.extended {
            ExtendedId::new(message.id).ok_or_else(invalid)?.into()
        } else {
            let raw = u16::try_from(message.id).map_err(|_| invalid())?;
            StandardId::new(raw).ok_or_else(invalid)?.into()
        };

        CanFrame::new(id, message.payload()).ok_or(FrameError::PayloadTooLong(message.len as usize))
    }
}

impl fmt::Display for CanMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{:08X}", self.id)?;
        } else {
            write!(f, "0x{:03X}", self.id)?;
        }
        write!(f, " [{}]", self.len)?;
        for byte in self.payload() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Current wall-clock time in microseconds, used to stamp received frames
pub fn timestamp_now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}
