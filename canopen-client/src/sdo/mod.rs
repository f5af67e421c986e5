//! SDO client: expedited, segmented and block transfers.
//!
//! Every transfer is a call-scoped request/response session against one
//! node. There is no standing connection and no automatic retry; timeouts
//! and aborts are terminal and reported to the caller.

pub mod abort;
mod client;
pub mod command;

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

pub use abort::{abort_code_description, ABORT_CODES, UNKNOWN_ABORT_CODE};
pub use client::SdoClient;
pub use command::{expedited_download_opcode, expedited_len, ClientCommand, ServerResponse};

/// Time allowed for each request/response exchange (per segment or block
/// for the non-expedited modes)
pub const SDO_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Expedited,
    Segmented,
    Block,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expedited => write!(f, "expedited"),
            Self::Segmented => write!(f, "segmented"),
            Self::Block => write!(f, "block"),
        }
    }
}

/// Result of a successful read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoUpload {
    pub mode: TransferMode,
    /// Size reported by the device (bytes received if none was declared)
    pub length: u32,
    /// Expedited: the raw bytes. Segmented: the printable prefix.
    pub data: Vec<u8>,
}

impl SdoUpload {
    /// Up to the first four bytes as a little-endian number
    pub fn as_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        let len = self.data.len().min(4);
        bytes[..len].copy_from_slice(&self.data[..len]);
        u32::from_le_bytes(bytes)
    }

    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum SdoError {
    #[error("SDO timeout on 0x{index:04X}:{subindex:02X}: CAN device present?")]
    Timeout { index: u16, subindex: u8 },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("SDO abort 0x{code:08X}: {info}")]
    AbortTransfer { code: u32, info: &'static str },
    #[error("SDO transfer aborted locally 0x{code:08X}: {info}")]
    LocalAbort { code: u32, info: &'static str },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Could not read block data: {0}")]
    Io(#[from] std::io::Error),
}

impl SdoError {
    pub(crate) fn remote_abort(code: u32) -> Self {
        Self::AbortTransfer {
            code,
            info: abort_code_description(code),
        }
    }

    pub(crate) fn local_abort(code: u32) -> Self {
        Self::LocalAbort {
            code,
            info: abort_code_description(code),
        }
    }

    /// The abort code, for remote and local aborts
    pub fn abort_code(&self) -> Option<u32> {
        match self {
            Self::AbortTransfer { code, .. } | Self::LocalAbort { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_accessors() {
        let upload = SdoUpload {
            mode: TransferMode::Expedited,
            length: 4,
            data: b"ABCD".to_vec(),
        };
        assert_eq!(upload.as_text(), "ABCD");
        assert_eq!(upload.as_u32(), 0x4443_4241);

        let short = SdoUpload {
            mode: TransferMode::Expedited,
            length: 2,
            data: vec![0x34, 0x12],
        };
        assert_eq!(short.as_u32(), 0x1234);
    }

    #[test]
    fn abort_errors_carry_code_and_text() {
        let err = SdoError::remote_abort(0x0602_0000);
        assert_eq!(err.abort_code(), Some(0x0602_0000));
        assert_eq!(
            err.to_string(),
            "SDO abort 0x06020000: Object does not exist in the object dictionary"
        );
        assert_eq!(SdoError::Timeout { index: 0x1008, subindex: 0 }.abort_code(), None);
    }
}
