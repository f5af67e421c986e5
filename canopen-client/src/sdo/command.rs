// command.rs - SDO command specifiers and frame layout
//
// Byte 0 of every SDO frame packs the command specifier together with
// flags (toggle, size, unused-byte counts). The enums below are the only
// place that bit layout is spelled out; everything else goes through
// `encode`/`decode`.
use crate::transport::CanMessage;

/// Payload bytes carried by one segment or block sub-segment
pub const SEGMENT_DATA_SIZE: usize = 7;
/// Payload bytes carried by an expedited frame
pub const EXPEDITED_DATA_SIZE: usize = 4;
/// Largest block size a server may negotiate
pub const MAX_BLOCK_SIZE: u8 = 127;

/// End-of-block-download opcodes indexed by the number of valid bytes in
/// the last sub-segment
pub const BLOCK_END_OPCODES: [u8; 8] = [0xDD, 0xD9, 0xD5, 0xD1, 0xCD, 0xC9, 0xC5, 0xC1];

const TOGGLE_BIT: u8 = 0x10;
const LAST_SEGMENT_BIT: u8 = 0x01;
const LAST_SUB_SEGMENT_BIT: u8 = 0x80;

/// Client to server command (byte 0 of a `0x600 + node` frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    /// Read request (`0x40`)
    InitiateUpload,
    /// Segment request during an upload (`0x60`/`0x70`)
    UploadSegment { toggle: bool },
    /// Write of 1 to 4 bytes in a single frame
    ExpeditedDownload { len: u8 },
    /// Segmented write request, size in bytes 4-7 (`0x21`)
    InitiateSegmentedDownload,
    /// Data segment of a segmented write
    DownloadSegment { toggle: bool, unused: u8, last: bool },
    /// Block write request without CRC, size in bytes 4-7 (`0xC2`)
    InitiateBlockDownload,
    /// Sub-segment of a block; `last` marks the final one of the transfer
    BlockSubSegment { seqno: u8, last: bool },
    /// End of block download, `valid_bytes` in the last sub-segment
    EndBlockDownload { valid_bytes: u8 },
    Abort,
}

impl ClientCommand {
    pub fn encode(self) -> u8 {
        match self {
            Self::InitiateUpload => 0x40,
            Self::UploadSegment { toggle } => 0x60 | toggle_bit(toggle),
            Self::ExpeditedDownload { len } => {
                let len = len.clamp(1, EXPEDITED_DATA_SIZE as u8);
                0x23 | ((EXPEDITED_DATA_SIZE as u8 - len) << 2)
            }
            Self::InitiateSegmentedDownload => 0x21,
            Self::DownloadSegment { toggle, unused, last } => {
                toggle_bit(toggle) | ((unused & 0x07) << 1) | u8::from(last)
            }
            Self::InitiateBlockDownload => 0xC2,
            Self::BlockSubSegment { seqno, last } => {
                (seqno & 0x7F) | if last { LAST_SUB_SEGMENT_BIT } else { 0 }
            }
            Self::EndBlockDownload { valid_bytes } => {
                BLOCK_END_OPCODES[usize::from(valid_bytes.min(SEGMENT_DATA_SIZE as u8))]
            }
            Self::Abort => 0x80,
        }
    }

    /// Decode a command outside of a block. Sub-segments are positional
    /// and must be decoded with [`ClientCommand::decode_sub_segment`].
    pub fn decode(byte: u8) -> Option<Self> {
        match byte >> 5 {
            0 => Some(Self::DownloadSegment {
                toggle: byte & TOGGLE_BIT != 0,
                unused: (byte >> 1) & 0x07,
                last: byte & LAST_SEGMENT_BIT != 0,
            }),
            1 if byte & 0x02 != 0 => Some(Self::ExpeditedDownload {
                len: indicated_len(byte),
            }),
            1 => Some(Self::InitiateSegmentedDownload),
            2 => Some(Self::InitiateUpload),
            3 => Some(Self::UploadSegment {
                toggle: byte & TOGGLE_BIT != 0,
            }),
            4 => Some(Self::Abort),
            6 if byte & 0x01 == 0 => Some(Self::InitiateBlockDownload),
            6 => Some(Self::EndBlockDownload {
                valid_bytes: SEGMENT_DATA_SIZE as u8 - ((byte >> 2) & 0x07),
            }),
            _ => None,
        }
    }

    pub fn decode_sub_segment(byte: u8) -> Self {
        Self::BlockSubSegment {
            seqno: byte & 0x7F,
            last: byte & LAST_SUB_SEGMENT_BIT != 0,
        }
    }
}

/// Server to client response (byte 0 of a `0x580 + node` frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerResponse {
    /// Read answered in the frame itself, 1 to 4 bytes
    UploadExpedited { len: u8 },
    /// Read continues with segments (`0x41` with size, `0x40` without)
    UploadSegmented { size_indicated: bool },
    UploadSegment { toggle: bool, unused: u8, last: bool },
    /// Write accepted (`0x60`; `0x70` is taken as the same answer)
    DownloadInitiated,
    /// Segment accepted (`0x20`/`0x30`)
    DownloadSegmentAck { toggle: bool },
    /// Block write accepted, block size in byte 4 (`0xA0`/`0xA4`)
    BlockDownloadInitiated { crc: bool },
    /// Block acknowledged, ackseq in byte 1 and next block size in byte 2
    BlockAck,
    /// Block write complete (`0xA1`)
    BlockEnd,
    Abort,
}

impl ServerResponse {
    pub fn encode(self) -> u8 {
        match self {
            Self::UploadExpedited { len } => {
                let len = len.clamp(1, EXPEDITED_DATA_SIZE as u8);
                0x43 | ((EXPEDITED_DATA_SIZE as u8 - len) << 2)
            }
            Self::UploadSegmented { size_indicated } => 0x40 | u8::from(size_indicated),
            Self::UploadSegment { toggle, unused, last } => {
                toggle_bit(toggle) | ((unused & 0x07) << 1) | u8::from(last)
            }
            Self::DownloadInitiated => 0x60,
            Self::DownloadSegmentAck { toggle } => 0x20 | toggle_bit(toggle),
            Self::BlockDownloadInitiated { crc } => 0xA0 | if crc { 0x04 } else { 0 },
            Self::BlockAck => 0xA2,
            Self::BlockEnd => 0xA1,
            Self::Abort => 0x80,
        }
    }

    pub fn decode(byte: u8) -> Option<Self> {
        match byte >> 5 {
            0 => Some(Self::UploadSegment {
                toggle: byte & TOGGLE_BIT != 0,
                unused: (byte >> 1) & 0x07,
                last: byte & LAST_SEGMENT_BIT != 0,
            }),
            // Devices answering a read with a download opcode are tolerated
            1 if byte & 0x02 != 0 => Some(Self::UploadExpedited {
                len: indicated_len(byte),
            }),
            1 => Some(Self::DownloadSegmentAck {
                toggle: byte & TOGGLE_BIT != 0,
            }),
            2 if byte & 0x02 != 0 => Some(Self::UploadExpedited {
                len: indicated_len(byte),
            }),
            2 => Some(Self::UploadSegmented {
                size_indicated: byte & 0x01 != 0,
            }),
            3 => Some(Self::DownloadInitiated),
            4 => Some(Self::Abort),
            5 => match byte & 0x03 {
                0 => Some(Self::BlockDownloadInitiated {
                    crc: byte & 0x04 != 0,
                }),
                1 => Some(Self::BlockEnd),
                2 => Some(Self::BlockAck),
                _ => None,
            },
            _ => None,
        }
    }
}

fn toggle_bit(toggle: bool) -> u8 {
    if toggle {
        TOGGLE_BIT
    } else {
        0
    }
}

// Expedited frames carry 4 - n bytes, n in bits 3-2 when bit 0 is set
fn indicated_len(byte: u8) -> u8 {
    if byte & 0x01 != 0 {
        EXPEDITED_DATA_SIZE as u8 - ((byte >> 2) & 0x03)
    } else {
        EXPEDITED_DATA_SIZE as u8
    }
}

/// Opcode for an expedited write of `len` bytes, `None` outside `1..=4`
pub fn expedited_download_opcode(len: usize) -> Option<u8> {
    match len {
        1..=EXPEDITED_DATA_SIZE => Some(ClientCommand::ExpeditedDownload { len: len as u8 }.encode()),
        _ => None,
    }
}

/// Payload length selected by an expedited opcode.
///
/// Upload responses `0x43/0x47/0x4B/0x4F` and download requests
/// `0x23/0x27/0x2B/0x2F` map to 4/3/2/1 bytes.
pub fn expedited_len(opcode: u8) -> Option<u8> {
    match opcode {
        0x43 | 0x23 => Some(4),
        0x47 | 0x27 => Some(3),
        0x4B | 0x2B => Some(2),
        0x4F | 0x2F => Some(1),
        _ => None,
    }
}

/// Initiate-style frame: opcode, LE index, subindex and four data bytes
pub fn initiate_frame(cob_id: u16, opcode: u8, index: u16, subindex: u8, payload: [u8; 4]) -> CanMessage {
    let [index_lo, index_hi] = index.to_le_bytes();
    CanMessage::standard(
        cob_id,
        [opcode, index_lo, index_hi, subindex, payload[0], payload[1], payload[2], payload[3]],
    )
}

/// Segment-style frame: opcode plus up to seven data bytes, zero padded
pub fn segment_frame(cob_id: u16, opcode: u8, data: &[u8]) -> CanMessage {
    let mut bytes = [0u8; 8];
    bytes[0] = opcode;
    let len = data.len().min(SEGMENT_DATA_SIZE);
    bytes[1..=len].copy_from_slice(&data[..len]);
    CanMessage::standard(cob_id, bytes)
}

/// Abort frame with the code little-endian in bytes 4-7
pub fn abort_frame(cob_id: u16, index: u16, subindex: u8, code: u32) -> CanMessage {
    initiate_frame(cob_id, ClientCommand::Abort.encode(), index, subindex, code.to_le_bytes())
}

/// Index and subindex of an initiate-style frame
pub fn frame_index(frame: &CanMessage) -> (u16, u8) {
    (u16::from_le_bytes([frame.data[1], frame.data[2]]), frame.data[3])
}

/// Bytes 4-7 as a little-endian value (sizes and abort codes)
pub fn frame_u32(frame: &CanMessage) -> u32 {
    u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]])
}

pub fn frame_abort_code(frame: &CanMessage) -> u32 {
    frame_u32(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expedited_opcodes_round_trip() {
        let opcodes: Vec<u8> = (1..=4).filter_map(expedited_download_opcode).collect();
        assert_eq!(opcodes, vec![0x2F, 0x2B, 0x27, 0x23]);

        for len in 1..=4usize {
            let opcode = expedited_download_opcode(len).unwrap();
            assert_eq!(expedited_len(opcode), Some(len as u8));
            let matching = opcodes
                .iter()
                .filter(|op| expedited_len(**op) == Some(len as u8))
                .count();
            assert_eq!(matching, 1);
        }
        assert_eq!(expedited_download_opcode(0), None);
        assert_eq!(expedited_download_opcode(5), None);
    }

    #[test]
    fn expedited_upload_lengths() {
        assert_eq!(expedited_len(0x43), Some(4));
        assert_eq!(expedited_len(0x47), Some(3));
        assert_eq!(expedited_len(0x4B), Some(2));
        assert_eq!(expedited_len(0x4F), Some(1));
        assert_eq!(expedited_len(0x41), None);
        assert_eq!(ServerResponse::decode(0x4F), Some(ServerResponse::UploadExpedited { len: 1 }));
        assert_eq!(ServerResponse::decode(0x23), Some(ServerResponse::UploadExpedited { len: 4 }));
    }

    #[test]
    fn block_end_opcode_tracks_valid_bytes() {
        let expected = [(7, 0xC1), (6, 0xC5), (5, 0xC9), (4, 0xCD), (3, 0xD1), (2, 0xD5), (1, 0xD9), (0, 0xDD)];
        for (valid_bytes, opcode) in expected {
            let command = ClientCommand::EndBlockDownload { valid_bytes };
            assert_eq!(command.encode(), opcode);
            assert_eq!(ClientCommand::decode(opcode), Some(command));
        }
    }

    #[test]
    fn segment_flags() {
        let segment = ClientCommand::DownloadSegment { toggle: true, unused: 3, last: true };
        assert_eq!(segment.encode(), 0x17);
        assert_eq!(ClientCommand::decode(0x17), Some(segment));

        assert_eq!(ClientCommand::UploadSegment { toggle: false }.encode(), 0x60);
        assert_eq!(ClientCommand::UploadSegment { toggle: true }.encode(), 0x70);
        assert_eq!(
            ServerResponse::decode(0x1D),
            Some(ServerResponse::UploadSegment { toggle: true, unused: 6, last: true })
        );
        assert_eq!(ServerResponse::decode(0x30), Some(ServerResponse::DownloadSegmentAck { toggle: true }));
    }

    #[test]
    fn write_ack_accepts_both_continuation_opcodes() {
        assert_eq!(ServerResponse::decode(0x60), Some(ServerResponse::DownloadInitiated));
        assert_eq!(ServerResponse::decode(0x70), Some(ServerResponse::DownloadInitiated));
    }

    #[test]
    fn block_responses() {
        assert_eq!(ServerResponse::decode(0xA0), Some(ServerResponse::BlockDownloadInitiated { crc: false }));
        assert_eq!(ServerResponse::decode(0xA4), Some(ServerResponse::BlockDownloadInitiated { crc: true }));
        assert_eq!(ServerResponse::decode(0xA2), Some(ServerResponse::BlockAck));
        assert_eq!(ServerResponse::decode(0xA1), Some(ServerResponse::BlockEnd));
        assert_eq!(ClientCommand::decode(0xC2), Some(ClientCommand::InitiateBlockDownload));
        assert_eq!(
            ClientCommand::decode_sub_segment(0x85),
            ClientCommand::BlockSubSegment { seqno: 5, last: true }
        );
        assert_eq!(ServerResponse::decode(0xE0), None);
    }

    #[test]
    fn frame_layout() {
        let frame = initiate_frame(0x620, 0x40, 0x1008, 0x02, [0; 4]);
        assert_eq!(frame.data, [0x40, 0x08, 0x10, 0x02, 0, 0, 0, 0]);
        assert_eq!(frame_index(&frame), (0x1008, 0x02));

        let abort = abort_frame(0x5A0, 0x1008, 0, 0x0602_0000);
        assert_eq!(abort.data, [0x80, 0x08, 0x10, 0x00, 0x00, 0x00, 0x02, 0x06]);
        assert_eq!(frame_abort_code(&abort), 0x0602_0000);

        let segment = segment_frame(0x620, 0x01, b"abc");
        assert_eq!(segment.data, [0x01, b'a', b'b', b'c', 0, 0, 0, 0]);
    }
}
