//! SDO server answering expedited, segmented and block transfers

use canopen_client::sdo::abort::{ABORT_CMD_SPECIFIER_INVALID, ABORT_INVALID_BLOCK_SIZE, ABORT_TOGGLE_BIT_NOT_ALTERED};
use canopen_client::sdo::command::{
    abort_frame, frame_index, frame_u32, initiate_frame, segment_frame, ClientCommand, ServerResponse,
    EXPEDITED_DATA_SIZE, MAX_BLOCK_SIZE, SEGMENT_DATA_SIZE,
};
use canopen_client::{CanMessage, NodeId};
use tracing::{debug, info, warn};

use crate::object_dictionary::ObjectDictionary;

/// Transfer in progress, at most one per server
#[derive(Debug)]
enum TransferState {
    Idle,
    Upload {
        index: u16,
        subindex: u8,
        data: Vec<u8>,
        offset: usize,
        toggle: bool,
    },
    Download {
        index: u16,
        subindex: u8,
        buffer: Vec<u8>,
        toggle: bool,
    },
    Block {
        index: u16,
        subindex: u8,
        buffer: Vec<u8>,
        /// Sub-segments of the current block accepted in order
        received: u8,
    },
    BlockEnd {
        index: u16,
        subindex: u8,
        buffer: Vec<u8>,
    },
}

pub struct SdoServer {
    node: NodeId,
    object_dict: ObjectDictionary,
    block_size: u8,
    state: TransferState,
}

impl SdoServer {
    pub fn new(node: NodeId, object_dict: ObjectDictionary) -> Self {
        Self {
            node,
            object_dict,
            block_size: MAX_BLOCK_SIZE,
            state: TransferState::Idle,
        }
    }

    /// Block size offered to block downloads, clamped to `1..=127`
    pub fn with_block_size(mut self, block_size: u8) -> Self {
        self.block_size = block_size.clamp(1, MAX_BLOCK_SIZE);
        self
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn object_dict(&self) -> &ObjectDictionary {
        &self.object_dict
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, TransferState::Idle)
    }

    /// Handle an incoming CAN frame.
    /// Returns the response if this was an SDO request for us and one is due.
    pub fn handle_frame(&mut self, frame: &CanMessage) -> Option<CanMessage> {
        if !frame.has_standard_id(self.node.sdo_request_id()) {
            return None;
        }

        let state = std::mem::replace(&mut self.state, TransferState::Idle);
        let (next, response) = self.step(state, frame);
        self.state = next;
        response
    }

    fn step(&mut self, state: TransferState, frame: &CanMessage) -> (TransferState, Option<CanMessage>) {
        let opcode = frame.data[0];

        if opcode == ClientCommand::Abort.encode() {
            let (index, subindex) = frame_index(frame);
            info!(
                "SDO transfer 0x{:04X}:{:02X} aborted by client: 0x{:08X}",
                index,
                subindex,
                frame_u32(frame)
            );
            return (TransferState::Idle, None);
        }

        match state {
            TransferState::Idle => self.initiate(frame),
            TransferState::Upload { .. } | TransferState::Download { .. } | TransferState::BlockEnd { .. } => {
                self.continue_transfer(state, frame)
            }
            TransferState::Block {
                index,
                subindex,
                buffer,
                received,
            } => self.sub_segment(index, subindex, buffer, received, frame),
        }
    }

    fn initiate(&mut self, frame: &CanMessage) -> (TransferState, Option<CanMessage>) {
        let (index, subindex) = frame_index(frame);

        match ClientCommand::decode(frame.data[0]) {
            Some(ClientCommand::InitiateUpload) => self.upload(index, subindex),
            Some(ClientCommand::ExpeditedDownload { len }) => {
                let len = usize::from(len).min(EXPEDITED_DATA_SIZE);
                let value = frame.data[4..4 + len].to_vec();
                debug!("SDO expedited download 0x{:04X}:{:02X}: {:02X?}", index, subindex, value);

                match self.object_dict.set(index, subindex, value) {
                    Ok(()) => (TransferState::Idle, Some(self.download_initiated(index, subindex))),
                    Err(code) => (TransferState::Idle, Some(self.abort(index, subindex, code))),
                }
            }
            Some(ClientCommand::InitiateSegmentedDownload) => match self.object_dict.check_writable(index, subindex) {
                Ok(()) => {
                    debug!(
                        "SDO segmented download 0x{:04X}:{:02X}: {} byte(s)",
                        index,
                        subindex,
                        frame_u32(frame)
                    );
                    let state = TransferState::Download {
                        index,
                        subindex,
                        buffer: Vec::new(),
                        toggle: false,
                    };
                    (state, Some(self.download_initiated(index, subindex)))
                }
                Err(code) => (TransferState::Idle, Some(self.abort(index, subindex, code))),
            },
            Some(ClientCommand::InitiateBlockDownload) => match self.object_dict.check_writable(index, subindex) {
                Ok(()) => {
                    debug!(
                        "SDO block download 0x{:04X}:{:02X}: {} byte(s), block size {}",
                        index,
                        subindex,
                        frame_u32(frame),
                        self.block_size
                    );
                    let response = initiate_frame(
                        self.response_id(),
                        ServerResponse::BlockDownloadInitiated { crc: false }.encode(),
                        index,
                        subindex,
                        [self.block_size, 0, 0, 0],
                    );
                    let state = TransferState::Block {
                        index,
                        subindex,
                        buffer: Vec::new(),
                        received: 0,
                    };
                    (state, Some(response))
                }
                Err(code) => (TransferState::Idle, Some(self.abort(index, subindex, code))),
            },
            _ => {
                warn!("Unexpected SDO command 0x{:02X} with no transfer in progress", frame.data[0]);
                (TransferState::Idle, Some(self.abort(index, subindex, ABORT_CMD_SPECIFIER_INVALID)))
            }
        }
    }

    fn upload(&self, index: u16, subindex: u8) -> (TransferState, Option<CanMessage>) {
        let data = match self.object_dict.get(index, subindex) {
            Ok(data) => data,
            Err(code) => {
                warn!("SDO upload 0x{:04X}:{:02X} refused: 0x{:08X}", index, subindex, code);
                return (TransferState::Idle, Some(self.abort(index, subindex, code)));
            }
        };
        debug!("SDO upload 0x{:04X}:{:02X}: {} byte(s)", index, subindex, data.len());

        if (1..=EXPEDITED_DATA_SIZE).contains(&data.len()) {
            let mut payload = [0u8; EXPEDITED_DATA_SIZE];
            payload[..data.len()].copy_from_slice(&data);
            let opcode = ServerResponse::UploadExpedited { len: data.len() as u8 }.encode();
            return (
                TransferState::Idle,
                Some(initiate_frame(self.response_id(), opcode, index, subindex, payload)),
            );
        }

        let response = initiate_frame(
            self.response_id(),
            ServerResponse::UploadSegmented { size_indicated: true }.encode(),
            index,
            subindex,
            (data.len() as u32).to_le_bytes(),
        );
        let state = TransferState::Upload {
            index,
            subindex,
            data,
            offset: 0,
            toggle: false,
        };
        (state, Some(response))
    }

    fn continue_transfer(&mut self, state: TransferState, frame: &CanMessage) -> (TransferState, Option<CanMessage>) {
        let command = ClientCommand::decode(frame.data[0]);

        match (state, command) {
            (
                TransferState::Upload {
                    index,
                    subindex,
                    data,
                    offset,
                    toggle,
                },
                Some(ClientCommand::UploadSegment { toggle: requested }),
            ) => {
                if requested != toggle {
                    return (TransferState::Idle, Some(self.abort(index, subindex, ABORT_TOGGLE_BIT_NOT_ALTERED)));
                }

                let end = (offset + SEGMENT_DATA_SIZE).min(data.len());
                let chunk = &data[offset..end];
                let last = end == data.len();
                let opcode = ServerResponse::UploadSegment {
                    toggle,
                    unused: (SEGMENT_DATA_SIZE - chunk.len()) as u8,
                    last,
                }
                .encode();
                let response = segment_frame(self.response_id(), opcode, chunk);

                if last {
                    return (TransferState::Idle, Some(response));
                }
                let state = TransferState::Upload {
                    index,
                    subindex,
                    data,
                    offset: end,
                    toggle: !toggle,
                };
                (state, Some(response))
            }
            (
                TransferState::Download {
                    index,
                    subindex,
                    mut buffer,
                    toggle,
                },
                Some(ClientCommand::DownloadSegment {
                    toggle: received,
                    unused,
                    last,
                }),
            ) => {
                if received != toggle {
                    return (TransferState::Idle, Some(self.abort(index, subindex, ABORT_TOGGLE_BIT_NOT_ALTERED)));
                }

                let count = SEGMENT_DATA_SIZE - usize::from(unused).min(SEGMENT_DATA_SIZE);
                buffer.extend_from_slice(&frame.data[1..1 + count]);
                let ack = segment_frame(
                    self.response_id(),
                    ServerResponse::DownloadSegmentAck { toggle }.encode(),
                    &[],
                );

                if !last {
                    let state = TransferState::Download {
                        index,
                        subindex,
                        buffer,
                        toggle: !toggle,
                    };
                    return (state, Some(ack));
                }

                debug!("SDO segmented download 0x{:04X}:{:02X} complete: {} byte(s)", index, subindex, buffer.len());
                match self.object_dict.set(index, subindex, buffer) {
                    Ok(()) => (TransferState::Idle, Some(ack)),
                    Err(code) => (TransferState::Idle, Some(self.abort(index, subindex, code))),
                }
            }
            (
                TransferState::BlockEnd {
                    index,
                    subindex,
                    mut buffer,
                },
                Some(ClientCommand::EndBlockDownload { valid_bytes }),
            ) => {
                let unused = SEGMENT_DATA_SIZE - usize::from(valid_bytes).min(SEGMENT_DATA_SIZE);
                buffer.truncate(buffer.len().saturating_sub(unused));

                debug!("SDO block download 0x{:04X}:{:02X} complete: {} byte(s)", index, subindex, buffer.len());
                match self.object_dict.set(index, subindex, buffer) {
                    Ok(()) => {
                        let response = segment_frame(self.response_id(), ServerResponse::BlockEnd.encode(), &[]);
                        (TransferState::Idle, Some(response))
                    }
                    Err(code) => (TransferState::Idle, Some(self.abort(index, subindex, code))),
                }
            }
            (state, _) => {
                let (index, subindex) = state.object().unwrap_or_else(|| frame_index(frame));
                warn!("Unexpected SDO command 0x{:02X} during {}", frame.data[0], state.name());
                (TransferState::Idle, Some(self.abort(index, subindex, ABORT_CMD_SPECIFIER_INVALID)))
            }
        }
    }

    /// Sub-segments out of sequence are dropped; the block ack then reports
    /// the last one taken in order so the client resends from there.
    fn sub_segment(
        &mut self,
        index: u16,
        subindex: u8,
        mut buffer: Vec<u8>,
        mut received: u8,
        frame: &CanMessage,
    ) -> (TransferState, Option<CanMessage>) {
        let ClientCommand::BlockSubSegment { seqno, last } = ClientCommand::decode_sub_segment(frame.data[0]) else {
            return (TransferState::Idle, Some(self.abort(index, subindex, ABORT_CMD_SPECIFIER_INVALID)));
        };
        if seqno == 0 || seqno > self.block_size {
            return (TransferState::Idle, Some(self.abort(index, subindex, ABORT_INVALID_BLOCK_SIZE)));
        }

        let in_order = seqno == received + 1;
        if in_order {
            buffer.extend_from_slice(&frame.data[1..=SEGMENT_DATA_SIZE]);
            received = seqno;
        }

        if !last && seqno < self.block_size {
            let state = TransferState::Block {
                index,
                subindex,
                buffer,
                received,
            };
            return (state, None);
        }

        let mut ack = [0u8; 8];
        ack[0] = ServerResponse::BlockAck.encode();
        ack[1] = received;
        ack[2] = self.block_size;
        let response = CanMessage::standard(self.response_id(), ack);

        let state = if last && in_order {
            TransferState::BlockEnd {
                index,
                subindex,
                buffer,
            }
        } else {
            TransferState::Block {
                index,
                subindex,
                buffer,
                received: 0,
            }
        };
        (state, Some(response))
    }

    fn response_id(&self) -> u16 {
        self.node.sdo_response_id()
    }

    fn download_initiated(&self, index: u16, subindex: u8) -> CanMessage {
        initiate_frame(
            self.response_id(),
            ServerResponse::DownloadInitiated.encode(),
            index,
            subindex,
            [0; 4],
        )
    }

    fn abort(&self, index: u16, subindex: u8, code: u32) -> CanMessage {
        debug!("SDO abort 0x{:04X}:{:02X}: 0x{:08X}", index, subindex, code);
        abort_frame(self.response_id(), index, subindex, code)
    }
}

impl TransferState {
    fn object(&self) -> Option<(u16, u8)> {
        match self {
            Self::Idle => None,
            Self::Upload { index, subindex, .. }
            | Self::Download { index, subindex, .. }
            | Self::Block { index, subindex, .. }
            | Self::BlockEnd { index, subindex, .. } => Some((*index, *subindex)),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Upload { .. } => "segmented upload",
            Self::Download { .. } => "segmented download",
            Self::Block { .. } => "block download",
            Self::BlockEnd { .. } => "block end",
        }
    }
}
