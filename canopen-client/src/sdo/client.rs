// client.rs - SDO transfer state machines
use std::path::Path;
use std::time::Duration;
use tokio::sync::MutexGuard as AsyncMutexGuard;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::abort::{
    ABORT_CMD_SPECIFIER_INVALID, ABORT_INVALID_BLOCK_SIZE, ABORT_TOGGLE_BIT_NOT_ALTERED,
};
use super::command::{
    abort_frame, expedited_download_opcode, frame_abort_code, frame_index, frame_u32,
    initiate_frame, segment_frame, ClientCommand, ServerResponse, EXPEDITED_DATA_SIZE,
    MAX_BLOCK_SIZE, SEGMENT_DATA_SIZE,
};
use super::{SdoError, SdoUpload, TransferMode, SDO_TIMEOUT};
use crate::node::NodeId;
use crate::transport::{CanChannel, CanMessage};

/// How often the receive queue is polled while waiting for a response
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// SDO client bound to a CAN channel.
///
/// Cheap to clone. Transfers on the same channel run one at a time: each
/// holds the channel's exchange lock from its first request to its last
/// response, and concurrent callers queue behind it.
#[derive(Clone)]
pub struct SdoClient {
    channel: CanChannel,
    timeout: Duration,
}

impl SdoClient {
    pub fn new(channel: CanChannel) -> Self {
        Self::with_timeout(channel, SDO_TIMEOUT)
    }

    pub fn with_timeout(channel: CanChannel, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read an object. Expedited or segmented, as chosen by the device.
    pub async fn read(&self, node: NodeId, index: u16, subindex: u8) -> Result<SdoUpload, SdoError> {
        let session = self.session(node, index, subindex).await;

        session.send_initiate(ClientCommand::InitiateUpload.encode(), [0; 4])?;
        let response = session.wait_for_initiate_response().await?;

        match ServerResponse::decode(response.data[0]) {
            Some(ServerResponse::UploadExpedited { len }) => {
                let len = usize::from(len);
                let upload = SdoUpload {
                    mode: TransferMode::Expedited,
                    length: len as u32,
                    data: response.data[4..4 + len].to_vec(),
                };
                debug!("SDO read {} 0x{:04X}:{:02X}: {} byte(s)", node, index, subindex, len);
                Ok(upload)
            }
            Some(ServerResponse::UploadSegmented { size_indicated }) => {
                let declared = size_indicated.then(|| frame_u32(&response));
                session.upload_segments(declared).await
            }
            Some(ServerResponse::Abort) => Err(SdoError::remote_abort(frame_abort_code(&response))),
            _ => Err(session.abort(ABORT_CMD_SPECIFIER_INVALID)),
        }
    }

    /// Expedited write of 1 to 4 bytes
    pub async fn write(&self, node: NodeId, index: u16, subindex: u8, data: &[u8]) -> Result<TransferMode, SdoError> {
        let opcode = expedited_download_opcode(data.len()).ok_or_else(|| {
            SdoError::InvalidArgument(format!(
                "expedited write takes 1 to 4 bytes, got {}",
                data.len()
            ))
        })?;

        let mut payload = [0u8; EXPEDITED_DATA_SIZE];
        payload[..data.len()].copy_from_slice(data);

        let session = self.session(node, index, subindex).await;
        session.send_initiate(opcode, payload)?;
        session.expect_download_initiated().await?;

        debug!("SDO write {} 0x{:04X}:{:02X}: {} byte(s)", node, index, subindex, data.len());
        Ok(TransferMode::Expedited)
    }

    /// Segmented write. Payloads of up to 4 bytes go out as an expedited write.
    pub async fn write_segmented(
        &self,
        node: NodeId,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<TransferMode, SdoError> {
        if data.len() <= EXPEDITED_DATA_SIZE {
            return self.write(node, index, subindex, data).await;
        }
        let total = transfer_size(data)?;

        let session = self.session(node, index, subindex).await;
        session.send_initiate(ClientCommand::InitiateSegmentedDownload.encode(), total.to_le_bytes())?;
        session.expect_download_initiated().await?;

        let segments = data.chunks(SEGMENT_DATA_SIZE).count();
        let mut toggle = false;

        for (n, chunk) in data.chunks(SEGMENT_DATA_SIZE).enumerate() {
            let last = n + 1 == segments;
            let command = ClientCommand::DownloadSegment {
                toggle,
                unused: (SEGMENT_DATA_SIZE - chunk.len()) as u8,
                last,
            };
            session.send(segment_frame(session.request_id(), command.encode(), chunk))?;

            let response = session.next_response(session.deadline()).await?;
            match ServerResponse::decode(response.data[0]) {
                Some(ServerResponse::DownloadSegmentAck { toggle: acked }) if acked == toggle => {}
                Some(ServerResponse::DownloadSegmentAck { .. }) => {
                    return Err(session.abort(ABORT_TOGGLE_BIT_NOT_ALTERED));
                }
                Some(ServerResponse::Abort) => {
                    return Err(SdoError::remote_abort(frame_abort_code(&response)));
                }
                _ => return Err(session.abort(ABORT_CMD_SPECIFIER_INVALID)),
            }
            toggle = !toggle;
        }

        debug!(
            "SDO segmented write {} 0x{:04X}:{:02X}: {} byte(s) in {} segment(s)",
            node, index, subindex, total, segments
        );
        Ok(TransferMode::Segmented)
    }

    /// Block download of `data`
    pub async fn write_block(&self, node: NodeId, index: u16, subindex: u8, data: &[u8]) -> Result<(), SdoError> {
        if data.is_empty() {
            return Err(SdoError::InvalidArgument("block write without data".to_string()));
        }
        let total = transfer_size(data)?;

        let session = self.session(node, index, subindex).await;
        session.send_initiate(ClientCommand::InitiateBlockDownload.encode(), total.to_le_bytes())?;
        let response = session.wait_for_initiate_response().await?;

        let mut block_size = match ServerResponse::decode(response.data[0]) {
            Some(ServerResponse::BlockDownloadInitiated { .. }) => response.data[4],
            Some(ServerResponse::Abort) => {
                return Err(SdoError::remote_abort(frame_abort_code(&response)));
            }
            _ => return Err(session.abort(ABORT_CMD_SPECIFIER_INVALID)),
        };
        if !valid_block_size(block_size) {
            return Err(session.abort(ABORT_INVALID_BLOCK_SIZE));
        }

        let chunks: Vec<&[u8]> = data.chunks(SEGMENT_DATA_SIZE).collect();
        let mut next = 0;
        let mut blocks = 0;

        while next < chunks.len() {
            let block_start = next;
            let mut sent: u8 = 0;

            while sent < block_size && next < chunks.len() {
                sent += 1;
                let command = ClientCommand::BlockSubSegment {
                    seqno: sent,
                    last: next + 1 == chunks.len(),
                };
                session.send(segment_frame(session.request_id(), command.encode(), chunks[next]))?;
                next += 1;
            }

            let (ackseq, new_block_size) = session.wait_for_block_ack().await?;
            blocks += 1;

            if ackseq < sent {
                trace!(
                    "SDO block to {}: {} of {} sub-segment(s) acknowledged, retransmitting",
                    node, ackseq, sent
                );
                next = block_start + usize::from(ackseq);
            }
            if !valid_block_size(new_block_size) {
                return Err(session.abort(ABORT_INVALID_BLOCK_SIZE));
            }
            block_size = new_block_size;
        }

        let valid_bytes = chunks.last().map_or(0, |chunk| chunk.len()) as u8;
        let end = ClientCommand::EndBlockDownload { valid_bytes };
        session.send(segment_frame(session.request_id(), end.encode(), &[]))?;
        session.wait_for_block_end().await?;

        debug!(
            "SDO block write {} 0x{:04X}:{:02X}: {} byte(s) in {} block(s)",
            node, index, subindex, total, blocks
        );
        Ok(())
    }

    /// Block download of a file's contents. Returns the number of bytes sent.
    pub async fn write_block_file(
        &self,
        node: NodeId,
        index: u16,
        subindex: u8,
        path: impl AsRef<Path>,
    ) -> Result<usize, SdoError> {
        let data = tokio::fs::read(path.as_ref()).await?;
        self.write_block(node, index, subindex, &data).await?;
        Ok(data.len())
    }

    async fn session(&self, node: NodeId, index: u16, subindex: u8) -> Session<'_> {
        let exchange = self.channel.lock_exchange().await;
        let dropped = self.channel.flush();
        if dropped > 0 {
            trace!("Discarded {} stale frame(s) before SDO transfer", dropped);
        }

        Session {
            channel: &self.channel,
            node,
            index,
            subindex,
            timeout: self.timeout,
            _exchange: exchange,
        }
    }
}

fn transfer_size(data: &[u8]) -> Result<u32, SdoError> {
    u32::try_from(data.len())
        .map_err(|_| SdoError::InvalidArgument(format!("{} bytes exceed the SDO size field", data.len())))
}

fn valid_block_size(size: u8) -> bool {
    (1..=MAX_BLOCK_SIZE).contains(&size)
}

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7E).contains(&byte)
}

/// State of one transfer on one node
struct Session<'a> {
    channel: &'a CanChannel,
    node: NodeId,
    index: u16,
    subindex: u8,
    timeout: Duration,
    _exchange: AsyncMutexGuard<'a, ()>,
}

impl Session<'_> {
    fn request_id(&self) -> u16 {
        self.node.sdo_request_id()
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    fn send(&self, frame: CanMessage) -> Result<(), SdoError> {
        self.channel.write(&frame)?;
        Ok(())
    }

    fn send_initiate(&self, opcode: u8, payload: [u8; 4]) -> Result<(), SdoError> {
        self.send(initiate_frame(self.request_id(), opcode, self.index, self.subindex, payload))
    }

    /// Send an abort frame and build the matching local error
    fn abort(&self, code: u32) -> SdoError {
        let frame = abort_frame(self.request_id(), self.index, self.subindex, code);
        if let Err(err) = self.channel.write(&frame) {
            warn!("Could not send SDO abort to {}: {}", self.node, err);
        }
        SdoError::local_abort(code)
    }

    fn timeout_error(&self) -> SdoError {
        SdoError::Timeout {
            index: self.index,
            subindex: self.subindex,
        }
    }

    /// Next frame from this node's SDO server. Other traffic is dropped.
    async fn next_response(&self, deadline: Instant) -> Result<CanMessage, SdoError> {
        let response_id = self.node.sdo_response_id();

        loop {
            while let Some(frame) = self.channel.read()? {
                if frame.has_standard_id(response_id) {
                    return Ok(frame);
                }
            }
            if Instant::now() >= deadline {
                return Err(self.timeout_error());
            }
            tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
        }
    }

    /// Response to an initiate request, matched on the object index
    async fn wait_for_initiate_response(&self) -> Result<CanMessage, SdoError> {
        let deadline = self.deadline();
        loop {
            let frame = self.next_response(deadline).await?;
            if frame_index(&frame).0 == self.index {
                return Ok(frame);
            }
        }
    }

    async fn expect_download_initiated(&self) -> Result<(), SdoError> {
        let response = self.wait_for_initiate_response().await?;
        match ServerResponse::decode(response.data[0]) {
            Some(ServerResponse::DownloadInitiated) => Ok(()),
            Some(ServerResponse::Abort) => Err(SdoError::remote_abort(frame_abort_code(&response))),
            _ => Err(self.abort(ABORT_CMD_SPECIFIER_INVALID)),
        }
    }

    async fn upload_segments(&self, declared: Option<u32>) -> Result<SdoUpload, SdoError> {
        let mut data = Vec::new();
        let mut received: u32 = 0;
        let mut text = true;
        let mut toggle = false;

        loop {
            let request = ClientCommand::UploadSegment { toggle };
            self.send(segment_frame(self.request_id(), request.encode(), &[]))?;

            let response = self.next_response(self.deadline()).await?;
            let (unused, last) = match ServerResponse::decode(response.data[0]) {
                Some(ServerResponse::UploadSegment { toggle: t, unused, last }) if t == toggle => (unused, last),
                Some(ServerResponse::UploadSegment { .. }) => {
                    return Err(self.abort(ABORT_TOGGLE_BIT_NOT_ALTERED));
                }
                Some(ServerResponse::Abort) => {
                    return Err(SdoError::remote_abort(frame_abort_code(&response)));
                }
                _ => return Err(self.abort(ABORT_CMD_SPECIFIER_INVALID)),
            };

            let mut count = SEGMENT_DATA_SIZE.saturating_sub(usize::from(unused));
            if let Some(size) = declared {
                count = count.min(size.saturating_sub(received) as usize);
            }

            // Text only: copying stops for good at the first non-printable byte
            for &byte in &response.data[1..1 + count] {
                if !text || !is_printable(byte) {
                    text = false;
                    break;
                }
                data.push(byte);
            }
            received += count as u32;

            if last {
                break;
            }
            toggle = !toggle;
        }

        debug!(
            "SDO segmented read {} 0x{:04X}:{:02X}: {} byte(s)",
            self.node, self.index, self.subindex, received
        );
        Ok(SdoUpload {
            mode: TransferMode::Segmented,
            length: declared.unwrap_or(received),
            data,
        })
    }

    /// Block acknowledgement: (ackseq, next block size)
    async fn wait_for_block_ack(&self) -> Result<(u8, u8), SdoError> {
        let deadline = self.deadline();
        loop {
            let response = self.next_response(deadline).await?;
            match ServerResponse::decode(response.data[0]) {
                Some(ServerResponse::BlockAck) => return Ok((response.data[1], response.data[2])),
                Some(ServerResponse::Abort) => {
                    return Err(SdoError::remote_abort(frame_abort_code(&response)));
                }
                _ => trace!("Ignoring {} while waiting for block ack", response),
            }
        }
    }

    async fn wait_for_block_end(&self) -> Result<(), SdoError> {
        let deadline = self.deadline();
        loop {
            let response = self.next_response(deadline).await?;
            match ServerResponse::decode(response.data[0]) {
                Some(ServerResponse::BlockEnd) => return Ok(()),
                Some(ServerResponse::Abort) => {
                    return Err(SdoError::remote_abort(frame_abort_code(&response)));
                }
                _ => trace!("Ignoring {} while waiting for block end", response),
            }
        }
    }
}
