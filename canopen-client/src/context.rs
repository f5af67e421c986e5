// context.rs - the public operations, bundled behind one handle
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ChannelConfig;
use crate::logging::{DisplayMode, ObjectDescriptions, Operation, ReportLine, TransferLog};
use crate::nmt::{NmtClient, NmtCommand, NmtError};
use crate::node::NodeId;
use crate::pdo::{PdoError, PdoScheduler};
use crate::sdo::{SdoClient, SdoError, SdoUpload, TransferMode};
use crate::transport::{BusOpener, CanChannel, CanMessage, TransportError};

/// Channel, SDO client, NMT client, PDO table and transfer log for one bus.
///
/// Node ids passed to the operations are clamped to `1..=127`. With
/// [`DisplayMode::Report`] every operation also emits a [`ReportLine`]
/// through `tracing` and into the transfer log when it is enabled.
pub struct CanopenContext {
    channel: CanChannel,
    sdo: SdoClient,
    nmt: NmtClient,
    pdo: PdoScheduler,
    log: TransferLog,
    descriptions: Option<Arc<dyn ObjectDescriptions>>,
}

impl CanopenContext {
    /// Start bringing up the channel. Returns immediately.
    pub fn initialize(opener: impl BusOpener, poll_interval: Duration) -> Self {
        let channel = CanChannel::initialize(opener, poll_interval);

        Self {
            sdo: SdoClient::new(channel.clone()),
            nmt: NmtClient::new(channel.clone()),
            pdo: PdoScheduler::new(&channel),
            log: TransferLog::new(),
            descriptions: None,
            channel,
        }
    }

    /// SocketCAN channel, timeouts and transfer log as configured
    pub fn from_config(config: &ChannelConfig) -> Self {
        let context = Self::initialize(config.clone(), config.poll_interval())
            .with_sdo_timeout(config.sdo_timeout());

        if config.enable_logging {
            match config.get_log_directory() {
                Some(dir) => {
                    if let Err(e) = context.log.enable(&dir) {
                        warn!("Transfer log disabled: {}", e);
                    }
                }
                None => warn!("Transfer log disabled: no log directory"),
            }
        }
        context
    }

    pub fn with_sdo_timeout(mut self, timeout: Duration) -> Self {
        self.sdo = SdoClient::with_timeout(self.channel.clone(), timeout);
        self
    }

    pub fn with_descriptions(mut self, descriptions: Arc<dyn ObjectDescriptions>) -> Self {
        self.descriptions = Some(descriptions);
        self
    }

    pub fn channel(&self) -> &CanChannel {
        &self.channel
    }

    pub fn transfer_log(&self) -> &TransferLog {
        &self.log
    }

    pub fn pdo_scheduler(&self) -> &PdoScheduler {
        &self.pdo
    }

    pub async fn wait_until_ready(&self) {
        self.channel.wait_until_ready().await
    }

    pub fn can_write(&self, frame: &CanMessage, mode: DisplayMode) -> Result<(), TransportError> {
        let result = self.channel.write(frame);

        let line = match &result {
            Ok(()) => ReportLine::new(Operation::Can, true, frame.to_string()),
            Err(e) => ReportLine::new(Operation::Can, false, e.to_string()),
        };
        self.report(mode, line.can_id(frame.id).size(usize::from(frame.len)));
        result
    }

    pub fn can_read(&self) -> Result<Option<CanMessage>, TransportError> {
        self.channel.read()
    }

    pub fn can_flush(&self) -> usize {
        self.channel.flush()
    }

    pub async fn sdo_read(
        &self,
        node: u8,
        index: u16,
        subindex: u8,
        mode: DisplayMode,
        comment: Option<&str>,
    ) -> Result<SdoUpload, SdoError> {
        let node = NodeId::clamped(node);
        let result = self.sdo.read(node, index, subindex).await;

        let line = match &result {
            Ok(upload) => ReportLine::new(Operation::Read, true, describe_upload(upload)).size(upload.length as usize),
            Err(e) => ReportLine::new(Operation::Read, false, e.to_string()),
        };
        self.report_object(mode, line, node, index, subindex, comment);
        result
    }

    /// Expedited write of 1 to 4 bytes
    pub async fn sdo_write(
        &self,
        node: u8,
        index: u16,
        subindex: u8,
        data: &[u8],
        mode: DisplayMode,
        comment: Option<&str>,
    ) -> Result<TransferMode, SdoError> {
        let node = NodeId::clamped(node);
        let result = self.sdo.write(node, index, subindex, data).await;
        self.report_write(mode, &result, data, node, index, subindex, comment);
        result
    }

    pub async fn sdo_write_segmented(
        &self,
        node: u8,
        index: u16,
        subindex: u8,
        data: &[u8],
        mode: DisplayMode,
        comment: Option<&str>,
    ) -> Result<TransferMode, SdoError> {
        let node = NodeId::clamped(node);
        let result = self.sdo.write_segmented(node, index, subindex, data).await;
        self.report_write(mode, &result, data, node, index, subindex, comment);
        result
    }

    pub async fn sdo_write_block(
        &self,
        node: u8,
        index: u16,
        subindex: u8,
        data: &[u8],
        mode: DisplayMode,
        comment: Option<&str>,
    ) -> Result<(), SdoError> {
        let node = NodeId::clamped(node);
        let result = self.sdo.write_block(node, index, subindex, data).await;

        let line = match &result {
            Ok(()) => ReportLine::new(Operation::Block, true, format!("{} byte(s) written", data.len())),
            Err(e) => ReportLine::new(Operation::Block, false, e.to_string()),
        };
        self.report_object(mode, line.size(data.len()), node, index, subindex, comment);
        result
    }

    pub async fn sdo_write_block_file(
        &self,
        node: u8,
        index: u16,
        subindex: u8,
        path: &Path,
        mode: DisplayMode,
        comment: Option<&str>,
    ) -> Result<usize, SdoError> {
        let node = NodeId::clamped(node);
        let result = self.sdo.write_block_file(node, index, subindex, path).await;

        let line = match &result {
            Ok(sent) => {
                ReportLine::new(Operation::Block, true, format!("{} byte(s) written from {}", sent, path.display()))
                    .size(*sent)
            }
            Err(e) => ReportLine::new(Operation::Block, false, e.to_string()),
        };
        self.report_object(mode, line, node, index, subindex, comment);
        result
    }

    pub fn nmt_send_command(&self, node: u8, command: NmtCommand, mode: DisplayMode) -> Result<(), NmtError> {
        let node = NodeId::clamped(node);
        let result = self.nmt.send_command(node, command);

        let line = match &result {
            Ok(()) => ReportLine::new(Operation::Nmt, true, command.description()),
            Err(e) => ReportLine::new(Operation::Nmt, false, format!("0x{:02X} {}", command.code(), e)),
        };
        self.report(mode, line.node(node.get()));
        result
    }

    pub fn pdo_add(
        &self,
        can_id: u16,
        period: Duration,
        length: u8,
        data: u64,
        mode: DisplayMode,
    ) -> Result<usize, PdoError> {
        let result = self.pdo.add(can_id, period, length, data);

        let line = match &result {
            Ok(_) => ReportLine::new(
                Operation::Pdo,
                true,
                format!("0x{:08X}, {}ms", data, period.as_millis()),
            ),
            Err(e) => ReportLine::new(Operation::Pdo, false, e.to_string()),
        };
        self.report(mode, line.can_id(u32::from(can_id)));
        result
    }

    /// Returns whether a registration existed. Unknown but valid ids are a no-op.
    pub fn pdo_del(&self, can_id: u16, mode: DisplayMode) -> Result<bool, PdoError> {
        let result = self.pdo.del(can_id);

        let line = match &result {
            Ok(_) => ReportLine::new(Operation::Pdo, true, "Delete"),
            Err(e) => ReportLine::new(Operation::Pdo, false, e.to_string()),
        };
        self.report(mode, line.can_id(u32::from(can_id)));
        result
    }

    /// Cancel every PDO, close the channel and the transfer log
    pub fn deinitialize(&self) {
        self.pdo.clear();
        self.channel.deinitialize();
        self.log.disable();
    }

    fn report(&self, mode: DisplayMode, line: ReportLine) {
        if mode == DisplayMode::Report {
            info!("{}", line);
            self.log.log(&line);
        }
    }

    fn report_object(
        &self,
        mode: DisplayMode,
        line: ReportLine,
        node: NodeId,
        index: u16,
        subindex: u8,
        comment: Option<&str>,
    ) {
        if mode == DisplayMode::Silent {
            return;
        }
        let comment = comment
            .map(str::to_string)
            .or_else(|| self.descriptions.as_ref().and_then(|d| d.describe(index, subindex)));
        self.report(mode, line.node(node.get()).object(index, subindex).comment(comment));
    }

    #[allow(clippy::too_many_arguments)]
    fn report_write(
        &self,
        mode: DisplayMode,
        result: &Result<TransferMode, SdoError>,
        data: &[u8],
        node: NodeId,
        index: u16,
        subindex: u8,
        comment: Option<&str>,
    ) {
        let line = match result {
            Ok(transfer) => ReportLine::new(
                Operation::Write,
                true,
                format!("{} byte(s) written ({})", data.len(), transfer),
            ),
            Err(e) => ReportLine::new(Operation::Write, false, e.to_string()),
        };
        self.report_object(mode, line.size(data.len()), node, index, subindex, comment);
    }
}

fn describe_upload(upload: &SdoUpload) -> String {
    match upload.mode {
        TransferMode::Expedited => {
            let value = upload.as_u32();
            let text = if upload.data.iter().all(|byte| (0x20..=0x7E).contains(byte)) {
                upload.as_text()
            } else {
                String::new()
            };
            format!("{} byte(s) read: {} (0x{:X}) {}", upload.length, value, value, text)
                .trim_end()
                .to_string()
        }
        _ => format!("{} byte(s) read: {}", upload.length, upload.as_text()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::spawn_device;
    use crate::transport::{CanBus, VirtualBus};
    use std::collections::HashMap;

    async fn context() -> (CanopenContext, VirtualBus) {
        let (host, device) = VirtualBus::pair();
        let context = CanopenContext::initialize(host.opener(), Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(1), context.wait_until_ready())
            .await
            .expect("channel did not become ready");
        (context, device)
    }

    #[test]
    fn upload_descriptions() {
        let text = SdoUpload {
            mode: TransferMode::Expedited,
            length: 4,
            data: b"ABCD".to_vec(),
        };
        assert_eq!(describe_upload(&text), "4 byte(s) read: 1145258561 (0x44434241) ABCD");

        let number = SdoUpload {
            mode: TransferMode::Expedited,
            length: 2,
            data: vec![0xE8, 0x03],
        };
        assert_eq!(describe_upload(&number), "2 byte(s) read: 1000 (0x3E8)");
    }

    #[tokio::test]
    async fn sdo_read_through_the_context() {
        let (context, device) = context().await;
        spawn_device(device, |request| {
            vec![CanMessage::standard(0x5A0, [0x43, request.data[1], request.data[2], 0, b'A', b'B', b'C', b'D'])]
        });

        let upload = context
            .sdo_read(0x20, 0x1008, 0x00, DisplayMode::Silent, None)
            .await
            .unwrap();
        assert_eq!(upload.length, 4);
        assert_eq!(upload.data, b"ABCD");
    }

    #[tokio::test]
    async fn report_mode_writes_the_transfer_log() {
        let (context, device) = context().await;
        let mut names = HashMap::new();
        names.insert((0x1008, 0), "Manufacturer device name".to_string());
        let context = context.with_descriptions(Arc::new(names));

        let dir = tempfile::tempdir().unwrap();
        let path = context.transfer_log().enable(dir.path()).unwrap();

        context.nmt_send_command(0x05, NmtCommand::Operational, DisplayMode::Report).unwrap();
        context.nmt_send_command(0x05, NmtCommand::Stop, DisplayMode::Silent).unwrap();
        let err = context
            .sdo_read(0x05, 0x1008, 0, DisplayMode::Report, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SdoError::Timeout { .. }));
        assert_eq!(
            context.pdo_add(0x180, Duration::from_millis(10), 1, 0, DisplayMode::Report),
            Err(PdoError::InvalidCanId(0x180))
        );

        let frames = device.drain();
        assert_eq!(frames[0].payload(), &[0x01, 0x05]);
        assert_eq!(frames[1].payload(), &[0x02, 0x05]);

        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains("NMT,0x05,,,SUCC,Start (go to Operational)"));
        assert!(lines[2].contains("Read,0x05,0x1008:00,,FAIL"));
        assert!(lines[3].contains("PDO,,0x180,,FAIL,Invalid TPDO CAN-ID 0x180"));
    }

    #[tokio::test]
    async fn pdo_add_and_del_through_the_context() {
        let (context, device) = context().await;

        context
            .pdo_add(0x181, Duration::from_millis(10), 4, 0x1122_3344, DisplayMode::Silent)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(context.pdo_del(0x181, DisplayMode::Silent), Ok(true));
        assert_eq!(context.pdo_scheduler().active_count(), 0);
        assert_eq!(context.pdo_del(0x181, DisplayMode::Silent), Ok(false));

        let frames = device.drain();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|frame| frame.payload() == [0x11, 0x22, 0x33, 0x44]));
    }

    #[tokio::test]
    async fn raw_frames_and_deinitialize() {
        let (context, device) = context().await;

        let frame = CanMessage::new(0x123, false, &[0xDE, 0xAD]).unwrap();
        context.can_write(&frame, DisplayMode::Report).unwrap();
        let received = device.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, 0x123);
        assert_eq!(received[0].payload(), &[0xDE, 0xAD]);

        device.write_frame(&CanMessage::new(0x700 + 5, false, &[0x05]).unwrap()).unwrap();
        device.write_frame(&CanMessage::new(0x185, false, &[1, 2]).unwrap()).unwrap();
        assert_eq!(context.can_read().unwrap().map(|f| f.id), Some(0x705));
        assert_eq!(context.can_flush(), 1);

        context.pdo_add(0x181, Duration::from_secs(1), 1, 1, DisplayMode::Silent).unwrap();
        context.deinitialize();
        assert_eq!(context.pdo_scheduler().active_count(), 0);
        assert!(!context.channel().is_ready());
        assert!(matches!(
            context.can_write(&frame, DisplayMode::Silent),
            Err(TransportError::NotReady)
        ));
    }
}
