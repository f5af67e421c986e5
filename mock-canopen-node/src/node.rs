//! NMT state, heartbeat boot-up and TPDO1 for the mock node

use canopen_client::nmt::NMT_COB_ID;
use canopen_client::{CanBus, CanMessage, NmtCommand, NodeId};
use std::io;
use tracing::{debug, info, warn};

use crate::sdo_server::SdoServer;

const TPDO1_BASE: u16 = 0x180;
const HEARTBEAT_BASE: u16 = 0x700;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtState {
    PreOperational,
    Operational,
    Stopped,
}

/// Simulated sensor values mapped into TPDO1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tpdo1 {
    /// Hundredths of a degree Celsius
    pub temperature: u16,
    /// hPa
    pub pressure: u16,
    pub status: u8,
}

impl Default for Tpdo1 {
    fn default() -> Self {
        Self {
            temperature: 2350,
            pressure: 1013,
            status: 1,
        }
    }
}

impl Tpdo1 {
    /// Move every value one step along its test pattern
    pub fn advance(&mut self) {
        self.temperature = (self.temperature + 1) % 3000;
        self.pressure = 1000 + (self.pressure - 1000 + 1) % 50;
        self.status = if self.status == 1 { 2 } else { 1 };
    }

    /// Temperature (16-bit), pressure (16-bit), status (8-bit), little-endian
    pub fn payload(&self) -> [u8; 5] {
        let [t0, t1] = self.temperature.to_le_bytes();
        let [p0, p1] = self.pressure.to_le_bytes();
        [t0, t1, p0, p1, self.status]
    }
}

pub struct MockNode {
    sdo: SdoServer,
    state: NmtState,
    tpdo: Tpdo1,
}

impl MockNode {
    /// A node in Pre-operational, as after boot-up
    pub fn new(sdo: SdoServer) -> Self {
        Self {
            sdo,
            state: NmtState::PreOperational,
            tpdo: Tpdo1::default(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.sdo.node()
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    pub fn set_state(&mut self, state: NmtState) {
        self.state = state;
    }

    pub fn sdo_server(&self) -> &SdoServer {
        &self.sdo
    }

    /// Heartbeat boot-up message (`0x700 + node`, one zero byte)
    pub fn boot_up_frame(&self) -> CanMessage {
        CanMessage {
            id: u32::from(HEARTBEAT_BASE + u16::from(self.node().get())),
            extended: false,
            len: 1,
            data: [0; 8],
            timestamp_us: 0,
        }
    }

    /// Handle one frame from the bus, returning the reply if any
    pub fn handle_frame(&mut self, frame: &CanMessage) -> Option<CanMessage> {
        if frame.has_standard_id(NMT_COB_ID) {
            return self.handle_nmt(frame);
        }
        // SDO is unavailable in Stopped
        if self.state == NmtState::Stopped {
            return None;
        }
        self.sdo.handle_frame(frame)
    }

    fn handle_nmt(&mut self, frame: &CanMessage) -> Option<CanMessage> {
        if frame.len < 2 {
            return None;
        }
        let target = frame.data[1];
        if target != 0 && target != self.node().get() {
            return None;
        }

        let command = match NmtCommand::try_from(frame.data[0]) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring NMT frame: {}", e);
                return None;
            }
        };
        info!("NMT: {}", command.description());

        match command {
            NmtCommand::Operational => self.state = NmtState::Operational,
            NmtCommand::Stop => self.state = NmtState::Stopped,
            NmtCommand::PreOperational => self.state = NmtState::PreOperational,
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => {
                self.state = NmtState::PreOperational;
                return Some(self.boot_up_frame());
            }
        }
        None
    }

    /// Next TPDO1 frame, only produced while Operational
    pub fn next_tpdo(&mut self) -> Option<CanMessage> {
        if self.state != NmtState::Operational {
            return None;
        }
        self.tpdo.advance();

        let payload = self.tpdo.payload();
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(&payload);
        Some(CanMessage {
            id: u32::from(TPDO1_BASE + u16::from(self.node().get())),
            extended: false,
            len: payload.len() as u8,
            data,
            timestamp_us: 0,
        })
    }

    pub fn tpdo_values(&self) -> Tpdo1 {
        self.tpdo
    }

    /// Answer every frame pending on `bus`. Returns the number of replies sent.
    pub fn poll(&mut self, bus: &dyn CanBus) -> io::Result<usize> {
        let mut replies = 0;
        while let Some(frame) = bus.read_frame()? {
            if let Some(reply) = self.handle_frame(&frame) {
                debug!("Reply {}", reply);
                bus.write_frame(&reply)?;
                replies += 1;
            }
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dictionary::ObjectDictionary;

    fn node() -> MockNode {
        let mut od = ObjectDictionary::new();
        od.add_test_objects_for_node(4);
        MockNode::new(SdoServer::new(NodeId::clamped(4), od))
    }

    fn nmt(command: u8, target: u8) -> CanMessage {
        let mut data = [0u8; 8];
        data[0] = command;
        data[1] = target;
        CanMessage {
            id: 0,
            extended: false,
            len: 2,
            data,
            timestamp_us: 0,
        }
    }

    #[test]
    fn follows_nmt_commands() {
        let mut node = node();
        assert_eq!(node.state(), NmtState::PreOperational);

        node.handle_frame(&nmt(0x01, 4));
        assert_eq!(node.state(), NmtState::Operational);

        // Other nodes' commands are ignored, broadcasts are not
        node.handle_frame(&nmt(0x02, 5));
        assert_eq!(node.state(), NmtState::Operational);
        node.handle_frame(&nmt(0x02, 0));
        assert_eq!(node.state(), NmtState::Stopped);

        let boot_up = node.handle_frame(&nmt(0x81, 4)).unwrap();
        assert_eq!(boot_up.id, 0x704);
        assert_eq!(boot_up.payload(), &[0x00]);
        assert_eq!(node.state(), NmtState::PreOperational);

        node.handle_frame(&nmt(0x55, 4));
        assert_eq!(node.state(), NmtState::PreOperational);
    }

    #[test]
    fn stopped_node_ignores_sdo() {
        let mut node = node();
        let read = CanMessage::standard(0x604, [0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
        assert!(node.handle_frame(&read).is_some());

        node.set_state(NmtState::Stopped);
        assert!(node.handle_frame(&read).is_none());
    }

    #[test]
    fn tpdo_only_while_operational() {
        let mut node = node();
        assert!(node.next_tpdo().is_none());

        node.set_state(NmtState::Operational);
        let frame = node.next_tpdo().unwrap();
        assert_eq!(frame.id, 0x184);
        // 2351, 1014, 2
        assert_eq!(frame.payload(), &[0x2F, 0x09, 0xF6, 0x03, 0x02]);
    }

    #[test]
    fn tpdo_values_wrap() {
        let mut values = Tpdo1 {
            temperature: 2999,
            pressure: 1049,
            status: 2,
        };
        values.advance();
        assert_eq!(values, Tpdo1 { temperature: 0, pressure: 1000, status: 1 });
    }
}
