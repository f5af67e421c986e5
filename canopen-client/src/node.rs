// node.rs - CANopen node addressing
use std::fmt;

/// SDO client-to-server COB-ID base
pub const SDO_REQUEST_BASE: u16 = 0x600;
/// SDO server-to-client COB-ID base
pub const SDO_RESPONSE_BASE: u16 = 0x580;

pub const NODE_ID_MIN: u8 = 1;
pub const NODE_ID_MAX: u8 = 127;

/// A node id in `1..=127`.
///
/// Out-of-range values are clamped to the nearest bound, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u8);

impl NodeId {
    pub fn clamped(raw: u8) -> Self {
        Self(raw.clamp(NODE_ID_MIN, NODE_ID_MAX))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn sdo_request_id(self) -> u16 {
        SDO_REQUEST_BASE + u16::from(self.0)
    }

    pub fn sdo_response_id(self) -> u16 {
        SDO_RESPONSE_BASE + u16::from(self.0)
    }
}

impl From<u8> for NodeId {
    fn from(raw: u8) -> Self {
        Self::clamped(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range_ids() {
        assert_eq!(NodeId::clamped(0).get(), 1);
        assert_eq!(NodeId::clamped(128).get(), 127);
        assert_eq!(NodeId::clamped(255).get(), 127);
        for raw in 1..=127u8 {
            assert_eq!(NodeId::clamped(raw).get(), raw);
        }
    }

    #[test]
    fn sdo_ids_follow_node() {
        let node = NodeId::from(0x20);
        assert_eq!(node.sdo_request_id(), 0x620);
        assert_eq!(node.sdo_response_id(), 0x5A0);
        assert_eq!(node.to_string(), "0x20");
    }
}
