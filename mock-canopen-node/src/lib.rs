//! # Mock CANopen Node
//!
//! A CANopen node simulator for exercising the client library against a
//! real protocol peer, on SocketCAN or on a [`canopen_client::VirtualBus`].
//!
//! The node:
//! - Serves its object dictionary over SDO (expedited, segmented and block)
//! - Follows NMT commands and announces resets with a boot-up message
//! - Broadcasts TPDO1 with simulated sensor values while Operational

pub mod node;
pub mod object_dictionary;
pub mod sdo_server;

pub use node::{MockNode, NmtState, Tpdo1};
pub use object_dictionary::{Access, DataType, DictionaryError, ObjectDictionary};
pub use sdo_server::SdoServer;
