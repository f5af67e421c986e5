//! # CANopen Client Library
//!
//! CANopen master-side protocol engine, shared by operator tools and the
//! mock CANopen node used for testing.
//!
//! This library provides:
//! - CAN transport with background bring-up and fault recovery
//! - SDO client (expedited, segmented and block transfers)
//! - NMT commands
//! - Periodic PDO transmission
//! - Configuration and a CSV transfer log

pub mod config;
pub mod context;
pub mod logging;
pub mod nmt;
pub mod node;
pub mod pdo;
pub mod sdo;
pub mod transport;

// Re-export commonly used types for convenience
pub use config::{ChannelConfig, ConfigError};
pub use context::CanopenContext;
pub use logging::{DisplayMode, ObjectDescriptions, ReportLine, TransferLog};
pub use nmt::{NmtClient, NmtCommand, NmtError};
pub use node::NodeId;
pub use pdo::{PdoError, PdoScheduler, PDO_MAX};
pub use sdo::{abort_code_description, SdoClient, SdoError, SdoUpload, TransferMode, SDO_TIMEOUT};
pub use transport::{BusOpener, CanBus, CanChannel, CanMessage, ChannelState, TransportError, VirtualBus};
