// nmt.rs - NMT master commands
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::node::NodeId;
use crate::transport::{CanChannel, CanMessage, TransportError};

/// NMT commands are broadcast on COB-ID 0
pub const NMT_COB_ID: u16 = 0x000;

/// NMT command specifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    /// Start (go to Operational)
    Operational = 0x01,
    /// Stop (go to Stopped)
    Stop = 0x02,
    PreOperational = 0x80,
    /// Application reset
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

impl NmtCommand {
    pub const ALL: [NmtCommand; 5] = [
        Self::Operational,
        Self::Stop,
        Self::PreOperational,
        Self::ResetNode,
        Self::ResetCommunication,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Short operator alias
    pub fn alias(self) -> &'static str {
        match self {
            Self::Operational => "op",
            Self::Stop => "stop",
            Self::PreOperational => "preop",
            Self::ResetNode => "reset",
            Self::ResetCommunication => "reset-comm",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Operational => "Start (go to Operational)",
            Self::Stop => "Stop (go to Stopped)",
            Self::PreOperational => "Go to Pre-operational",
            Self::ResetNode => "Reset node (Application reset)",
            Self::ResetCommunication => "Reset communication",
        }
    }
}

impl TryFrom<u8> for NmtCommand {
    type Error = NmtError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|command| command.code() == code)
            .ok_or(NmtError::UnknownCommand(code))
    }
}

impl FromStr for NmtCommand {
    type Err = NmtError;

    /// Accepts the operator aliases and numeric codes (`0x81`, `129`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(command) = Self::ALL.into_iter().find(|command| command.alias().eq_ignore_ascii_case(s)) {
            return Ok(command);
        }

        let code = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => s.parse::<u8>(),
        }
        .map_err(|_| NmtError::UnknownAlias(s.to_string()))?;

        Self::try_from(code)
    }
}

impl fmt::Display for NmtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[derive(Debug, Error)]
pub enum NmtError {
    #[error("Unknown NMT command 0x{0:02X}")]
    UnknownCommand(u8),
    #[error("Unknown NMT command '{0}'")]
    UnknownAlias(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The NMT frame for `command` addressed to `node`
pub fn nmt_frame(node: NodeId, command: NmtCommand) -> CanMessage {
    let mut data = [0u8; 8];
    data[0] = command.code();
    data[1] = node.get();

    CanMessage {
        id: u32::from(NMT_COB_ID),
        extended: false,
        len: 2,
        data,
        timestamp_us: 0,
    }
}

/// Stateless NMT master
#[derive(Clone)]
pub struct NmtClient {
    channel: CanChannel,
}

impl NmtClient {
    pub fn new(channel: CanChannel) -> Self {
        Self { channel }
    }

    pub fn send_command(&self, node: NodeId, command: NmtCommand) -> Result<(), NmtError> {
        self.channel.write(&nmt_frame(node, command))?;
        debug!("NMT {} -> node {}", command, node);
        Ok(())
    }

    /// Send a raw command code. Unknown codes are rejected without transmitting.
    pub fn send_command_code(&self, node: NodeId, code: u8) -> Result<NmtCommand, NmtError> {
        let command = NmtCommand::try_from(code)?;
        self.send_command(node, command)?;
        Ok(command)
    }
}
