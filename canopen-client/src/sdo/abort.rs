// abort.rs - SDO abort codes
pub const ABORT_TOGGLE_BIT_NOT_ALTERED: u32 = 0x0503_0000;
pub const ABORT_SDO_PROTOCOL_TIMED_OUT: u32 = 0x0504_0000;
pub const ABORT_CMD_SPECIFIER_INVALID: u32 = 0x0504_0001;
pub const ABORT_INVALID_BLOCK_SIZE: u32 = 0x0504_0002;
pub const ABORT_INVALID_SEQUENCE_NUMBER: u32 = 0x0504_0003;
pub const ABORT_OUT_OF_MEMORY: u32 = 0x0504_0005;
pub const ABORT_ATTEMPT_TO_READ_WRITE_ONLY: u32 = 0x0601_0001;
pub const ABORT_ATTEMPT_TO_WRITE_READ_ONLY: u32 = 0x0601_0002;
pub const ABORT_OBJECT_DOES_NOT_EXIST: u32 = 0x0602_0000;
pub const ABORT_DATA_TYPE_DOES_NOT_MATCH: u32 = 0x0607_0010;
pub const ABORT_SUB_INDEX_DOES_NOT_EXIST: u32 = 0x0609_0011;
pub const ABORT_GENERAL_ERROR: u32 = 0x0800_0000;

pub const UNKNOWN_ABORT_CODE: &str = "Unknown abort code";

/// Every abort code with its fixed description
pub const ABORT_CODES: [(u32, &str); 31] = [
    (ABORT_TOGGLE_BIT_NOT_ALTERED, "Toggle bit not altered"),
    (ABORT_SDO_PROTOCOL_TIMED_OUT, "SDO protocol timed out"),
    (ABORT_CMD_SPECIFIER_INVALID, "Client/server command specifier not valid or unknown"),
    (ABORT_INVALID_BLOCK_SIZE, "Invalid block size"),
    (ABORT_INVALID_SEQUENCE_NUMBER, "Invalid sequence number"),
    (0x0504_0004, "CRC error"),
    (ABORT_OUT_OF_MEMORY, "Out of memory"),
    (0x0601_0000, "Unsupported access to an object"),
    (ABORT_ATTEMPT_TO_READ_WRITE_ONLY, "Attempt to read a write only object"),
    (ABORT_ATTEMPT_TO_WRITE_READ_ONLY, "Attempt to write a read only object"),
    (ABORT_OBJECT_DOES_NOT_EXIST, "Object does not exist in the object dictionary"),
    (0x0604_0041, "Object cannot be mapped to the PDO"),
    (0x0604_0042, "Number, length of the object would exceed PDO length"),
    (0x0604_0043, "General parameter incompatibility reason"),
    (0x0604_0047, "General internal incompatibility in the device"),
    (0x0606_0000, "Access failed due to an hardware error"),
    (ABORT_DATA_TYPE_DOES_NOT_MATCH, "Data type does not match, length does not match"),
    (0x0607_0012, "Data type does not match, length too high"),
    (0x0607_0013, "Data type does not match, length too low"),
    (ABORT_SUB_INDEX_DOES_NOT_EXIST, "Sub-index does not exist"),
    (0x0609_0030, "Invalid value for parameter"),
    (0x0609_0031, "Value for parameter written too high"),
    (0x0609_0032, "Value for parameter written too low"),
    (0x0609_0036, "Maximum value is less than minimum value"),
    (0x060A_0023, "Resource not available: SDO connection"),
    (ABORT_GENERAL_ERROR, "General error"),
    (0x0800_0020, "Data cannot be transferred"),
    (0x0800_0021, "Data cannot be transferred or stored to the application because of local control"),
    (0x0800_0022, "Data cannot be transferred because of the present device state"),
    (0x0800_0023, "Object dictionary dynamic generation fails or no object dictionary present"),
    (0x0800_0024, "No data available"),
];

/// Human-readable text for an abort code. Callers branch on the code, not this text.
pub fn abort_code_description(code: u32) -> &'static str {
    ABORT_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, text)| *text)
        .unwrap_or(UNKNOWN_ABORT_CODE)
}
