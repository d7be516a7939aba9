//! Framing for the JBD BMS serial protocol, carried over the BLE UART service.
//!
//! A read request is
//!
//! Start Byte | End Byte     | Meaning
//! 0          | 1            | A constant header with value [0xdd, 0xa5]
//! 2          | 2            | The register to read
//! 3          | 3            | The length of the data, 0 for reads
//! 4          | 5            | Checksum over bytes 2-3, big endian
//! 6          | 6            | A constant trailer with value 0x77
//!
//! and the response is
//!
//! Start Byte | End Byte     | Meaning
//! 0          | 0            | A constant header with value 0xdd
//! 1          | 1            | The register that was read
//! 2          | 2            | Status, 0x00 on success and 0x80 on error
//! 3          | 3            | The length in bytes of the data (x)
//! 4          | x+3          | The data
//! x+4        | x+5          | Checksum over bytes 2-(x+3), big endian
//! x+6        | x+6          | A constant trailer with value 0x77
//!
//! The checksum is `0x10000` minus the sum of the covered bytes.

pub(crate) mod basic_info;
pub(crate) mod cell_voltages;

pub use basic_info::BasicInfo;
pub use cell_voltages::CellVoltages;

pub const START_BYTE: u8 = 0xdd;
pub const END_BYTE: u8 = 0x77;
const READ_MARKER: u8 = 0xa5;
const STATUS_OK: u8 = 0x00;
/// Bytes in a response around the data: start, register, status, length, checksum (2), end
pub const FRAME_OVERHEAD: usize = 7;

/// A readable register of the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    BasicInfo = 0x03,
    CellVoltages = 0x04,
}

impl Register {
    pub fn id(self) -> u8 {
        self as u8
    }

    /// The largest data length a well-formed response for this register may declare.
    pub fn max_data_len(self, max_cells: usize) -> usize {
        match self {
            Register::BasicInfo => {
                basic_info::FIXED_LEN + 2 * basic_info::MAX_NTC + basic_info::MAX_EXTENSION_LEN
            }
            Register::CellVoltages => 2 * max_cells,
        }
    }
}

/// Compute the checksum for the given bytes
pub fn checksum(data: &[u8]) -> [u8; 2] {
    let sum = data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    0u16.wrapping_sub(sum).to_be_bytes()
}

/// Build the request frame that reads `register`.
pub fn encode_request(register: Register) -> [u8; 7] {
    let body = [register.id(), 0x00];
    let [hi, lo] = checksum(&body);
    [START_BYTE, READ_MARKER, body[0], body[1], hi, lo, END_BYTE]
}

/// Build a response frame the way the BMS does, to feed the decoder known payloads.
#[cfg(test)]
pub(crate) fn encode_response(register: u8, status: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&[START_BYTE, register, status, data.len() as u8]);
    frame.extend_from_slice(data);
    let crc = checksum(&frame[2..]);
    frame.extend_from_slice(&crc);
    frame.push(END_BYTE);
    frame
}

#[derive(PartialEq, Eq, Debug)]
pub enum TryParseMessageResult {
    Ok(Vec<u8>),
    Incomplete,
    Invalid(&'static str),
    /// A complete frame answering a different register
    Unexpected(u8),
}

/// Attempt to parse the accumulated response bytes for `register`, returning its data.
///
/// The declared length is checked against the register's bound as soon as the
/// header is in, so an oversized frame fails before the rest of it arrives.
pub fn try_parse_msg(buffer: &[u8], register: Register, max_cells: usize) -> TryParseMessageResult {
    if buffer.is_empty() {
        return TryParseMessageResult::Incomplete;
    }
    if buffer[0] != START_BYTE {
        return TryParseMessageResult::Invalid("Unexpected start byte");
    }
    if buffer.len() < 4 {
        return TryParseMessageResult::Incomplete;
    }

    let data_len = buffer[3] as usize;
    let expected_len = data_len + FRAME_OVERHEAD;
    if buffer.len() < expected_len {
        // A mismatched register is only reported once its frame is complete,
        // so the bound check below cannot be tripped by a foreign frame's length.
        if buffer[1] == register.id() && data_len > register.max_data_len(max_cells) {
            return TryParseMessageResult::Invalid("Declared length exceeds bound");
        }
        return TryParseMessageResult::Incomplete;
    }

    if buffer.len() > expected_len {
        return TryParseMessageResult::Invalid("Too long");
    }

    if buffer[expected_len - 1] != END_BYTE {
        return TryParseMessageResult::Invalid("Unexpected end byte");
    }

    let crc_actual = &buffer[expected_len - 3..expected_len - 1];
    let crc_expected = checksum(&buffer[2..expected_len - 3]);
    if crc_actual != crc_expected {
        return TryParseMessageResult::Invalid("Checksum check failed");
    }

    if buffer[1] != register.id() {
        return TryParseMessageResult::Unexpected(buffer[1]);
    }

    if buffer[2] != STATUS_OK {
        return TryParseMessageResult::Invalid("Device reported error status");
    }

    if data_len > register.max_data_len(max_cells) {
        return TryParseMessageResult::Invalid("Declared length exceeds bound");
    }

    TryParseMessageResult::Ok(buffer[4..4 + data_len].to_vec())
}

/// Iterate big-endian 16-bit words.
pub(crate) fn words(data: &[u8]) -> impl Iterator<Item = u16> + '_ {
    data.chunks_exact(2).map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
}
