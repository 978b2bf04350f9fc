//! Loader command and response packets.
//!
//! ## Request Format
//!
//! ```text
//! +-----------+--------+---------+-------------------+-----------+
//! | Direction | Opcode | Length  | Checksum          | Payload   |
//! +-----------+--------+---------+-------------------+-----------+
//! |  1 byte   | 1 byte | 2 (LE)  | 4 (LE)            | variable  |
//! |   0x00    |  op    | payload | XOR of data bytes | ...       |
//! +-----------+--------+---------+-------------------+-----------+
//! ```
//!
//! ## Response Format
//!
//! ```text
//! +-----------+--------+---------+-----------+-----------------------------+
//! | Direction | Opcode | Length  | Value     | Data (ends in status bytes) |
//! +-----------+--------+---------+-----------+-----------------------------+
//! |   0x01    |  op    | 2 (LE)  | 4 (LE)    | variable                    |
//! +-----------+--------+---------+-----------+-----------------------------+
//! ```

use {
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    std::{fmt, time::Duration},
};

/// Direction byte of a request.
pub const DIRECTION_REQUEST: u8 = 0x00;

/// Direction byte of a response.
pub const DIRECTION_RESPONSE: u8 = 0x01;

/// Size of both request and response headers.
pub const HEADER_LEN: usize = 8;

/// Seed of the data checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Payload of the SYNC command: 0x07 0x07 0x12 0x20 followed by 32 x 0x55.
pub const SYNC_PAYLOAD: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55,
];

/// Loader opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Begin a raw flash write (also erases).
    FlashBegin = 0x02,
    /// One raw flash block.
    FlashData = 0x03,
    /// Finish flash writing.
    FlashEnd = 0x04,
    /// Begin a RAM download.
    MemBegin = 0x05,
    /// Finish a RAM download and optionally jump to an entry point.
    MemEnd = 0x06,
    /// One RAM block.
    MemData = 0x07,
    /// Baud detection / liveness probe.
    Sync = 0x08,
    /// Write a 32-bit register.
    WriteReg = 0x09,
    /// Read a 32-bit register.
    ReadReg = 0x0A,
    /// Switch the loader to a different baud rate.
    ChangeBaudrate = 0x0F,
    /// Begin a compressed flash write.
    FlashDeflBegin = 0x10,
    /// One compressed flash block.
    FlashDeflData = 0x11,
    /// Finish a compressed flash write.
    FlashDeflEnd = 0x12,
    /// Query secure boot / flash encryption state.
    GetSecurityInfo = 0x14,
}

impl Opcode {
    /// Map a raw opcode byte back to a known command.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x02 => Self::FlashBegin,
            0x03 => Self::FlashData,
            0x04 => Self::FlashEnd,
            0x05 => Self::MemBegin,
            0x06 => Self::MemEnd,
            0x07 => Self::MemData,
            0x08 => Self::Sync,
            0x09 => Self::WriteReg,
            0x0A => Self::ReadReg,
            0x0F => Self::ChangeBaudrate,
            0x10 => Self::FlashDeflBegin,
            0x11 => Self::FlashDeflData,
            0x12 => Self::FlashDeflEnd,
            0x14 => Self::GetSecurityInfo,
            _ => return None,
        })
    }

    /// Retry policy used when the caller has no better one.
    pub fn default_policy(self) -> RetryPolicy {
        match self {
            Self::MemEnd => RetryPolicy::MEM_END,
            Self::Sync => RetryPolicy::SYNC,
            Self::MemBegin
            | Self::MemData
            | Self::FlashBegin
            | Self::FlashData
            | Self::FlashDeflBegin
            | Self::FlashDeflData => RetryPolicy::DATA,
            _ => RetryPolicy::CONTROL,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}(0x{:02X})", *self as u8)
    }
}

/// Per-attempt timeout and attempt count of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long each attempt waits for its response.
    pub timeout: Duration,
    /// Number of attempts, at least one.
    pub tries: u32,
}

impl RetryPolicy {
    /// Short control operations.
    pub const CONTROL: Self = Self::new(Duration::from_millis(500), 5);
    /// Large data-bearing operations.
    pub const DATA: Self = Self::new(Duration::from_secs(5), 1);
    /// MEM_END, answered right before the loader jumps away.
    pub const MEM_END: Self = Self::new(Duration::from_millis(50), 1);
    /// A single SYNC probe; the bootstrap loop does its own retrying.
    pub const SYNC: Self = Self::new(Duration::from_millis(100), 1);

    /// Create a policy.
    pub const fn new(timeout: Duration, tries: u32) -> Self {
        Self { timeout, tries }
    }
}

/// XOR checksum over `data`, seeded with [`CHECKSUM_SEED`].
pub fn checksum(data: &[u8]) -> u32 {
    u32::from(
        data.iter()
            .fold(CHECKSUM_SEED, |acc, b| acc ^ b),
    )
}

/// A request ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    opcode: Opcode,
    payload: Vec<u8>,
    checksum: u32,
}

impl Request {
    /// Create a request with a zero checksum field.
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            checksum: 0,
        }
    }

    /// Set the checksum/value header field.
    #[must_use]
    pub fn with_checksum(mut self, checksum: u32) -> Self {
        self.checksum = checksum;
        self
    }

    /// Build a request whose payload is a list of little-endian words.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn from_words(opcode: Opcode, words: &[u32]) -> Self {
        let mut payload = Vec::with_capacity(words.len() * 4);
        for &word in words {
            payload
                .write_u32::<LittleEndian>(word)
                .unwrap();
        }
        Self::new(opcode, payload)
    }

    /// Build a data block request: `[len, seq, 0, 0]` followed by `data`,
    /// with the checksum of `data` in the header.
    #[allow(clippy::cast_possible_truncation)]
    pub fn data_block(opcode: Opcode, data: &[u8], seq: u32) -> Self {
        // Safe cast: blocks are at most a few KiB
        let mut request = Self::from_words(opcode, &[data.len() as u32, seq, 0, 0]);
        request
            .payload
            .extend_from_slice(data);
        request.with_checksum(checksum(data))
    }

    /// The command opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The command payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize header and payload (unframed).
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(DIRECTION_REQUEST);
        buf.push(self.opcode as u8);
        // Safe cast: payloads never exceed 64 KiB
        buf.write_u16::<LittleEndian>(self.payload.len() as u16)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.checksum)
            .unwrap();
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// A decoded loader response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Raw opcode echoed by the loader.
    pub opcode: u8,
    /// The 32-bit value field (register contents for READ_REG).
    pub value: u32,
    /// Trailing data, which ends with the status bytes.
    pub data: Vec<u8>,
}

impl Response {
    /// Parse a decoded frame.
    ///
    /// Returns `None` for frames that are too short or are not responses
    /// (for example the stub's greeting).
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_LEN || frame[0] != DIRECTION_RESPONSE {
            return None;
        }
        Some(Self {
            opcode: frame[1],
            value: LittleEndian::read_u32(&frame[4..8]),
            data: frame[HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_seed() {
        assert_eq!(checksum(&[]), 0xEF);
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), u32::from(0xEFu8 ^ 0x01 ^ 0x02 ^ 0x03));
    }

    #[test]
    fn test_request_header_layout() {
        let bytes = Request::new(Opcode::Sync, SYNC_PAYLOAD.to_vec()).to_bytes();
        assert_eq!(&bytes[..8], &[0x00, 0x08, 36, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert_eq!(bytes.len(), 8 + 36);
    }

    #[test]
    fn test_read_reg_request() {
        let bytes = Request::from_words(Opcode::ReadReg, &[0x4000_1000]).to_bytes();
        assert_eq!(bytes, vec![0x00, 0x0A, 4, 0, 0, 0, 0, 0, 0x00, 0x10, 0x00, 0x40]);
    }

    #[test]
    fn test_data_block_request() {
        let request = Request::data_block(Opcode::FlashDeflData, &[0xAA, 0x55], 3);
        let bytes = request.to_bytes();
        assert_eq!(bytes[1], 0x11);
        assert_eq!(&bytes[2..4], &[18, 0]);
        assert_eq!(&bytes[4..8], &[0xEF ^ 0xAA ^ 0x55, 0, 0, 0]);
        assert_eq!(&bytes[8..24], &[2, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[24..], &[0xAA, 0x55]);
    }

    #[test]
    fn test_response_parse() {
        let frame = [0x01, 0x0A, 0x02, 0x00, 0x83, 0x1D, 0xF0, 0x00, 0x00, 0x00];
        let response = Response::parse(&frame).unwrap();
        assert_eq!(response.opcode, 0x0A);
        assert_eq!(response.value, 0x00F0_1D83);
        assert_eq!(response.data, vec![0x00, 0x00]);
    }

    #[test]
    fn test_response_parse_rejects_non_responses() {
        assert!(Response::parse(b"OHAI").is_none());
        assert!(Response::parse(&[0x00, 0x08, 0, 0, 0, 0, 0, 0]).is_none());
        assert!(Response::parse(&[0x01, 0x08, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_opcode_round_trip_and_policies() {
        for op in [Opcode::Sync, Opcode::ReadReg, Opcode::FlashDeflData, Opcode::GetSecurityInfo] {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0xFF), None);
        assert_eq!(Opcode::FlashDeflData.default_policy().tries, 1);
        assert_eq!(Opcode::ReadReg.default_policy().tries, 5);
        assert_eq!(Opcode::MemEnd.default_policy().timeout, Duration::from_millis(50));
    }
}
