// DWP protocol definitions and packet framing
//
// Every packet starts with an 11 byte big-endian header. Commands carry a
// command set and command byte, replies carry a 16 bit error code in the same
// position and set the high bit of the flags byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid handshake")]
    InvalidHandshake,

    #[error("Command failed with {0}")]
    Command(ErrorCode),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid agent option: {0}")]
    Config(String),
}

pub const HANDSHAKE: &[u8] = b"DWP-Handshake";

// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [Command packet: command set (1 byte) + command (1 byte)]
// [Reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;

/// Largest packet either side accepts (10MB)
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

pub const MAJOR_VERSION: u32 = 2;
pub const MINOR_VERSION: u32 = 58;

/// Negotiated protocol version, compared lexicographically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion {
        major: MAJOR_VERSION,
        minor: MINOR_VERSION,
    };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// True if the peer speaks at least `major.minor`
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= ProtocolVersion::new(major, minor)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Wire error codes carried in reply headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    None = 0,
    InvalidObject = 20,
    InvalidFieldId = 25,
    InvalidFrameId = 30,
    NotImplemented = 100,
    NotSuspended = 101,
    InvalidArgument = 102,
    Unloaded = 103,
    NoInvocation = 104,
    AbsentInformation = 105,
    NoSeqPointAtIlOffset = 106,
    InvokeAborted = 107,
    LoaderError = 200,
}

impl ErrorCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0 => ErrorCode::None,
            20 => ErrorCode::InvalidObject,
            25 => ErrorCode::InvalidFieldId,
            30 => ErrorCode::InvalidFrameId,
            100 => ErrorCode::NotImplemented,
            101 => ErrorCode::NotSuspended,
            102 => ErrorCode::InvalidArgument,
            103 => ErrorCode::Unloaded,
            104 => ErrorCode::NoInvocation,
            105 => ErrorCode::AbsentInformation,
            106 => ErrorCode::NoSeqPointAtIlOffset,
            107 => ErrorCode::InvokeAborted,
            200 => ErrorCode::LoaderError,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::None => "NONE",
            ErrorCode::InvalidObject => "INVALID_OBJECT",
            ErrorCode::InvalidFieldId => "INVALID_FIELDID",
            ErrorCode::InvalidFrameId => "INVALID_FRAMEID",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::NotSuspended => "NOT_SUSPENDED",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::Unloaded => "UNLOADED",
            ErrorCode::NoInvocation => "NO_INVOCATION",
            ErrorCode::AbsentInformation => "ABSENT_INFORMATION",
            ErrorCode::NoSeqPointAtIlOffset => "NO_SEQ_POINT_AT_IL_OFFSET",
            ErrorCode::InvokeAborted => "INVOKE_ABORTED",
            ErrorCode::LoaderError => "LOADER_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), *self as u16)
    }
}

// A body that fails to decode is the client's fault
impl From<AgentError> for ErrorCode {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Command(code) => code,
            _ => ErrorCode::InvalidArgument,
        }
    }
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: usize,
    pub id: u32,
    pub flags: u8,
    pub command_set: u8,
    pub command: u8,
}

impl PacketHeader {
    pub fn decode(mut buf: &[u8]) -> AgentResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(AgentError::Protocol("Packet header too short".to_string()));
        }

        let length = buf.get_u32() as usize;
        let id = buf.get_u32();
        let flags = buf.get_u8();
        let command_set = buf.get_u8();
        let command = buf.get_u8();

        if length < HEADER_SIZE {
            return Err(AgentError::Protocol(format!(
                "Invalid packet length: {}",
                length
            )));
        }

        if length > MAX_PACKET_SIZE {
            return Err(AgentError::Protocol(format!(
                "Packet too large: {} bytes (max: {} bytes)",
                length, MAX_PACKET_SIZE
            )));
        }

        Ok(Self {
            length,
            id,
            flags,
            command_set,
            command,
        })
    }

    pub fn is_reply(&self) -> bool {
        self.flags & REPLY_FLAG != 0
    }

    /// Error code of a reply header
    pub fn error_code(&self) -> u16 {
        u16::from_be_bytes([self.command_set, self.command])
    }
}

#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub data: Vec<u8>,
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            command_set,
            command,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(0x00); // command flag
        buf.put_u8(self.command_set);
        buf.put_u8(self.command);
        buf.put_slice(&self.data);

        buf.to_vec()
    }

    pub fn decode(buf: &[u8]) -> AgentResult<Self> {
        let header = PacketHeader::decode(buf)?;
        if header.is_reply() {
            return Err(AgentError::Protocol("Expected a command packet".to_string()));
        }
        if buf.len() != header.length {
            return Err(AgentError::Protocol(format!(
                "Packet length mismatch: header says {}, got {}",
                header.length,
                buf.len()
            )));
        }

        Ok(Self {
            id: header.id,
            command_set: header.command_set,
            command: header.command,
            data: buf[HEADER_SIZE..].to_vec(),
        })
    }
}

impl ReplyPacket {
    pub fn new(id: u32, error: ErrorCode, data: Vec<u8>) -> Self {
        Self {
            id,
            error_code: error as u16,
            data,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.data.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append this reply to `buf`, used when replies are batched
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32((HEADER_SIZE + self.data.len()) as u32);
        buf.put_u32(self.id);
        buf.put_u8(REPLY_FLAG);
        buf.put_u16(self.error_code);
        buf.put_slice(&self.data);
    }

    pub fn decode(mut buf: &[u8]) -> AgentResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(AgentError::Protocol("Reply packet too short".to_string()));
        }

        let _length = buf.get_u32();
        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags != REPLY_FLAG {
            return Err(AgentError::Protocol(format!("Invalid reply flag: {:#x}", flags)));
        }

        let error_code = buf.get_u16();
        let data = buf.to_vec();

        Ok(Self {
            id,
            error_code,
            data,
        })
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    pub fn check_error(&self) -> AgentResult<()> {
        if !self.is_error() {
            return Ok(());
        }
        match ErrorCode::from_u16(self.error_code) {
            Some(code) => Err(AgentError::Command(code)),
            None => Err(AgentError::Protocol(format!(
                "Unknown error code {}",
                self.error_code
            ))),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_packet_encode() {
        let packet = CommandPacket::new(1, 1, 1);
        let encoded = packet.encode();

        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(&encoded[0..4], &[0, 0, 0, 11]); // length (big-endian)
        assert_eq!(&encoded[4..8], &[0, 0, 0, 1]); // id (big-endian)
        assert_eq!(encoded[8], 0x00); // command flag
        assert_eq!(encoded[9], 1); // command set
        assert_eq!(encoded[10], 1); // command
    }

    #[test]
    fn test_reply_carries_error_in_place_of_command() {
        let reply = ReplyPacket::new(0x01020304, ErrorCode::NotSuspended, vec![7]);
        let encoded = reply.encode();

        assert_eq!(&encoded[0..4], &[0, 0, 0, 12]);
        assert_eq!(&encoded[4..8], &[1, 2, 3, 4]);
        assert_eq!(encoded[8], REPLY_FLAG);
        assert_eq!(&encoded[9..11], &[0, 101]);

        let header = PacketHeader::decode(&encoded).unwrap();
        assert!(header.is_reply());
        assert_eq!(header.error_code(), 101);

        let decoded = ReplyPacket::decode(&encoded).unwrap();
        assert!(matches!(
            decoded.check_error(),
            Err(AgentError::Command(ErrorCode::NotSuspended))
        ));
    }

    #[test]
    fn test_header_rejects_bad_lengths() {
        let short = [0u8, 0, 0, 5, 0, 0, 0, 1, 0, 1, 1];
        assert!(PacketHeader::decode(&short).is_err());

        let huge = [0xffu8, 0xff, 0xff, 0xff, 0, 0, 0, 1, 0, 1, 1];
        assert!(PacketHeader::decode(&huge).is_err());
    }

    #[test]
    fn test_command_packet_decode() {
        let mut packet = CommandPacket::new(9, 15, 1);
        packet.data.extend_from_slice(&[10, 2, 0]);
        let decoded = CommandPacket::decode(&packet.encode()).unwrap();

        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.command_set, 15);
        assert_eq!(decoded.command, 1);
        assert_eq!(decoded.data, vec![10, 2, 0]);
    }

    #[test]
    fn test_version_gates() {
        let v = ProtocolVersion::new(2, 25);
        assert!(v.at_least(2, 16));
        assert!(v.at_least(2, 25));
        assert!(!v.at_least(2, 26));
        assert!(ProtocolVersion::new(3, 0).at_least(2, 58));
    }
}
