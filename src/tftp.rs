use std::error;
use std::fmt;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error encountered while decoding a datagram as
/// a TFTP packet.
#[derive(Debug, PartialEq)]
pub enum PacketError {
    TooShort(usize),
    UnknownOpcode(u16),
    UnterminatedField(&'static str),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::TooShort(len) => write!(f, "packet too short: {len} bytes"),
            PacketError::UnknownOpcode(op) => write!(f, "unknown opcode: {op}"),
            PacketError::UnterminatedField(field) => write!(f, "{field} is not NUL-terminated"),
        }
    }
}

type ParseResult<T> = Result<T, PacketError>;

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorCode { Undefined, FileNotFound, AccessViolation, DiskFull, Illegal, UnknownTid, FileAlreadyExists, NoSuchUser }

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
///
/// The mode string on requests is carried verbatim and never
/// interpreted; all transfers are served as raw octets.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file the client wants to read.
        filename: String,

        /// The transfer mode named by the client.
        mode: String,
    },

    /// A write request packet
    WriteReq {
        filename: String,
        mode: String,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the block itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let mut s = String::new();
    for (i, &c) in buf.iter().enumerate() {
        if c == 0x00 {
            return (s, i);
        }
        s.push(char::from(c));
    }

    (s, buf.len())
}

/// Utility enum for the TFTP opcode at the head of every packet
#[derive(Debug, PartialEq)]
enum OpCode { Rrq, Wrq, Data, Ack, Error }

impl OpCode {
    fn wire(&self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

fn retrieve_op_code(buf: &[u8]) -> ParseResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(PacketError::UnknownOpcode(rawcode)),
    }
}

fn parse_filename_and_mode(buf: &[u8]) -> ParseResult<(String, String)> {
    let (filename, filename_end) = string_from_buffer(buf);

    if filename_end == buf.len() {
        return Err(PacketError::UnterminatedField("filename"));
    }

    let rest = &buf[filename_end + 1..];
    let (mode, mode_end) = string_from_buffer(rest);

    if mode_end == rest.len() {
        return Err(PacketError::UnterminatedField("mode"));
    }

    Ok((filename, mode))
}

fn parse_read_req(buf: &[u8]) -> ParseResult<Packet> {
    let (filename, mode) = parse_filename_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { filename, mode })
}

fn parse_write_req(buf: &[u8]) -> ParseResult<Packet> {
    let (filename, mode) = parse_filename_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { filename, mode })
}

fn parse_data(buf: &[u8]) -> ParseResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> ParseResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> ParseResult<Packet> {
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

///////////////////////////////////////////////////////////////
// Wire codec

impl Packet {
    pub fn parse(buf: &[u8]) -> ParseResult<Packet> {
        if buf.len() < 4 {
            return Err(PacketError::TooShort(buf.len()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { filename, mode } => serialize_request(OpCode::Rrq, filename, mode),
            Packet::WriteReq { filename, mode } => serialize_request(OpCode::Wrq, filename, mode),
            Packet::Data { block, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&OpCode::Data.wire().to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OpCode::Ack.wire().to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                buf.extend_from_slice(&OpCode::Error.wire().to_be_bytes());
                buf.extend_from_slice(&u16::from(*code).to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
                buf
            }
        }
    }
}

fn serialize_request(op: OpCode, filename: &str, mode: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.extend_from_slice(&op.wire().to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0x00);
    buf
}
