//! MySQL wire framing.
//!
//! Every unit on the wire is a 4-byte header followed by a payload. Hermes
//! reads and writes the header as one little-endian u32: the low 24 bits
//! carry the payload length, the high 8 bits the sequence id. The router
//! forwards most payloads opaquely, so `Packet` keeps them as shared
//! `Bytes` and only the handful of synthesized packets ever allocate.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header bytes preceding every payload
pub const PACKET_HEADER_SIZE: usize = 4;
/// Largest payload one packet may carry (24-bit length field)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// One framed unit of the MySQL protocol
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Build a COM_QUERY packet from SQL text
    pub fn query(sql: &str) -> Self {
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(Command::Query.byte());
        payload.extend_from_slice(sql.as_bytes());
        Self::new(0, payload)
    }

    /// First payload byte, i.e. the command byte of a request packet
    pub fn command_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Append the framed packet to an output buffer.
    ///
    /// The payload must fit the 24-bit length field; the codec checks this
    /// before packets reach here.
    pub fn encode(&self, dst: &mut BytesMut) {
        let header = self.payload.len() as u32 | u32::from(self.sequence_id) << 24;
        dst.put_u32_le(header);
        dst.put_slice(&self.payload);
    }

    /// Split one packet off the front of `src`; None while more bytes are
    /// needed, in which case `src` is left untouched.
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let header = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let len = (header & 0x00FF_FFFF) as usize;
        if src.len() - PACKET_HEADER_SIZE < len {
            return None;
        }

        src.advance(PACKET_HEADER_SIZE);
        Some(Self {
            sequence_id: (header >> 24) as u8,
            payload: src.split_to(len).freeze(),
        })
    }
}

/// MySQL capability flags hermes negotiates or inspects.
///
/// Deliberately not the full protocol table: flags hermes neither sets nor
/// reads (compression, TLS, connect attributes, ...) are omitted, and an
/// absent flag is implicitly refused during negotiation.
pub mod capabilities {
    // Handshake and authentication
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;

    // Statement features the router forwards
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;

    // Row-count semantics passed through to backends
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;

    // Recognized so it can be refused on both sides
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities hermes negotiates on both sides of the proxy.
    ///
    /// CLIENT_DEPRECATE_EOF is intentionally NOT included: some backends
    /// advertise it but still send EOF packets, and a fixed EOF-terminated
    /// result layout keeps the reply-state machine honest.
    ///
    /// CLIENT_MULTI_STATEMENTS and CLIENT_LOCAL_FILES are included because
    /// the router classifies multi-statement payloads and forwards
    /// LOAD DATA LOCAL INFILE streams rather than refusing them.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_LOCAL_FILES
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// Server status flags carried in OK and EOF packets
pub mod status_flags {
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// The client commands the router distinguishes.
///
/// Everything else reaches the master untouched as `Other`; the byte is
/// preserved so the packet can still be forwarded and logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    InitDb,
    Query,
    FieldList,
    Statistics,
    Debug,
    Ping,
    ChangeUser,
    StmtPrepare,
    StmtExecute,
    StmtSendLongData,
    StmtClose,
    StmtReset,
    SetOption,
    StmtFetch,
    ResetConnection,
    Other(u8),
}

impl Command {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x09 => Command::Statistics,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x11 => Command::ChangeUser,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1f => Command::ResetConnection,
            other => Command::Other(other),
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Command::Quit => 0x01,
            Command::InitDb => 0x02,
            Command::Query => 0x03,
            Command::FieldList => 0x04,
            Command::Statistics => 0x09,
            Command::Debug => 0x0d,
            Command::Ping => 0x0e,
            Command::ChangeUser => 0x11,
            Command::StmtPrepare => 0x16,
            Command::StmtExecute => 0x17,
            Command::StmtSendLongData => 0x18,
            Command::StmtClose => 0x19,
            Command::StmtReset => 0x1a,
            Command::SetOption => 0x1b,
            Command::StmtFetch => 0x1c,
            Command::ResetConnection => 0x1f,
            Command::Other(other) => other,
        }
    }
}

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    match value {
        0..=250 => buf.put_u8(value as u8),
        251..=0xFFFF => {
            buf.put_u8(0xFC);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFF_FFFF => {
            buf.put_u8(0xFD);
            buf.put_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            buf.put_u8(0xFE);
            buf.put_u64_le(value);
        }
    }
}

/// Parse a length-encoded integer, returning (value, bytes consumed)
pub fn get_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    let width = match *data.first()? {
        v @ 0..=0xFA => return Some((v as u64, 1)),
        0xFC => 2,
        0xFD => 3,
        0xFE => 8,
        _ => return None,
    };
    let tail = data.get(1..1 + width)?;
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(tail);
    Some((u64::from_le_bytes(bytes), 1 + width))
}
