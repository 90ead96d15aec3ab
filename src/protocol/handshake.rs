//! Connection setup packets and synthesized responses.
//!
//! Hermes speaks both sides of the auth exchange: it greets clients with
//! its own handshake and answers the greeting of every backend it opens.
//! Parsing runs through a small forward-only `Cursor` so truncated or
//! malformed payloads fall out as `None` instead of panicking, and the
//! 20-byte auth nonce is modeled whole rather than in the two wire pieces
//! the v10 layout scatters it into.

use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, put_lenenc_int, status_flags, Packet};

const PROTOCOL_VERSION: u8 = 10;
const SERVER_VERSION: &str = "8.0.0-hermes";
const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
const UTF8_GENERAL_CI: u8 = 0x21;
/// Bytes of the nonce carried in the fixed head of the greeting
const NONCE_HEAD: usize = 8;
/// Bytes of the nonce carried in the tail piece
const NONCE_TAIL: usize = 12;

/// Forward-only reader over a packet payload
struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { rest: payload }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.rest.len() < n {
            return None;
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn peek(&self) -> Option<u8> {
        self.rest.first().copied()
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    /// NUL-terminated string; the terminator is consumed
    fn cstr(&mut self) -> Option<&'a [u8]> {
        let end = self.rest.iter().position(|&b| b == 0)?;
        let s = &self.rest[..end];
        self.rest = &self.rest[end + 1..];
        Some(s)
    }

    /// Up to the next NUL if one exists, otherwise everything left.
    /// Trailing fields are NUL-terminated by some implementations and
    /// bare in others; both shapes land here.
    fn cstr_or_rest(&mut self) -> &'a [u8] {
        match self.rest.iter().position(|&b| b == 0) {
            Some(end) => {
                let s = &self.rest[..end];
                self.rest = &self.rest[end + 1..];
                s
            }
            None => std::mem::take(&mut self.rest),
        }
    }

    /// Everything left, consumed
    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.rest)
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// The v10 greeting: sent by hermes to clients, received from backends
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
    nonce: [u8; NONCE_HEAD + NONCE_TAIL],
}

impl InitialHandshake {
    /// Greeting hermes presents to a connecting client
    pub fn new(connection_id: u32) -> Self {
        use rand::RngCore;
        let mut nonce = [0u8; NONCE_HEAD + NONCE_TAIL];
        rand::thread_rng().fill_bytes(&mut nonce);

        Self {
            server_version: SERVER_VERSION.to_string(),
            connection_id,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: UTF8_GENERAL_CI,
            status_flags: status_flags::SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
            nonce,
        }
    }

    /// The full 20-byte auth nonce
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Encode the greeting.
    ///
    /// Hermes always offers mysql_native_password over a secure-connection
    /// handshake, so the optional tail sections of the v10 layout are
    /// always present and no conditionals are needed here.
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::with_capacity(96);

        buf.put_u8(PROTOCOL_VERSION);
        put_cstr(&mut buf, &self.server_version);
        buf.put_u32_le(self.connection_id);

        // The capability word straddles the charset and status fields;
        // the first nonce piece and a filler byte sit in between.
        buf.put_slice(&self.nonce[..NONCE_HEAD]);
        buf.put_u8(0);
        buf.put_u16_le(self.capability_flags as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le((self.capability_flags >> 16) as u16);

        // Announced scramble length counts its NUL terminator
        buf.put_u8((self.nonce.len() + 1) as u8);
        buf.put_bytes(0, 10);

        buf.put_slice(&self.nonce[NONCE_HEAD..]);
        buf.put_u8(0);
        put_cstr(&mut buf, &self.auth_plugin_name);

        Packet::new(0, buf.freeze())
    }

    /// Parse a backend's greeting
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut c = Cursor::new(payload);

        if c.u8()? != PROTOCOL_VERSION {
            return None;
        }
        let server_version = lossy(c.cstr()?);
        let connection_id = c.u32_le()?;

        let mut nonce = [0u8; NONCE_HEAD + NONCE_TAIL];
        nonce[..NONCE_HEAD].copy_from_slice(c.take(NONCE_HEAD)?);
        c.take(1)?; // filler

        let caps_low = u32::from(c.u16_le()?);
        let character_set = c.u8()?;
        let status_flags = c.u16_le()?;
        let caps_high = u32::from(c.u16_le()?);
        let capability_flags = caps_high << 16 | caps_low;

        let scramble_len = c.u8()? as usize;
        c.take(10)?; // reserved

        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            // The tail piece occupies at least 13 bytes on the wire but
            // only the leading non-NUL bytes belong to the scramble
            let tail = c.take(scramble_len.saturating_sub(NONCE_HEAD).max(NONCE_TAIL + 1))?;
            let used = tail
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(tail.len())
                .min(NONCE_TAIL);
            nonce[NONCE_HEAD..NONCE_HEAD + used].copy_from_slice(&tail[..used]);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !c.is_empty() {
            lossy(c.cstr_or_rest())
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_name,
            nonce,
        })
    }
}

/// The client's answer to a greeting: sent by hermes to backends,
/// received from clients
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut c = Cursor::new(payload);

        let capability_flags = c.u32_le()?;
        let max_packet_size = c.u32_le()?;
        let character_set = c.u8()?;
        c.take(23)?; // zero filler
        let username = lossy(c.cstr()?);

        // Auth data is length-prefixed under either modern auth flag and
        // NUL-terminated in the ancient layout
        let auth_response = if capability_flags
            & (CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA | CLIENT_SECURE_CONNECTION)
            != 0
        {
            let len = c.u8()? as usize;
            c.take(len)?.to_vec()
        } else {
            c.cstr_or_rest().to_vec()
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !c.is_empty() {
            Some(lossy(c.cstr_or_rest())).filter(|db| !db.is_empty())
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !c.is_empty() {
            lossy(c.cstr_or_rest())
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(64 + self.username.len());

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.put_bytes(0, 23);
        put_cstr(&mut buf, &self.username);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.put_slice(&self.auth_response);
        } else {
            buf.put_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            put_cstr(&mut buf, self.database.as_deref().unwrap_or(""));
        }
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            put_cstr(&mut buf, &self.auth_plugin_name);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// mysql_native_password scramble:
/// `SHA1(password) XOR SHA1(nonce . SHA1(SHA1(password)))`.
/// An empty password answers with an empty proof.
pub fn scramble_password(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    fn sha1(parts: &[&[u8]]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    let pw_hash = sha1(&[password.as_bytes()]);
    let salted = sha1(&[nonce, &sha1(&[&pw_hash])]);

    pw_hash.iter().zip(salted).map(|(a, b)| a ^ b).collect()
}

/// OK packet, synthesized when hermes answers a command itself
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: status_flags::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(0x00);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }
        Packet::new(sequence_id, buf.freeze())
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// ERR packet, synthesized for routing failures and parsed off broken
/// backend replies
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::with_capacity(16 + self.error_message.len());
        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.put_slice(self.sql_state.as_bytes());
        }
        buf.put_slice(self.error_message.as_bytes());
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        let mut c = Cursor::new(payload);
        if c.u8()? != 0xFF {
            return None;
        }
        let error_code = c.u16_le()?;

        // A '#' marker introduces the five-byte SQL state under 4.1
        let mut sql_state = "HY000".to_string();
        if capabilities & CLIENT_PROTOCOL_41 != 0 && c.peek() == Some(b'#') {
            c.take(1)?;
            if let Some(state) = c.take(5) {
                sql_state = lossy(state);
            }
        }

        Some(Self {
            error_code,
            sql_state,
            error_message: lossy(c.rest()),
        })
    }
}

/// An OK response starts with a zero header byte
pub fn is_ok_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0x00)
}

/// An ERR response starts with 0xFF
pub fn is_err_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0xFF)
}

/// Check if packet is an EOF packet. A 0xFE header is only an EOF when
/// the payload is short; longer 0xFE payloads are rows. Hermes never
/// negotiates DEPRECATE_EOF, so no capability check is needed.
pub fn is_eof_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < 9
}

/// Check if packet is the LOCAL INFILE file-request marker
pub fn is_local_infile_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0xFB)
}

/// Status flags of an OK payload: header byte, two length-encoded
/// integers, then the status word
pub fn ok_status_flags(payload: &[u8]) -> u16 {
    let mut c = Cursor::new(payload);
    if c.take(1).is_none() {
        return 0;
    }
    for _ in 0..2 {
        let skipped = super::packet::get_lenenc_int(c.rest)
            .and_then(|(_, consumed)| c.take(consumed));
        if skipped.is_none() {
            return 0;
        }
    }
    c.u16_le().unwrap_or(0)
}

/// Status flags of an EOF payload (0xFE, warnings u16, status u16)
pub fn eof_status_flags(payload: &[u8]) -> u16 {
    let mut c = Cursor::new(payload);
    match c.take(3) {
        Some(_) => c.u16_le().unwrap_or(0),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_roundtrip() {
        let greeting = InitialHandshake::new(42);
        let packet = greeting.encode();
        let parsed = InitialHandshake::parse(&packet.payload).unwrap();

        assert_eq!(parsed.connection_id, 42);
        assert_eq!(parsed.server_version, SERVER_VERSION);
        assert_eq!(parsed.capability_flags, DEFAULT_CAPABILITIES);
        // The nonce survives the split into its two wire pieces
        assert_eq!(parsed.nonce(), greeting.nonce());
    }

    #[test]
    fn test_greeting_rejects_unknown_protocol() {
        let packet = InitialHandshake::new(1).encode();
        let mut payload = packet.payload.to_vec();
        payload[0] = 9;
        assert!(InitialHandshake::parse(&payload).is_none());
    }

    #[test]
    fn test_truncated_greeting_rejected() {
        let packet = InitialHandshake::new(1).encode();
        for cut in [0, 5, 20, 40] {
            assert!(InitialHandshake::parse(&packet.payload[..cut]).is_none());
        }
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        let response = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: UTF8_GENERAL_CI,
            username: "app".to_string(),
            auth_response: vec![1, 2, 3],
            database: Some("test".to_string()),
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        };
        let packet = response.encode(1);
        let parsed = HandshakeResponse::parse(&packet.payload).unwrap();

        assert_eq!(parsed.username, "app");
        assert_eq!(parsed.database.as_deref(), Some("test"));
        assert_eq!(parsed.auth_response, vec![1, 2, 3]);
        assert_eq!(parsed.auth_plugin_name, NATIVE_PASSWORD_PLUGIN);
    }

    #[test]
    fn test_response_without_database_field() {
        let response = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES,
            max_packet_size: 1024,
            character_set: UTF8_GENERAL_CI,
            username: "app".to_string(),
            auth_response: Vec::new(),
            database: None,
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        };
        let packet = response.encode(1);
        let parsed = HandshakeResponse::parse(&packet.payload).unwrap();
        assert_eq!(parsed.database, None);
    }

    #[test]
    fn test_scramble_length_and_empty_password() {
        assert!(scramble_password("", &[0u8; 20]).is_empty());

        let proof = scramble_password("secret", &[7u8; 20]);
        assert_eq!(proof.len(), 20);
        // A different nonce must change the proof
        assert_ne!(proof, scramble_password("secret", &[8u8; 20]));
    }

    #[test]
    fn test_err_packet_roundtrip() {
        let err = ErrPacket::new(1064, "42000", "syntax error");
        let packet = err.encode(1, CLIENT_PROTOCOL_41);
        assert!(is_err_packet(&packet.payload));

        let parsed = ErrPacket::parse(&packet.payload, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(parsed.error_code, 1064);
        assert_eq!(parsed.sql_state, "42000");
        assert_eq!(parsed.error_message, "syntax error");
    }

    #[test]
    fn test_ok_status_flags() {
        let mut ok = OkPacket::new();
        ok.status_flags = status_flags::SERVER_MORE_RESULTS_EXISTS;
        let packet = ok.encode(1, CLIENT_PROTOCOL_41);
        assert!(is_ok_packet(&packet.payload));
        assert_eq!(
            ok_status_flags(&packet.payload),
            status_flags::SERVER_MORE_RESULTS_EXISTS
        );
    }

    #[test]
    fn test_eof_detection() {
        let eof = Bytes::from_static(&[0xFE, 0x00, 0x00, 0x02, 0x00]);
        assert!(is_eof_packet(&eof));
        assert_eq!(eof_status_flags(&eof), 2);

        // 9+ byte 0xFE payload is a row, not EOF
        let row = Bytes::from_static(&[0xFE, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(!is_eof_packet(&row));
    }
}
