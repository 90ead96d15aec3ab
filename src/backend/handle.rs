use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use super::ServerInfo;
use crate::protocol::{
    capabilities, is_err_packet, is_ok_packet, scramble_password, Command, ErrPacket,
    HandshakeResponse, InitialHandshake, Packet, PacketCodec, ReplyState, ReplyTracker,
};

/// One session's physical connection to one backend server.
///
/// The owning router session is the sole accessor; at most one query is
/// active on a handle at any time.
pub struct BackendHandle {
    server: Arc<ServerInfo>,
    framed: Framed<TcpStream, PacketCodec>,
    reply: ReplyTracker,
    closed: bool,
    fatal_failure: bool,
    /// Highest session-command position replayed on this backend
    sescmd_cursor: u64,
    /// Header byte of the first packet of the current reply
    reply_first_byte: Option<u8>,
    last_used: Instant,
}

impl BackendHandle {
    /// Connect and authenticate against a backend server
    pub async fn connect(
        server: Arc<ServerInfo>,
        user: &str,
        password: &str,
        database: Option<&str>,
    ) -> Result<Self, ConnectionError> {
        let addr = server.addr();
        debug!(backend = %server.name, addr = %addr, "Connecting to backend");

        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            server.set_up(false);
            error!(backend = %server.name, error = %e, "Failed to connect to backend");
            ConnectionError::Connect(e.to_string())
        })?;

        let mut framed = Framed::new(stream, PacketCodec);

        let handshake_packet = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let backend_handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| ConnectionError::Protocol("Invalid backend handshake".into()))?;

        let auth_response = scramble_password(password, backend_handshake.nonce());

        let mut caps = capabilities::DEFAULT_CAPABILITIES & backend_handshake.capability_flags;
        if database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: user.to_string(),
            auth_response,
            database: database.map(str::to_string),
            auth_plugin_name: backend_handshake.auth_plugin_name.clone(),
        };

        framed
            .send(response.encode(1))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let reply = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload, caps)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            error!(
                backend = %server.name,
                error_code = err.error_code,
                error_message = %err.error_message,
                "Backend authentication failed"
            );
            return Err(ConnectionError::Auth(err.error_message));
        }

        if !is_ok_packet(&reply.payload) {
            return Err(ConnectionError::Protocol(
                "Expected OK packet from backend".into(),
            ));
        }

        server.set_up(true);
        server.connection_opened();

        Ok(Self {
            server,
            framed,
            reply: ReplyTracker::new(),
            closed: false,
            fatal_failure: false,
            sescmd_cursor: 0,
            reply_first_byte: None,
            last_used: Instant::now(),
        })
    }

    pub fn server(&self) -> &Arc<ServerInfo> {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_failed(&self) -> bool {
        self.fatal_failure
    }

    /// Usable for new work: open, not failed, previous reply fully received
    pub fn is_usable(&self) -> bool {
        !self.closed && !self.fatal_failure && self.reply.is_done()
    }

    /// A query is outstanding on this handle
    pub fn is_waiting_result(&self) -> bool {
        !self.closed && !self.reply.is_done()
    }

    pub fn reply_state(&self) -> ReplyState {
        self.reply.state()
    }

    pub fn sescmd_cursor(&self) -> u64 {
        self.sescmd_cursor
    }

    pub fn set_sescmd_cursor(&mut self, position: u64) {
        self.sescmd_cursor = position;
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }

    /// Mark this backend unusable after a protocol or consistency failure
    pub fn set_fatal_failure(&mut self) {
        self.fatal_failure = true;
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if !self.reply.is_done() {
            self.server.operation_finished();
        }
        self.closed = true;
        self.server.connection_closed();
    }

    /// Dispatch a command packet and arm the reply tracker for the kind of
    /// reply the command produces
    pub async fn send_command(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        debug_assert!(self.reply.is_done(), "query already active on backend");
        self.last_used = Instant::now();
        match packet.command_byte().map(Command::from_byte) {
            Some(Command::StmtPrepare) => self.reply.start_prepare(),
            Some(Command::FieldList) => self.reply.start_field_list(),
            Some(Command::Statistics) | Some(Command::Debug) => {
                self.reply.start_single_packet()
            }
            _ => self.reply.start_query(),
        }
        self.reply_first_byte = None;
        self.server.operation_started();
        if let Err(e) = self.framed.send(packet).await {
            self.mark_broken();
            return Err(ConnectionError::Io(e.to_string()));
        }
        Ok(())
    }

    /// Forward one raw packet without expecting a reply (LOAD DATA stream)
    pub async fn send_raw(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        self.last_used = Instant::now();
        if let Err(e) = self.framed.send(packet).await {
            self.mark_broken();
            return Err(ConnectionError::Io(e.to_string()));
        }
        Ok(())
    }

    /// Arm the tracker for a reply without sending (LOAD DATA terminator)
    pub fn expect_reply(&mut self) {
        self.reply.start_query();
        self.reply_first_byte = None;
        self.server.operation_started();
    }

    /// Header byte of the first packet of the current/last reply
    pub fn reply_first_byte(&self) -> Option<u8> {
        self.reply_first_byte
    }

    /// Receive one reply packet
    pub async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => {
                self.mark_broken();
                Err(ConnectionError::Io(e.to_string()))
            }
            None => {
                self.mark_broken();
                Err(ConnectionError::Disconnected)
            }
        }
    }

    /// Advance the reply-state machine with one received packet.
    ///
    /// Returns the new state; on the transition to `Done` the server's
    /// current-operations counter is decremented.
    pub fn process_reply(&mut self, packet: &Packet) -> ReplyState {
        let was_waiting = !self.reply.is_done();
        let previous = self.reply.state();
        if self.reply_first_byte.is_none() {
            self.reply_first_byte = packet.command_byte();
        }
        let state = self.reply.process(&packet.payload);
        if state != previous {
            debug!(
                backend = %self.server.name,
                from = previous.as_str(),
                to = state.as_str(),
                "Reply state change"
            );
        }
        if was_waiting && state == ReplyState::Done {
            self.server.operation_finished();
        }
        state
    }

    /// Read packets until the current reply completes, discarding them.
    ///
    /// Used for session-command replies on non-reference backends and for
    /// replay on a freshly attached backend. Returns the header byte of the
    /// first packet of the reply.
    pub async fn drain_reply(&mut self) -> Result<u8, ConnectionError> {
        let mut first_byte = None;
        while self.is_waiting_result() {
            let packet = self.recv().await?;
            if first_byte.is_none() {
                first_byte = packet.command_byte();
            }
            self.process_reply(&packet);
        }
        first_byte.ok_or(ConnectionError::Disconnected)
    }

    fn mark_broken(&mut self) {
        if self.closed {
            return;
        }
        if !self.reply.is_done() {
            self.server.operation_finished();
        }
        self.closed = true;
        self.server.set_up(false);
        self.server.connection_closed();
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Backend connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection disconnected")]
    Disconnected,
}
