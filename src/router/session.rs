//! The per-client router session.
//!
//! One tokio task owns one `RouterSession` together with every backend
//! connection it opens, so all session state is single-writer by
//! construction. The session terminates the client side of the MySQL
//! protocol, classifies each statement, routes it to one backend or
//! broadcasts it to all of them, and merges the replies back into the one
//! stream the client sees.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::admin::{SessionInfo, SessionRegistration, SessionRegistry};
use crate::backend::{BackendHandle, ConnectionError, ServerInfo};
use crate::classify::{Classification, ClassifyContext, LoadDataState, QueryClassifier, RouteTarget};
use crate::config::{MasterFailureMode, RouterConfig, SqlVariablesIn};
use crate::masking::{MaskPlan, MaskingRules};
use crate::metrics::metrics;
use crate::protocol::{
    is_local_infile_packet, Command, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket,
    Packet, PacketCodec, ReplyState,
};
use crate::sescmd::SessionCommandLog;

use super::selector;

const USERVAR_REJECT_MESSAGE: &str = "SELECT with session data modification is not supported \
     if configuration parameter use_sql_variables_in=all";

/// Everything a session needs from the surrounding service
pub struct SessionContext {
    pub id: u32,
    pub servers: Vec<Arc<ServerInfo>>,
    pub user: String,
    pub password: String,
    pub config: RouterConfig,
    pub masking: Arc<RwLock<Arc<MaskingRules>>>,
    pub registry: Option<Arc<SessionRegistry>>,
    pub client_host: String,
}

/// The single query currently in flight on one backend
struct CurrentQuery {
    packet: Packet,
    can_retry: bool,
    is_write: bool,
}

enum Event {
    Client(Option<Result<Packet, std::io::Error>>),
    Backend {
        idx: usize,
        result: Result<Packet, ConnectionError>,
    },
    KeepaliveTick,
}

pub struct RouterSession {
    id: u32,
    config: RouterConfig,
    servers: Vec<Arc<ServerInfo>>,
    user: String,
    password: String,
    masking: Arc<RwLock<Arc<MaskingRules>>>,
    registry: Option<Arc<SessionRegistry>>,
    registration: Option<SessionRegistration>,
    client_host: String,
    client_user: String,
    client_db: Option<String>,
    client_caps: u32,

    classifier: QueryClassifier,
    backends: Vec<BackendHandle>,
    current_master: Option<usize>,
    /// Sticky routing lock set by strict multi-statement handling
    target_node: Option<usize>,
    in_transaction: bool,
    closed: bool,

    temp_tables: HashSet<String>,
    sescmds: SessionCommandLog,

    load_data_state: LoadDataState,
    load_data_target: Option<usize>,
    load_data_sent: u64,

    expected_responses: usize,
    query_queue: VecDeque<Packet>,
    reference_backend: Option<usize>,
    current_query: Option<CurrentQuery>,
    broadcast_position: Option<u64>,
    broadcast_replies: Vec<(usize, u8)>,
    mask_plan: Option<MaskPlan>,
}

impl RouterSession {
    pub fn new(ctx: SessionContext) -> Self {
        let sescmds = SessionCommandLog::new(
            ctx.config.max_sescmd_history,
            ctx.config.disable_sescmd_history,
        );
        Self {
            id: ctx.id,
            sescmds,
            config: ctx.config,
            servers: ctx.servers,
            user: ctx.user,
            password: ctx.password,
            masking: ctx.masking,
            registry: ctx.registry,
            registration: None,
            client_host: ctx.client_host,
            client_user: String::new(),
            client_db: None,
            client_caps: 0,
            classifier: QueryClassifier::new(),
            backends: Vec::new(),
            current_master: None,
            target_node: None,
            in_transaction: false,
            closed: false,
            temp_tables: HashSet::new(),
            load_data_state: LoadDataState::Inactive,
            load_data_target: None,
            load_data_sent: 0,
            expected_responses: 0,
            query_queue: VecDeque::new(),
            reference_backend: None,
            current_query: None,
            broadcast_position: None,
            broadcast_replies: Vec::new(),
            mask_plan: None,
        }
    }

    /// Run the session over the client connection
    pub async fn run<S>(mut self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut client = Framed::new(stream, PacketCodec);

        metrics().record_session_opened();
        let result = async {
            self.open(&mut client).await?;
            self.command_loop(&mut client).await
        }
        .await;

        self.close();
        metrics().record_session_closed();
        result
    }

    /// Handshake with the client and open the backend connections
    async fn open<C>(&mut self, client: &mut Framed<C, PacketCodec>) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let handshake = InitialHandshake::new(self.id);
        client.send(handshake.encode()).await?;

        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;

        let response = HandshakeResponse::parse(&response_packet.payload)
            .ok_or_else(|| SessionError::Protocol("Invalid handshake response".into()))?;

        self.client_user = response.username.clone();
        self.client_db = response.database.clone();
        self.client_caps = response.capability_flags;

        debug!(
            session_id = self.id,
            username = %self.client_user,
            database = ?self.client_db,
            "Received handshake response"
        );

        if let Err(e) = self.open_backends().await {
            let err = ErrPacket::new(1045, "28000", &e.to_string());
            client.send(err.encode(2, self.client_caps)).await?;
            return Err(e);
        }

        let ok = OkPacket::new();
        client.send(ok.encode(2, self.client_caps)).await?;

        if let Some(registry) = &self.registry {
            self.registration = Some(SessionRegistration::new(
                registry.clone(),
                SessionInfo {
                    id: self.id,
                    user: self.client_user.clone(),
                    remote: self.client_host.clone(),
                    started: std::time::Instant::now(),
                },
            ));
        }

        info!(
            session_id = self.id,
            username = %self.client_user,
            backends = self.backends.len(),
            master = ?self.current_master.map(|i| self.backends[i].server().name.clone()),
            "Session opened"
        );

        Ok(())
    }

    /// Connect the master and up to `max_slave_connections` slaves
    async fn open_backends(&mut self) -> Result<(), SessionError> {
        if let Some(server) = selector::find_master(&self.servers) {
            match BackendHandle::connect(
                server.clone(),
                &self.user,
                &self.password,
                self.client_db.as_deref(),
            )
            .await
            {
                Ok(handle) => {
                    self.backends.push(handle);
                    self.current_master = Some(self.backends.len() - 1);
                }
                Err(e) => {
                    warn!(session_id = self.id, server = %server.name, error = %e,
                        "Could not connect to master");
                }
            }
        }

        if self.current_master.is_none()
            && self.config.master_failure_mode == MasterFailureMode::FailInstantly
        {
            return Err(SessionError::NoMaster);
        }

        let slave_count = self.servers.iter().filter(|s| s.role.is_slave()).count();
        let slave_cap = self.config.max_slave_connections.limit(slave_count);

        let ranked = selector::rank_slaves(
            &self.servers,
            self.config.slave_selection_criteria,
            self.config.max_slave_replication_lag,
        );
        for server in ranked.into_iter().take(slave_cap) {
            match BackendHandle::connect(
                server.clone(),
                &self.user,
                &self.password,
                self.client_db.as_deref(),
            )
            .await
            {
                Ok(handle) => self.backends.push(handle),
                Err(e) => {
                    warn!(session_id = self.id, server = %server.name, error = %e,
                        "Could not connect to slave");
                }
            }
        }

        if self.backends.is_empty() {
            return Err(SessionError::NoUsableBackend);
        }

        Ok(())
    }

    async fn command_loop<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            if self.closed {
                return Ok(());
            }

            // Quiescent point: drain the pending-query queue strictly FIFO
            if self.expected_responses == 0 && self.load_data_state == LoadDataState::Inactive {
                if let Some(packet) = self.query_queue.pop_front() {
                    self.route_query(client, packet).await?;
                    continue;
                }
            }

            match self.next_event(client).await {
                Event::Client(None) => {
                    info!(session_id = self.id, "Client disconnected");
                    return Ok(());
                }
                Event::Client(Some(Err(e))) => return Err(e.into()),
                Event::Client(Some(Ok(packet))) => {
                    self.on_client_packet(client, packet).await?;
                }
                Event::Backend {
                    idx,
                    result: Ok(packet),
                } => {
                    self.client_reply(client, packet, idx).await?;
                }
                Event::Backend {
                    idx,
                    result: Err(e),
                } => {
                    self.handle_error(client, idx, e).await?;
                }
                Event::KeepaliveTick => self.keepalive().await,
            }
        }
    }

    /// Wait for the next client packet or backend reply
    async fn next_event<C>(&mut self, client: &mut Framed<C, PacketCodec>) -> Event
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let has_waiting = self.backends.iter().any(|b| b.is_waiting_result());

        if !has_waiting {
            if self.config.connection_keepalive > 0 {
                let tick = Duration::from_secs(self.config.connection_keepalive);
                tokio::select! {
                    packet = client.next() => Event::Client(packet),
                    _ = tokio::time::sleep(tick) => Event::KeepaliveTick,
                }
            } else {
                Event::Client(client.next().await)
            }
        } else {
            let replies = futures::future::select_all(
                self.backends
                    .iter_mut()
                    .enumerate()
                    .filter(|(_, b)| b.is_waiting_result())
                    .map(|(idx, backend)| Box::pin(async move { (idx, backend.recv().await) })),
            );
            tokio::select! {
                packet = client.next() => Event::Client(packet),
                ((idx, result), _, _) = replies => Event::Backend { idx, result },
            }
        }
    }

    async fn on_client_packet<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.load_data_state == LoadDataState::Active {
            let ctx = ClassifyContext {
                temp_tables: None,
                load_data_state: self.load_data_state,
                in_transaction: self.in_transaction,
            };
            let classification = self.classifier.classify(&packet.payload, &ctx);
            return self
                .forward_load_data(packet, classification.ends_load_data)
                .await;
        }

        if self.expected_responses > 0 || self.load_data_state != LoadDataState::Inactive {
            if packet.command_byte() == Some(Command::Quit.byte()) {
                self.closed = true;
                return Ok(());
            }
            debug!(session_id = self.id, "Queueing query while reply pending");
            self.query_queue.push_back(packet);
            return Ok(());
        }

        self.route_query(client, packet).await
    }

    /// Route one client statement
    async fn route_query<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match packet.command_byte().map(Command::from_byte) {
            Some(Command::Quit) => {
                self.closed = true;
                return Ok(());
            }
            // Answered by the proxy itself
            Some(Command::Ping) => {
                let ok = OkPacket::new();
                client
                    .send(ok.encode(packet.sequence_id.wrapping_add(1), self.client_caps))
                    .await?;
                return Ok(());
            }
            _ => {}
        }

        let ctx = ClassifyContext {
            temp_tables: Some(&self.temp_tables),
            load_data_state: self.load_data_state,
            in_transaction: self.in_transaction,
        };
        let classification = self.classifier.classify(&packet.payload, &ctx);

        // A SELECT that modifies user variables cannot be both broadcast and
        // answered by one backend; with variables on all nodes it is refused.
        if self.config.use_sql_variables_in == SqlVariablesIn::All
            && classification.is_read_only
            && classification.writes_user_variables
        {
            warn!(
                session_id = self.id,
                "The query can't be routed to all backend servers because it includes SELECT and SQL variable modifications which is not supported"
            );
            metrics().record_query_error("classification_reject");
            let err = ErrPacket::new(1064, "42000", USERVAR_REJECT_MESSAGE);
            client
                .send(err.encode(packet.sequence_id.wrapping_add(1), self.client_caps))
                .await?;
            return Ok(());
        }

        if let Some(name) = &classification.creates_temp_table {
            self.temp_tables.insert(name.clone());
        }
        for table in &classification.dropped_tables {
            self.temp_tables.remove(table);
        }

        if classification.starts_transaction {
            self.in_transaction = true;
        }

        // Strict multi-statement handling locks the session to the master
        // until the connection state is reset.
        if classification.is_multi_stmt && self.config.strict_multi_stmt {
            self.target_node = self.current_master;
        }
        if matches!(
            Command::from_byte(classification.command),
            Command::ChangeUser | Command::ResetConnection
        ) {
            self.target_node = None;
        }

        let result = if classification.is_session_modifying && classification.needs_broadcast {
            self.broadcast_sescmd(client, packet, &classification).await
        } else {
            self.route_single(client, packet, &classification).await
        };

        if classification.ends_transaction {
            self.in_transaction = false;
        }

        result
    }

    /// Broadcast a session command to every usable backend
    async fn broadcast_sescmd<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
        classification: &Classification,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // Under history pressure, first drop entries every live backend has
        // already acknowledged; only then does the overflow policy apply.
        if self.config.max_sescmd_history > 0
            && self.sescmds.len() >= self.config.max_sescmd_history
        {
            self.trim_sescmds();
        }

        let position = self.sescmds.add(packet.payload.clone());
        metrics().record_sescmd();

        let mut recipients = Vec::new();
        let mut lost = Vec::new();
        for idx in 0..self.backends.len() {
            if !self.backends[idx].is_usable() {
                continue;
            }
            let copy = Packet::new(packet.sequence_id, packet.payload.clone());
            let sent = if classification.expects_response {
                self.backends[idx].send_command(copy).await
            } else {
                self.backends[idx].send_raw(copy).await
            };
            match sent {
                Ok(()) => {
                    self.backends[idx].set_sescmd_cursor(position);
                    recipients.push(idx);
                }
                Err(e) => {
                    warn!(session_id = self.id, backend = %self.backends[idx].server().name,
                        error = %e, "Broadcast send failed");
                    lost.push(idx);
                }
            }
        }

        for idx in lost {
            if self.note_backend_lost(idx) {
                self.send_error(client, 1, 1105, "HY000", "Session closed: master server failed")
                    .await?;
                self.closed = true;
                return Ok(());
            }
        }

        if recipients.is_empty() {
            metrics().record_query_error("no_backend");
            self.send_error(
                client,
                packet.sequence_id.wrapping_add(1),
                1105,
                "HY000",
                "no eligible backend available",
            )
            .await?;
            return Ok(());
        }

        metrics().record_route("all");

        if classification.expects_response {
            self.expected_responses = recipients.len();
            self.reference_backend = self
                .current_master
                .filter(|m| recipients.contains(m))
                .or(Some(recipients[0]));
            self.broadcast_position = Some(position);
            self.broadcast_replies.clear();
        } else if let Some(entry) = self.sescmds.get_mut(position) {
            // No reply exists on the wire; acknowledge immediately
            entry.mark_reply_received(0x00);
        }

        Ok(())
    }

    /// Route a statement to exactly one backend
    fn route_single<'a, C>(
        &'a mut self,
        client: &'a mut Framed<C, PacketCodec>,
        packet: Packet,
        classification: &'a Classification,
    ) -> futures::future::BoxFuture<'a, Result<(), SessionError>>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        Box::pin(async move {
            let is_write = !classification.is_read_only;

            match self.select_target(classification).await {
                Ok(idx) => {
                    self.dispatch(client, idx, packet, classification).await
                }
                Err(RouteFailure::NoBackend) => {
                    metrics().record_query_error("no_backend");
                    self.send_error(
                        client,
                        packet.sequence_id.wrapping_add(1),
                        1105,
                        "HY000",
                        "no eligible backend available",
                    )
                    .await?;
                    Ok(())
                }
                Err(RouteFailure::MasterLost) => {
                    if self.in_transaction {
                        self.send_error(
                            client,
                            packet.sequence_id.wrapping_add(1),
                            1105,
                            "HY000",
                            "Transaction lost: master server has failed",
                        )
                        .await?;
                        self.closed = true;
                        return Ok(());
                    }
                    metrics().record_query_error("master_lost_write");
                    self.send_error(
                        client,
                        packet.sequence_id.wrapping_add(1),
                        1105,
                        "HY000",
                        "Cannot route statement: no master server available",
                    )
                    .await?;
                    match self.config.master_failure_mode {
                        // The session survives: writes get errors, reads keep
                        // flowing to slaves
                        MasterFailureMode::ErrorOnWrite => {}
                        MasterFailureMode::FailOnWrite if !is_write => {}
                        _ => self.closed = true,
                    }
                    Ok(())
                }
            }
        })
    }

    /// Pick the backend for a single-target statement
    async fn select_target(
        &mut self,
        classification: &Classification,
    ) -> Result<usize, RouteFailure> {
        // The sticky target overrides normal selection while it is usable
        if let Some(target) = self.target_node {
            if self
                .backends
                .get(target)
                .is_some_and(|b| !b.is_closed() && !b.has_failed())
            {
                return Ok(target);
            }
            self.target_node = None;
        }

        let wants_master = self.in_transaction
            || classification.target != Some(RouteTarget::Slave)
            || (classification.reads_user_variables
                && self.config.use_sql_variables_in == SqlVariablesIn::Master);

        if wants_master {
            return match self.current_master {
                Some(m) if !self.backends[m].is_closed() && !self.backends[m].has_failed() => {
                    Ok(m)
                }
                _ => Err(RouteFailure::MasterLost),
            };
        }

        let pick = selector::pick_best(
            self.backends
                .iter()
                .enumerate()
                .filter(|(i, b)| {
                    Some(*i) != self.current_master
                        && b.server().role.is_slave()
                        && !b.is_closed()
                        && !b.has_failed()
                })
                .map(|(i, b)| (i, b.server())),
            self.config.slave_selection_criteria,
            self.config.max_slave_replication_lag,
        );
        if let Ok(idx) = pick {
            return Ok(idx);
        }

        if let Some(idx) = self.attach_slave().await {
            return Ok(idx);
        }

        if self.config.master_accept_reads {
            if let Some(m) = self.current_master {
                if !self.backends[m].is_closed() && !self.backends[m].has_failed() {
                    return Ok(m);
                }
            }
        }

        Err(RouteFailure::NoBackend)
    }

    /// Send the packet to the chosen backend and account for the reply
    async fn dispatch<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        packet: Packet,
        classification: &Classification,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let target_label = if Some(idx) == self.current_master {
            "master"
        } else {
            "slave"
        };

        let copy = Packet::new(packet.sequence_id, packet.payload.clone());
        if let Err(e) = self.backends[idx].send_command(copy).await {
            warn!(session_id = self.id, backend = %self.backends[idx].server().name,
                error = %e, "Dispatch failed");
            metrics().record_backend_failure(&self.backends[idx].server().name);
            if self.note_backend_lost(idx) {
                self.send_error(client, 1, 1105, "HY000", "Session closed: master server failed")
                    .await?;
                self.closed = true;
                return Ok(());
            }
            // Selection may still find another backend for a retryable read
            if classification.is_read_only
                && !self.in_transaction
                && !classification.touches_temp_table
                && self.config.retry_failed_reads
            {
                metrics().record_read_retry();
                return self.route_single(client, packet, classification).await;
            }
            self.send_error(
                client,
                packet.sequence_id.wrapping_add(1),
                1105,
                "HY000",
                "backend server failure",
            )
            .await?;
            return Ok(());
        }

        metrics().record_route(target_label);
        debug!(
            session_id = self.id,
            backend = %self.backends[idx].server().name,
            target = target_label,
            "Statement dispatched"
        );

        self.expected_responses = 1;
        self.reference_backend = Some(idx);
        self.current_query = Some(CurrentQuery {
            packet,
            can_retry: classification.is_read_only
                && !self.in_transaction
                && !classification.touches_temp_table
                && self.config.retry_failed_reads,
            is_write: !classification.is_read_only,
        });

        if classification.starts_load_data {
            self.load_data_state = LoadDataState::Start;
            self.load_data_target = Some(idx);
            self.load_data_sent = 0;
        }

        Ok(())
    }

    /// Feed one backend reply packet through the session
    async fn client_reply<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
        idx: usize,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let previous = self.backends[idx].reply_state();
        let state = self.backends[idx].process_reply(&packet);
        let is_reference = self.reference_backend == Some(idx);

        if self.closed {
            // Client is gone; consume backend traffic without forwarding
            if previous != ReplyState::Done && state == ReplyState::Done {
                self.note_reply_complete(idx);
            }
            return Ok(());
        }

        // LOAD DATA: the reply to the statement is either the file-request
        // marker or an error
        if self.load_data_state == LoadDataState::Start && is_reference {
            if is_local_infile_packet(&packet.payload) {
                self.load_data_state = LoadDataState::Active;
            } else {
                self.load_data_state = LoadDataState::Inactive;
                self.load_data_target = None;
            }
        } else if self.load_data_state == LoadDataState::End
            && is_reference
            && state == ReplyState::Done
        {
            self.load_data_state = LoadDataState::Inactive;
            self.load_data_target = None;
        }

        let packet = if is_reference {
            self.apply_masking(previous, state, packet)
        } else {
            packet
        };

        if is_reference {
            client.send(packet).await?;
        }

        if previous != ReplyState::Done && state == ReplyState::Done {
            self.note_reply_complete(idx);
        }

        // Raw data packets queued while the marker was in flight belong to
        // the load stream, not the query queue
        if self.load_data_state == LoadDataState::Active {
            while let Some(data) = self.query_queue.pop_front() {
                let terminator = data.payload.is_empty();
                self.forward_load_data(data, terminator).await?;
                if self.load_data_state != LoadDataState::Active {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Track result-set structure on the forwarded stream and rewrite rows
    fn apply_masking(&mut self, previous: ReplyState, state: ReplyState, packet: Packet) -> Packet {
        match (previous, state) {
            (ReplyState::Start, ReplyState::RsetColdef) => {
                let rules = self.masking.read().clone();
                self.mask_plan = if rules.is_empty() {
                    None
                } else {
                    Some(MaskPlan::new(rules))
                };
                packet
            }
            (ReplyState::RsetColdef, ReplyState::RsetColdef) => {
                if let Some(plan) = &mut self.mask_plan {
                    plan.add_column(&packet.payload, &self.client_user, &self.client_host);
                }
                packet
            }
            (ReplyState::RsetRows, ReplyState::RsetRows) => {
                match &self.mask_plan {
                    Some(plan) if plan.is_active() => {
                        let mut payload = packet.payload.to_vec();
                        plan.apply(&mut payload);
                        Packet::new(packet.sequence_id, payload)
                    }
                    _ => packet,
                }
            }
            _ => packet,
        }
    }

    /// One backend finished its reply; settle broadcast bookkeeping and
    /// the expected-responses counter
    fn note_reply_complete(&mut self, idx: usize) {
        if self.broadcast_position.is_some() {
            let first = self.backends[idx].reply_first_byte().unwrap_or(0);
            self.broadcast_replies.push((idx, first));
        }

        if self.expected_responses > 0 {
            self.expected_responses -= 1;
        }

        if self.expected_responses == 0 {
            if let Some(position) = self.broadcast_position.take() {
                self.finish_broadcast(position);
            }
            self.reference_backend = None;
            self.current_query = None;
            self.mask_plan = None;
        }
    }

    /// Check broadcast replies against the reference and trim the log
    fn finish_broadcast(&mut self, position: u64) {
        let reference = self.reference_backend;
        let reference_byte = self
            .broadcast_replies
            .iter()
            .find(|(idx, _)| Some(*idx) == reference)
            .map(|(_, byte)| *byte);

        if let Some(byte) = reference_byte {
            if let Some(entry) = self.sescmds.get_mut(position) {
                entry.mark_reply_received(byte);
            }
        }

        if let Some(expected) = reference_byte {
            let divergent: Vec<usize> = self
                .broadcast_replies
                .iter()
                .filter(|(idx, byte)| Some(*idx) != reference && *byte != expected)
                .map(|(idx, _)| *idx)
                .collect();
            for idx in divergent {
                warn!(
                    session_id = self.id,
                    backend = %self.backends[idx].server().name,
                    position,
                    "Session command reply diverges from reference; backend excluded"
                );
                metrics().record_reply_divergence();
                self.backends[idx].set_fatal_failure();
            }
        }

        self.broadcast_replies.clear();
    }

    fn trim_sescmds(&mut self) {
        let min_acked = self
            .backends
            .iter()
            .filter(|b| !b.is_closed() && !b.has_failed())
            .map(|b| b.sescmd_cursor())
            .min();
        if let Some(min) = min_acked {
            self.sescmds.trim(min);
        }
    }

    /// Forward one raw LOAD DATA stream packet to the load target
    async fn forward_load_data(
        &mut self,
        packet: Packet,
        terminator: bool,
    ) -> Result<(), SessionError> {
        let Some(target) = self.load_data_target else {
            self.load_data_state = LoadDataState::Inactive;
            return Ok(());
        };

        self.load_data_sent += packet.payload.len() as u64;

        if let Err(e) = self.backends[target].send_raw(packet).await {
            warn!(session_id = self.id, error = %e, "LOAD DATA stream send failed");
            self.load_data_state = LoadDataState::Inactive;
            self.load_data_target = None;
            if self.note_backend_lost(target) {
                self.closed = true;
            }
            return Ok(());
        }

        if terminator {
            debug!(
                session_id = self.id,
                bytes = self.load_data_sent,
                "LOAD DATA stream complete"
            );
            self.load_data_state = LoadDataState::End;
            self.backends[target].expect_reply();
            self.expected_responses = 1;
            self.reference_backend = Some(target);
        }

        Ok(())
    }

    /// React to an asynchronous backend failure
    async fn handle_error<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        error: ConnectionError,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        warn!(
            session_id = self.id,
            backend = %self.backends[idx].server().name,
            error = %error,
            "Backend failure"
        );
        metrics().record_backend_failure(&self.backends[idx].server().name);

        let was_reference = self.reference_backend == Some(idx);
        let in_broadcast = self.broadcast_position.is_some();
        self.backends[idx].close();

        let must_close = self.note_backend_lost(idx);

        if in_broadcast {
            if self.expected_responses > 0 {
                self.expected_responses -= 1;
            }
            if was_reference {
                // Hand the reference role to a recipient that has not
                // delivered any packet yet; its whole reply can still be
                // forwarded to the client.
                let replacement = self
                    .backends
                    .iter()
                    .enumerate()
                    .position(|(i, b)| i != idx && b.is_waiting_result());
                match replacement {
                    Some(new_reference) => self.reference_backend = Some(new_reference),
                    None => {
                        self.send_error(client, 1, 1105, "HY000", "backend server failure")
                            .await?;
                        self.reference_backend = None;
                    }
                }
            }
            if self.expected_responses == 0 {
                if let Some(position) = self.broadcast_position.take() {
                    self.finish_broadcast(position);
                }
                self.reference_backend = None;
            }
            if must_close {
                self.closed = true;
            }
            return Ok(());
        }

        if must_close {
            self.send_error(client, 1, 1105, "HY000", "Session closed: master server failed")
                .await?;
            self.closed = true;
            return Ok(());
        }

        if was_reference {
            self.expected_responses = 0;
            self.reference_backend = None;
            self.mask_plan = None;
            if self.load_data_state != LoadDataState::Inactive {
                self.load_data_state = LoadDataState::Inactive;
                self.load_data_target = None;
            }

            if let Some(query) = self.current_query.take() {
                if query.can_retry {
                    // The client never learns the first attempt failed
                    info!(
                        session_id = self.id,
                        "Re-routing failed read to another backend"
                    );
                    metrics().record_read_retry();
                    let ctx = ClassifyContext {
                        temp_tables: Some(&self.temp_tables),
                        load_data_state: self.load_data_state,
                        in_transaction: self.in_transaction,
                    };
                    let classification = self.classifier.classify(&query.packet.payload, &ctx);
                    return self.route_single(client, query.packet, &classification).await;
                }

                if query.is_write && self.config.master_failure_mode == MasterFailureMode::FailOnWrite
                {
                    self.send_error(
                        client,
                        1,
                        1105,
                        "HY000",
                        "Write failed: master server has failed",
                    )
                    .await?;
                    self.closed = true;
                    return Ok(());
                }

                self.send_error(client, 1, 1105, "HY000", "backend server failure")
                    .await?;
            }
        }

        Ok(())
    }

    /// Update master bookkeeping for a lost backend.
    ///
    /// Returns true when the loss must close the whole session (transaction
    /// in flight, or FAIL_INSTANTLY).
    fn note_backend_lost(&mut self, idx: usize) -> bool {
        if self.target_node == Some(idx) {
            self.target_node = None;
        }

        if self.current_master != Some(idx) {
            return false;
        }

        self.current_master = None;
        warn!(session_id = self.id, "Master server lost");

        if self.in_transaction {
            warn!(session_id = self.id, "Transaction in flight, closing session");
            return true;
        }

        self.config.master_failure_mode == MasterFailureMode::FailInstantly
    }

    /// Connect a new slave mid-session and bring it up to date by replaying
    /// the session-command log in position order
    async fn attach_slave(&mut self) -> Option<usize> {
        if !self.sescmds.can_attach_backends() {
            debug!(
                session_id = self.id,
                "Cannot attach backend: session command history was discarded"
            );
            return None;
        }

        let slave_count = self.servers.iter().filter(|s| s.role.is_slave()).count();
        let cap = self.config.max_slave_connections.limit(slave_count);
        let connected = self
            .backends
            .iter()
            .filter(|b| !b.is_closed() && !b.has_failed() && b.server().role.is_slave())
            .count();
        if connected >= cap {
            return None;
        }

        let connected_addrs: HashSet<String> = self
            .backends
            .iter()
            .filter(|b| !b.is_closed())
            .map(|b| b.server().addr())
            .collect();

        let ranked = selector::rank_slaves(
            &self.servers,
            self.config.slave_selection_criteria,
            self.config.max_slave_replication_lag,
        );

        for server in ranked
            .into_iter()
            .filter(|s| !connected_addrs.contains(&s.addr()))
        {
            match BackendHandle::connect(
                server.clone(),
                &self.user,
                &self.password,
                self.client_db.as_deref(),
            )
            .await
            {
                Ok(mut handle) => {
                    if let Err(e) = self.replay_sescmds(&mut handle).await {
                        warn!(session_id = self.id, server = %server.name, error = %e,
                            "Session command replay failed on new backend");
                        continue;
                    }
                    info!(session_id = self.id, server = %server.name, "Attached new slave");
                    self.backends.push(handle);
                    return Some(self.backends.len() - 1);
                }
                Err(e) => {
                    warn!(session_id = self.id, server = %server.name, error = %e,
                        "Could not attach slave");
                }
            }
        }

        None
    }

    /// Replay the session-command log onto a fresh backend, checking each
    /// reply against the reference reply by position
    async fn replay_sescmds(&mut self, handle: &mut BackendHandle) -> Result<(), ConnectionError> {
        let commands: Vec<_> = self
            .sescmds
            .replay_from(handle.sescmd_cursor())
            .map(|c| (c.position(), c.buffer(), c.command(), c.reference_reply()))
            .collect();

        for (position, buffer, command, reference) in commands {
            let packet = Packet::new(0, buffer);
            let no_reply = matches!(
                Command::from_byte(command),
                Command::StmtClose | Command::StmtSendLongData
            );

            if no_reply {
                handle.send_raw(packet).await?;
            } else {
                handle.send_command(packet).await?;
                let first = handle.drain_reply().await?;
                if let Some(expected) = reference {
                    if expected != first {
                        metrics().record_reply_divergence();
                        return Err(ConnectionError::Protocol(format!(
                            "session command {} reply {:#04x} diverges from reference {:#04x}",
                            position, first, expected
                        )));
                    }
                }
            }
            metrics().record_sescmd_replay();
            handle.set_sescmd_cursor(position);
        }

        Ok(())
    }

    /// Ping backends idle beyond the keepalive threshold
    async fn keepalive(&mut self) {
        if self.config.connection_keepalive == 0 {
            return;
        }
        let threshold = Duration::from_secs(self.config.connection_keepalive);

        for backend in self.backends.iter_mut() {
            if backend.is_usable() && backend.idle_for() >= threshold {
                debug!(backend = %backend.server().name, "Keepalive ping");
                let ping = Packet::new(0, vec![Command::Ping.byte()]);
                if backend.send_command(ping).await.is_ok() {
                    let _ = backend.drain_reply().await;
                }
            }
        }
    }

    async fn send_error<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        sequence_id: u8,
        code: u16,
        state: &str,
        message: &str,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let err = ErrPacket::new(code, state, message);
        client.send(err.encode(sequence_id, self.client_caps)).await?;
        Ok(())
    }

    /// Tear down every backend connection
    fn close(&mut self) {
        self.closed = true;
        for backend in self.backends.iter_mut() {
            backend.close();
        }
        self.registration = None;
        info!(session_id = self.id, "Session closed");
    }
}

enum RouteFailure {
    NoBackend,
    MasterLost,
}


/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("No master server available")]
    NoMaster,

    #[error("No usable backend server")]
    NoUsableBackend,
}
