//! Per-client session engine
//!
//! One task per client connection. The session owns a [`Backend`] handle per
//! configured server, the session command history, the transaction record
//! and the queue of statements waiting for their turn. All entry points run
//! on the session's own task; nothing here is shared across sessions.

mod causal;
mod history;
mod recovery;
mod trx;

pub use causal::CausalPhase;
pub use history::{History, HistoryEntry};
pub use trx::{TrxRecord, EXCLUDED_CHECKSUM};

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Instant;

use bytes::BytesMut;
use futures::{SinkExt, Stream, StreamExt};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, CloseType, ExpectKind};
use crate::config::{CausalReads, ChecksumMode, Config, MasterFailureMode};
use crate::metrics::metrics;
use crate::monitor::{ServerRegistry, ServerSnapshot};
use crate::parser::{types::*, Classifier, RouteInfo};
use crate::protocol::{
    Command, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket, Packet, PacketCodec, Reply,
};
use crate::router::{plan_route, PlanCtx, RouteTarget, RoutingPlan};

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("Transaction replay failed: {0}")]
    ReplayFailed(String),
}

/// Top-level state of the session engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Normal statement routing
    Routing,
    /// A failed transaction is being re-executed
    TrxReplay,
    /// The replay finished, the interrupted statement is being re-run
    TrxReplayInterrupted,
    /// A speculative replica transaction is being rolled back before it
    /// moves to the primary
    OtrxRollback,
}

/// The statement whose response is currently streaming back
pub(crate) struct CurrentQuery {
    packet: Packet,
    type_mask: u32,
    bytes: u64,
    hasher: Sha1,
}

impl CurrentQuery {
    fn new(packet: Packet, type_mask: u32) -> Self {
        Self {
            packet,
            type_mask,
            bytes: 0,
            hasher: Sha1::new(),
        }
    }
}

/// Statement displaced by a replay, together with how much of its result the
/// client has already received
pub(crate) struct InterruptedQuery {
    packet: Packet,
    type_mask: u32,
    /// Bytes of the original response already with the client
    bytes: u64,
    /// Hash of those bytes
    prefix_digest: [u8; 20],
    /// Running state of the re-execution
    replayed_bytes: u64,
    replay_hasher: Sha1,
}

/// A read stashed while its GTID synchronisation runs
struct StashedRead {
    packet: Packet,
    info: RouteInfo,
}

pub(crate) struct PendingRetry {
    pub due: Instant,
    pub packet: Packet,
    pub replayed: bool,
}

enum Event {
    Client(Option<Result<Packet, std::io::Error>>),
    Backend(usize, Option<Result<Packet, std::io::Error>>),
    RetryTimer,
}

pub struct Session {
    pub id: u32,
    config: Arc<Config>,
    registry: Arc<ServerRegistry>,
    classifier: Classifier,

    backends: Vec<Backend>,
    current_master: Option<usize>,
    last_used: Option<usize>,

    client_caps: u32,
    database: Option<String>,

    phase: SessionPhase,
    causal: CausalPhase,
    expected_responses: u32,

    query_queue: VecDeque<Packet>,
    current_query: Option<CurrentQuery>,
    interrupted_query: Option<InterruptedQuery>,
    stashed_read: Option<StashedRead>,
    causal_buf: Vec<Packet>,
    /// Session-level GTID used for causal waits
    gtid: Option<String>,

    trx: TrxRecord,
    /// Snapshot being replayed; statements are popped, checksums stay for
    /// position-aligned comparison
    replayed_trx: TrxRecord,
    /// Pristine copies for replay restarts
    orig_trx: Option<TrxRecord>,
    orig_stmt: Option<recovery::StashedStmt>,
    /// Forward replayed responses (the transaction never produced output
    /// before the failure)
    replay_forward: bool,
    /// A replayed statement's checksum diverged from the recorded one
    replay_mismatch: bool,

    trx_open: bool,
    trx_read_only: bool,
    trx_ending: bool,
    autocommit: bool,
    next_trx_read_only: Option<bool>,
    can_replay_trx: bool,
    num_trx_replays: u64,
    trx_replay_timer: Option<Instant>,

    pending_retries: VecDeque<PendingRetry>,
    canceled_retries: usize,
    retry_start: Option<Instant>,
    /// Start time and primary-ness of the statement in flight, for latency
    /// accounting
    stmt_timer: Option<(Instant, bool)>,

    locked_to_primary: bool,
    in_optimistic_trx: bool,
    has_tmp_tables: bool,
    client_large_active: bool,
    large_target: Option<usize>,

    next_ps_id: u32,
    /// Internal statement id -> type mask of the prepared text
    ps_types: HashMap<u32, u32>,
    /// History sequence of each binary PREPARE, for id installation during
    /// catch-up
    ps_prepare_seq: HashMap<u64, u32>,
    /// SQL -> (internal id, cached response packets) when reuse_ps is on
    ps_cache: HashMap<String, (u32, Vec<Packet>)>,
    /// Binary PREPARE currently in flight: (internal id, sql)
    prepare_inflight: Option<(u32, String)>,
    /// Response packets being collected for the reuse_ps cache
    ps_cache_pending: Vec<Packet>,

    history: History,
    /// (history seq, response hasher) of the session command in flight
    sescmd_inflight: Option<(u64, Sha1)>,
}

impl Session {
    pub fn new(id: u32, config: Arc<Config>, registry: Arc<ServerRegistry>) -> Self {
        let backends = config
            .servers
            .iter()
            .map(|s| Backend::new(s.name.clone(), s.addr()))
            .collect();

        Self {
            id,
            config,
            registry,
            classifier: Classifier::new(),
            backends,
            current_master: None,
            last_used: None,
            client_caps: 0,
            database: None,
            phase: SessionPhase::Routing,
            causal: CausalPhase::None,
            expected_responses: 0,
            query_queue: VecDeque::new(),
            current_query: None,
            interrupted_query: None,
            stashed_read: None,
            causal_buf: Vec::new(),
            gtid: None,
            trx: TrxRecord::new(),
            replayed_trx: TrxRecord::new(),
            orig_trx: None,
            orig_stmt: None,
            replay_forward: false,
            replay_mismatch: false,
            trx_open: false,
            trx_read_only: false,
            trx_ending: false,
            autocommit: true,
            next_trx_read_only: None,
            can_replay_trx: true,
            num_trx_replays: 0,
            trx_replay_timer: None,
            pending_retries: VecDeque::new(),
            canceled_retries: 0,
            retry_start: None,
            stmt_timer: None,
            locked_to_primary: false,
            in_optimistic_trx: false,
            has_tmp_tables: false,
            client_large_active: false,
            large_target: None,
            next_ps_id: 1,
            ps_types: HashMap::new(),
            ps_prepare_seq: HashMap::new(),
            ps_cache: HashMap::new(),
            prepare_inflight: None,
            ps_cache_pending: Vec::new(),
            history: History::new(),
            sescmd_inflight: None,
        }
    }

    /// Run the session over a client stream
    pub async fn run<S>(mut self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(stream, PacketCodec);

        self.handshake(&mut client).await?;
        metrics().record_session_started();

        let result = self.event_loop(&mut client).await;

        self.teardown().await;
        metrics().record_session_closed();
        result
    }

    async fn handshake<C>(&mut self, client: &mut Framed<C, PacketCodec>) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let greeting = InitialHandshake::new(self.id);
        let scramble = greeting.auth_plugin_data();
        client.send(greeting.encode()).await?;

        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;
        let response = HandshakeResponse::parse(&response_packet.payload)
            .ok_or_else(|| SessionError::Protocol("invalid handshake response".into()))?;

        self.client_caps = response.capability_flags;
        self.database = response.database.clone();

        let expected =
            crate::protocol::compute_auth_response(&self.config.proxy.password, &scramble);
        if response.username != self.config.proxy.user || response.auth_response != expected {
            let err = ErrPacket::new(
                1045,
                "28000",
                &format!("Access denied for user '{}'", response.username),
            );
            client.send(err.encode(2, self.client_caps)).await?;
            return Err(SessionError::Protocol("authentication failed".into()));
        }

        // Bring up the primary connection before telling the client it is in
        if let Err(e) = self.ensure_primary_open().await {
            if self.config.service.master_failure_mode == MasterFailureMode::FailInstantly {
                let err = ErrPacket::new(1045, "08S01", &format!("No primary available: {}", e));
                client.send(err.encode(2, self.client_caps)).await?;
                return Err(SessionError::Backend(e));
            }
            warn!(session_id = self.id, error = %e, "Primary not available at connect");
        }

        client
            .send(OkPacket::new().encode(2, self.client_caps))
            .await?;
        info!(session_id = self.id, username = %response.username, "Client authenticated");
        Ok(())
    }

    async fn event_loop<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let retry_due = self.pending_retries.iter().map(|r| r.due).min();

            let event = {
                let backend_fut = next_backend_event(&mut self.backends);
                tokio::select! {
                    maybe = client.next() => Event::Client(maybe),
                    (idx, item) = backend_fut => Event::Backend(idx, item),
                    _ = sleep_until_opt(retry_due), if retry_due.is_some() => Event::RetryTimer,
                }
            };

            match event {
                Event::Client(None) => {
                    info!(session_id = self.id, "Client disconnected");
                    return Ok(());
                }
                Event::Client(Some(Err(e))) => return Err(e.into()),
                Event::Client(Some(Ok(packet))) => {
                    if packet.command() == Command::Quit && !self.client_large_active {
                        info!(session_id = self.id, "Client sent QUIT");
                        return Ok(());
                    }
                    self.route_query(client, packet).await?;
                }
                Event::Backend(idx, Some(Ok(packet))) => {
                    self.on_backend_packet(client, idx, packet).await?;
                }
                Event::Backend(idx, Some(Err(e))) => {
                    self.on_backend_lost(client, idx, &e.to_string()).await?;
                }
                Event::Backend(idx, None) => {
                    self.on_backend_lost(client, idx, "connection closed by server")
                        .await?;
                }
                Event::RetryTimer => {
                    self.fire_due_retries(client).await?;
                }
            }
        }
    }

    /// Client packet entry point
    async fn route_query<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        // Trailing chunks of a multi-packet statement bypass classification
        if self.client_large_active {
            self.client_large_active = packet.is_large();
            let Some(idx) = self.large_target else {
                return Err(SessionError::Protocol(
                    "large statement continuation without a target".into(),
                ));
            };
            return self.send_continuation(idx, packet).await;
        }

        if self.phase != SessionPhase::Routing
            || self.causal != CausalPhase::None
            || !self.pending_retries.is_empty()
            || !self.query_queue.is_empty()
        {
            debug!(
                session_id = self.id,
                phase = ?self.phase,
                queued = self.query_queue.len(),
                "Busy, queueing statement"
            );
            self.query_queue.push_back(packet);
            return Ok(());
        }

        self.dispatch(client, packet, false).await
    }

    /// Classify, plan and route one statement. `replayed` statements bypass
    /// the queue gating.
    pub(crate) async fn dispatch<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
        replayed: bool,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let info = self.classifier.classify(&packet, &self.ps_types);

        // COM_STMT_CLOSE produces no response and is fire-and-forget
        if packet.command() == Command::StmtClose {
            return self.route_stmt_close(packet, &info).await;
        }

        if self.config.service.strict_multi_stmt && info.multi_statement
            || self.config.service.strict_sp_calls && info.type_mask & TYPE_CALL != 0
        {
            if !self.locked_to_primary {
                info!(
                    session_id = self.id,
                    "Multi-statement or stored procedure, locking session to primary"
                );
            }
            self.locked_to_primary = true;
        }
        if info.type_mask & TYPE_CREATE_TMP_TABLE != 0 {
            self.has_tmp_tables = true;
        }

        let saved = self.trx_state_snapshot();
        self.update_trx_state(&info);

        let plan = self.plan_for(&info);

        if plan.gtid_probe && !replayed {
            // Defer the read, probe the primary first; the statement is
            // reclassified from scratch on the next round
            self.restore_trx_state(saved);
            self.query_queue.push_front(packet);
            return self.start_gtid_probe(client).await;
        }

        self.route_stmt(client, packet, info, plan, replayed).await
    }

    fn plan_for(&self, info: &RouteInfo) -> RoutingPlan {
        let server_stmts: HashMap<String, u64> = self
            .backends
            .iter()
            .map(|b| (b.name().to_string(), b.stmt_count))
            .collect();

        let ctx = PlanCtx {
            info,
            trx_open: self.trx_open,
            trx_read_only: self.trx_read_only,
            trx_target: self.trx.target(),
            optimistic: self.in_optimistic_trx,
            locked_to_primary: self.locked_to_primary,
            last_used: self.last_used.map(|i| self.backends[i].name()),
            causal_idle: self.causal == CausalPhase::None,
            server_stmts: &server_stmts,
        };

        plan_route(&ctx, &self.usable_snapshot(), &self.config.service)
    }

    /// Registry snapshot minus servers whose backend is closed for good
    fn usable_snapshot(&self) -> Vec<ServerSnapshot> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|s| {
                self.backend_index(&s.name)
                    .map(|i| self.backends[i].can_connect())
                    .unwrap_or(false)
            })
            .collect()
    }

    async fn route_stmt<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
        info: RouteInfo,
        plan: RoutingPlan,
        replayed: bool,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if self.expected_responses > 0 && !replayed {
            self.query_queue.push_back(packet);
            return Ok(());
        }

        // A write arriving inside a speculative replica transaction forces
        // the transaction back onto the primary
        if self.in_optimistic_trx && plan.target == RouteTarget::Primary && !info.ends_trx() {
            return self.start_otrx_rollback(packet, &info).await;
        }

        // Session commands keep their own fan-out path regardless of the
        // planner's scope decision
        if info.is_session_command() && !info.is_write() {
            let primary_only = plan.target == RouteTarget::Primary;
            return self
                .route_session_command(client, packet, info, primary_only)
                .await;
        }

        match plan.target {
            RouteTarget::All => {
                self.route_session_command(client, packet, info, false).await
            }
            RouteTarget::Primary => {
                let Some(idx) = self.resolve_primary(&plan).await else {
                    return self.no_target_available(client, packet, &info, replayed).await;
                };
                self.current_master = Some(idx);
                self.send_user_stmt(client, idx, packet, &info).await
            }
            RouteTarget::Replica => {
                let idx = match plan.server.as_deref().and_then(|n| self.backend_index(n)) {
                    Some(idx) => idx,
                    None => {
                        return self.no_target_available(client, packet, &info, replayed).await
                    }
                };
                if let Err(e) = self.ensure_open(idx).await {
                    warn!(session_id = self.id, backend = %self.backends[idx].name(), error = %e, "Replica connect failed");
                    return self.no_target_available(client, packet, &info, replayed).await;
                }

                if plan.causal_read {
                    if let Some(gtid) = self.wait_gtid_for_read() {
                        return self.start_causal_wait(idx, packet, info, &gtid).await;
                    }
                }

                self.send_user_stmt(client, idx, packet, &info).await
            }
        }
    }

    /// Send one client statement to a backend and start expecting its reply
    async fn send_user_stmt<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        packet: Packet,
        info: &RouteInfo,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = self.ensure_open(idx).await {
            warn!(session_id = self.id, backend = %self.backends[idx].name(), error = %e, "Backend connect failed");
            return self.no_target_available(client, packet, info, false).await;
        }

        self.large_target = Some(idx);
        self.client_large_active = packet.is_large();

        self.current_query = Some(CurrentQuery::new(packet.clone(), info.type_mask));

        // Multi-packet statements cannot be re-sent; a transaction carrying
        // one loses its replay eligibility
        if packet.is_large() {
            if self.trx_open {
                self.can_replay_trx = false;
            }
            self.current_query = None;
        }

        if self.trx_open && self.trx.target().is_none() {
            let name = self.backends[idx].name().to_string();
            self.trx.set_target(&name);
        }

        let send_result = self.backends[idx].send(packet.clone(), ExpectKind::Client).await;
        if let Err(e) = send_result {
            warn!(session_id = self.id, backend = %self.backends[idx].name(), error = %e, "Write to backend failed");
            self.current_query = None;
            return self.handle_send_failure(client, idx, packet, info).await;
        }

        self.expected_responses += 1;
        self.last_used = Some(idx);
        self.retry_start = None;

        let on_primary = Some(idx) == self.current_master;
        self.stmt_timer = Some((Instant::now(), on_primary));
        metrics().record_route(if on_primary { "primary" } else { "replica" });

        debug!(
            session_id = self.id,
            backend = %self.backends[idx].name(),
            cmd = ?packet.command(),
            expected = self.expected_responses,
            "Statement routed"
        );
        Ok(())
    }

    async fn send_continuation(&mut self, idx: usize, packet: Packet) -> Result<(), SessionError> {
        self.backends[idx]
            .send_continuation(packet)
            .await
            .map_err(|e| SessionError::Backend(e.to_string()))
    }

    /// Session commands run on every connected backend; only one response is
    /// forwarded and its hash becomes the history signature. With
    /// `primary_only`, the command runs on the primary alone but is still
    /// recorded for catch-up of a reconnected primary.
    async fn route_session_command<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
        info: RouteInfo,
        primary_only: bool,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        // Repeat PREPAREs can be answered from the cache
        if self.config.service.reuse_ps && packet.command() == Command::StmtPrepare {
            let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
            if let Some((_, packets)) = self.ps_cache.get(&sql) {
                debug!(session_id = self.id, "Serving prepare from cache");
                for cached in packets.clone() {
                    client.send(cached).await?;
                }
                return Ok(());
            }
        }

        if !self.backends.iter().any(|b| b.is_in_use()) {
            // Nothing connected yet; bring up the primary for this command
            if self.ensure_primary_open().await.is_err() {
                return self.no_target_available(client, packet, &info, false).await;
            }
        }

        let seq = self.history.append(packet.clone());

        if packet.command() == Command::StmtPrepare {
            let internal = self.next_ps_id;
            self.next_ps_id += 1;
            let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
            let mut prepared_info = RouteInfo::default();
            self.classifier.classify_sql(&sql, &mut prepared_info);
            self.ps_types.insert(internal, prepared_info.type_mask);
            self.ps_prepare_seq.insert(seq, internal);
            self.prepare_inflight = Some((internal, sql));
            self.ps_cache_pending.clear();
        }

        // The backend whose response the client sees: the transaction
        // target, else the primary, else the first connected backend
        let forward_idx = self
            .trx
            .target()
            .and_then(|n| self.backend_index(n))
            .filter(|&i| self.backends[i].is_in_use())
            .or(self
                .current_master
                .filter(|&i| self.backends[i].is_in_use()))
            .or_else(|| self.backends.iter().position(|b| b.is_in_use()));

        let Some(forward_idx) = forward_idx else {
            return self.no_target_available(client, packet, &info, false).await;
        };

        let mut sent = 0usize;
        for idx in 0..self.backends.len() {
            if !self.backends[idx].is_in_use() {
                continue;
            }
            if primary_only && Some(idx) != self.current_master && idx != forward_idx {
                continue;
            }
            // Secondary backends use the history expectation so that a
            // PREPARE response still installs their statement handle
            let kind = if idx == forward_idx {
                ExpectKind::Client
            } else {
                ExpectKind::History { seq }
            };
            if let Err(e) = self.backends[idx].send(packet.clone(), kind).await {
                warn!(
                    session_id = self.id,
                    backend = %self.backends[idx].name(),
                    error = %e,
                    "Session command write failed"
                );
                if idx == forward_idx {
                    return self.handle_send_failure(client, idx, packet, &info).await;
                }
            } else {
                self.backends[idx].history_cursor = seq + 1;
                sent += 1;
            }
        }

        if sent == 0 {
            return self.no_target_available(client, packet, &info, false).await;
        }

        self.expected_responses += 1;
        self.sescmd_inflight = Some((seq, Sha1::new()));
        self.last_used = Some(forward_idx);
        debug!(
            session_id = self.id,
            seq = seq,
            backends = sent,
            "Session command routed"
        );
        Ok(())
    }

    /// COM_STMT_CLOSE: no response; propagate to every backend and record it
    async fn route_stmt_close(&mut self, packet: Packet, info: &RouteInfo) -> Result<(), SessionError> {
        let seq = self.history.append(packet.clone());
        if let Some(id) = info.stmt_id {
            self.ps_types.remove(&id);
        }
        for idx in 0..self.backends.len() {
            if self.backends[idx].is_in_use()
                && self.backends[idx]
                    .send(packet.clone(), ExpectKind::Discard)
                    .await
                    .is_ok()
            {
                self.backends[idx].history_cursor = seq + 1;
            }
        }
        Ok(())
    }

    /// Start the probe that resolves the primary's GTID position
    async fn start_gtid_probe<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(idx) = self.resolve_primary_simple().await else {
            // No primary to probe; run the read unsynchronised
            if let Some(packet) = self.query_queue.pop_front() {
                let info = self.classifier.classify(&packet, &self.ps_types);
                let plan = self.plan_for(&info);
                self.update_trx_state(&info);
                return self.route_stmt(client, packet, info, plan, true).await;
            }
            return Ok(());
        };

        self.causal_buf.clear();
        self.causal = CausalPhase::ReadingGtid;
        self.backends[idx]
            .send(causal::gtid_probe_packet(), ExpectKind::GtidProbe)
            .await
            .map_err(|e| SessionError::Backend(e.to_string()))?;
        debug!(session_id = self.id, "GTID probe sent to primary");
        Ok(())
    }

    /// Send the wait statement on the replica and stash the read behind it
    async fn start_causal_wait(
        &mut self,
        idx: usize,
        packet: Packet,
        info: RouteInfo,
        gtid: &str,
    ) -> Result<(), SessionError> {
        let wait = causal::gtid_wait_packet(gtid, self.config.service.causal_reads_timeout());
        self.causal_buf.clear();
        self.backends[idx]
            .send(wait, ExpectKind::CausalWait)
            .await
            .map_err(|e| SessionError::Backend(e.to_string()))?;
        self.stashed_read = Some(StashedRead { packet, info });
        if self.causal == CausalPhase::None {
            self.causal = CausalPhase::GtidReadDone;
        }
        debug!(session_id = self.id, backend = %self.backends[idx].name(), gtid = %gtid, "GTID wait sent");
        Ok(())
    }

    /// GTID to synchronise the pending read on, per causal mode
    fn wait_gtid_for_read(&self) -> Option<String> {
        match self.config.service.causal_reads {
            CausalReads::None => None,
            CausalReads::Local => self.gtid.clone(),
            CausalReads::Universal => {
                if self.causal == CausalPhase::GtidReadDone {
                    self.gtid.clone()
                } else {
                    None
                }
            }
            CausalReads::FastUniversal => self.registry.primary_gtid().or_else(|| self.gtid.clone()),
        }
    }

    /// Roll the speculative replica transaction back; replay starts when the
    /// ROLLBACK is acknowledged
    async fn start_otrx_rollback(
        &mut self,
        packet: Packet,
        info: &RouteInfo,
    ) -> Result<(), SessionError> {
        let Some(idx) = self.trx.target().and_then(|n| self.backend_index(n)) else {
            return Err(SessionError::Protocol(
                "optimistic transaction without a target".into(),
            ));
        };

        info!(
            session_id = self.id,
            backend = %self.backends[idx].name(),
            "Write in speculative transaction, rolling back on replica"
        );

        self.phase = SessionPhase::OtrxRollback;
        self.in_optimistic_trx = false;
        self.current_query = Some(CurrentQuery::new(packet, info.type_mask));
        self.backends[idx]
            .send(Packet::query("ROLLBACK"), ExpectKind::Discard)
            .await
            .map_err(|e| SessionError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Backend packet entry point
    async fn on_backend_packet<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let processed = self.backends[idx].process_reply(&packet);

        let reply = match processed {
            Ok(reply) => reply,
            Err(BackendError::HistoryMismatch) => {
                warn!(
                    session_id = self.id,
                    backend = %self.backends[idx].name(),
                    "Session command replay diverged, discarding backend"
                );
                self.backends[idx].close(
                    CloseType::Fatal,
                    "session command response mismatch during catch-up",
                );
                return self.on_backend_lost(client, idx, "history mismatch").await;
            }
            Err(BackendError::UnexpectedResponse) => {
                let name = self.backends[idx].name().to_string();
                self.backends[idx]
                    .close(CloseType::Fatal, "response received while idle");
                return Err(SessionError::Protocol(format!(
                    "unexpected response from '{}'",
                    name
                )));
            }
            Err(e) => return Err(SessionError::Backend(e.to_string())),
        };

        match reply.kind {
            ExpectKind::History { seq } => {
                if reply.complete {
                    self.on_history_replayed(idx, seq, &reply.reply);
                }
                Ok(())
            }
            ExpectKind::Discard => {
                if reply.complete {
                    self.on_discard_complete(idx, &reply.reply)?;
                }
                Ok(())
            }
            ExpectKind::GtidProbe => {
                self.causal_buf.push(packet);
                if reply.complete {
                    self.on_gtid_probe_done(client, &reply.reply).await?;
                }
                Ok(())
            }
            ExpectKind::CausalWait => {
                self.causal_buf.push(packet);
                if reply.complete {
                    self.on_causal_wait_done(client, idx, &reply.reply).await?;
                }
                Ok(())
            }
            ExpectKind::Client => {
                self.on_client_reply(client, idx, packet, reply.reply, reply.complete)
                    .await
            }
        }
    }

    fn on_history_replayed(&mut self, idx: usize, seq: u64, reply: &Reply) {
        // Catch-up PREPAREs install this backend's statement handle
        if reply.command == Command::StmtPrepare && reply.is_ok() {
            if let Some(&internal) = self.ps_prepare_seq.get(&seq) {
                self.backends[idx].add_ps_handle(internal, reply.generated_id);
            }
        }
    }

    fn on_discard_complete(&mut self, _idx: usize, reply: &Reply) -> Result<(), SessionError> {
        if self.phase == SessionPhase::OtrxRollback {
            // The ROLLBACK of the speculative transaction answered
            if reply.is_ok() {
                self.phase = SessionPhase::Routing;
                if !self.start_trx_replay() {
                    return Err(SessionError::ReplayFailed(
                        "could not move speculative transaction to the primary".into(),
                    ));
                }
            } else {
                return Err(SessionError::Backend(
                    "rollback of speculative transaction failed".into(),
                ));
            }
        }
        Ok(())
    }

    async fn on_gtid_probe_done<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        reply: &Reply,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(err) = &reply.error {
            // Answer the deferred read with the probe failure
            warn!(session_id = self.id, error = %err.message, "GTID probe failed");
            self.causal = CausalPhase::None;
            if self.query_queue.pop_front().is_some() {
                let packet =
                    ErrPacket::new(err.code, &err.sql_state, &err.message).encode(1, self.client_caps);
                client.send(packet).await?;
            }
            self.causal_buf.clear();
            return self.route_stored(client).await;
        }

        let value = causal::extract_scalar(&self.causal_buf).flatten();
        self.causal_buf.clear();
        self.gtid = value;
        self.causal = CausalPhase::GtidReadDone;
        debug!(session_id = self.id, gtid = ?self.gtid, "GTID probe complete");

        if let Some(packet) = self.query_queue.pop_front() {
            self.dispatch(client, packet, true).await?;
        }
        Ok(())
    }

    async fn on_causal_wait_done<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        reply: &Reply,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let value = causal::extract_scalar(&self.causal_buf).flatten();
        self.causal_buf.clear();
        let succeeded = reply.error.is_none() && causal::wait_succeeded(value.as_deref());

        let Some(stashed) = self.stashed_read.take() else {
            self.causal = CausalPhase::None;
            return Ok(());
        };

        if succeeded {
            self.causal = CausalPhase::None;
            return self
                .send_user_stmt(client, idx, stashed.packet, &stashed.info)
                .await;
        }

        match self.config.service.causal_reads {
            CausalReads::Universal => {
                warn!(session_id = self.id, "Causal read timed out on replica");
                metrics().record_causal_timeout();
                self.causal = CausalPhase::None;
                let err = ErrPacket::new(
                    1969,
                    "70100",
                    "Causal read timed out while the replica caught up",
                );
                client.send(err.encode(1, self.client_caps)).await?;
                self.route_stored(client).await
            }
            _ => {
                // Local and fast modes fall back to the primary
                debug!(session_id = self.id, "GTID wait failed, retrying read on primary");
                self.causal = CausalPhase::RetryingOnMaster;
                let Some(primary) = self.resolve_primary_simple().await else {
                    self.causal = CausalPhase::None;
                    return self
                        .no_target_available(client, stashed.packet, &stashed.info, false)
                        .await;
                };
                self.send_user_stmt(client, primary, stashed.packet, &stashed.info)
                    .await
            }
        }
    }

    /// Reply chunk destined for the client
    async fn on_client_reply<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        packet: Packet,
        reply: Reply,
        complete: bool,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        // Server-shutdown errors before any output are swallowed so that the
        // retry logic can run when the hangup arrives
        if let Some(err) = &reply.error {
            if err.is_server_shutdown() && !reply.started {
                let reason = format!("'{}' is shutting down", self.backends[idx].name());
                debug!(session_id = self.id, backend = %self.backends[idx].name(), "Dropping shutdown error");
                self.backends[idx].close(CloseType::Normal, reason.clone());
                return self
                    .handle_backend_failure(client, idx, true, true, &reason)
                    .await;
            }
        }

        if complete {
            if let Some(err) = reply.error.clone() {
                if self.is_ignorable_error(idx, &err)
                    && self.handle_ignorable_error(client, idx, &err).await?
                {
                    return Ok(());
                }
            }
        }

        // Collect prepare responses for the reuse cache
        if self.config.service.reuse_ps
            && reply.command == Command::StmtPrepare
            && self.prepare_inflight.is_some()
        {
            self.ps_cache_pending.push(packet.clone());
        }

        // Session command in flight: hash the forwarded response for the
        // history signature
        if let Some((_, hasher)) = self.sescmd_inflight.as_mut() {
            hasher.update(&packet.payload);
        }

        self.manage_transactions(idx, &packet, &reply, complete);

        let mut forward: Option<Packet> = Some(packet);

        if complete {
            self.expected_responses = self.expected_responses.saturating_sub(1);
            self.note_reply_state(&reply);

            if let Some((started, on_primary)) = self.stmt_timer.take() {
                metrics().record_query(
                    if on_primary { "primary" } else { "replica" },
                    started.elapsed().as_secs_f64(),
                );
            }

            if let Some((seq, hasher)) = self.sescmd_inflight.take() {
                let digest: [u8; 20] = hasher.finalize().into();
                self.history.set_signature(seq, digest);
            }

            if reply.command == Command::StmtPrepare && reply.is_ok() {
                forward = forward.map(|p| self.finish_prepare(idx, &reply, p));
            }
        }

        match self.phase {
            SessionPhase::TrxReplay => {
                // The client already has these results unless the
                // transaction never produced any before the failure
                if !self.replay_forward {
                    forward = None;
                }
                if complete {
                    if self.replay_mismatch {
                        return self.handle_checksum_mismatch(client).await;
                    }
                    if self.expected_responses == 0 {
                        self.continue_trx_replay(client).await?;
                    }
                }
            }
            SessionPhase::TrxReplayInterrupted => {
                let outcome = self.slice_interrupted_chunk(forward.take(), complete);
                if outcome.mismatch {
                    return self.handle_checksum_mismatch(client).await;
                }
                forward = outcome.forward;
                if complete {
                    self.finish_interrupted_replay(client, &reply).await?;
                }
            }
            _ => {}
        }

        if complete
            && matches!(
                self.causal,
                CausalPhase::GtidReadDone | CausalPhase::RetryingOnMaster
            )
        {
            self.causal = CausalPhase::None;
        }

        if complete && self.trx_open && self.trx_ending && self.expected_responses == 0 {
            self.finish_transaction();
        }

        if let Some(packet) = forward {
            client.send(packet).await?;
        }

        if complete && self.expected_responses == 0 && self.phase == SessionPhase::Routing {
            self.route_stored(client).await?;
            if !self.trx_open {
                self.close_stale_connections();
            }
        }

        Ok(())
    }

    /// Track transaction contents and the current query's byte stream
    fn manage_transactions(&mut self, idx: usize, packet: &Packet, reply: &Reply, complete: bool) {
        let recording = (self.config.service.transaction_replay
            || self.config.service.optimistic_trx)
            && self.can_replay_trx
            && self.trx_open
            && self.causal != CausalPhase::ReadingGtid
            && self.causal != CausalPhase::GtidReadDone;

        if self.phase == SessionPhase::TrxReplayInterrupted {
            // Byte accounting happens in the slicing path
            return;
        }

        if recording {
            if let Some(cq) = self.current_query.as_mut() {
                cq.hasher.update(&packet.payload);
                cq.bytes += packet.payload.len() as u64;

                if complete {
                    let size = self.trx.size() + cq.packet.payload.len() as u64;
                    if size > self.config.service.trx_max_size {
                        info!(
                            session_id = self.id,
                            size = size,
                            "Transaction too large to replay"
                        );
                        self.can_replay_trx = false;
                        metrics().record_trx_too_big();
                        self.current_query = None;
                        return;
                    }

                    let cq = self.current_query.take().expect("current query present");
                    let checksum = if include_in_checksum(
                        self.config.service.transaction_replay_checksum,
                        cq.type_mask,
                        reply,
                    ) {
                        cq.hasher.finalize().into()
                    } else {
                        EXCLUDED_CHECKSUM
                    };
                    let backend = self.backends[idx].name().to_string();
                    self.trx.add_stmt(&backend, cq.packet);
                    self.trx.add_checksum(checksum);

                    if self.phase == SessionPhase::TrxReplay {
                        self.verify_replay_checksum();
                    }
                }
            }
        } else if self.causal == CausalPhase::RetryingOnMaster {
            // The read is being retried on the primary; keep it retryable
        } else if let Some(cq) = self.current_query.as_mut() {
            cq.hasher.update(&packet.payload);
            cq.bytes += packet.payload.len() as u64;
            if reply.started || complete {
                // Output reached the client; the statement can no longer be
                // transparently retried
                self.current_query = None;
            }
        }
    }

    /// Server-side state changes observed in a completed reply
    fn note_reply_state(&mut self, reply: &Reply) {
        const LEVEL: &str = "SERIALIZABLE";
        let serializable = ["transaction_isolation", "tx_isolation", "trx_characteristics"]
            .iter()
            .filter_map(|v| reply.get_variable(v))
            .any(|v| v.to_uppercase().contains(LEVEL));
        if serializable {
            info!(
                session_id = self.id,
                "Isolation level set to SERIALIZABLE, locking session to primary"
            );
            self.locked_to_primary = true;
        } else if ["transaction_isolation", "tx_isolation"]
            .iter()
            .filter_map(|v| reply.get_variable(v))
            .next()
            .is_some()
        {
            // Any other explicit isolation level unlocks routing again
            self.locked_to_primary = false;
        }

        if let Some(gtid) = reply.get_variable("last_gtid") {
            self.gtid = Some(gtid.to_string());
        }
    }

    /// Bookkeeping when a forwarded PREPARE response completes: remap the
    /// statement id to the session-internal one and fill the reuse cache
    fn finish_prepare(&mut self, idx: usize, reply: &Reply, packet: Packet) -> Packet {
        let Some((internal, sql)) = self.prepare_inflight.take() else {
            return packet;
        };

        self.backends[idx].add_ps_handle(internal, reply.generated_id);

        // The client sees the session-internal statement id; only the first
        // response packet carries one
        let rewrite = |p: &Packet| -> Packet {
            if p.payload.first() == Some(&0x00) && p.payload.len() >= 5 {
                let mut payload = BytesMut::from(&p.payload[..]);
                payload[1..5].copy_from_slice(&internal.to_le_bytes());
                Packet::new(p.sequence_id, payload.freeze())
            } else {
                p.clone()
            }
        };

        if self.config.service.reuse_ps {
            let cached: Vec<Packet> = self.ps_cache_pending.iter().map(rewrite).collect();
            self.ps_cache.insert(sql, (internal, cached));
            self.ps_cache_pending.clear();
        }

        rewrite(&packet)
    }

    pub(crate) fn finish_transaction(&mut self) {
        debug!(
            session_id = self.id,
            target = ?self.trx.target(),
            size = self.trx.size(),
            "Transaction complete"
        );
        self.trx.close();
        self.trx_open = false;
        self.trx_ending = false;
        self.trx_read_only = false;
        self.in_optimistic_trx = false;
        self.can_replay_trx = true;
        self.next_trx_read_only = None;
    }

    /// Drain queued statements while the engine is free to route
    pub(crate) async fn route_stored<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        while self.phase == SessionPhase::Routing
            && self.expected_responses == 0
            && self.causal == CausalPhase::None
            && self.pending_retries.is_empty()
        {
            let Some(packet) = self.query_queue.pop_front() else {
                return Ok(());
            };
            self.dispatch(client, packet, false).await?;
        }
        Ok(())
    }

    /// Close connections that routing would no longer pick
    fn close_stale_connections(&mut self) {
        let snapshot = self.registry.snapshot();
        let current_rank = self
            .current_master
            .map(|i| self.backends[i].name().to_string())
            .and_then(|n| snapshot.iter().find(|s| s.name == n).map(|s| s.rank))
            .unwrap_or_else(|| snapshot.iter().map(|s| s.rank).max().unwrap_or(0));

        for backend in &mut self.backends {
            if !backend.is_in_use() || backend.is_waiting_result() {
                continue;
            }
            let Some(server) = snapshot.iter().find(|s| s.name == backend.name()) else {
                continue;
            };
            if !server.is_usable() {
                backend.close(CloseType::Normal, "server no longer usable");
            } else if server.rank != current_rank {
                backend.close(CloseType::Normal, "server rank differs from current");
            } else if self.config.service.max_replication_lag_s > 0
                && server
                    .lag_s
                    .is_some_and(|lag| lag > self.config.service.max_replication_lag_s)
            {
                backend.close(CloseType::Normal, "replication lag too high");
            }
        }
    }

    // --- transaction sub-machine -------------------------------------------

    fn trx_state_snapshot(&self) -> (bool, bool, bool, bool, Option<bool>) {
        (
            self.trx_open,
            self.trx_read_only,
            self.trx_ending,
            self.autocommit,
            self.next_trx_read_only,
        )
    }

    fn restore_trx_state(&mut self, saved: (bool, bool, bool, bool, Option<bool>)) {
        (
            self.trx_open,
            self.trx_read_only,
            self.trx_ending,
            self.autocommit,
            self.next_trx_read_only,
        ) = saved;
    }

    fn update_trx_state(&mut self, info: &RouteInfo) {
        if info.type_mask & (TYPE_ENABLE_AUTOCOMMIT | TYPE_DISABLE_AUTOCOMMIT) != 0 {
            if info.type_mask & TYPE_ENABLE_AUTOCOMMIT != 0 {
                self.autocommit = true;
                if self.trx_open {
                    self.trx_ending = true;
                }
            } else {
                self.autocommit = false;
            }
            return;
        }

        if info.type_mask & TYPE_READONLY != 0 && !info.starts_trx() {
            self.next_trx_read_only = Some(true);
            return;
        }
        if info.type_mask & TYPE_READWRITE != 0 {
            self.next_trx_read_only = Some(false);
            return;
        }

        if info.starts_trx() {
            self.trx_open = true;
            self.trx_ending = false;
            self.trx_read_only = info.type_mask & TYPE_READONLY != 0
                || self.next_trx_read_only.take().unwrap_or(false);
            if self.config.service.optimistic_trx
                && !self.trx_read_only
                && !self.locked_to_primary
                && self.phase == SessionPhase::Routing
            {
                self.in_optimistic_trx = true;
            }
            return;
        }

        if info.ends_trx() {
            self.trx_ending = true;
            return;
        }

        // Autocommit off: the first statement opens an implicit transaction
        if !self.autocommit && !self.trx_open && !info.is_session_command() {
            self.trx_open = true;
            self.trx_ending = false;
            self.trx_read_only = self.next_trx_read_only.take().unwrap_or(false);
        }
    }

    pub(crate) fn trx_is_open(&self) -> bool {
        self.trx_open
    }

    pub(crate) fn trx_is_read_only(&self) -> bool {
        self.trx_read_only
    }

    /// COMMIT/ROLLBACK sent, acknowledgement still outstanding
    pub(crate) fn trx_is_ending(&self) -> bool {
        self.trx_ending
    }

    // --- backend plumbing ---------------------------------------------------

    pub(crate) fn backend_index(&self, name: &str) -> Option<usize> {
        self.backends.iter().position(|b| b.name() == name)
    }

    /// Open the backend if needed and replay the session command history
    async fn ensure_open(&mut self, idx: usize) -> Result<(), String> {
        if self.backends[idx].is_in_use() {
            return Ok(());
        }
        if !self.backends[idx].can_connect() {
            return Err(format!(
                "'{}' is closed for good",
                self.backends[idx].name()
            ));
        }
        if self.has_tmp_tables && self.config.service.strict_tmp_tables {
            return Err("temporary tables exist, reconnecting is unsafe".into());
        }

        let user = self.config.proxy.user.clone();
        let password = self.config.proxy.password.clone();
        let database = self.database.clone();
        self.backends[idx]
            .open(&user, &password, database.as_deref())
            .await
            .map_err(|e| e.to_string())?;

        // Catch up on everything the session has done so far
        let pending: Vec<HistoryEntry> = self
            .history
            .pending(self.backends[idx].history_cursor)
            .to_vec();
        for entry in pending {
            self.backends[idx]
                .catch_up_entry(entry.seq, entry.packet.clone(), entry.signature)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Resolve (and possibly reconnect) the primary for a plan
    async fn resolve_primary(&mut self, plan: &RoutingPlan) -> Option<usize> {
        let name = plan
            .server
            .clone()
            .or_else(|| crate::router::pick_primary(&self.usable_snapshot()))?;
        let idx = self.backend_index(&name)?;

        if self.backends[idx].is_in_use() {
            return Some(idx);
        }
        if !self.config.service.master_reconnection && self.current_master == Some(idx) {
            // The primary was lost earlier and reconnecting is disabled
            return None;
        }
        match self.ensure_open(idx).await {
            Ok(()) => Some(idx),
            Err(e) => {
                warn!(session_id = self.id, backend = %name, error = %e, "Primary connect failed");
                None
            }
        }
    }

    async fn resolve_primary_simple(&mut self) -> Option<usize> {
        let name = crate::router::pick_primary(&self.usable_snapshot())?;
        let idx = self.backend_index(&name)?;
        if !self.backends[idx].is_in_use() {
            self.ensure_open(idx).await.ok()?;
        }
        Some(idx)
    }

    async fn ensure_primary_open(&mut self) -> Result<usize, String> {
        let name = crate::router::pick_primary(&self.usable_snapshot())
            .ok_or_else(|| "no primary in the cluster view".to_string())?;
        let idx = self
            .backend_index(&name)
            .ok_or_else(|| "primary not configured".to_string())?;
        self.ensure_open(idx).await?;
        self.current_master = Some(idx);
        Ok(idx)
    }

    async fn teardown(&mut self) {
        for backend in &mut self.backends {
            if backend.is_in_use() {
                backend.send_logout().await;
                backend.close(CloseType::Normal, "session ended");
            }
        }
        self.query_queue.clear();
        self.pending_retries.clear();
    }

    // Accessors used by the recovery half and by tests

    pub(crate) fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
    }

    pub(crate) fn expected_responses(&self) -> u32 {
        self.expected_responses
    }
}

/// Whether a reply's bytes participate in the replay checksum
fn include_in_checksum(mode: ChecksumMode, type_mask: u32, reply: &Reply) -> bool {
    match mode {
        ChecksumMode::Full => true,
        ChecksumMode::ResultOnly => reply.started || reply.error.is_some(),
        ChecksumMode::NoInsertId => {
            (reply.started || reply.error.is_some()) && type_mask & TYPE_MASTER_READ == 0
        }
    }
}

/// Resolve the next packet from any connected backend
async fn next_backend_event(
    backends: &mut [Backend],
) -> (usize, Option<Result<Packet, std::io::Error>>) {
    futures::future::poll_fn(|cx| {
        for (idx, backend) in backends.iter_mut().enumerate() {
            if let Some(conn) = backend.conn_mut() {
                if let Poll::Ready(item) = Pin::new(conn).poll_next(cx) {
                    return Poll::Ready((idx, item));
                }
            }
        }
        Poll::Pending
    })
    .await
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
