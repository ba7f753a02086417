//! Failure recovery
//!
//! Everything that runs when a backend breaks: transaction replay with
//! checksum verification, resumption of an interrupted statement, read
//! retries, delayed retries and primary reconnection.

use std::time::{Duration, Instant};

use futures::SinkExt;
use sha1::Digest;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backend::CloseType;
use crate::config::MasterFailureMode;
use crate::metrics::metrics;
use crate::parser::RouteInfo;
use crate::protocol::{ErrPacket, ErrorInfo, Packet, PacketCodec, Reply};

use super::{
    CausalPhase, CurrentQuery, InterruptedQuery, PendingRetry, Session, SessionError,
    SessionPhase, EXCLUDED_CHECKSUM,
};

/// What to do with a reply chunk while an interrupted statement re-runs
pub(crate) struct SliceOutcome {
    pub forward: Option<Packet>,
    pub mismatch: bool,
}

/// A statement displaced by a replay, in its storable form
#[derive(Clone)]
pub(crate) struct StashedStmt {
    pub packet: Packet,
    pub type_mask: u32,
    pub bytes: u64,
    pub prefix_digest: [u8; 20],
}

impl StashedStmt {
    fn from_current(cq: &CurrentQuery) -> Self {
        Self {
            packet: cq.packet.clone(),
            type_mask: cq.type_mask,
            bytes: cq.bytes,
            prefix_digest: cq.hasher.clone().finalize().into(),
        }
    }
}

impl Session {
    // --- error classification ----------------------------------------------

    /// Errors that are treated as if the connection had broken, so that the
    /// replay/retry machinery can recover them
    pub(crate) fn is_ignorable_error(&self, idx: usize, error: &ErrorInfo) -> bool {
        if self.config.service.trx_retry_on_deadlock && error.is_rollback() {
            debug!(session_id = self.id, code = error.code, "Deadlock rollback, recoverable");
            return true;
        }

        if error.is_wsrep_not_ready() {
            debug!(session_id = self.id, "Cluster node not ready, recoverable");
            return true;
        }

        // A primary turning read-only mid-transaction is what a switchover
        // looks like from here
        if error.is_read_only()
            && Some(idx) == self.current_master
            && self.trx_is_open()
            && !self.trx_is_read_only()
            && self.config.service.transaction_replay
            && self.phase() != SessionPhase::TrxReplay
        {
            debug!(session_id = self.id, "Primary went read-only inside a transaction");
            return true;
        }

        false
    }

    /// Recover from an ignorable error. Returns true when recovery was
    /// started; the reply is then dropped and the backend closed.
    pub(crate) async fn handle_ignorable_error<C>(
        &mut self,
        _client: &mut Framed<C, PacketCodec>,
        idx: usize,
        error: &ErrorInfo,
    ) -> Result<bool, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let ok = if self.trx_is_open() {
            self.start_trx_replay()
        } else if self.expected_responses() > 1 {
            debug!(session_id = self.id, "Multiple statements in flight, cannot retry");
            false
        } else if self.current_query.is_none() {
            debug!(session_id = self.id, "Reply partially delivered, cannot retry");
            false
        } else if Some(idx) == self.current_master {
            if self.can_recover_master() {
                let cq = self.current_query.take().expect("current query present");
                self.retry_query(cq.packet, Duration::ZERO, false);
                true
            } else {
                false
            }
        } else if self.config.service.retry_failed_reads {
            let cq = self.current_query.take().expect("current query present");
            self.retry_query(cq.packet, Duration::ZERO, false);
            true
        } else {
            false
        };

        if ok {
            info!(
                session_id = self.id,
                backend = %self.backends[idx].name(),
                code = error.code,
                "Recovering from server error"
            );
            self.expected_responses_dec();
            self.causal = CausalPhase::None;
            self.backends[idx].close(
                CloseType::Normal,
                format!("recoverable error: {} {}", error.code, error.message),
            );
        }

        Ok(ok)
    }

    // --- connection loss ----------------------------------------------------

    /// A backend's connection broke or errored
    pub(crate) async fn on_backend_lost<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        desc: &str,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.backends[idx].is_in_use() {
            return Ok(());
        }

        let was_waiting = self.backends[idx].is_waiting_result();
        let held_client = self.backends[idx].has_client_expectation();
        let started = self.backends[idx].head_reply_started();
        let large = self.client_large_active && self.large_target == Some(idx);
        let name = self.backends[idx].name().to_string();

        info!(session_id = self.id, backend = %name, error = %desc, "Backend lost");

        let resumable = self.trx_is_open()
            && self.can_replay_trx
            && (self.config.service.transaction_replay || self.config.service.optimistic_trx)
            && self.current_query.is_some();

        if large || (started && !resumable) {
            // Part of the response is already with the client and it cannot
            // be reproduced
            warn!(
                session_id = self.id,
                backend = %name,
                large = large,
                "Lost mid-result, terminating session"
            );
            self.backends[idx].close(CloseType::Normal, format!("lost mid-result: {}", desc));
            return Err(SessionError::Backend(format!(
                "'{}' was lost in the middle of a {}",
                name,
                if large { "multi-packet statement" } else { "resultset" }
            )));
        }

        self.handle_backend_failure(client, idx, was_waiting, held_client, desc)
            .await
    }

    pub(crate) async fn handle_backend_failure<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        was_waiting: bool,
        held_client: bool,
        desc: &str,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let name = self.backends[idx].name().to_string();

        if Some(idx) == self.current_master {
            self.handle_master_failure(client, idx, was_waiting, held_client, desc)
                .await
        } else {
            self.handle_replica_failure(client, idx, was_waiting, held_client, desc)
                .await
                .map_err(|e| {
                    warn!(session_id = self.id, backend = %name, "Replica failure not recoverable");
                    e
                })
        }
    }

    async fn handle_master_failure<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        was_waiting: bool,
        held_client: bool,
        desc: &str,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let name = self.backends[idx].name().to_string();
        let old_causal = self.causal;
        let mut can_continue = false;

        if !was_waiting {
            // Idle primary loss: reads keep working, a later write decides
            can_continue =
                self.config.service.master_failure_mode != MasterFailureMode::FailInstantly;
        } else if self.expected_responses() > 1 {
            can_continue = false;
        } else if self.causal == CausalPhase::ReadingGtid {
            // The GTID probe died with the primary; the deferred read is at
            // the front of the queue
            self.causal = CausalPhase::None;
            if !self.trx_is_open() && self.can_recover_master() {
                if let Some(packet) = self.query_queue.pop_front() {
                    self.retry_query(packet, Duration::ZERO, false);
                }
                can_continue = true;
            }
        } else if self.config.service.retry_failed_reads
            && !self.trx_is_open()
            && self.current_query.is_some()
            && self.can_recover_master()
        {
            let cq = self.current_query.take().expect("checked above");
            self.retry_query(cq.packet, Duration::ZERO, false);
            can_continue = true;
        } else if self.config.service.master_failure_mode == MasterFailureMode::ErrorOnWrite {
            self.send_readonly_error(client).await?;
            self.current_query = None;
            can_continue = true;
        }

        if self.trx_is_open()
            && !self.in_optimistic_trx
            && (self.trx.target().is_none()
                || self.trx.target() == Some(name.as_str())
                || old_causal == CausalPhase::ReadingGtid)
        {
            can_continue = self.start_trx_replay();
        }

        if can_continue && was_waiting && held_client {
            self.expected_responses_dec();
        }
        self.backends[idx].close(
            CloseType::Normal,
            format!("primary connection failed: {}", desc),
        );

        if !can_continue {
            let err = ErrPacket::new(
                2013,
                "HY000",
                &format!("Lost connection to the primary server: {}", desc),
            );
            let _ = client.send(err.encode(1, self.client_caps)).await;
            return Err(SessionError::Backend(format!(
                "lost connection to primary '{}': {}",
                name, desc
            )));
        }
        Ok(())
    }

    async fn handle_replica_failure<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        was_waiting: bool,
        held_client: bool,
        desc: &str,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let name = self.backends[idx].name().to_string();

        if was_waiting && held_client {
            self.expected_responses_dec();
        }
        if was_waiting {
            // Any causal wait on this replica is void now
            if self.causal != CausalPhase::ReadingGtid {
                self.causal = CausalPhase::None;
            }
        }

        let carried_trx = self.trx.target() == Some(name.as_str());

        if self.trx_is_open()
            && self.trx_is_read_only()
            && carried_trx
            && self.causal != CausalPhase::ReadingGtid
        {
            // Read-only transaction moves to another replica via replay
            let can_continue = self.start_trx_replay();
            self.backends[idx].close(
                CloseType::Normal,
                format!("read-only transaction failed: {}", desc),
            );
            if !can_continue {
                return Err(SessionError::Backend(format!(
                    "read-only transaction on '{}' failed: {}",
                    name, desc
                )));
            }
            return Ok(());
        }

        if self.in_optimistic_trx && carried_trx {
            // The speculative transaction (or its rollback) died with the
            // connection; rebuild it on the primary
            self.in_optimistic_trx = false;
            if self.phase() == SessionPhase::OtrxRollback {
                self.set_phase(SessionPhase::Routing);
            }
            let can_continue = self.start_trx_replay();
            self.backends[idx].close(
                CloseType::Normal,
                format!("speculative transaction failed: {}", desc),
            );
            if !can_continue {
                return Err(SessionError::Backend(format!(
                    "speculative transaction on '{}' failed: {}",
                    name, desc
                )));
            }
            return Ok(());
        }

        // Plain replica read failure: close first so rerouting cannot pick
        // the dead server again
        self.backends[idx].close(
            CloseType::Normal,
            format!("replica connection failed: {}", desc),
        );

        let mut stashed = self.stashed_read.take();
        if held_client || stashed.is_some() {
            let retryable = self.current_query.is_some() || stashed.is_some();
            if retryable && self.config.service.retry_failed_reads {
                let packet = stashed
                    .take()
                    .map(|s| s.packet)
                    .or_else(|| self.current_query.take().map(|cq| cq.packet))
                    .expect("retryable checked");
                debug!(session_id = self.id, "Re-routing failed read");
                self.retry_query(packet, Duration::ZERO, false);
            } else {
                let err = ErrPacket::new(
                    2013,
                    "HY000",
                    &format!("Lost connection to server during query: {}", desc),
                );
                client.send(err.encode(1, self.client_caps)).await?;
                self.current_query = None;
                self.route_stored(client).await?;
            }
        }

        let usable = !self.usable_snapshot_is_empty();
        if !usable {
            return Err(SessionError::Backend(format!(
                "all server connections have failed, last was '{}'",
                name
            )));
        }
        Ok(())
    }

    /// A write to a backend failed before the statement left the proxy
    pub(crate) async fn handle_send_failure<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        idx: usize,
        packet: Packet,
        info: &RouteInfo,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let name = self.backends[idx].name().to_string();

        if packet.is_large() || self.client_large_active {
            // A multi-packet statement cannot be re-sent from scratch
            return Err(SessionError::Backend(format!(
                "write of a multi-packet statement to '{}' failed",
                name
            )));
        }

        if self.trx_is_open()
            && (self.trx.target().is_none() || self.trx.target() == Some(name.as_str()))
        {
            // Stash the statement so the replay re-runs it after the
            // recorded transaction is rebuilt
            self.current_query = Some(CurrentQuery::new(packet, info.type_mask));
            if self.start_trx_replay() {
                return Ok(());
            }
            return Err(SessionError::Backend(format!(
                "write to '{}' failed inside a transaction",
                name
            )));
        }

        self.current_query = None;
        self.no_target_available(client, packet, info, false).await
    }

    /// No server could take the statement right now
    pub(crate) async fn no_target_available<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
        info: &RouteInfo,
        replayed: bool,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if self.delayed_retry_budget_ok() {
            debug!(session_id = self.id, "No target available, scheduling delayed retry");
            self.retry_query(packet, Duration::from_secs(1), replayed);
            return Ok(());
        }

        if replayed {
            return Err(SessionError::ReplayFailed(
                "no server with the primary role became available before the retry budget ran out"
                    .into(),
            ));
        }

        if info.is_write() || info.is_session_command() {
            match self.config.service.master_failure_mode {
                MasterFailureMode::ErrorOnWrite => {
                    self.send_readonly_error(client).await?;
                    return Ok(());
                }
                _ => {
                    let err = ErrPacket::new(2003, "HY000", "No server available for a write");
                    let _ = client.send(err.encode(1, self.client_caps)).await;
                    return Err(SessionError::Backend("no primary available".into()));
                }
            }
        }

        let err = ErrPacket::new(2003, "HY000", "No server available for the statement");
        client.send(err.encode(1, self.client_caps)).await?;
        metrics().record_query_error("no_target");
        Ok(())
    }

    // --- transaction replay -------------------------------------------------

    pub(crate) fn can_start_trx_replay(&self) -> bool {
        if !self.can_replay_trx {
            return false;
        }

        if self.config.service.trx_timeout_ms > 0 {
            // The timer starts with the first attempt
            if self.num_trx_replays == 0 {
                return true;
            }
            match self.trx_replay_timer {
                Some(started) => {
                    let ok = started.elapsed() < self.config.service.trx_timeout();
                    if !ok {
                        info!(
                            session_id = self.id,
                            "Transaction replay time budget exceeded, not replaying"
                        );
                    }
                    ok
                }
                None => true,
            }
        } else if self.num_trx_replays < self.config.service.trx_max_attempts {
            true
        } else {
            info!(
                session_id = self.id,
                attempts = self.num_trx_replays,
                "Transaction replay attempt cap reached, not replaying"
            );
            false
        }
    }

    /// Begin (or restart) replaying the open transaction. Returns false when
    /// replay is disabled or over budget.
    pub(crate) fn start_trx_replay(&mut self) -> bool {
        let enabled =
            self.config.service.transaction_replay || self.config.service.optimistic_trx;
        if !enabled || !self.can_start_trx_replay() {
            return false;
        }

        self.num_trx_replays += 1;

        let restarting = matches!(
            self.phase(),
            SessionPhase::TrxReplay | SessionPhase::TrxReplayInterrupted
        );

        let stashed: Option<StashedStmt> = if restarting {
            // Cancel whatever retries the previous attempt still has queued
            self.canceled_retries = self.pending_retries.len();
            self.current_query = None;
            self.trx = self.orig_trx.clone().unwrap_or_default();
            self.orig_stmt.clone()
        } else {
            let stashed = self.current_query.take().map(|cq| StashedStmt::from_current(&cq));
            self.orig_trx = Some(self.trx.clone());
            self.orig_stmt = stashed.clone();
            self.trx_replay_timer = Some(Instant::now());
            stashed
        };

        if self.trx.stmt_count() == 0 && stashed.is_none() {
            // Nothing was executed yet; there is nothing to replay and the
            // next statement will route normally
            debug!(session_id = self.id, "Transaction had no statements, nothing to replay");
            self.trx.close();
            self.trx_open = false;
            self.trx_ending = false;
            return true;
        }

        info!(
            session_id = self.id,
            attempt = self.num_trx_replays,
            stmts = self.trx.stmt_count(),
            "Starting transaction replay"
        );

        self.replayed_trx = std::mem::take(&mut self.trx);
        self.replay_forward = self.replayed_trx.stmt_count() == 0;
        self.replay_mismatch = false;
        self.set_phase(SessionPhase::TrxReplay);
        self.trx_open = false;
        self.trx_ending = false;

        if self.replayed_trx.have_stmts() {
            self.interrupted_query = stashed.map(InterruptedQuery::from_stashed);
            let packet = self.replayed_trx.pop_stmt().expect("statements exist");
            debug!(session_id = self.id, sql = %packet.sql(), "Replaying first statement");
            self.retry_query(packet, Duration::ZERO, true);
        } else if let Some(stashed) = stashed {
            // The transaction never got a statement through; re-run the one
            // that was interrupted and forward its result
            debug!(session_id = self.id, sql = %stashed.packet.sql(), "Retrying interrupted statement");
            self.retry_query(stashed.packet, Duration::ZERO, true);
        }

        true
    }

    /// Compare the newest rebuilt checksum against the recorded one
    pub(crate) fn verify_replay_checksum(&mut self) {
        let Some(new) = self.trx.checksums().last() else {
            return;
        };
        let i = self.trx.checksums().len() - 1;
        if let Some(recorded) = self.replayed_trx.checksums().get(i) {
            if *recorded != EXCLUDED_CHECKSUM && *new != EXCLUDED_CHECKSUM && recorded != new {
                warn!(session_id = self.id, position = i, "Replay checksum diverged");
                self.replay_mismatch = true;
            }
        }
    }

    /// A replayed statement finished; send the next one or wrap up
    pub(crate) async fn continue_trx_replay<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        debug_assert!(self.phase() == SessionPhase::TrxReplay);

        if self.replayed_trx.have_stmts() {
            let packet = self.replayed_trx.pop_stmt().expect("statements exist");
            debug!(session_id = self.id, sql = %packet.sql(), "Replaying next statement");
            self.retry_query(packet, Duration::ZERO, true);
            return Ok(());
        }

        // All recorded statements re-executed with matching checksums
        metrics().record_trx_replay();
        info!(
            session_id = self.id,
            attempt = self.num_trx_replays,
            "Transaction replay verified"
        );

        let interrupted = self.interrupted_query.as_ref().map(|iq| iq.packet.clone());
        if let Some(packet) = interrupted {
            self.set_phase(SessionPhase::TrxReplayInterrupted);
            debug!(session_id = self.id, "Resuming interrupted statement");
            self.retry_query(packet, Duration::ZERO, true);
            return Ok(());
        }

        self.finish_replay_success();
        self.route_stored(client).await
    }

    /// Route the reply bytes of the re-executed interrupted statement:
    /// everything the client already has is consumed, the rest is forwarded.
    pub(crate) fn slice_interrupted_chunk(
        &mut self,
        forward: Option<Packet>,
        complete: bool,
    ) -> SliceOutcome {
        let Some(packet) = forward else {
            return SliceOutcome {
                forward: None,
                mismatch: false,
            };
        };
        let Some(iq) = self.interrupted_query.as_mut() else {
            return SliceOutcome {
                forward: Some(packet),
                mismatch: false,
            };
        };

        let len = packet.payload.len() as u64;

        if iq.replayed_bytes + len <= iq.bytes {
            // Still inside the prefix the client has seen
            iq.replay_hasher.update(&packet.payload);
            iq.replayed_bytes += len;

            if iq.replayed_bytes == iq.bytes {
                let digest: [u8; 20] = iq.replay_hasher.clone().finalize().into();
                if digest != iq.prefix_digest {
                    return SliceOutcome {
                        forward: None,
                        mismatch: true,
                    };
                }
            }
            if complete && iq.replayed_bytes < iq.bytes {
                // The re-executed reply is shorter than what the client got
                return SliceOutcome {
                    forward: None,
                    mismatch: true,
                };
            }
            SliceOutcome {
                forward: None,
                mismatch: false,
            }
        } else if iq.replayed_bytes < iq.bytes {
            // The boundary falls inside this packet: the reply was framed
            // differently than the original, its bytes cannot match
            SliceOutcome {
                forward: None,
                mismatch: true,
            }
        } else {
            // Past the prefix: new data the client has not seen
            iq.replay_hasher.update(&packet.payload);
            SliceOutcome {
                forward: Some(packet),
                mismatch: false,
            }
        }
    }

    /// The interrupted statement completed and verified
    pub(crate) async fn finish_interrupted_replay<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        reply: &Reply,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(iq) = self.interrupted_query.take() {
            // The resumed statement joins the rebuilt transaction record
            if self.trx_is_open() && self.can_replay_trx {
                let digest: [u8; 20] = iq.replay_hasher.finalize().into();
                let include = super::include_in_checksum(
                    self.config.service.transaction_replay_checksum,
                    iq.type_mask,
                    reply,
                );
                let backend = self
                    .current_master
                    .map(|i| self.backends[i].name().to_string())
                    .unwrap_or_default();
                self.trx.add_stmt(&backend, iq.packet);
                self.trx
                    .add_checksum(if include { digest } else { EXCLUDED_CHECKSUM });
            }
        }

        self.finish_replay_success();
        self.route_stored(client).await
    }

    fn finish_replay_success(&mut self) {
        self.set_phase(SessionPhase::Routing);
        self.num_trx_replays = 0;
        self.replayed_trx.close();
        self.orig_trx = None;
        self.orig_stmt = None;
        self.replay_forward = false;
        self.replay_mismatch = false;
        self.interrupted_query = None;
        self.current_query = None;
    }

    /// Replay produced different results than the original execution
    pub(crate) async fn handle_checksum_mismatch<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        self.replay_mismatch = false;

        if self.config.service.trx_retry_on_mismatch && self.start_trx_replay() {
            info!(session_id = self.id, "Checksum mismatch, replaying again");
            return Ok(());
        }

        warn!(session_id = self.id, "Checksum mismatch, closing session");
        let err = ErrPacket::new(
            1927,
            "08S01",
            "Transaction checksum mismatch encountered when replaying transaction.",
        );
        let _ = client.send(err.encode(1, self.client_caps)).await;
        Err(SessionError::ReplayFailed(
            "transaction checksum mismatch".into(),
        ))
    }

    // --- retries ------------------------------------------------------------

    /// Schedule a statement for (re-)routing
    pub(crate) fn retry_query(&mut self, packet: Packet, delay: Duration, replayed: bool) {
        self.pending_retries.push_back(PendingRetry {
            due: Instant::now() + delay,
            packet,
            replayed,
        });
    }

    /// Route every retry whose delay has elapsed
    pub(crate) async fn fire_due_retries<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let now = Instant::now();
        loop {
            let Some(pos) = self.pending_retries.iter().position(|r| r.due <= now) else {
                return Ok(());
            };
            let retry = self.pending_retries.remove(pos).expect("position valid");
            if self.canceled_retries > 0 {
                // A replay restart invalidated this queued statement
                self.canceled_retries -= 1;
                continue;
            }
            self.dispatch(client, retry.packet, retry.replayed).await?;
        }
    }

    pub(crate) fn delayed_retry_budget_ok(&mut self) -> bool {
        if !self.config.service.delayed_retry {
            return false;
        }
        let started = *self.retry_start.get_or_insert_with(Instant::now);
        started.elapsed() < self.config.service.delayed_retry_timeout()
    }

    // --- helpers ------------------------------------------------------------

    pub(crate) fn can_recover_master(&self) -> bool {
        self.current_master
            .map(|i| self.backends[i].is_in_use())
            .unwrap_or(false)
            || (self.config.service.master_reconnection
                && crate::router::pick_primary(&self.usable_snapshot()).is_some())
    }

    pub(crate) async fn send_readonly_error<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let err = ErrPacket::new(
            1290,
            "HY000",
            "The MariaDB server is running with the --read-only option so it cannot execute this statement",
        );
        client.send(err.encode(1, self.client_caps)).await?;
        Ok(())
    }

    fn usable_snapshot_is_empty(&self) -> bool {
        self.usable_snapshot().is_empty()
            && !self.backends.iter().any(|b| b.is_in_use())
    }

    fn expected_responses_dec(&mut self) {
        self.expected_responses = self.expected_responses.saturating_sub(1);
    }
}

impl InterruptedQuery {
    pub(crate) fn from_stashed(stashed: StashedStmt) -> Self {
        Self {
            packet: stashed.packet,
            type_mask: stashed.type_mask,
            bytes: stashed.bytes,
            prefix_digest: stashed.prefix_digest,
            replayed_bytes: 0,
            replay_hasher: sha1::Sha1::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig, ServiceConfig};
    use crate::monitor::ServerRegistry;
    use sha1::Sha1;
    use std::sync::Arc;

    fn test_session(service: ServiceConfig) -> Session {
        let config = Arc::new(Config {
            proxy: Default::default(),
            service,
            servers: vec![ServerConfig {
                name: "db1".into(),
                host: "localhost".into(),
                port: 13306,
                rank: 0,
            }],
        });
        let registry = Arc::new(ServerRegistry::new(&config.servers));
        Session::new(1, config, registry)
    }

    fn replay_session() -> Session {
        let mut session = test_session(ServiceConfig {
            transaction_replay: true,
            trx_max_attempts: 2,
            ..Default::default()
        });
        session.trx_open = true;
        session.trx.add_stmt("db1", Packet::query("BEGIN"));
        session.trx.add_stmt("db1", Packet::query("INSERT INTO t VALUES (1)"));
        session.trx.add_checksum([1u8; 20]);
        session.trx.add_checksum([2u8; 20]);
        session
    }

    #[test]
    fn test_replay_attempt_cap() {
        let mut session = replay_session();

        assert!(session.start_trx_replay());
        assert_eq!(session.phase(), SessionPhase::TrxReplay);
        assert_eq!(session.num_trx_replays, 1);

        // Second attempt restores the snapshot and runs again
        assert!(session.start_trx_replay());
        assert_eq!(session.num_trx_replays, 2);

        // The cap of two attempts is now exhausted
        assert!(!session.start_trx_replay());
    }

    #[test]
    fn test_replay_disabled_without_config() {
        let mut session = test_session(ServiceConfig::default());
        session.trx_open = true;
        session.trx.add_stmt("db1", Packet::query("INSERT INTO t VALUES (1)"));
        assert!(!session.start_trx_replay());
    }

    #[test]
    fn test_replay_time_budget() {
        let mut session = test_session(ServiceConfig {
            transaction_replay: true,
            trx_timeout_ms: 50,
            ..Default::default()
        });
        session.trx_open = true;
        session.trx.add_stmt("db1", Packet::query("INSERT INTO t VALUES (1)"));

        assert!(session.start_trx_replay());

        // Pretend the first attempt started long ago
        session.trx_replay_timer = std::time::Instant::now()
            .checked_sub(Duration::from_millis(200));
        assert!(!session.can_start_trx_replay());
    }

    #[test]
    fn test_replay_snapshot_restores_statements() {
        let mut session = replay_session();

        assert!(session.start_trx_replay());
        // The first statement was popped for replaying
        assert_eq!(session.replayed_trx.replayed_so_far(), 1);
        assert_eq!(session.pending_retries.len(), 1);

        // Restart: queued retries from the first attempt are canceled and
        // the statements are replayable again from the top
        assert!(session.start_trx_replay());
        assert_eq!(session.canceled_retries, 1);
        assert_eq!(session.replayed_trx.replayed_so_far(), 1);
        assert_eq!(session.replayed_trx.checksums().len(), 2);
    }

    #[test]
    fn test_non_replayable_trx_refuses() {
        let mut session = replay_session();
        session.can_replay_trx = false;
        assert!(!session.start_trx_replay());
    }

    #[test]
    fn test_verify_replay_checksum_matches() {
        let mut session = replay_session();
        session.replayed_trx = session.trx.clone();

        session.trx.close();
        session.trx.add_checksum([1u8; 20]);
        session.verify_replay_checksum();
        assert!(!session.replay_mismatch);

        session.trx.add_checksum([9u8; 20]);
        session.verify_replay_checksum();
        assert!(session.replay_mismatch);
    }

    #[test]
    fn test_verify_replay_checksum_skips_sentinels() {
        let mut session = replay_session();
        session.replayed_trx.close();
        session.replayed_trx.add_checksum(EXCLUDED_CHECKSUM);

        session.trx.close();
        // The re-executed result differs, but the slot was excluded
        session.trx.add_checksum([7u8; 20]);
        session.verify_replay_checksum();
        assert!(!session.replay_mismatch);
    }

    fn interrupted(prefix: &[u8]) -> InterruptedQuery {
        use sha1::Digest as _;
        InterruptedQuery::from_stashed(StashedStmt {
            packet: Packet::query("SELECT * FROM t"),
            type_mask: 0,
            bytes: prefix.len() as u64,
            prefix_digest: Sha1::digest(prefix).into(),
        })
    }

    #[test]
    fn test_slice_consumes_prefix_and_forwards_tail() {
        let mut session = replay_session();
        let prefix = b"0123456789";
        session.interrupted_query = Some(interrupted(prefix));

        // First chunk: entirely inside the prefix, consumed silently
        let outcome =
            session.slice_interrupted_chunk(Some(Packet::new(1, &prefix[..6])), false);
        assert!(outcome.forward.is_none());
        assert!(!outcome.mismatch);

        // Second chunk reaches the high-water mark exactly; digest verifies
        let outcome =
            session.slice_interrupted_chunk(Some(Packet::new(2, &prefix[6..])), false);
        assert!(outcome.forward.is_none());
        assert!(!outcome.mismatch);

        // Everything past the prefix is new data for the client
        let outcome =
            session.slice_interrupted_chunk(Some(Packet::new(3, &b"tail"[..])), true);
        assert!(outcome.forward.is_some());
        assert!(!outcome.mismatch);
    }

    #[test]
    fn test_slice_detects_diverged_prefix() {
        let mut session = replay_session();
        session.interrupted_query = Some(interrupted(b"0123456789"));

        // Same length, different bytes
        let outcome =
            session.slice_interrupted_chunk(Some(Packet::new(1, &b"9876543210"[..])), false);
        assert!(outcome.mismatch);
    }

    #[test]
    fn test_slice_detects_short_reply() {
        let mut session = replay_session();
        session.interrupted_query = Some(interrupted(b"0123456789"));

        // The re-executed reply ends before covering the prefix
        let outcome =
            session.slice_interrupted_chunk(Some(Packet::new(1, &b"0123"[..])), true);
        assert!(outcome.mismatch);
    }

    #[test]
    fn test_slice_detects_framing_divergence() {
        let mut session = replay_session();
        session.interrupted_query = Some(interrupted(b"0123456789"));

        // A single packet that straddles the boundary cannot match the
        // original packetisation
        let outcome = session
            .slice_interrupted_chunk(Some(Packet::new(1, &b"0123456789extra"[..])), false);
        assert!(outcome.mismatch);
    }
}
