//! Upstream connection handle
//!
//! A `Backend` multiplexes one pooled connection to one server within a
//! single session. It owns the expectation queue that pairs statements with
//! their replies, remaps prepared-statement ids and replays the session
//! command history when the connection is (re)opened.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::protocol::{
    capabilities, compute_auth_response, is_err_packet, is_ok_packet, Command, ErrorInfo,
    HandshakeResponse, InitialHandshake, Packet, PacketCodec, Reply, ReplyTracker,
};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Backend disconnected")]
    Disconnected,
    #[error("Backend not connected")]
    NotConnected,
    #[error("Unexpected response while idle")]
    UnexpectedResponse,
    #[error("Session command response mismatch")]
    HistoryMismatch,
}

/// How a connection is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// The connection may be reopened later
    Normal,
    /// The server rejected us in a way that forbids reconnecting
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Closed,
    Ready,
    Busy,
}

/// What to do with the reply to a sent statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectKind {
    /// Forward to the client
    Client,
    /// History replay; consume silently and verify the signature
    History { seq: u64 },
    /// Consume silently (session command echo on a secondary backend)
    Discard,
    /// GTID probe result, consumed by the causal-read logic
    GtidProbe,
    /// GTID wait result, consumed by the causal-read logic
    CausalWait,
}

struct Expectation {
    kind: ExpectKind,
    tracker: ReplyTracker,
    /// Response hash for history signature verification
    hasher: Option<Sha1>,
    expected_signature: Option<[u8; 20]>,
}

/// Outcome of feeding one backend packet into the expectation queue
pub struct BackendReply {
    pub kind: ExpectKind,
    pub reply: Reply,
    pub complete: bool,
}

pub struct Backend {
    name: String,
    addr: String,
    conn: Option<Framed<TcpStream, PacketCodec>>,
    state: BackendState,
    expectations: VecDeque<Expectation>,
    close_reason: Option<String>,
    fatal: bool,
    last_write: Instant,
    /// History entries already executed on this connection
    pub history_cursor: u64,
    /// Internal prepared-statement id -> server-side id
    ps_handles: HashMap<u32, u32>,
    /// Statements routed to this backend by this session
    pub stmt_count: u64,
}

impl Backend {
    pub fn new(name: String, addr: String) -> Self {
        Self {
            name,
            addr,
            conn: None,
            state: BackendState::Closed,
            expectations: VecDeque::new(),
            close_reason: None,
            fatal: false,
            last_write: Instant::now(),
            history_cursor: 0,
            ps_handles: HashMap::new(),
            stmt_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn is_in_use(&self) -> bool {
        self.state != BackendState::Closed
    }

    pub fn is_waiting_result(&self) -> bool {
        !self.expectations.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.state == BackendState::Ready && self.expectations.is_empty()
    }

    /// Reply at the head of the queue is not the one forwarded to the client
    pub fn should_ignore_response(&self) -> bool {
        self.expectations
            .front()
            .map(|e| e.kind != ExpectKind::Client)
            .unwrap_or(false)
    }

    /// A client-visible response is still outstanding on this connection
    pub fn has_client_expectation(&self) -> bool {
        self.expectations.iter().any(|e| e.kind == ExpectKind::Client)
    }

    /// The response currently streaming has started a resultset
    pub fn head_reply_started(&self) -> bool {
        self.expectations
            .front()
            .map(|e| e.tracker.reply().started)
            .unwrap_or(false)
    }

    pub fn last_write(&self) -> Instant {
        self.last_write
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn has_failed(&self) -> bool {
        self.fatal
    }

    /// A closed backend can be reopened unless the close was fatal
    pub fn can_connect(&self) -> bool {
        !self.fatal
    }

    /// Open a connection and authenticate. The caller replays history
    /// afterwards via [`Backend::catch_up_entry`].
    pub async fn open(
        &mut self,
        user: &str,
        password: &str,
        database: Option<&str>,
    ) -> Result<(), BackendError> {
        debug_assert!(self.state == BackendState::Closed);
        if self.fatal {
            return Err(BackendError::Connect(format!(
                "'{}' is closed for good: {}",
                self.name,
                self.close_reason.as_deref().unwrap_or("fatal error")
            )));
        }

        debug!(backend = %self.name, addr = %self.addr, "Connecting");
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        let mut framed = Framed::new(stream, PacketCodec);

        let greeting = match framed.next().await {
            Some(Ok(p)) => p,
            Some(Err(e)) => return Err(BackendError::Io(e.to_string())),
            None => return Err(BackendError::Disconnected),
        };
        let handshake = InitialHandshake::parse(&greeting.payload)
            .ok_or_else(|| BackendError::Protocol("invalid server greeting".into()))?;

        let auth_response = compute_auth_response(password, &handshake.auth_plugin_data());
        let mut caps = capabilities::BACKEND_CAPABILITIES & handshake.capability_flags;
        if database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: user.to_string(),
            auth_response,
            database: database.map(|s| s.to_string()),
            auth_plugin_name: handshake.auth_plugin_name.clone(),
        };
        framed
            .send(response.encode(1))
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;

        let reply = match framed.next().await {
            Some(Ok(p)) => p,
            Some(Err(e)) => return Err(BackendError::Io(e.to_string())),
            None => return Err(BackendError::Disconnected),
        };
        if is_err_packet(&reply.payload) {
            let err = ErrorInfo::parse(&reply.payload).unwrap_or_default();
            return Err(BackendError::Auth(err.message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(BackendError::Protocol("expected OK after auth".into()));
        }

        self.conn = Some(framed);
        self.state = BackendState::Ready;
        self.close_reason = None;
        self.expectations.clear();
        // Server-side statement handles died with the old connection
        self.ps_handles.clear();
        self.history_cursor = 0;
        debug!(backend = %self.name, "Connected");
        Ok(())
    }

    /// Send one statement. `kind` decides what happens to the reply.
    pub async fn send(&mut self, packet: Packet, kind: ExpectKind) -> Result<(), BackendError> {
        let command = packet.command();
        let packet = self.map_ps_id(packet);

        let Some(conn) = self.conn.as_mut() else {
            return Err(BackendError::NotConnected);
        };

        if let Err(e) = conn.send(packet).await {
            self.mark_broken(format!("write failed: {}", e));
            return Err(BackendError::Io(e.to_string()));
        }

        self.last_write = Instant::now();
        self.stmt_count += 1;

        if command.expects_response() {
            let hasher = matches!(kind, ExpectKind::History { .. }).then(Sha1::new);
            self.expectations.push_back(Expectation {
                kind,
                tracker: ReplyTracker::new(command),
                hasher,
                expected_signature: None,
            });
            self.state = BackendState::Busy;
        }
        Ok(())
    }

    /// Send a trailing chunk of a multi-packet statement; the expectation
    /// was registered with the first chunk.
    pub async fn send_continuation(&mut self, packet: Packet) -> Result<(), BackendError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(BackendError::NotConnected);
        };
        if let Err(e) = conn.send(packet).await {
            self.mark_broken(format!("write failed: {}", e));
            return Err(BackendError::Io(e.to_string()));
        }
        self.last_write = Instant::now();
        Ok(())
    }

    /// Send a history entry during catch-up; the reply is consumed and its
    /// hash compared against `signature`.
    pub async fn catch_up_entry(
        &mut self,
        seq: u64,
        packet: Packet,
        signature: Option<[u8; 20]>,
    ) -> Result<(), BackendError> {
        let command = packet.command();
        let packet = self.map_ps_id(packet);
        let Some(conn) = self.conn.as_mut() else {
            return Err(BackendError::NotConnected);
        };
        if let Err(e) = conn.send(packet).await {
            self.mark_broken(format!("write failed: {}", e));
            return Err(BackendError::Io(e.to_string()));
        }
        self.last_write = Instant::now();
        if command.expects_response() {
            self.expectations.push_back(Expectation {
                kind: ExpectKind::History { seq },
                tracker: ReplyTracker::new(command),
                hasher: Some(Sha1::new()),
                expected_signature: signature,
            });
            self.state = BackendState::Busy;
        }
        self.history_cursor = seq + 1;
        Ok(())
    }

    /// Feed one packet received from this backend into the head expectation.
    pub fn process_reply(&mut self, packet: &Packet) -> Result<BackendReply, BackendError> {
        let Some(expectation) = self.expectations.front_mut() else {
            return Err(BackendError::UnexpectedResponse);
        };

        if let Some(hasher) = expectation.hasher.as_mut() {
            hasher.update(&packet.payload);
        }

        let complete = expectation.tracker.process(packet);
        let kind = expectation.kind.clone();
        let reply = expectation.tracker.reply().clone();

        if complete {
            let expectation = self.expectations.pop_front().expect("head exists");
            if let (Some(hasher), Some(expected)) =
                (expectation.hasher, expectation.expected_signature)
            {
                let digest: [u8; 20] = hasher.finalize().into();
                if digest != expected {
                    return Err(BackendError::HistoryMismatch);
                }
            }
            if self.expectations.is_empty() {
                self.state = BackendState::Ready;
            }
        }

        Ok(BackendReply {
            kind,
            reply,
            complete,
        })
    }

    /// Acknowledge a write whose reply will never arrive (error recovery)
    pub fn ack_write(&mut self) {
        self.expectations.pop_front();
        if self.expectations.is_empty() && self.state == BackendState::Busy {
            self.state = BackendState::Ready;
        }
    }

    pub fn close(&mut self, close_type: CloseType, reason: impl Into<String>) {
        let reason = reason.into();
        if self.conn.is_some() {
            debug!(backend = %self.name, reason = %reason, "Closing connection");
        }
        self.conn = None;
        self.state = BackendState::Closed;
        self.expectations.clear();
        self.ps_handles.clear();
        self.close_reason = Some(reason);
        if close_type == CloseType::Fatal {
            self.fatal = true;
        }
    }

    fn mark_broken(&mut self, reason: String) {
        self.close(CloseType::Normal, reason);
    }

    /// Best-effort COM_QUIT before the session goes away
    pub async fn send_logout(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.send(Packet::new(0, vec![Command::Quit as u8])).await;
        }
    }

    /// Record the server-side id a prepared statement got on this backend
    pub fn add_ps_handle(&mut self, internal_id: u32, server_id: u32) {
        self.ps_handles.insert(internal_id, server_id);
    }

    pub fn ps_handle(&self, internal_id: u32) -> Option<u32> {
        self.ps_handles.get(&internal_id).copied()
    }

    /// Rewrite the statement id of binary-protocol commands from the
    /// session-internal id to this server's handle.
    fn map_ps_id(&self, packet: Packet) -> Packet {
        let needs_map = matches!(
            packet.command(),
            Command::StmtExecute
                | Command::StmtClose
                | Command::StmtReset
                | Command::StmtFetch
                | Command::StmtSendLongData
        );
        if !needs_map || packet.payload.len() < 5 {
            return packet;
        }

        let internal_id = u32::from_le_bytes([
            packet.payload[1],
            packet.payload[2],
            packet.payload[3],
            packet.payload[4],
        ]);
        let Some(server_id) = self.ps_handles.get(&internal_id) else {
            return packet;
        };
        if *server_id == internal_id {
            return packet;
        }

        let mut payload = BytesMut::from(&packet.payload[..]);
        payload[1..5].copy_from_slice(&server_id.to_le_bytes());
        Packet::new(packet.sequence_id, payload.freeze())
    }

    /// Poll for the next packet from this backend. Only call when connected.
    pub fn conn_mut(&mut self) -> Option<&mut Framed<TcpStream, PacketCodec>> {
        self.conn.as_mut()
    }

    #[cfg(test)]
    pub(crate) fn push_expectation_for_test(&mut self, kind: ExpectKind, command: Command) {
        self.expectations.push_back(Expectation {
            kind,
            tracker: ReplyTracker::new(command),
            hasher: None,
            expected_signature: None,
        });
        self.state = BackendState::Busy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_packet() -> Packet {
        Packet::new(1, vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00])
    }

    #[test]
    fn test_new_backend_is_closed() {
        let backend = Backend::new("db1".into(), "localhost:3306".into());
        assert!(!backend.is_in_use());
        assert!(!backend.is_waiting_result());
        assert!(backend.can_connect());
    }

    #[test]
    fn test_fatal_close_forbids_reconnect() {
        let mut backend = Backend::new("db1".into(), "localhost:3306".into());
        backend.close(CloseType::Fatal, "history signature mismatch");
        assert!(!backend.can_connect());
        assert!(backend.has_failed());
        assert_eq!(backend.close_reason(), Some("history signature mismatch"));

        let mut backend = Backend::new("db2".into(), "localhost:3306".into());
        backend.close(CloseType::Normal, "pool hygiene");
        assert!(backend.can_connect());
    }

    #[test]
    fn test_unexpected_reply_is_error() {
        let mut backend = Backend::new("db1".into(), "localhost:3306".into());
        let result = backend.process_reply(&ok_packet());
        assert!(matches!(result, Err(BackendError::UnexpectedResponse)));
    }

    #[test]
    fn test_expectation_fifo() {
        let mut backend = Backend::new("db1".into(), "localhost:3306".into());
        backend.push_expectation_for_test(ExpectKind::Discard, Command::Query);
        backend.push_expectation_for_test(ExpectKind::Client, Command::Query);

        assert!(backend.should_ignore_response());

        let reply = backend.process_reply(&ok_packet()).unwrap();
        assert!(reply.complete);
        assert_eq!(reply.kind, ExpectKind::Discard);

        assert!(!backend.should_ignore_response());
        let reply = backend.process_reply(&ok_packet()).unwrap();
        assert_eq!(reply.kind, ExpectKind::Client);
        assert!(!backend.is_waiting_result());
    }

    #[test]
    fn test_ps_id_mapping() {
        let mut backend = Backend::new("db1".into(), "localhost:3306".into());
        backend.add_ps_handle(1, 99);

        let mut payload = vec![Command::StmtExecute as u8];
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&[0, 1, 0, 0, 0]);
        let packet = backend.map_ps_id(Packet::new(0, payload));

        let id = u32::from_le_bytes([
            packet.payload[1],
            packet.payload[2],
            packet.payload[3],
            packet.payload[4],
        ]);
        assert_eq!(id, 99);

        // Unmapped ids pass through untouched
        let mut payload = vec![Command::StmtExecute as u8];
        payload.extend_from_slice(&5u32.to_le_bytes());
        payload.extend_from_slice(&[0, 1, 0, 0, 0]);
        let packet = backend.map_ps_id(Packet::new(0, payload));
        let id = u32::from_le_bytes([
            packet.payload[1],
            packet.payload[2],
            packet.payload[3],
            packet.payload[4],
        ]);
        assert_eq!(id, 5);
    }

    #[test]
    fn test_ack_write_restores_ready() {
        let mut backend = Backend::new("db1".into(), "localhost:3306".into());
        backend.push_expectation_for_test(ExpectKind::Client, Command::Query);
        assert_eq!(backend.state(), BackendState::Busy);
        backend.ack_write();
        assert_eq!(backend.state(), BackendState::Ready);
        assert!(!backend.is_waiting_result());
    }
}
