//! Server response tracking
//!
//! A backend response to one statement spans several packets (resultset
//! header, column definitions, rows, EOF). `ReplyTracker` consumes the
//! packets of exactly one response and reports when it is complete, what it
//! contained and which server-side session variables it changed.

use std::collections::HashMap;

use bytes::Buf;

use super::packet::{read_lenenc_int, status, Command, Packet};

/// Error information extracted from an ERR packet
#[derive(Debug, Clone, Default)]
pub struct ErrorInfo {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrorInfo {
    /// Parse an ERR packet payload (0xFF header)
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFF) || payload.len() < 3 {
            return None;
        }
        let mut buf = &payload[1..];
        let code = buf.get_u16_le();

        let (sql_state, message) = if buf.first() == Some(&b'#') && buf.len() >= 6 {
            let state = String::from_utf8_lossy(&buf[1..6]).to_string();
            (state, String::from_utf8_lossy(&buf[6..]).to_string())
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
        };

        Some(Self {
            code,
            sql_state,
            message,
        })
    }

    /// Server-initiated transaction rollback (deadlock, lock wait timeout)
    pub fn is_rollback(&self) -> bool {
        self.sql_state.starts_with("40")
    }

    /// Galera node refusing statements while joining the cluster
    pub fn is_wsrep_not_ready(&self) -> bool {
        self.code == 1047
            && self.sql_state == "08S01"
            && self.message == "WSREP has not yet prepared node for application use"
    }

    /// ER_OPTION_PREVENTS_STATEMENT, seen when a primary is flipped to
    /// read-only mid-switchover
    pub fn is_read_only(&self) -> bool {
        self.code == 1290
    }

    /// Errors the server emits while shutting down or killing the connection
    pub fn is_server_shutdown(&self) -> bool {
        // ER_SERVER_SHUTDOWN / ER_CONNECTION_KILLED
        self.code == 1053 || self.code == 1927
    }
}

/// Summary of one (possibly still streaming) server response
#[derive(Debug, Clone)]
pub struct Reply {
    /// Command the response answers
    pub command: Command,
    /// All packets of the response have been seen
    pub complete: bool,
    /// A resultset header has been forwarded; rows may already be with the
    /// client
    pub started: bool,
    /// Response ended in an OK packet (or OK-prefixed prepare response)
    pub ok: bool,
    /// Trailing or leading error, if any
    pub error: Option<ErrorInfo>,
    /// Statement id from a COM_STMT_PREPARE response
    pub generated_id: u32,
    /// Parameter count from a COM_STMT_PREPARE response
    pub param_count: u16,
    /// System variables the server reported as changed (session tracking)
    variables: HashMap<String, String>,
}

impl Reply {
    fn new(command: Command) -> Self {
        Self {
            command,
            complete: false,
            started: false,
            ok: false,
            error: None,
            generated_id: 0,
            param_count: 0,
            variables: HashMap::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok && self.error.is_none()
    }

    /// Value of a session-tracked variable changed by this statement
    pub fn get_variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(|s| s.as_str())
    }

    /// One-line description for logging
    pub fn describe(&self) -> String {
        match &self.error {
            Some(e) => format!("{:?}: ERR {} [{}] {}", self.command, e.code, e.sql_state, e.message),
            None if self.ok => format!("{:?}: OK", self.command),
            None => format!("{:?}: resultset (complete: {})", self.command, self.complete),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    /// Waiting for the first packet of a response
    Start,
    /// Reading column definitions, n remaining
    Fields(u64),
    /// Reading rows until the terminating EOF/ERR
    Rows,
    /// Reading prepare parameter definitions, (params, columns) remaining
    PrepareParams(u16, u16),
    /// Reading prepare column definitions, n remaining
    PrepareFields(u16),
    Done,
}

/// Incremental parser for a single server response.
///
/// EOF framing is assumed (CLIENT_DEPRECATE_EOF is never negotiated).
#[derive(Debug)]
pub struct ReplyTracker {
    state: TrackState,
    reply: Reply,
}

impl ReplyTracker {
    pub fn new(command: Command) -> Self {
        Self {
            state: TrackState::Start,
            reply: Reply::new(command),
        }
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn is_complete(&self) -> bool {
        self.state == TrackState::Done
    }

    /// Consume one packet of the response. Returns true when the response is
    /// complete after this packet.
    pub fn process(&mut self, packet: &Packet) -> bool {
        let payload = &packet.payload;

        match self.state {
            TrackState::Start => self.process_first(payload),
            TrackState::Fields(remaining) => {
                if is_eof(payload) {
                    // EOF between column definitions and rows
                    self.state = TrackState::Rows;
                } else {
                    self.state = TrackState::Fields(remaining.saturating_sub(1));
                }
            }
            TrackState::Rows => {
                if payload.first() == Some(&0xFF) {
                    self.reply.error = ErrorInfo::parse(payload);
                    self.state = TrackState::Done;
                } else if is_eof(payload) {
                    self.finish_resultset(payload);
                }
            }
            TrackState::PrepareParams(params, cols) => {
                if is_eof(payload) {
                    self.state = if cols > 0 {
                        TrackState::PrepareFields(cols)
                    } else {
                        TrackState::Done
                    };
                } else {
                    let left = params.saturating_sub(1);
                    self.state = TrackState::PrepareParams(left, cols);
                }
            }
            TrackState::PrepareFields(cols) => {
                if is_eof(payload) {
                    self.state = TrackState::Done;
                } else {
                    let left = cols.saturating_sub(1);
                    self.state = TrackState::PrepareFields(left);
                }
            }
            TrackState::Done => {}
        }

        self.reply.complete = self.state == TrackState::Done;
        self.reply.complete
    }

    fn process_first(&mut self, payload: &[u8]) {
        match payload.first() {
            Some(&0xFF) => {
                self.reply.error = ErrorInfo::parse(payload);
                self.state = TrackState::Done;
            }
            Some(&0x00) if self.reply.command == Command::StmtPrepare => {
                // COM_STMT_PREPARE_OK: id(4) columns(2) params(2)
                if payload.len() >= 12 {
                    let mut buf = &payload[1..];
                    self.reply.generated_id = buf.get_u32_le();
                    let cols = buf.get_u16_le();
                    let params = buf.get_u16_le();
                    self.reply.param_count = params;
                    self.reply.ok = true;
                    self.state = if params > 0 {
                        TrackState::PrepareParams(params, cols)
                    } else if cols > 0 {
                        TrackState::PrepareFields(cols)
                    } else {
                        TrackState::Done
                    };
                } else {
                    self.state = TrackState::Done;
                }
            }
            Some(&0x00) => {
                self.reply.ok = true;
                self.parse_ok(payload);
                // OK with MORE_RESULTS means another resultset follows
                if self.more_results(payload) {
                    self.state = TrackState::Start;
                } else {
                    self.state = TrackState::Done;
                }
            }
            Some(_) if is_eof(payload) => {
                // Bare EOF as first packet (COM_FIELD_LIST terminator)
                self.finish_resultset(payload);
            }
            Some(_) => {
                // Resultset header: column count
                if let Some((count, _)) = read_lenenc_int(payload) {
                    self.reply.started = true;
                    self.state = TrackState::Fields(count);
                } else {
                    self.state = TrackState::Done;
                }
            }
            None => {
                self.state = TrackState::Done;
            }
        }
    }

    fn finish_resultset(&mut self, eof_payload: &[u8]) {
        self.reply.ok = true;
        if self.eof_more_results(eof_payload) {
            self.state = TrackState::Start;
        } else {
            self.state = TrackState::Done;
        }
    }

    fn more_results(&self, ok_payload: &[u8]) -> bool {
        ok_status_flags(ok_payload)
            .map(|s| s & status::SERVER_MORE_RESULTS_EXISTS != 0)
            .unwrap_or(false)
    }

    fn eof_more_results(&self, payload: &[u8]) -> bool {
        // EOF: 0xFE warnings(2) status(2)
        if payload.len() >= 5 {
            let flags = u16::from_le_bytes([payload[3], payload[4]]);
            flags & status::SERVER_MORE_RESULTS_EXISTS != 0
        } else {
            false
        }
    }

    /// Extract status flags and session-tracked variables from an OK packet
    fn parse_ok(&mut self, payload: &[u8]) {
        let mut buf = &payload[1..];

        let Some((_affected, n)) = read_lenenc_int(buf) else {
            return;
        };
        buf = &buf[n..];
        let Some((_insert_id, n)) = read_lenenc_int(buf) else {
            return;
        };
        buf = &buf[n..];

        if buf.len() < 4 {
            return;
        }
        let status_flags = buf.get_u16_le();
        let _warnings = buf.get_u16_le();

        if status_flags & status::SERVER_SESSION_STATE_CHANGED == 0 {
            return;
        }

        // Human-readable info string precedes the state-change block
        if let Some((len, n)) = read_lenenc_int(buf) {
            let skip = n + len as usize;
            if buf.len() < skip {
                return;
            }
            buf = &buf[skip..];
        } else {
            return;
        }

        let Some((len, n)) = read_lenenc_int(buf) else {
            return;
        };
        buf = &buf[n..];
        let mut state = &buf[..(len as usize).min(buf.len())];

        // Sequence of (type, lenenc data) entries; type 0 is a system
        // variable as (lenenc name, lenenc value)
        while state.len() >= 2 {
            let entry_type = state[0];
            state = &state[1..];
            let Some((entry_len, n)) = read_lenenc_int(state) else {
                break;
            };
            state = &state[n..];
            if state.len() < entry_len as usize {
                break;
            }
            let entry = &state[..entry_len as usize];
            state = &state[entry_len as usize..];

            if entry_type == 0x00 {
                if let Some((name_len, n)) = read_lenenc_int(entry) {
                    let rest = &entry[n..];
                    if rest.len() >= name_len as usize {
                        let name = String::from_utf8_lossy(&rest[..name_len as usize]).to_string();
                        let rest = &rest[name_len as usize..];
                        if let Some((val_len, n)) = read_lenenc_int(rest) {
                            let rest = &rest[n..];
                            if rest.len() >= val_len as usize {
                                let value =
                                    String::from_utf8_lossy(&rest[..val_len as usize]).to_string();
                                self.reply.variables.insert(name, value);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < 9
}

/// Extract the status flags of an OK packet payload
pub fn ok_status_flags(payload: &[u8]) -> Option<u16> {
    if payload.first() != Some(&0x00) {
        return None;
    }
    let mut buf = &payload[1..];
    let (_, n) = read_lenenc_int(buf)?;
    buf = &buf[n..];
    let (_, n) = read_lenenc_int(buf)?;
    buf = &buf[n..];
    if buf.len() >= 2 {
        Some(u16::from_le_bytes([buf[0], buf[1]]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn ok_payload() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
    }

    fn err_payload(code: u16, state: &str, msg: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        buf.put_u16_le(code);
        buf.put_u8(b'#');
        buf.extend_from_slice(state.as_bytes());
        buf.extend_from_slice(msg.as_bytes());
        buf.to_vec()
    }

    fn eof_payload() -> Vec<u8> {
        vec![0xFE, 0x00, 0x00, 0x02, 0x00]
    }

    #[test]
    fn test_ok_reply_completes() {
        let mut tracker = ReplyTracker::new(Command::Query);
        assert!(tracker.process(&Packet::new(1, ok_payload())));
        assert!(tracker.reply().is_ok());
        assert!(!tracker.reply().started);
    }

    #[test]
    fn test_err_reply() {
        let mut tracker = ReplyTracker::new(Command::Query);
        assert!(tracker.process(&Packet::new(1, err_payload(1213, "40001", "Deadlock found"))));
        let err = tracker.reply().error.as_ref().unwrap();
        assert_eq!(err.code, 1213);
        assert_eq!(err.sql_state, "40001");
        assert!(err.is_rollback());
    }

    #[test]
    fn test_resultset_framing() {
        let mut tracker = ReplyTracker::new(Command::Query);
        // Column count = 2
        assert!(!tracker.process(&Packet::new(1, vec![0x02])));
        assert!(tracker.reply().started);
        // Two column definitions
        assert!(!tracker.process(&Packet::new(2, vec![0x03, b'd', b'e', b'f'])));
        assert!(!tracker.process(&Packet::new(3, vec![0x03, b'd', b'e', b'f'])));
        // EOF after columns
        assert!(!tracker.process(&Packet::new(4, eof_payload())));
        // One row
        assert!(!tracker.process(&Packet::new(5, vec![0x01, b'x'])));
        // Terminating EOF
        assert!(tracker.process(&Packet::new(6, eof_payload())));
        assert!(tracker.reply().is_ok());
    }

    #[test]
    fn test_resultset_trailing_error() {
        let mut tracker = ReplyTracker::new(Command::Query);
        tracker.process(&Packet::new(1, vec![0x01]));
        tracker.process(&Packet::new(2, vec![0x03, b'd', b'e', b'f']));
        tracker.process(&Packet::new(3, eof_payload()));
        assert!(tracker.process(&Packet::new(4, err_payload(1053, "08S01", "shutdown"))));
        assert!(tracker.reply().error.as_ref().unwrap().is_server_shutdown());
        // Rows had begun streaming when the error arrived
        assert!(tracker.reply().started);
    }

    #[test]
    fn test_prepare_response() {
        let mut tracker = ReplyTracker::new(Command::StmtPrepare);
        // COM_STMT_PREPARE_OK: id=7, 1 column, 2 params
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        buf.put_u32_le(7);
        buf.put_u16_le(1);
        buf.put_u16_le(2);
        buf.put_u8(0);
        buf.put_u16_le(0);
        assert!(!tracker.process(&Packet::new(1, buf.to_vec())));
        assert_eq!(tracker.reply().generated_id, 7);
        assert_eq!(tracker.reply().param_count, 2);

        // Two param definitions + EOF
        tracker.process(&Packet::new(2, vec![0x03, b'd', b'e', b'f']));
        tracker.process(&Packet::new(3, vec![0x03, b'd', b'e', b'f']));
        assert!(!tracker.process(&Packet::new(4, eof_payload())));
        // One column definition + EOF
        tracker.process(&Packet::new(5, vec![0x03, b'd', b'e', b'f']));
        assert!(tracker.process(&Packet::new(6, eof_payload())));
        assert!(tracker.reply().is_ok());
    }

    #[test]
    fn test_session_track_variable() {
        // OK with SESSION_STATE_CHANGED carrying transaction_isolation
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        buf.put_u8(0); // affected rows
        buf.put_u8(0); // insert id
        buf.put_u16_le(status::SERVER_STATUS_AUTOCOMMIT | status::SERVER_SESSION_STATE_CHANGED);
        buf.put_u16_le(0); // warnings
        buf.put_u8(0); // info string, empty

        let name = b"transaction_isolation";
        let value = b"SERIALIZABLE";
        let entry_len = 1 + name.len() + 1 + value.len();
        buf.put_u8((entry_len + 2) as u8); // state block length
        buf.put_u8(0x00); // type: system variable
        buf.put_u8(entry_len as u8);
        buf.put_u8(name.len() as u8);
        buf.extend_from_slice(name);
        buf.put_u8(value.len() as u8);
        buf.extend_from_slice(value);

        let mut tracker = ReplyTracker::new(Command::Query);
        assert!(tracker.process(&Packet::new(1, buf.to_vec())));
        assert_eq!(
            tracker.reply().get_variable("transaction_isolation"),
            Some("SERIALIZABLE")
        );
    }

    #[test]
    fn test_multi_resultset() {
        let mut tracker = ReplyTracker::new(Command::Query);
        tracker.process(&Packet::new(1, vec![0x01]));
        tracker.process(&Packet::new(2, vec![0x03, b'd', b'e', b'f']));
        tracker.process(&Packet::new(3, eof_payload()));
        // Terminating EOF with MORE_RESULTS set
        let eof_more = vec![0xFE, 0x00, 0x00, 0x0A, 0x00];
        assert!(!tracker.process(&Packet::new(4, eof_more)));
        // Second result: a plain OK
        assert!(tracker.process(&Packet::new(5, ok_payload())));
    }
}
