use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1). A payload of exactly this size
/// means the statement continues in the next packet.
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet
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
        payload.push(Command::Query as u8);
        payload.extend_from_slice(sql.as_bytes());
        Self::new(0, payload)
    }

    /// Command byte of a client packet
    pub fn command(&self) -> Command {
        self.payload
            .first()
            .map(|b| Command::from(*b))
            .unwrap_or(Command::Unknown)
    }

    /// SQL text of a COM_QUERY packet, lossy
    pub fn sql(&self) -> String {
        if self.payload.len() > 1 && self.command() == Command::Query {
            String::from_utf8_lossy(&self.payload[1..]).to_string()
        } else {
            String::new()
        }
    }

    /// True when the payload fills the frame, meaning more chunks follow
    pub fn is_large(&self) -> bool {
        self.payload.len() == MAX_PACKET_SIZE
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        // 3 bytes for length (little endian)
        dst.put_u8((len & 0xFF) as u8);
        dst.put_u8(((len >> 8) & 0xFF) as u8);
        dst.put_u8(((len >> 16) & 0xFF) as u8);
        // 1 byte for sequence id
        dst.put_u8(self.sequence_id);
        // Payload
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        // Read length (3 bytes, little endian)
        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);

        let total_len = PACKET_HEADER_SIZE + len;
        if src.len() < total_len {
            return None;
        }

        // Read sequence id
        let sequence_id = src[3];

        // Advance past header
        src.advance(PACKET_HEADER_SIZE);

        // Read payload
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_RESERVED: u32 = 1 << 15;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities offered to clients.
    ///
    /// Note: CLIENT_DEPRECATE_EOF is intentionally NOT included because some
    /// backends advertise support but still send EOF packets despite
    /// negotiating deprecation. Keeping EOF framing on both sides lets
    /// responses be forwarded without re-framing.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_PLUGIN_AUTH;

    /// Capabilities requested from backends. SESSION_TRACK is required to
    /// observe server-side variable changes (transaction_isolation,
    /// last_gtid) reported in OK packets.
    pub const BACKEND_CAPABILITIES: u32 = DEFAULT_CAPABILITIES | CLIENT_SESSION_TRACK;
}

/// Server status flags carried in OK/EOF packets
#[allow(dead_code)]
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// MySQL command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl Command {
    /// Commands that produce no response from the server
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            Command::Quit | Command::StmtClose | Command::StmtSendLongData
        )
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}

/// Parse a length-encoded integer, returning (value, bytes consumed)
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    match *data.first()? {
        v @ 0..=0xFA => Some((v as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => {
            Some((u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64, 4))
        }
        0xFE if data.len() >= 9 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[1..9]);
            Some((u64::from_le_bytes(b), 9))
        }
        _ => None,
    }
}

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let pkt = Packet::new(3, vec![0x03, b'S', b'E', b'L']);
        let mut buf = BytesMut::new();
        pkt.encode(&mut buf);

        let decoded = Packet::decode(&mut buf).unwrap();
        assert_eq!(decoded.sequence_id, 3);
        assert_eq!(&decoded.payload[..], &[0x03, b'S', b'E', b'L']);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial() {
        let mut buf = BytesMut::from(&[5u8, 0, 0][..]);
        assert!(Packet::decode(&mut buf).is_none());

        // Header present but payload truncated
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0, 1, 2][..]);
        assert!(Packet::decode(&mut buf).is_none());
    }

    #[test]
    fn test_query_packet() {
        let pkt = Packet::query("SELECT 1");
        assert_eq!(pkt.command(), Command::Query);
        assert_eq!(pkt.sql(), "SELECT 1");
        assert!(!pkt.is_large());
    }

    #[test]
    fn test_lenenc_int_roundtrip() {
        let mut buf = BytesMut::new();
        for v in [0u64, 250, 251, 65535, 65536, 16777215, 16777216, u64::MAX] {
            buf.clear();
            put_lenenc_int(&mut buf, v);
            let (parsed, used) = read_lenenc_int(&buf).unwrap();
            assert_eq!(parsed, v);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_no_response_commands() {
        assert!(!Command::Quit.expects_response());
        assert!(!Command::StmtClose.expects_response());
        assert!(Command::Query.expects_response());
        assert!(Command::StmtPrepare.expects_response());
    }
}
