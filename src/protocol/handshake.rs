//! Connection establishment packets
//!
//! Both sides of the proxy speak the MariaDB handshake: the client side gets
//! a greeting generated by us, the backend side answers the greeting of the
//! real server with mysql_native_password.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, put_lenenc_int, Packet};

/// Initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Greeting sent to connecting clients
    pub fn new(connection_id: u32) -> Self {
        let mut auth_data1 = [0u8; 8];
        let mut auth_data2 = vec![0u8; 12];

        use rand::RngCore;
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut auth_data1);
        rng.fill_bytes(&mut auth_data2);

        Self {
            protocol_version: 10,
            server_version: "10.6.0-hermes".to_string(),
            connection_id,
            auth_plugin_data_part1: auth_data1,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: 0x0002,
            auth_plugin_data_part2: auth_data2,
            auth_plugin_name: "mysql_native_password".to_string(),
        }
    }

    /// Full 20-byte scramble
    pub fn auth_plugin_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&self.auth_plugin_data_part1);
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }

    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.connection_id);
        buf.extend_from_slice(&self.auth_plugin_data_part1);
        buf.put_u8(0); // filler
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            let len = self.auth_plugin_data_part1.len() + self.auth_plugin_data_part2.len() + 1;
            buf.put_u8(len as u8);
        } else {
            buf.put_u8(0);
        }

        buf.extend_from_slice(&[0u8; 10]); // reserved

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data_part2);
            buf.put_u8(0);
        }
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;
        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let connection_id = buf.get_u32_le();

        let mut auth_plugin_data_part1 = [0u8; 8];
        auth_plugin_data_part1.copy_from_slice(&buf[..8]);
        buf.advance(8);
        buf.advance(1); // filler

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8();
        buf.advance(10); // reserved

        let mut auth_plugin_data_part2 = Vec::new();
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, auth_plugin_data_len.saturating_sub(8) as usize);
            if buf.len() < len {
                return None;
            }
            let data_len = buf.iter().take(len).position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data_part2.extend_from_slice(&buf[..data_len]);
            buf.advance(len);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }
}

/// Handshake response packet (client -> server)
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
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;
        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();
        buf.advance(23); // reserved

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_response = if capability_flags
            & (CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA | CLIENT_SECURE_CONNECTION)
            != 0
        {
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            (!db.is_empty()).then_some(db)
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
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
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// mysql_native_password scramble:
/// SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);

    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

/// OK packet
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            status_flags: 0x0002, // SERVER_STATUS_AUTOCOMMIT
            ..Default::default()
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();
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

/// ERR packet
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
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }
        buf.extend_from_slice(self.error_message.as_bytes());
        Packet::new(sequence_id, buf.freeze())
    }
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0x00)
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0xFF)
}

/// Check if packet is an EOF packet (EOF framing only)
pub fn is_eof_packet(payload: &Bytes) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < 9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let hs = InitialHandshake::new(42);
        let pkt = hs.encode();
        let parsed = InitialHandshake::parse(&pkt.payload).unwrap();
        assert_eq!(parsed.connection_id, 42);
        assert_eq!(parsed.server_version, hs.server_version);
        assert_eq!(parsed.auth_plugin_data(), hs.auth_plugin_data());
        assert_eq!(parsed.capability_flags, DEFAULT_CAPABILITIES);
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        let resp = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "app".to_string(),
            auth_response: vec![1, 2, 3, 4],
            database: Some("orders".to_string()),
            auth_plugin_name: "mysql_native_password".to_string(),
        };
        let pkt = resp.encode(1);
        let parsed = HandshakeResponse::parse(&pkt.payload).unwrap();
        assert_eq!(parsed.username, "app");
        assert_eq!(parsed.database.as_deref(), Some("orders"));
        assert_eq!(parsed.auth_response, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_auth_response_empty_password() {
        assert!(compute_auth_response("", &[0u8; 20]).is_empty());
        assert_eq!(compute_auth_response("secret", &[0u8; 20]).len(), 20);
    }

    #[test]
    fn test_err_packet_encode() {
        let err = ErrPacket::new(1927, "08S01", "checksum mismatch");
        let pkt = err.encode(1, CLIENT_PROTOCOL_41);
        assert!(is_err_packet(&pkt.payload));
        let info = crate::protocol::reply::ErrorInfo::parse(&pkt.payload).unwrap();
        assert_eq!(info.code, 1927);
        assert_eq!(info.sql_state, "08S01");
        assert_eq!(info.message, "checksum mismatch");
    }
}
