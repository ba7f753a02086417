//! Single-shot server probe
//!
//! Opens a throwaway connection, authenticates and reads `@@read_only` plus
//! the GTID position. Used by the registry's background loop.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::protocol::packet::read_lenenc_int;
use crate::protocol::{
    capabilities, compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet,
    HandshakeResponse, InitialHandshake, Packet, PacketCodec,
};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Authentication failed")]
    Auth,
    #[error("Server disconnected")]
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub read_only: bool,
    pub gtid_pos: Option<String>,
    pub lag_s: Option<u64>,
}

pub async fn probe_server(
    addr: &str,
    user: &str,
    password: &str,
) -> Result<ProbeResult, ProbeError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ProbeError::Connect(e.to_string()))?;
    let mut framed = Framed::new(stream, PacketCodec);

    // Authenticate with mysql_native_password
    let greeting = next_packet(&mut framed).await?;
    let handshake = InitialHandshake::parse(&greeting.payload)
        .ok_or_else(|| ProbeError::Protocol("invalid server greeting".into()))?;

    let auth_response = compute_auth_response(password, &handshake.auth_plugin_data());
    let caps = capabilities::DEFAULT_CAPABILITIES & handshake.capability_flags;
    let response = HandshakeResponse {
        capability_flags: caps,
        max_packet_size: 16 * 1024 * 1024,
        character_set: 0x21,
        username: user.to_string(),
        auth_response,
        database: None,
        auth_plugin_name: handshake.auth_plugin_name.clone(),
    };
    framed
        .send(response.encode(1))
        .await
        .map_err(|e| ProbeError::Io(e.to_string()))?;

    let auth_reply = next_packet(&mut framed).await?;
    if is_err_packet(&auth_reply.payload) {
        return Err(ProbeError::Auth);
    }
    if !is_ok_packet(&auth_reply.payload) {
        return Err(ProbeError::Protocol("expected OK after auth".into()));
    }

    let row = query_single_row(
        &mut framed,
        "SELECT @@read_only, @@gtid_current_pos",
    )
    .await?;

    let read_only = row
        .first()
        .and_then(|v| v.as_deref())
        .map(|v| v != "0")
        .unwrap_or(true);
    let gtid_pos = row.get(1).and_then(|v| v.clone()).filter(|v| !v.is_empty());

    // Best-effort logout
    let _ = framed.send(Packet::new(0, vec![0x01])).await;

    Ok(ProbeResult {
        read_only,
        gtid_pos,
        lag_s: None,
    })
}

async fn next_packet(framed: &mut Framed<TcpStream, PacketCodec>) -> Result<Packet, ProbeError> {
    match framed.next().await {
        Some(Ok(packet)) => Ok(packet),
        Some(Err(e)) => Err(ProbeError::Io(e.to_string())),
        None => Err(ProbeError::Disconnected),
    }
}

/// Run a text-protocol query and return the first row's columns
async fn query_single_row(
    framed: &mut Framed<TcpStream, PacketCodec>,
    sql: &str,
) -> Result<Vec<Option<String>>, ProbeError> {
    framed
        .send(Packet::query(sql))
        .await
        .map_err(|e| ProbeError::Io(e.to_string()))?;

    let first = next_packet(framed).await?;
    if is_err_packet(&first.payload) {
        return Err(ProbeError::Protocol("query failed".into()));
    }
    if is_ok_packet(&first.payload) {
        return Ok(Vec::new());
    }

    let (columns, _) = read_lenenc_int(&first.payload)
        .ok_or_else(|| ProbeError::Protocol("bad resultset header".into()))?;

    // Skip column definitions and their terminating EOF
    loop {
        let packet = next_packet(framed).await?;
        if is_eof_packet(&packet.payload) {
            break;
        }
    }

    let mut row = Vec::new();
    loop {
        let packet = next_packet(framed).await?;
        if is_eof_packet(&packet.payload) || is_err_packet(&packet.payload) {
            break;
        }
        if row.is_empty() {
            row = parse_text_row(&packet.payload, columns as usize);
        }
        // Remaining rows are drained and dropped
    }

    Ok(row)
}

/// Parse a text-protocol row: one length-encoded string per column, 0xFB
/// for NULL
fn parse_text_row(payload: &[u8], columns: usize) -> Vec<Option<String>> {
    let mut values = Vec::with_capacity(columns);
    let mut buf = payload;
    for _ in 0..columns {
        if buf.first() == Some(&0xFB) {
            values.push(None);
            buf = &buf[1..];
            continue;
        }
        let Some((len, n)) = read_lenenc_int(buf) else {
            break;
        };
        buf = &buf[n..];
        if buf.len() < len as usize {
            break;
        }
        values.push(Some(
            String::from_utf8_lossy(&buf[..len as usize]).to_string(),
        ));
        buf = &buf[len as usize..];
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_row() {
        // "0", NULL, "0-1-42"
        let mut payload = vec![1, b'0', 0xFB];
        payload.push(6);
        payload.extend_from_slice(b"0-1-42");

        let row = parse_text_row(&payload, 3);
        assert_eq!(row[0].as_deref(), Some("0"));
        assert_eq!(row[1], None);
        assert_eq!(row[2].as_deref(), Some("0-1-42"));
    }
}
