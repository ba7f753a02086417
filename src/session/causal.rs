//! Causal read synchronisation
//!
//! Read-your-writes across replicas: before a read runs on a replica the
//! session makes sure the replica has caught up to a known GTID, either the
//! session's own write position (local mode) or a position probed from the
//! primary (universal modes).

use std::time::Duration;

use crate::protocol::packet::read_lenenc_int;
use crate::protocol::{is_eof_packet, is_err_packet, is_ok_packet, Packet};

/// Progress of the one causal read a session may have in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalPhase {
    None,
    /// Probe for @@gtid_current_pos sent to the primary
    ReadingGtid,
    /// Probe answered; the deferred read is being synchronised
    GtidReadDone,
    /// Wait failed on the replica, read was rerouted to the primary
    RetryingOnMaster,
}

/// Query sent to the primary to learn its current position
pub fn gtid_probe_packet() -> Packet {
    Packet::query("SELECT @@gtid_current_pos")
}

/// Wait statement run on a replica before the deferred read
pub fn gtid_wait_packet(gtid: &str, timeout: Duration) -> Packet {
    let sql = format!(
        "SELECT MASTER_GTID_WAIT('{}', {})",
        gtid.replace('\'', ""),
        timeout.as_secs().max(1)
    );
    Packet::query(&sql)
}

/// Extract the single scalar of a one-row, one-column resultset.
///
/// Returns `None` while the shape is not the expected one; `Some(None)`
/// stands for a NULL value.
pub fn extract_scalar(packets: &[Packet]) -> Option<Option<String>> {
    // header, column definition(s), EOF, row, EOF
    let mut eof_seen = false;
    for packet in packets {
        if is_err_packet(&packet.payload) || is_ok_packet(&packet.payload) {
            return None;
        }
        if is_eof_packet(&packet.payload) {
            if eof_seen {
                return None;
            }
            eof_seen = true;
            continue;
        }
        if eof_seen {
            // First row packet
            if packet.payload.first() == Some(&0xFB) {
                return Some(None);
            }
            let (len, n) = read_lenenc_int(&packet.payload)?;
            let rest = &packet.payload[n..];
            if rest.len() < len as usize {
                return None;
            }
            return Some(Some(
                String::from_utf8_lossy(&rest[..len as usize]).to_string(),
            ));
        }
    }
    None
}

/// A MASTER_GTID_WAIT result of 0 means the replica caught up in time
pub fn wait_succeeded(value: Option<&str>) -> bool {
    value == Some("0")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resultset_with_value(value: &[u8]) -> Vec<Packet> {
        let mut row = vec![value.len() as u8];
        row.extend_from_slice(value);
        vec![
            Packet::new(1, vec![0x01]),                        // one column
            Packet::new(2, vec![0x03, b'd', b'e', b'f']),      // column def
            Packet::new(3, vec![0xFE, 0x00, 0x00, 0x02, 0x00]), // EOF
            Packet::new(4, row),
            Packet::new(5, vec![0xFE, 0x00, 0x00, 0x02, 0x00]), // EOF
        ]
    }

    #[test]
    fn test_extract_scalar() {
        let packets = resultset_with_value(b"0-1-42");
        assert_eq!(extract_scalar(&packets), Some(Some("0-1-42".to_string())));
    }

    #[test]
    fn test_extract_null() {
        let packets = vec![
            Packet::new(1, vec![0x01]),
            Packet::new(2, vec![0x03, b'd', b'e', b'f']),
            Packet::new(3, vec![0xFE, 0x00, 0x00, 0x02, 0x00]),
            Packet::new(4, vec![0xFB]),
            Packet::new(5, vec![0xFE, 0x00, 0x00, 0x02, 0x00]),
        ];
        assert_eq!(extract_scalar(&packets), Some(None));
    }

    #[test]
    fn test_wait_result() {
        assert!(wait_succeeded(Some("0")));
        assert!(!wait_succeeded(Some("-1")));
        assert!(!wait_succeeded(None));
    }

    #[test]
    fn test_wait_packet_escapes_quotes() {
        let packet = gtid_wait_packet("0-1-42'; DROP TABLE t", Duration::from_secs(10));
        let sql = packet.sql();
        assert!(sql.starts_with("SELECT MASTER_GTID_WAIT('0-1-42; DROP TABLE t'"));
        assert!(sql.ends_with(", 10)"));
    }
}
