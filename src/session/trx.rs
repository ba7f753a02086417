//! Transaction recording
//!
//! While a transaction is open and eligible for replay, every statement and
//! the SHA-1 of every result forwarded to the client are accumulated here.
//! On a backend failure the record is snapshotted and re-executed; matching
//! checksum vectors prove the replay produced what the client already saw.

use crate::protocol::Packet;

/// Sentinel stored for statements excluded from checksumming, keeping the
/// checksum vector position-aligned with the statement log
pub const EXCLUDED_CHECKSUM: [u8; 20] = [0u8; 20];

#[derive(Debug, Clone, Default)]
pub struct TrxRecord {
    /// Server the transaction is bound to
    target: Option<String>,
    /// Accumulated statement bytes
    size: u64,
    stmts: Vec<(String, Packet)>,
    checksums: Vec<[u8; 20]>,
    /// Position of the next statement to replay
    replay_pos: usize,
}

impl TrxRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn set_target(&mut self, target: &str) {
        self.target = Some(target.to_string());
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Record a statement executed on `backend`
    pub fn add_stmt(&mut self, backend: &str, packet: Packet) {
        self.size += packet.payload.len() as u64;
        self.stmts.push((backend.to_string(), packet));
    }

    /// Record the result checksum of the most recent statement
    pub fn add_checksum(&mut self, checksum: [u8; 20]) {
        self.checksums.push(checksum);
    }

    pub fn checksums(&self) -> &[[u8; 20]] {
        &self.checksums
    }

    pub fn stmt_count(&self) -> usize {
        self.stmts.len()
    }

    /// Statements not yet replayed remain
    pub fn have_stmts(&self) -> bool {
        self.replay_pos < self.stmts.len()
    }

    /// Nothing was ever recorded
    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty() && self.checksums.is_empty()
    }

    /// Pop the next statement for replaying
    pub fn pop_stmt(&mut self) -> Option<Packet> {
        let packet = self.stmts.get(self.replay_pos).map(|(_, p)| p.clone());
        if packet.is_some() {
            self.replay_pos += 1;
        }
        packet
    }

    /// Index of the statement most recently popped for replay
    pub fn replayed_so_far(&self) -> usize {
        self.replay_pos
    }

    /// Reset to an empty record
    pub fn close(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_size_and_stmts() {
        let mut trx = TrxRecord::new();
        assert!(trx.is_empty());

        trx.add_stmt("db1", Packet::query("BEGIN"));
        trx.add_stmt("db1", Packet::query("INSERT INTO t VALUES (1)"));
        assert_eq!(trx.stmt_count(), 2);
        // COM_QUERY byte + SQL text per statement
        assert_eq!(trx.size(), 6 + 25);
        assert!(trx.have_stmts());
    }

    #[test]
    fn test_replay_ordering() {
        let mut trx = TrxRecord::new();
        trx.add_stmt("db1", Packet::query("BEGIN"));
        trx.add_stmt("db1", Packet::query("INSERT INTO t VALUES (1)"));

        assert_eq!(trx.pop_stmt().unwrap().sql(), "BEGIN");
        assert_eq!(trx.replayed_so_far(), 1);
        assert_eq!(trx.pop_stmt().unwrap().sql(), "INSERT INTO t VALUES (1)");
        assert!(!trx.have_stmts());
        assert!(trx.pop_stmt().is_none());
    }

    #[test]
    fn test_snapshot_restarts_replay() {
        let mut trx = TrxRecord::new();
        trx.add_stmt("db1", Packet::query("BEGIN"));
        trx.add_checksum([1u8; 20]);

        // Snapshot taken before replay starts
        let snapshot = trx.clone();
        let mut replaying = trx.clone();
        replaying.pop_stmt();
        assert!(!replaying.have_stmts());

        // Restoring from the snapshot makes the statements replayable again
        let mut restored = snapshot.clone();
        assert!(restored.have_stmts());
        assert_eq!(restored.pop_stmt().unwrap().sql(), "BEGIN");
        assert_eq!(restored.checksums().len(), 1);
    }

    #[test]
    fn test_target_binding() {
        let mut trx = TrxRecord::new();
        assert!(trx.target().is_none());
        trx.set_target("db2");
        assert_eq!(trx.target(), Some("db2"));
        trx.close();
        assert!(trx.target().is_none());
    }
}
