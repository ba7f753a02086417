//! Session command history
//!
//! Statements whose effect persists on a connection (SET, USE, PREPARE, ...)
//! are appended here in execution order. A backend opened or reopened
//! mid-session replays the log from its cursor before it may carry user
//! statements; each replayed response is checked against the signature
//! recorded from the response the client saw.

use crate::protocol::Packet;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub seq: u64,
    pub packet: Packet,
    /// SHA-1 of the response forwarded to the client, set once known
    pub signature: Option<[u8; 20]>,
}

/// Monotonically growing ordered log of session commands
#[derive(Debug, Default)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a session command; returns its sequence number
    pub fn append(&mut self, packet: Packet) -> u64 {
        let seq = self.entries.len() as u64;
        self.entries.push(HistoryEntry {
            seq,
            packet,
            signature: None,
        });
        seq
    }

    /// Record the response signature once the forwarded reply completed
    pub fn set_signature(&mut self, seq: u64, signature: [u8; 20]) {
        if let Some(entry) = self.entries.get_mut(seq as usize) {
            entry.signature = Some(signature);
        }
    }

    pub fn get(&self, cursor: u64) -> Option<&HistoryEntry> {
        self.entries.get(cursor as usize)
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries a backend at `cursor` still has to execute
    pub fn pending(&self, cursor: u64) -> &[HistoryEntry] {
        &self.entries[(cursor as usize).min(self.entries.len())..]
    }
}
