//! Statement classification
//!
//! Each client packet is reduced to a [`RouteInfo`]: the command byte, a
//! type-mask bitset, the accessed tables and an optional routing hint. The
//! common transaction-control statements are recognised with fast prefix
//! checks; everything else goes through sqlparser. Statements sqlparser
//! cannot handle are conservatively classified as writes.

use std::collections::HashMap;

use sqlparser::ast::{SetExpr, Statement, TableFactor};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::protocol::{Command, Packet};

/// Statement type mask bits
#[allow(dead_code)]
pub mod types {
    pub const TYPE_READ: u32 = 1;
    pub const TYPE_WRITE: u32 = 1 << 1;
    /// Statement whose effect persists on the connection (SET, USE, PREPARE)
    pub const TYPE_SESSION_WRITE: u32 = 1 << 2;
    pub const TYPE_USERVAR_READ: u32 = 1 << 3;
    pub const TYPE_USERVAR_WRITE: u32 = 1 << 4;
    pub const TYPE_SYSVAR_READ: u32 = 1 << 5;
    pub const TYPE_BEGIN_TRX: u32 = 1 << 6;
    pub const TYPE_COMMIT: u32 = 1 << 7;
    pub const TYPE_ROLLBACK: u32 = 1 << 8;
    pub const TYPE_ENABLE_AUTOCOMMIT: u32 = 1 << 9;
    pub const TYPE_DISABLE_AUTOCOMMIT: u32 = 1 << 10;
    /// SET TRANSACTION READ ONLY: the next (or current) trx is read-only
    pub const TYPE_READONLY: u32 = 1 << 11;
    pub const TYPE_READWRITE: u32 = 1 << 12;
    /// Binary-protocol or named PREPARE
    pub const TYPE_PREPARE_STMT: u32 = 1 << 13;
    pub const TYPE_DEALLOC_PREPARE: u32 = 1 << 14;
    pub const TYPE_EXEC_STMT: u32 = 1 << 15;
    /// Read that only makes sense on the primary (LAST_INSERT_ID)
    pub const TYPE_MASTER_READ: u32 = 1 << 16;
    pub const TYPE_CREATE_TMP_TABLE: u32 = 1 << 17;
    pub const TYPE_CALL: u32 = 1 << 18;
}

use types::*;

/// Routing hint parsed from a leading SQL comment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingHint {
    ToPrimary,
    ToReplica,
    ToNamed(String),
    ToLastUsed,
}

/// Classification of one client packet
#[derive(Debug, Clone, Default)]
pub struct RouteInfo {
    pub command: Option<Command>,
    pub type_mask: u32,
    pub tables: Vec<String>,
    /// Name of a text-protocol prepared statement, if any
    pub prepare_name: Option<String>,
    pub hint: Option<RoutingHint>,
    /// Statement continues in further packets
    pub large: bool,
    pub multi_statement: bool,
    /// Statement id of a binary-protocol command
    pub stmt_id: Option<u32>,
}

impl RouteInfo {
    pub fn is_read(&self) -> bool {
        self.type_mask & (TYPE_READ | TYPE_USERVAR_READ | TYPE_SYSVAR_READ) != 0
            && self.type_mask & (TYPE_WRITE | TYPE_SESSION_WRITE | TYPE_MASTER_READ) == 0
    }

    pub fn is_write(&self) -> bool {
        self.type_mask & TYPE_WRITE != 0
    }

    pub fn is_session_command(&self) -> bool {
        self.type_mask & TYPE_SESSION_WRITE != 0
    }

    pub fn starts_trx(&self) -> bool {
        self.type_mask & TYPE_BEGIN_TRX != 0
    }

    pub fn ends_trx(&self) -> bool {
        self.type_mask & (TYPE_COMMIT | TYPE_ROLLBACK) != 0
    }

    pub fn is_exec_stmt(&self) -> bool {
        self.type_mask & TYPE_EXEC_STMT != 0
    }
}

/// Statement classifier. Stateless; per-session state (prepared statement
/// types, autocommit) lives in the session.
pub struct Classifier {
    dialect: MySqlDialect,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    /// Classify one client packet.
    ///
    /// `ps_types` maps internal prepared-statement ids to the type mask of
    /// the statement they prepare, so COM_STMT_EXECUTE can be routed by the
    /// prepared text.
    pub fn classify(&self, packet: &Packet, ps_types: &HashMap<u32, u32>) -> RouteInfo {
        let mut info = RouteInfo {
            command: Some(packet.command()),
            large: packet.is_large(),
            ..Default::default()
        };

        match packet.command() {
            Command::Query => {
                let sql = packet.sql();
                self.classify_sql(&sql, &mut info);
            }
            Command::StmtPrepare => {
                info.type_mask = TYPE_SESSION_WRITE | TYPE_PREPARE_STMT;
            }
            Command::StmtExecute | Command::StmtFetch => {
                info.stmt_id = stmt_id_of(packet);
                let prepared_mask = info
                    .stmt_id
                    .and_then(|id| ps_types.get(&id).copied())
                    .unwrap_or(TYPE_WRITE);
                info.type_mask = TYPE_EXEC_STMT | prepared_mask;
            }
            Command::StmtClose | Command::StmtReset | Command::StmtSendLongData => {
                info.stmt_id = stmt_id_of(packet);
                info.type_mask = TYPE_SESSION_WRITE;
            }
            Command::InitDb | Command::SetOption | Command::ChangeUser => {
                info.type_mask = TYPE_SESSION_WRITE;
            }
            Command::Ping | Command::Statistics => {
                info.type_mask = TYPE_READ;
            }
            _ => {
                info.type_mask = TYPE_WRITE;
            }
        }

        info
    }

    /// Classify SQL text into `info`
    pub fn classify_sql(&self, sql: &str, info: &mut RouteInfo) {
        let trimmed = strip_leading_comments(sql, info);
        let upper = trimmed.trim().to_uppercase();

        info.multi_statement = has_multiple_statements(trimmed);

        if self.fast_path(&upper, info) {
            return;
        }

        match Parser::parse_sql(&self.dialect, trimmed) {
            Ok(statements) => {
                if statements.len() > 1 {
                    info.multi_statement = true;
                }
                match statements.first() {
                    Some(stmt) => self.classify_statement(stmt, &upper, info),
                    None => info.type_mask |= TYPE_WRITE,
                }
            }
            Err(e) => {
                // Not classifiable; the primary can execute anything
                debug!(error = %e, "Statement not parseable, routing as write");
                info.type_mask |= TYPE_WRITE;
            }
        }
    }

    /// Prefix checks for statements that either do not parse or that we need
    /// to recognise without paying for a full parse
    fn fast_path(&self, upper: &str, info: &mut RouteInfo) -> bool {
        if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
            info.type_mask |= TYPE_BEGIN_TRX;
            if upper.contains("READ ONLY") {
                info.type_mask |= TYPE_READONLY;
            }
            return true;
        }
        if upper.starts_with("COMMIT") {
            info.type_mask |= TYPE_COMMIT;
            return true;
        }
        if upper.starts_with("ROLLBACK") {
            info.type_mask |= TYPE_ROLLBACK;
            return true;
        }
        if upper.starts_with("SET") {
            self.classify_set(upper, info);
            return true;
        }
        if upper.starts_with("USE ") {
            info.type_mask |= TYPE_SESSION_WRITE;
            return true;
        }
        if upper.starts_with("PREPARE ") {
            info.type_mask |= TYPE_SESSION_WRITE | TYPE_PREPARE_STMT;
            info.prepare_name = second_word(upper);
            return true;
        }
        if upper.starts_with("EXECUTE ") {
            info.type_mask |= TYPE_EXEC_STMT | TYPE_WRITE;
            info.prepare_name = second_word(upper);
            return true;
        }
        if upper.starts_with("DEALLOCATE") || upper.starts_with("DROP PREPARE") {
            info.type_mask |= TYPE_SESSION_WRITE | TYPE_DEALLOC_PREPARE;
            info.prepare_name = upper.split_whitespace().last().map(|s| s.to_string());
            return true;
        }
        if upper.starts_with("CALL ") {
            info.type_mask |= TYPE_WRITE | TYPE_CALL;
            return true;
        }
        if upper.starts_with("CREATE TEMPORARY TABLE") {
            info.type_mask |= TYPE_WRITE | TYPE_CREATE_TMP_TABLE;
            return true;
        }
        if upper.starts_with("LOCK TABLE") || upper.starts_with("UNLOCK TABLE") {
            info.type_mask |= TYPE_WRITE | TYPE_SESSION_WRITE;
            return true;
        }
        if upper.starts_with("XA ") {
            info.type_mask |= TYPE_WRITE;
            return true;
        }
        false
    }

    fn classify_set(&self, upper: &str, info: &mut RouteInfo) {
        info.type_mask |= TYPE_SESSION_WRITE;

        if upper.contains("AUTOCOMMIT") {
            // SET autocommit=0 opens an implicit transaction
            let value = upper.split('=').nth(1).map(|v| v.trim()).unwrap_or("");
            if value.starts_with('0') || value.starts_with("OFF") || value.starts_with("FALSE") {
                info.type_mask |= TYPE_DISABLE_AUTOCOMMIT | TYPE_BEGIN_TRX;
            } else if value.starts_with('1') || value.starts_with("ON") || value.starts_with("TRUE")
            {
                info.type_mask |= TYPE_ENABLE_AUTOCOMMIT | TYPE_COMMIT;
            }
            return;
        }

        if upper.contains("TRANSACTION") {
            if upper.contains("READ ONLY") {
                info.type_mask |= TYPE_READONLY;
            } else if upper.contains("READ WRITE") {
                info.type_mask |= TYPE_READWRITE;
            }
            return;
        }

        // SET @var = ... is a user variable write
        if upper.contains("SET @") && !upper.contains("SET @@") {
            info.type_mask |= TYPE_USERVAR_WRITE;
        }
    }

    fn classify_statement(&self, stmt: &Statement, upper: &str, info: &mut RouteInfo) {
        match stmt {
            Statement::Query(query) => {
                info.type_mask |= TYPE_READ;

                if let SetExpr::Select(select) = query.body.as_ref() {
                    for twj in &select.from {
                        collect_table(&twj.relation, &mut info.tables);
                        for join in &twj.joins {
                            collect_table(&join.relation, &mut info.tables);
                        }
                    }
                }

                // Locking reads and primary-only functions force the primary
                if upper.contains("FOR UPDATE") || upper.contains("LOCK IN SHARE MODE") {
                    info.type_mask |= TYPE_WRITE;
                }
                if upper.contains("LAST_INSERT_ID") || upper.contains("@@IDENTITY") {
                    info.type_mask |= TYPE_MASTER_READ;
                }
                if upper.contains("INTO @") || upper.contains("INTO OUTFILE") {
                    info.type_mask |= TYPE_USERVAR_WRITE;
                } else if upper.contains("@@") {
                    info.type_mask |= TYPE_SYSVAR_READ;
                } else if contains_uservar(upper) {
                    info.type_mask |= TYPE_USERVAR_READ;
                }
            }
            Statement::Insert { table_name, .. } => {
                info.type_mask |= TYPE_WRITE;
                info.tables.push(table_name.to_string());
            }
            Statement::Update { table, .. } => {
                info.type_mask |= TYPE_WRITE;
                collect_table(&table.relation, &mut info.tables);
            }
            Statement::Delete { .. } => {
                info.type_mask |= TYPE_WRITE;
            }
            Statement::ShowVariable { .. }
            | Statement::ShowVariables { .. }
            | Statement::ShowTables { .. }
            | Statement::ShowColumns { .. }
            | Statement::ShowCreate { .. }
            | Statement::ExplainTable { .. }
            | Statement::Explain { .. } => {
                info.type_mask |= TYPE_READ;
            }
            _ => {
                // DDL and everything else changes state somewhere
                info.type_mask |= TYPE_WRITE;
            }
        }
    }
}

fn collect_table(factor: &TableFactor, tables: &mut Vec<String>) {
    if let TableFactor::Table { name, .. } = factor {
        tables.push(name.to_string());
    }
}

/// Statement id of a binary-protocol command (bytes 1..5)
fn stmt_id_of(packet: &Packet) -> Option<u32> {
    if packet.payload.len() >= 5 {
        Some(u32::from_le_bytes([
            packet.payload[1],
            packet.payload[2],
            packet.payload[3],
            packet.payload[4],
        ]))
    } else {
        None
    }
}

/// Strip leading comments, extracting a routing hint if one is present.
/// Recognised forms:
///   /* hermes route to master */
///   /* hermes route to slave */
///   /* hermes route to server <name> */
///   /* hermes route to last */
///   -- hermes route to master
fn strip_leading_comments<'a>(sql: &'a str, info: &mut RouteInfo) -> &'a str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(stripped) = rest.strip_prefix("/*") {
            if let Some(end) = stripped.find("*/") {
                parse_hint(&stripped[..end], info);
                rest = stripped[end + 2..].trim_start();
                continue;
            }
        }
        if rest.starts_with("--") || rest.starts_with('#') {
            if let Some(end) = rest.find('\n') {
                let line = rest[..end].trim_start_matches(['-', '#']).trim();
                parse_hint(line, info);
                rest = rest[end + 1..].trim_start();
                continue;
            } else {
                let line = rest.trim_start_matches(['-', '#']).trim();
                parse_hint(line, info);
                return "";
            }
        }
        return rest;
    }
}

fn parse_hint(comment: &str, info: &mut RouteInfo) {
    let lower = comment.trim().to_lowercase();
    let Some(rest) = lower.strip_prefix("hermes route to ") else {
        return;
    };
    let rest = rest.trim();
    info.hint = if rest.starts_with("master") || rest.starts_with("primary") {
        Some(RoutingHint::ToPrimary)
    } else if rest.starts_with("slave") || rest.starts_with("replica") {
        Some(RoutingHint::ToReplica)
    } else if rest.starts_with("last") {
        Some(RoutingHint::ToLastUsed)
    } else if let Some(name) = rest.strip_prefix("server ") {
        // Preserve the original case of the server name
        let name = name.split_whitespace().next().unwrap_or("");
        let original = comment
            .split_whitespace()
            .last()
            .unwrap_or(name)
            .to_string();
        (!original.is_empty()).then_some(RoutingHint::ToNamed(original))
    } else {
        None
    };
}

/// True when a semicolon separates two statements (quotes respected)
fn has_multiple_statements(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut in_quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match in_quote {
            Some(q) => {
                if b == q && (i == 0 || bytes[i - 1] != b'\\') {
                    in_quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => in_quote = Some(b),
                b';' => {
                    if bytes[i + 1..].iter().any(|c| !c.is_ascii_whitespace()) {
                        return true;
                    }
                }
                _ => {}
            },
        }
    }
    false
}

/// True when the text references a user variable (@x but not @@x)
fn contains_uservar(upper: &str) -> bool {
    let bytes = upper.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'@'
            && bytes.get(i + 1).is_some_and(|&n| n != b'@')
            && (i == 0 || bytes[i - 1] != b'@')
        {
            return true;
        }
    }
    false
}

fn second_word(s: &str) -> Option<String> {
    s.split_whitespace().nth(1).map(|w| w.to_string())
}
