//! Read-your-writes guarantees through the proxy
//!
//! Requires `causal_reads` set to local or universal in the proxy
//! configuration.

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_PREFIX: &str = "e2e_causal_";

fn cleanup(conn: &mut mysql::PooledConn, marker: &str) {
    let sql = format!("DELETE FROM entries WHERE marker = '{}'", marker);
    let _ = conn.query_drop(&sql);
}

#[test]
fn test_write_then_read_sees_the_write() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let marker = format!("{}wrr", TEST_PREFIX);
    cleanup(&mut conn, &marker);

    // Tight write-then-read loops are exactly what replication lag breaks
    // without GTID synchronisation
    for i in 0..20 {
        conn.query_drop(format!(
            "INSERT INTO entries (marker, amount) VALUES ('{}', {})",
            marker, i
        ))
        .expect("INSERT should succeed");

        let count: Option<u64> = conn
            .query_first(format!(
                "SELECT COUNT(*) FROM entries WHERE marker = '{}'",
                marker
            ))
            .expect("SELECT should succeed");
        assert_eq!(count, Some(i + 1), "read did not observe the preceding write");
    }

    cleanup(&mut conn, &marker);
}

#[test]
fn test_reads_still_spread_with_causal_reads() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let marker = format!("{}spread", TEST_PREFIX);
    cleanup(&mut conn, &marker);

    conn.query_drop(format!(
        "INSERT INTO entries (marker, amount) VALUES ('{}', 0)",
        marker
    ))
    .expect("INSERT should succeed");

    let mut server_ids = std::collections::HashSet::new();
    for _ in 0..20 {
        let id: Option<u64> = conn
            .query_first("SELECT @@server_id")
            .expect("SELECT should succeed");
        if let Some(id) = id {
            server_ids.insert(id);
        }
    }

    eprintln!(
        "Causal reads served by {} distinct servers",
        server_ids.len()
    );
    cleanup(&mut conn, &marker);
}
