//! Read/write splitting behaviour through a live cluster

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_PREFIX: &str = "e2e_rw_";

fn cleanup(conn: &mut mysql::PooledConn, marker: &str) {
    let sql = format!("DELETE FROM entries WHERE marker = '{}'", marker);
    let _ = conn.query_drop(&sql);
}

#[test]
fn test_reads_spread_over_replicas() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let mut server_ids = std::collections::HashSet::new();
    for _ in 0..20 {
        let server_id: Option<u64> = conn
            .query_first("SELECT @@server_id")
            .expect("SELECT @@server_id should succeed");
        if let Some(id) = server_id {
            server_ids.insert(id);
        }
    }

    if server_ids.len() > 1 {
        eprintln!("Read scaling observed across {} servers", server_ids.len());
    } else {
        eprintln!("All reads on one server (expected without replicas)");
    }
}

#[test]
fn test_writes_reach_the_primary() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let marker = format!("{}write", TEST_PREFIX);
    cleanup(&mut conn, &marker);

    conn.query_drop(format!(
        "INSERT INTO entries (marker, amount) VALUES ('{}', 100)",
        marker
    ))
    .expect("INSERT should succeed");

    // The primary must not be read-only
    let read_only: Option<u64> = conn
        .query_first("/* hermes route to master */ SELECT @@read_only")
        .expect("SELECT should succeed");
    assert_eq!(read_only, Some(0));

    cleanup(&mut conn, &marker);
}

#[test]
fn test_transaction_sticks_to_one_server() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let marker = format!("{}trx", TEST_PREFIX);
    cleanup(&mut conn, &marker);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");

    let first: Option<u64> = conn
        .query_first("SELECT @@server_id")
        .expect("SELECT should succeed");

    conn.query_drop(format!(
        "INSERT INTO entries (marker, amount) VALUES ('{}', 1)",
        marker
    ))
    .expect("INSERT should succeed");

    let second: Option<u64> = conn
        .query_first("SELECT @@server_id")
        .expect("SELECT should succeed");
    assert_eq!(first, second, "transaction moved between servers");

    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");

    let rows: Option<u64> = conn
        .query_first(format!(
            "SELECT COUNT(*) FROM entries WHERE marker = '{}'",
            marker
        ))
        .expect("SELECT should succeed");
    assert_eq!(rows, Some(0), "rollback should leave no rows");
}

#[test]
fn test_serializable_isolation_pins_reads_to_primary() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let primary_id: Option<u64> = conn
        .query_first("/* hermes route to master */ SELECT @@server_id")
        .expect("SELECT should succeed");

    conn.query_drop("SET SESSION TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .expect("SET should succeed");

    for _ in 0..10 {
        let id: Option<u64> = conn
            .query_first("SELECT @@server_id")
            .expect("SELECT should succeed");
        assert_eq!(id, primary_id, "serializable reads must hit the primary");
    }

    conn.query_drop("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .expect("SET should succeed");
}

#[test]
fn test_session_variables_visible_on_all_targets() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("SET @tag = 'sticky'").expect("SET should succeed");

    // The variable must resolve regardless of which server serves the read
    for _ in 0..10 {
        let value: Option<String> = conn
            .query_first("SELECT @tag")
            .expect("SELECT should succeed");
        assert_eq!(value.as_deref(), Some("sticky"));
    }
}
