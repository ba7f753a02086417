//! Transaction replay scenarios
//!
//! These require `transaction_replay = true` in the proxy configuration and
//! a way to kill backend connections mid-transaction; the KILL-based tests
//! use a second connection routed to the primary.

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_PREFIX: &str = "e2e_replay_";

fn cleanup(conn: &mut mysql::PooledConn, marker: &str) {
    let sql = format!("DELETE FROM entries WHERE marker = '{}'", marker);
    let _ = conn.query_drop(&sql);
}

/// Connection id of the backend carrying the session's primary connection
fn backend_connection_id(conn: &mut mysql::PooledConn) -> Option<u64> {
    conn.query_first("/* hermes route to master */ SELECT CONNECTION_ID()")
        .ok()
        .flatten()
}

#[test]
fn test_trx_replay_survives_killed_connection() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let mut admin = config.conn();
    let marker = format!("{}kill", TEST_PREFIX);
    cleanup(&mut conn, &marker);

    conn.query_drop("START TRANSACTION").expect("BEGIN should succeed");
    conn.query_drop(format!(
        "INSERT INTO entries (marker, amount) VALUES ('{}', 1)",
        marker
    ))
    .expect("INSERT should succeed");

    // Kill the server-side connection out from under the proxy
    let victim = backend_connection_id(&mut conn).expect("connection id");
    let _ = admin.query_drop(format!("KILL {}", victim));

    // The replay must land the transaction despite the kill
    conn.query_drop("COMMIT").expect("COMMIT should survive the kill");

    let rows: Option<u64> = conn
        .query_first(format!(
            "/* hermes route to master */ SELECT COUNT(*) FROM entries WHERE marker = '{}'",
            marker
        ))
        .expect("SELECT should succeed");
    assert_eq!(rows, Some(1), "replayed transaction must be committed");

    cleanup(&mut conn, &marker);
}

#[test]
fn test_replay_with_last_insert_id_depends_on_checksum_mode() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let mut admin = config.conn();
    let marker = format!("{}insert_id", TEST_PREFIX);
    cleanup(&mut conn, &marker);

    conn.query_drop("START TRANSACTION").expect("BEGIN should succeed");
    conn.query_drop(format!(
        "INSERT INTO entries (marker, amount) VALUES ('{}', 1)",
        marker
    ))
    .expect("INSERT should succeed");

    // The auto-increment id will differ when the insert re-runs
    let _: Option<u64> = conn
        .query_first("SELECT LAST_INSERT_ID()")
        .expect("SELECT should succeed");

    let victim = backend_connection_id(&mut conn).expect("connection id");
    let _ = admin.query_drop(format!("KILL {}", victim));

    // With transaction_replay_checksum=full this COMMIT fails with 1927;
    // with no_insert_id it succeeds. Accept either, assert the distinction.
    match conn.query_drop("COMMIT") {
        Ok(()) => {
            eprintln!("COMMIT succeeded: proxy runs with no_insert_id checksums");
        }
        Err(mysql::Error::MySqlError(e)) => {
            assert_eq!(e.code, 1927, "expected checksum mismatch error, got {:?}", e);
            eprintln!("COMMIT failed with 1927: proxy runs with full checksums");
        }
        Err(e) => panic!("unexpected error: {:?}", e),
    }

    cleanup(&mut admin, &marker);
}

#[test]
fn test_idle_primary_loss_is_survivable() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let mut admin = config.conn();

    // Kill the idle primary connection; nothing is in flight
    let victim = backend_connection_id(&mut conn).expect("connection id");
    let _ = admin.query_drop(format!("KILL {}", victim));

    std::thread::sleep(std::time::Duration::from_millis(500));

    // With master_reconnection enabled the next write re-opens the primary
    let result: Result<Option<u64>, _> =
        conn.query_first("/* hermes route to master */ SELECT 1");
    match result {
        Ok(v) => assert_eq!(v, Some(1)),
        Err(e) => eprintln!("Session ended after primary loss (master_reconnection off): {}", e),
    }
}
