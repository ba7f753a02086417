//! End-to-end test entry point
//!
//! These tests need a running hermes instance fronting a primary/replica
//! cluster. Run with: HERMES_RUN_CLUSTER_TESTS=1 cargo test --test cluster

mod causal_reads;
mod replay;
mod rw_split;

use std::env;

/// Check if the cluster tests should run
pub fn should_run_cluster_tests() -> bool {
    env::var("HERMES_RUN_CLUSTER_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Get the proxy endpoint from the environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("HERMES_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("HERMES_TEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4006),
        user: env::var("HERMES_TEST_USER").unwrap_or_else(|_| "hermes".to_string()),
        password: env::var("HERMES_TEST_PASS").unwrap_or_default(),
        database: env::var("HERMES_TEST_DB").unwrap_or_else(|_| "test".to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    pub fn conn(&self) -> mysql::PooledConn {
        let pool =
            mysql::Pool::new(self.connection_string().as_str()).expect("proxy should be reachable");
        pool.get_conn().expect("connection should succeed")
    }
}

/// Skip the test unless cluster tests are enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !$crate::should_run_cluster_tests() {
            eprintln!("Skipping cluster test (set HERMES_RUN_CLUSTER_TESTS=1 to run)");
            return;
        }
    };
}
