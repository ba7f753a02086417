use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
}

impl Config {
    /// Reject configurations that cannot work at all
    pub fn validate(&self) -> Result<(), String> {
        if self.servers.is_empty() {
            return Err("no [[server]] entries configured".to_string());
        }
        let mut names: Vec<&str> = self.servers.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.servers.len() {
            return Err("duplicate server names in configuration".to_string());
        }
        if self.service.trx_max_attempts == 0 && self.service.trx_timeout_ms == 0 {
            return Err("either trx_max_attempts or trx_timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Port for the metrics exposition endpoint; 0 disables it
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Credentials used for backend connections
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            metrics_port: default_metrics_port(),
            user: "hermes".to_string(),
            password: String::new(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    4006
}

fn default_metrics_port() -> u16 {
    9106
}

/// One upstream server. Role (primary/replica) is detected by the monitor;
/// rank is an administrative preference among eligible servers.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub rank: i64,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_server_port() -> u16 {
    3306
}

/// Scope on which session variable writes are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseSqlVariablesIn {
    /// Session commands run on every backend of the session
    All,
    /// Session variable writes go to the primary only; variable reads are
    /// then pinned there too
    Primary,
}

/// Which statement results feed the replay checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    /// Every result in the transaction is hashed
    Full,
    /// Session commands are excluded
    ResultOnly,
    /// Session commands and LAST_INSERT_ID() reads are excluded
    NoInsertId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalReads {
    None,
    /// Wait for the session's own GTID on the replica; retry on the primary
    /// if the wait fails
    Local,
    /// Probe the primary position before every read; wait failure is an error
    Universal,
    /// Like universal but uses the monitor's view of the primary position
    /// instead of probing
    FastUniversal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    /// Close the session as soon as the primary is lost
    FailInstantly,
    /// Keep serving reads, fail the session on the next write
    FailOnWrite,
    /// Keep serving reads, answer writes with a read-only error
    ErrorOnWrite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_use_sql_variables_in")]
    pub use_sql_variables_in: UseSqlVariablesIn,

    #[serde(default)]
    pub transaction_replay: bool,
    #[serde(default = "default_checksum_mode")]
    pub transaction_replay_checksum: ChecksumMode,
    /// Byte cap beyond which a transaction is tracked but not replayable
    #[serde(default = "default_trx_max_size")]
    pub trx_max_size: u64,
    #[serde(default = "default_trx_max_attempts")]
    pub trx_max_attempts: u64,
    /// Wall-clock replay budget in milliseconds; overrides the attempt cap
    /// when non-zero
    #[serde(default)]
    pub trx_timeout_ms: u64,
    #[serde(default)]
    pub trx_retry_on_deadlock: bool,
    #[serde(default)]
    pub trx_retry_on_mismatch: bool,

    #[serde(default = "default_causal_reads")]
    pub causal_reads: CausalReads,
    #[serde(default = "default_causal_reads_timeout_ms")]
    pub causal_reads_timeout_ms: u64,

    #[serde(default)]
    pub retry_failed_reads: bool,
    #[serde(default)]
    pub delayed_retry: bool,
    #[serde(default = "default_delayed_retry_timeout_ms")]
    pub delayed_retry_timeout_ms: u64,

    #[serde(default)]
    pub master_reconnection: bool,
    #[serde(default = "default_master_failure_mode")]
    pub master_failure_mode: MasterFailureMode,

    #[serde(default)]
    pub optimistic_trx: bool,

    #[serde(default)]
    pub strict_multi_stmt: bool,
    #[serde(default)]
    pub strict_sp_calls: bool,
    #[serde(default)]
    pub strict_tmp_tables: bool,

    #[serde(default)]
    pub reuse_ps: bool,

    /// Replicas lagging more than this many seconds are skipped for reads;
    /// 0 disables the check
    #[serde(default)]
    pub max_replication_lag_s: u64,
}

fn default_use_sql_variables_in() -> UseSqlVariablesIn {
    UseSqlVariablesIn::All
}

fn default_checksum_mode() -> ChecksumMode {
    ChecksumMode::Full
}

fn default_trx_max_size() -> u64 {
    1024 * 1024
}

fn default_trx_max_attempts() -> u64 {
    5
}

fn default_causal_reads() -> CausalReads {
    CausalReads::None
}

fn default_causal_reads_timeout_ms() -> u64 {
    10_000
}

fn default_delayed_retry_timeout_ms() -> u64 {
    10_000
}

fn default_master_failure_mode() -> MasterFailureMode {
    MasterFailureMode::FailOnWrite
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            use_sql_variables_in: default_use_sql_variables_in(),
            transaction_replay: false,
            transaction_replay_checksum: default_checksum_mode(),
            trx_max_size: default_trx_max_size(),
            trx_max_attempts: default_trx_max_attempts(),
            trx_timeout_ms: 0,
            trx_retry_on_deadlock: false,
            trx_retry_on_mismatch: false,
            causal_reads: default_causal_reads(),
            causal_reads_timeout_ms: default_causal_reads_timeout_ms(),
            retry_failed_reads: false,
            delayed_retry: false,
            delayed_retry_timeout_ms: default_delayed_retry_timeout_ms(),
            master_reconnection: false,
            master_failure_mode: default_master_failure_mode(),
            optimistic_trx: false,
            strict_multi_stmt: false,
            strict_sp_calls: false,
            strict_tmp_tables: false,
            reuse_ps: false,
            max_replication_lag_s: 0,
        }
    }
}

impl ServiceConfig {
    pub fn trx_timeout(&self) -> Duration {
        Duration::from_millis(self.trx_timeout_ms)
    }

    pub fn causal_reads_timeout(&self) -> Duration {
        Duration::from_millis(self.causal_reads_timeout_ms)
    }

    pub fn delayed_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.delayed_retry_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_service_section() {
        let toml = r#"
            [proxy]
            listen_addr = "0.0.0.0"
            listen_port = 4006
            user = "proxy"
            password = "secret"

            [service]
            transaction_replay = true
            transaction_replay_checksum = "no_insert_id"
            trx_max_size = 65536
            trx_max_attempts = 3
            trx_retry_on_deadlock = true
            causal_reads = "universal"
            causal_reads_timeout_ms = 5000
            retry_failed_reads = true
            delayed_retry = true
            master_reconnection = true
            master_failure_mode = "error_on_write"
            strict_multi_stmt = true
            reuse_ps = true
            use_sql_variables_in = "primary"

            [[server]]
            name = "db1"
            host = "10.0.0.1"
            rank = 1

            [[server]]
            name = "db2"
            host = "10.0.0.2"
            port = 3307
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert!(config.service.transaction_replay);
        assert_eq!(
            config.service.transaction_replay_checksum,
            ChecksumMode::NoInsertId
        );
        assert_eq!(config.service.causal_reads, CausalReads::Universal);
        assert_eq!(
            config.service.master_failure_mode,
            MasterFailureMode::ErrorOnWrite
        );
        assert_eq!(
            config.service.use_sql_variables_in,
            UseSqlVariablesIn::Primary
        );
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].rank, 1);
        assert_eq!(config.servers[1].addr(), "10.0.0.2:3307");
    }

    #[test]
    fn test_defaults() {
        let toml = r#"
            [proxy]
            user = "proxy"

            [[server]]
            name = "db1"
            host = "localhost"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert!(!config.service.transaction_replay);
        assert_eq!(config.service.transaction_replay_checksum, ChecksumMode::Full);
        assert_eq!(config.service.causal_reads, CausalReads::None);
        assert_eq!(config.service.trx_max_attempts, 5);
        assert_eq!(
            config.service.master_failure_mode,
            MasterFailureMode::FailOnWrite
        );
        assert_eq!(config.servers[0].port, 3306);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let toml = r#"
            [proxy]
            user = "proxy"

            [[server]]
            name = "db1"
            host = "a"

            [[server]]
            name = "db1"
            host = "b"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_servers() {
        let toml = r#"
            [proxy]
            user = "proxy"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
