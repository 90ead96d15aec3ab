use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::backend::ServerRole;
use crate::router::SelectCriteria;

use super::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub masking: MaskingConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "cluster.servers must list at least one server".into(),
            ));
        }
        if !self.cluster.servers.iter().any(|s| s.role.is_master()) {
            return Err(ConfigError::Invalid(
                "cluster.servers must include a master (or joined) server".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_port() -> u16 {
    3307
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub servers: Vec<ClusterServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterServerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub role: ServerRole,
}

fn default_mysql_port() -> u16 {
    3306
}

/// Whether statements touching user variables must run on the master only,
/// or are broadcast so every backend can answer reads of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SqlVariablesIn {
    #[default]
    Master,
    All,
}

/// How the session reacts to losing its master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    /// Close the session as soon as the master is lost
    #[default]
    FailInstantly,
    /// Keep serving reads, close on the next write
    FailOnWrite,
    /// Keep the session, answer writes with an error packet
    ErrorOnWrite,
}

impl MasterFailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasterFailureMode::FailInstantly => "fail_instantly",
            MasterFailureMode::FailOnWrite => "fail_on_write",
            MasterFailureMode::ErrorOnWrite => "error_on_write",
        }
    }
}

/// Slave connection cap: absolute count or percent of the cluster's slaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxSlaveConnections {
    Count(usize),
    Percent(u8),
}

impl MaxSlaveConnections {
    /// Resolve against the number of slaves in the cluster
    pub fn limit(&self, cluster_slaves: usize) -> usize {
        match self {
            MaxSlaveConnections::Count(n) => *n,
            MaxSlaveConnections::Percent(p) => cluster_slaves * (*p as usize) / 100,
        }
    }
}

impl Default for MaxSlaveConnections {
    fn default() -> Self {
        MaxSlaveConnections::Count(1)
    }
}

impl<'de> Deserialize<'de> for MaxSlaveConnections {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CountOrPercent;

        impl Visitor<'_> for CountOrPercent {
            type Value = MaxSlaveConnections;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an integer count or a percent string like \"50%\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(MaxSlaveConnections::Count(v as usize))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom("max_slave_connections must not be negative"));
                }
                Ok(MaxSlaveConnections::Count(v as usize))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                if let Some(percent) = v.trim().strip_suffix('%') {
                    let p: u8 = percent
                        .trim()
                        .parse()
                        .map_err(|_| E::custom("invalid percent value"))?;
                    if p > 100 {
                        return Err(E::custom("percent must be at most 100"));
                    }
                    Ok(MaxSlaveConnections::Percent(p))
                } else {
                    let n: usize = v
                        .trim()
                        .parse()
                        .map_err(|_| E::custom("invalid count value"))?;
                    Ok(MaxSlaveConnections::Count(n))
                }
            }
        }

        deserializer.deserialize_any(CountOrPercent)
    }
}

/// Router session configuration, frozen per session at open time
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub slave_selection_criteria: SelectCriteria,
    pub max_slave_connections: MaxSlaveConnections,
    /// Seconds; -1 disables the lag filter
    pub max_slave_replication_lag: i64,
    pub use_sql_variables_in: SqlVariablesIn,
    /// 0 keeps the full history
    pub max_sescmd_history: usize,
    pub disable_sescmd_history: bool,
    pub master_accept_reads: bool,
    pub strict_multi_stmt: bool,
    pub master_failure_mode: MasterFailureMode,
    pub retry_failed_reads: bool,
    /// Seconds a backend may sit idle before a ping; 0 disables
    pub connection_keepalive: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            slave_selection_criteria: SelectCriteria::LeastCurrentOperations,
            max_slave_connections: MaxSlaveConnections::Count(1),
            max_slave_replication_lag: -1,
            use_sql_variables_in: SqlVariablesIn::Master,
            max_sescmd_history: 50,
            disable_sescmd_history: false,
            master_accept_reads: false,
            strict_multi_stmt: true,
            master_failure_mode: MasterFailureMode::FailInstantly,
            retry_failed_reads: true,
            connection_keepalive: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MaskingConfig {
    /// Path to the JSON rules file; masking is off when unset
    #[serde(default)]
    pub rules_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub listen_addr: String,
    #[serde(default = "default_admin_port")]
    pub listen_port: u16,
}

fn default_admin_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    8989
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_admin_addr(),
            listen_port: default_admin_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parses() {
        let toml = r#"
            [server]
            listen_addr = "0.0.0.0"
            listen_port = 4006

            [cluster]
            user = "proxy"
            password = "secret"

            [[cluster.servers]]
            name = "db1"
            host = "10.0.0.1"
            role = "master"

            [[cluster.servers]]
            name = "db2"
            host = "10.0.0.2"
            port = 3307
            role = "slave"

            [router]
            slave_selection_criteria = "LEAST_BEHIND_MASTER"
            max_slave_connections = "50%"
            max_slave_replication_lag = 30
            use_sql_variables_in = "all"
            master_failure_mode = "fail_on_write"
            master_accept_reads = true

            [masking]
            rules_path = "/etc/hermes/masking.json"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.listen_port, 4006);
        assert_eq!(config.cluster.servers.len(), 2);
        assert_eq!(config.cluster.servers[1].port, 3307);
        assert_eq!(
            config.router.slave_selection_criteria,
            SelectCriteria::LeastBehindMaster
        );
        assert_eq!(
            config.router.max_slave_connections,
            MaxSlaveConnections::Percent(50)
        );
        assert_eq!(config.router.max_slave_replication_lag, 30);
        assert_eq!(config.router.use_sql_variables_in, SqlVariablesIn::All);
        assert_eq!(
            config.router.master_failure_mode,
            MasterFailureMode::FailOnWrite
        );
        assert!(config.router.master_accept_reads);
        assert!(config.masking.rules_path.is_some());
    }

    #[test]
    fn test_router_defaults() {
        let config = RouterConfig::default();
        assert_eq!(
            config.slave_selection_criteria,
            SelectCriteria::LeastCurrentOperations
        );
        assert_eq!(config.max_slave_connections, MaxSlaveConnections::Count(1));
        assert_eq!(config.max_slave_replication_lag, -1);
        assert_eq!(config.use_sql_variables_in, SqlVariablesIn::Master);
        assert_eq!(
            config.master_failure_mode,
            MasterFailureMode::FailInstantly
        );
        assert!(config.strict_multi_stmt);
        assert!(config.retry_failed_reads);
    }

    #[test]
    fn test_max_slave_connections_forms() {
        #[derive(Deserialize)]
        struct Wrapper {
            value: MaxSlaveConnections,
        }

        let count: Wrapper = toml::from_str("value = 3").unwrap();
        assert_eq!(count.value, MaxSlaveConnections::Count(3));

        let percent: Wrapper = toml::from_str("value = \"25%\"").unwrap();
        assert_eq!(percent.value, MaxSlaveConnections::Percent(25));

        let as_string: Wrapper = toml::from_str("value = \"4\"").unwrap();
        assert_eq!(as_string.value, MaxSlaveConnections::Count(4));

        assert!(toml::from_str::<Wrapper>("value = \"120%\"").is_err());
    }

    #[test]
    fn test_percent_limit_resolution() {
        assert_eq!(MaxSlaveConnections::Percent(50).limit(4), 2);
        assert_eq!(MaxSlaveConnections::Percent(100).limit(3), 3);
        assert_eq!(MaxSlaveConnections::Percent(10).limit(4), 0);
        assert_eq!(MaxSlaveConnections::Count(2).limit(10), 2);
    }

    #[test]
    fn test_masterless_cluster_rejected() {
        let toml = r#"
            [server]
            listen_addr = "0.0.0.0"

            [cluster]
            user = "proxy"

            [[cluster.servers]]
            name = "db1"
            host = "10.0.0.1"
            role = "slave"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_joined_satisfies_master_requirement() {
        let toml = r#"
            [server]
            listen_addr = "0.0.0.0"

            [cluster]
            user = "proxy"

            [[cluster.servers]]
            name = "galera1"
            host = "10.0.0.1"
            role = "joined"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
    }
}
