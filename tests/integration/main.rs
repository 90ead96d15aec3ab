//! Integration test entry point
//!
//! These tests need a running hermes instance in front of a real
//! master/slave cluster. Run with:
//! HERMES_RUN_INTEGRATION_TESTS=1 cargo test --test integration

mod masking;
mod rw_split;

use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("HERMES_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip the current test unless integration tests are enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !$crate::should_run_integration_tests() {
            eprintln!("skipping: set HERMES_RUN_INTEGRATION_TESTS=1 to run");
            return;
        }
    };
}

/// Get proxy connection config from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("HERMES_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("HERMES_TEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3307),
        user: env::var("HERMES_TEST_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("HERMES_TEST_PASS").unwrap_or_default(),
        database: env::var("HERMES_TEST_DB").unwrap_or_else(|_| "test".to_string()),
    }
}

/// Proxy test configuration
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    pub fn connection_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    /// Open a connection through the proxy
    pub fn conn(&self) -> mysql::Conn {
        let opts = mysql::Opts::from_url(&self.connection_url()).expect("invalid connection URL");
        mysql::Conn::new(opts).expect("could not connect to hermes")
    }
}
