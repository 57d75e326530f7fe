//! Environment-based configuration.
//!
//! Everything is optional except the store/log connection info, which the
//! binaries require. Durations are plain seconds (or milliseconds where
//! noted) in the environment.

use std::time::Duration;

use crate::dag::Tier;
use crate::monitor::MonitorConfig;
use crate::scheduler::SchedulerConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL for the run store.
    pub database_url: Option<String>,

    /// Connection URL for the durable log; defaults to `database_url`.
    pub log_database_url: Option<String>,

    /// Redis address, surfaced to executor plugins for rate limiting and
    /// ephemeral coordination. The core never dials it.
    pub redis_addr: Option<String>,

    pub heartbeat_interval: Duration,
    pub lease_ttl: Duration,
    pub max_redrives: i32,
    pub default_max_retries: i32,
    pub monitor_tick_interval: Duration,
    pub poll_interval: Duration,
    pub default_task_deadline: Duration,
    pub max_task_runtime: Duration,
    pub drain_grace: Duration,
    pub log_retention: Duration,
    pub max_concurrent: usize,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

impl Config {
    /// Load configuration from environment variables (and `.env`).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Config {
            database_url: env_string("AGENTFLOW_DATABASE_URL"),
            log_database_url: env_string("AGENTFLOW_LOG_DATABASE_URL"),
            redis_addr: env_string("AGENTFLOW_REDIS_ADDR"),
            heartbeat_interval: env_secs("AGENTFLOW_HEARTBEAT_INTERVAL_SECS", 30),
            lease_ttl: env_secs("AGENTFLOW_LEASE_TTL_SECS", 60),
            max_redrives: env_parse("AGENTFLOW_MAX_REDRIVES", 5),
            default_max_retries: env_parse("AGENTFLOW_DEFAULT_MAX_RETRIES", 3),
            monitor_tick_interval: env_secs("AGENTFLOW_MONITOR_TICK_SECS", 15),
            poll_interval: Duration::from_millis(env_parse(
                "AGENTFLOW_POLL_INTERVAL_MS",
                100,
            )),
            default_task_deadline: env_secs("AGENTFLOW_DEFAULT_TASK_DEADLINE_SECS", 300),
            max_task_runtime: env_secs("AGENTFLOW_MAX_TASK_RUNTIME_SECS", 600),
            drain_grace: env_secs("AGENTFLOW_DRAIN_GRACE_SECS", 30),
            log_retention: env_secs("AGENTFLOW_LOG_RETENTION_SECS", 24 * 60 * 60),
            max_concurrent: env_parse("AGENTFLOW_MAX_CONCURRENT", num_cpus::get().max(1) * 2),
        }
    }

    /// Store connection URL or a hard error; the binaries cannot run
    /// without one.
    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("AGENTFLOW_DATABASE_URL must be set"))
    }

    /// Log connection URL, falling back to the store's.
    pub fn log_url(&self) -> Option<&str> {
        self.log_database_url
            .as_deref()
            .or(self.database_url.as_deref())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: self.poll_interval,
            default_task_deadline: self.default_task_deadline,
            ..SchedulerConfig::default()
        }
    }

    pub fn worker_config(&self, tiers: Vec<Tier>) -> WorkerConfig {
        WorkerConfig {
            tiers,
            poll_interval: self.poll_interval,
            max_concurrent: self.max_concurrent,
            lease_ttl: self.lease_ttl,
            heartbeat_interval: self.heartbeat_interval,
            max_task_runtime: self.max_task_runtime,
            drain_grace: self.drain_grace,
            default_max_retries: self.default_max_retries,
            ..WorkerConfig::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            tick_interval: self.monitor_tick_interval,
            max_redrives: self.max_redrives,
            heartbeat_interval: self.heartbeat_interval,
            retention: self.log_retention,
            ..MonitorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_environment() {
        // no env manipulation: just exercise the default paths
        let config = Config {
            database_url: None,
            log_database_url: None,
            redis_addr: None,
            heartbeat_interval: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(60),
            max_redrives: 5,
            default_max_retries: 3,
            monitor_tick_interval: Duration::from_secs(15),
            poll_interval: Duration::from_millis(100),
            default_task_deadline: Duration::from_secs(300),
            max_task_runtime: Duration::from_secs(600),
            drain_grace: Duration::from_secs(30),
            log_retention: Duration::from_secs(86_400),
            max_concurrent: 8,
        };

        assert!(config.require_database_url().is_err());
        assert!(config.log_url().is_none());

        let monitor = config.monitor_config();
        assert_eq!(monitor.max_redrives, 5);
        assert_eq!(monitor.tick_interval, Duration::from_secs(15));

        let worker = config.worker_config(Tier::all().to_vec());
        assert_eq!(worker.lease_ttl, Duration::from_secs(60));
        assert_eq!(worker.tiers.len(), 3);
    }

    #[test]
    fn log_url_falls_back_to_database_url() {
        let mut config = Config::from_env();
        config.database_url = Some("postgres://store".to_string());
        config.log_database_url = None;
        assert_eq!(config.log_url(), Some("postgres://store"));

        config.log_database_url = Some("postgres://log".to_string());
        assert_eq!(config.log_url(), Some("postgres://log"));
    }
}
