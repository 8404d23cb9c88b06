use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    pub kafka_hosts: String,
    pub kafka_topic: String,

    #[envconfig(default = "relay-worker")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub database_url: String,

    /// Base URL of the metrics service queried for the utilization signal.
    pub metrics_endpoint: String,

    #[envconfig(default = "provisioned_utilization")]
    pub metric_name: String,

    #[envconfig(default = "60")]
    pub metric_window_secs: u64,

    #[envconfig(default = "0.7")]
    pub metric_threshold: f64,

    #[envconfig(default = "5000")]
    pub metric_timeout: EnvMsDuration,

    pub inference_endpoint: String,
    pub inference_deployment: String,
    pub inference_api_key: String,

    #[envconfig(default = "2025-04-01-preview")]
    pub inference_api_version: String,

    #[envconfig(default = "30000")]
    pub inference_timeout: EnvMsDuration,

    /// Sleep between consume cycles; also the backoff after a deferred record.
    #[envconfig(default = "1000")]
    pub poll_interval: EnvMsDuration,

    /// How long a cycle waits on the broker before deciding it has drained it.
    #[envconfig(default = "5000")]
    pub cycle_poll_timeout: EnvMsDuration,

    #[envconfig(default = "100")]
    pub max_records_per_cycle: usize,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
