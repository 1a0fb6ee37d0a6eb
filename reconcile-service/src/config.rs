use network_client::domain::{Network, NetworkConfig};
use serde::Deserialize;
use std::{fs, time::Duration};
use time::Time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub kind: StoreKind,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Create missing tables on startup.
    #[serde(default)]
    pub apply_schema: bool,
}

fn default_max_connections() -> u32 {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSourceConfig {
    pub http_bind_addr: String,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl SinkConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadingsConfig {
    pub source: HttpSourceConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MnfConfig {
    /// Start of the minimum night flow window, `HH:MM` UTC.
    #[serde(default = "default_mnf_start")]
    pub window_start: String,
    #[serde(default = "default_mnf_end")]
    pub window_end: String,
    /// Delay between a zone's day closing and its leak estimate.
    #[serde(default = "default_mnf_delay")]
    pub delay_secs: u64,
}

fn default_mnf_start() -> String {
    "02:00".to_string()
}

fn default_mnf_end() -> String {
    "04:00".to_string()
}

fn default_mnf_delay() -> u64 {
    60
}

impl Default for MnfConfig {
    fn default() -> Self {
        Self {
            window_start: default_mnf_start(),
            window_end: default_mnf_end(),
            delay_secs: default_mnf_delay(),
        }
    }
}

fn parse_hhmm(s: &str) -> anyhow::Result<Time> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected HH:MM, got '{s}'"))?;
    Ok(Time::from_hms(h.parse()?, m.parse()?, 0)?)
}

impl MnfConfig {
    pub fn window(&self) -> anyhow::Result<(Time, Time)> {
        let start = parse_hhmm(&self.window_start)?;
        let end = parse_hhmm(&self.window_end)?;
        if end <= start {
            anyhow::bail!("mnf window must end after it starts ({} - {})", self.window_start, self.window_end);
        }
        Ok((start, end))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Gaps longer than this are not distributed; the tick is reset to zero instead.
    #[serde(default = "default_gap_reset_after_hours")]
    pub gap_reset_after_hours: i64,
    /// Ticks a zone may run ahead of a record before its missing pulses count as lost.
    #[serde(default = "default_late_tolerance_ticks")]
    pub late_tolerance_ticks: u32,
    /// Meters whose pulses are stored but never reconciled.
    #[serde(default)]
    pub ignored_meters: Vec<String>,
    #[serde(default)]
    pub mnf: MnfConfig,
}

fn default_gap_reset_after_hours() -> i64 {
    48
}

fn default_late_tolerance_ticks() -> u32 {
    4
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            gap_reset_after_hours: default_gap_reset_after_hours(),
            late_tolerance_ticks: default_late_tolerance_ticks(),
            ignored_meters: Vec::new(),
            mnf: MnfConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// TOML file holding the network topology.
    pub network_path: String,
    pub store: StoreConfig,
    pub readings: ReadingsConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("RECONCILE_CONFIG").unwrap_or_else(|_| "reconcile-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&contents)?;
        Ok(cfg)
    }

    pub fn load_network(&self) -> anyhow::Result<Network> {
        load_network(&self.network_path)
    }
}

pub fn parse_network(contents: &str) -> anyhow::Result<Network> {
    let cfg: NetworkConfig = toml::from_str(contents)?;
    Ok(Network::build(cfg)?)
}

pub fn load_network(path: &str) -> anyhow::Result<Network> {
    let contents = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read network file '{path}': {e}"))?;
    parse_network(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_config_fills_reconcile_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            network_path = "network.toml"

            [store]
            kind = "memory"

            [readings.source]
            http_bind_addr = "127.0.0.1:9100"
            channel_capacity = 1024

            [readings.sink]
            max_retries = 3
            retry_backoff_ms = 50
            "#,
        )
        .unwrap();

        assert_eq!(cfg.store.kind, StoreKind::Memory);
        assert_eq!(cfg.readings.sink.workers, 4);
        assert_eq!(cfg.reconcile.gap_reset_after_hours, 48);
        assert_eq!(cfg.reconcile.late_tolerance_ticks, 4);
        let (start, end) = cfg.reconcile.mnf.window().unwrap();
        assert_eq!(start, Time::from_hms(2, 0, 0).unwrap());
        assert_eq!(end, Time::from_hms(4, 0, 0).unwrap());
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn mnf_window_must_be_ordered() {
        let mnf = MnfConfig {
            window_start: "04:00".into(),
            window_end: "02:00".into(),
            delay_secs: 0,
        };
        assert!(mnf.window().is_err());
    }

    #[test]
    fn network_toml_is_validated() {
        let net = parse_network(
            r#"
            subscribers = ["ops"]

            [[zones]]
            id = "red"
            burst_threshold = 5.0

            [[meters]]
            id = "mtr-1"
            input_for = "red"
            digits = 6

            [[meters]]
            id = "mtr-4"
            input_for = "red"
            factor = 2.0
            offset = 17.0
            "#,
        )
        .unwrap();

        assert_eq!(net.zone_inputs("red").len(), 2);
        assert_eq!(net.meter("mtr-4").unwrap().calibration.offset, 17.0);
        assert_eq!(net.meter("mtr-1").unwrap().calibration.digits, Some(6));
        assert_eq!(net.subscribers(), ["ops".to_string()]);

        let err = parse_network(
            r#"
            [[meters]]
            id = "orphan"
            "#,
        );
        assert!(err.is_err());
    }
}
