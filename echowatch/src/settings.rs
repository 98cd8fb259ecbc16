use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_ECHO_PORT: u16 = 6943;
const DEFAULT_SEND_INTERVAL_MS: u64 = 10;
const DEFAULT_TCP_DEADLINE_MS: u64 = 10;
const DEFAULT_UDP_DEADLINE_MS: u64 = 1000;
const DEFAULT_TCP_REPORT_INTERVAL_MS: u64 = 1000;
const DEFAULT_UDP_REPORT_INTERVAL_MS: u64 = 5000;
const DEFAULT_RESTART_DELAY_MS: u64 = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_SYSFS_ROOT: &str = "/sys/class/net";
const DEFAULT_HTTP_LISTEN: &str = "0.0.0.0:6942";
const DEFAULT_CONFIG_FILE: &str = "echowatch";

/// Echo engine configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct EchoSettings {
    pub port: Option<u16>,
    pub send_interval_ms: Option<u64>,
    pub tcp_deadline_ms: Option<u64>,
    pub udp_deadline_ms: Option<u64>,
    pub tcp_report_interval_ms: Option<u64>,
    pub udp_report_interval_ms: Option<u64>,
    pub restart_delay_ms: Option<u64>,
    pub server_enabled: Option<bool>,
}

impl EchoSettings {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_ECHO_PORT)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms.unwrap_or(DEFAULT_SEND_INTERVAL_MS))
    }

    pub fn tcp_deadline(&self) -> Duration {
        Duration::from_millis(self.tcp_deadline_ms.unwrap_or(DEFAULT_TCP_DEADLINE_MS))
    }

    pub fn udp_deadline(&self) -> Duration {
        Duration::from_millis(self.udp_deadline_ms.unwrap_or(DEFAULT_UDP_DEADLINE_MS))
    }

    pub fn tcp_report_interval(&self) -> Duration {
        Duration::from_millis(
            self.tcp_report_interval_ms
                .unwrap_or(DEFAULT_TCP_REPORT_INTERVAL_MS),
        )
    }

    pub fn udp_report_interval(&self) -> Duration {
        Duration::from_millis(
            self.udp_report_interval_ms
                .unwrap_or(DEFAULT_UDP_REPORT_INTERVAL_MS),
        )
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms.unwrap_or(DEFAULT_RESTART_DELAY_MS))
    }

    pub fn server_enabled(&self) -> bool {
        self.server_enabled.unwrap_or(true)
    }
}

/// Interface counter collection
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct InterfaceSettings {
    pub enabled: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub source: Option<String>,
    pub sysfs_root: Option<String>,
}

impl InterfaceSettings {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS))
    }

    pub fn source(&self) -> &str {
        self.source.as_deref().unwrap_or("sysfs")
    }

    pub fn sysfs_root(&self) -> &str {
        self.sysfs_root.as_deref().unwrap_or(DEFAULT_SYSFS_ROOT)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct HttpSettings {
    pub listen: Option<String>,
}

impl HttpSettings {
    pub fn listen(&self) -> &str {
        self.listen.as_deref().unwrap_or(DEFAULT_HTTP_LISTEN)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub echo: EchoSettings,
    #[serde(default)]
    pub interfaces: InterfaceSettings,
    #[serde(default)]
    pub http: HttpSettings,
}

impl Settings {
    /// Loads `.env`, then the optional YAML file, then `ECHOWATCH__*` variables.
    pub fn new(config_file: Option<&str>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(File::with_name(config_file.unwrap_or(DEFAULT_CONFIG_FILE)).required(false))
            .add_source(
                Environment::with_prefix("ECHOWATCH")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("targets")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects zero periods; tokio intervals cannot tick every 0 ms.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("echo.send_interval_ms", self.echo.send_interval()),
            ("echo.tcp_report_interval_ms", self.echo.tcp_report_interval()),
            ("echo.udp_report_interval_ms", self.echo.udp_report_interval()),
            ("interfaces.poll_interval_ms", self.interfaces.poll_interval()),
        ];
        for (key, period) in periods {
            if period.is_zero() {
                return Err(ConfigError::Message(format!("{} must be greater than 0", key)));
            }
        }
        Ok(())
    }

    /// Configured targets followed by `extra` (usually CLI arguments), deduplicated.
    pub fn all_targets(&self, extra: &[String]) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for target in self.targets.iter().chain(extra) {
            let target = target.trim();
            if !target.is_empty() && !targets.iter().any(|t| t == target) {
                targets.push(target.to_string());
            }
        }
        targets
    }
}
