use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;

use crate::relay::{Routes, DEFAULT_TELEMETRY_CYCLE_MS};
use crate::transport::{ConnectionString, ModuleSettings};

#[derive(Clone, Debug)]
pub struct Config {
    pub connection_string: ConnectionString,
    pub ca_certificate: Option<PathBuf>,
    pub routes: Routes,
    pub telemetry_cycle_ms: NonZeroU64,
    pub message_timeout_ms: u64,
    pub keepalive_secs: u64,
    pub sas_token_ttl_secs: u64,
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    pub simulate_sensors: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str, default: u64| match var(key) {
            None => default,
            Some(raw) => match raw.parse::<u64>() {
                Ok(value) if value > 0 => value,
                _ => {
                    tracing::warn!(key, value = %raw, default, "invalid setting; using default");
                    default
                }
            },
        };

        let connection_string = var("EdgeHubConnectionString")
            .or_else(|| var("IOTHUB_MODULE_CONNECTION_STRING"))
            .context("EdgeHubConnectionString or IOTHUB_MODULE_CONNECTION_STRING is required")?
            .parse::<ConnectionString>()
            .context("invalid module connection string")?;
        let ca_certificate = var("EdgeModuleCACertificateFile").map(PathBuf::from);

        let defaults = Routes::default();
        let routes = Routes {
            input: var("RELAY_INPUT").unwrap_or(defaults.input),
            forward_output: var("RELAY_FORWARD_OUTPUT").unwrap_or(defaults.forward_output),
            sensor_output: var("RELAY_SENSOR_OUTPUT").unwrap_or(defaults.sensor_output),
        };

        let telemetry_cycle_ms = NonZeroU64::new(number(
            "RELAY_TELEMETRY_CYCLE_MS",
            DEFAULT_TELEMETRY_CYCLE_MS,
        ))
        .context("telemetry cycle must be positive")?;
        let message_timeout_ms = number("RELAY_MESSAGE_TIMEOUT_MS", 10_000);
        let keepalive_secs = number("RELAY_KEEPALIVE_SECS", 60);
        let sas_token_ttl_secs = number("RELAY_SAS_TOKEN_TTL_SECS", 86_400);

        let sysfs_root = var("SENSEHAT_SYSFS_ROOT").unwrap_or_else(|| "/sys".to_string());
        let dev_root = var("SENSEHAT_DEV_ROOT").unwrap_or_else(|| "/dev".to_string());
        let simulate_sensors = var("SENSEHAT_SIMULATE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            connection_string,
            ca_certificate,
            routes,
            telemetry_cycle_ms,
            message_timeout_ms,
            keepalive_secs,
            sas_token_ttl_secs,
            sysfs_root: PathBuf::from(sysfs_root),
            dev_root: PathBuf::from(dev_root),
            simulate_sensors,
        })
    }

    pub fn module_settings(&self) -> ModuleSettings {
        ModuleSettings {
            connection_string: self.connection_string.clone(),
            ca_certificate: self.ca_certificate.clone(),
            keep_alive: Duration::from_secs(self.keepalive_secs),
            message_timeout: Duration::from_millis(self.message_timeout_ms),
            sas_token_ttl: Duration::from_secs(self.sas_token_ttl_secs),
        }
    }
}
