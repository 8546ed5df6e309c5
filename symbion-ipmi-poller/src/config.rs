//! Poller configuration, read from the environment set by the manager
//!
//! Required: `SYMBION_IPMI_FAMILY`, `SYMBION_IPMI_WORKER`.
//! Optional: `SYMBION_MQTT_HOST` / `SYMBION_MQTT_PORT` (localhost:1883),
//! `SYMBION_IPMITOOL` (ipmitool), `SYMBION_IPMI_TIMEOUT_SECS` (10).

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub family: String,
    pub worker: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    /// ipmitool invocation split shell-style, e.g. `sudo -n ipmitool`
    pub ipmitool: Vec<String>,
    pub timeout: Duration,
}

impl PollerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let family = lookup("SYMBION_IPMI_FAMILY").ok_or_else(|| anyhow!("SYMBION_IPMI_FAMILY is not set"))?;
        let worker = lookup("SYMBION_IPMI_WORKER").ok_or_else(|| anyhow!("SYMBION_IPMI_WORKER is not set"))?;

        let mqtt_port = match lookup("SYMBION_MQTT_PORT") {
            Some(port) => port.parse().with_context(|| format!("invalid SYMBION_MQTT_PORT '{}'", port))?,
            None => 1883,
        };

        let ipmitool_line = lookup("SYMBION_IPMITOOL").unwrap_or_else(|| "ipmitool".to_string());
        let ipmitool = shell_words::split(&ipmitool_line)
            .with_context(|| format!("invalid SYMBION_IPMITOOL '{}'", ipmitool_line))?;
        if ipmitool.is_empty() {
            return Err(anyhow!("SYMBION_IPMITOOL is empty"));
        }

        let timeout_secs: u64 = match lookup("SYMBION_IPMI_TIMEOUT_SECS") {
            Some(secs) => secs
                .parse()
                .with_context(|| format!("invalid SYMBION_IPMI_TIMEOUT_SECS '{}'", secs))?,
            None => 10,
        };

        Ok(Self {
            family,
            worker,
            mqtt_host: lookup("SYMBION_MQTT_HOST").unwrap_or_else(|| "localhost".to_string()),
            mqtt_port,
            ipmitool,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        })
    }
}
