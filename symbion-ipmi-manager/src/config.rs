use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tracing::warn;

use crate::hosts::BackoffPolicy;
use crate::models::{HostAddress, HostId, ItemId, ItemState, ValueType};
use crate::schedule::ScheduleItem;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ManagerConfig {
    /// Nombre de pollers, fixé au démarrage
    pub pool_size: usize,
    pub host_cache_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Attente max de la boucle sans événement ni échéance
    pub max_idle_ms: u64,
    pub batch_size: usize,
    pub unreachable_period_secs: u64,
    pub unreachable_delay_secs: u64,
    pub unavailable_delay_secs: u64,
    pub worker_loss: WorkerLossPolicy,
    pub command_timeout_secs: u64,
    /// Binaire symbion-ipmi-poller à lancer (pollers externes sinon)
    pub poller_binary: Option<PathBuf>,
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub hosts: HashMap<HostId, HostAddress>,
    pub items: Vec<ItemConf>,
}

/// Comportement quand un poller perd sa connexion
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLossPolicy {
    /// Arrêt du manager
    Fatal,
    /// File conservée, réaffectée au prochain poller qui s'enregistre
    Requeue,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ItemConf {
    pub item_id: ItemId,
    pub host_id: HostId,
    pub sensor: String,
    #[serde(default = "default_value_type")]
    pub value_type: ValueType,
    #[serde(default = "default_delay")]
    pub delay_secs: u64,
}

fn default_value_type() -> ValueType {
    ValueType::Float
}

fn default_delay() -> u64 {
    60
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            host_cache_ttl_secs: 24 * 3600,
            cleanup_interval_secs: 3600,
            max_idle_ms: 1000,
            batch_size: 1000,
            unreachable_period_secs: 45,
            unreachable_delay_secs: 15,
            unavailable_delay_secs: 60,
            worker_loss: WorkerLossPolicy::Fatal,
            command_timeout_secs: 30,
            poller_binary: None,
            mqtt: MqttConf { host: "localhost".into(), port: 1883 },
            http: HttpConf { bind: "0.0.0.0:8081".into() },
            hosts: HashMap::new(),
            items: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn host_cache_ttl(&self) -> Duration {
        Duration::seconds(self.host_cache_ttl_secs as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::seconds(self.cleanup_interval_secs as i64)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::milliseconds(self.max_idle_ms as i64)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            unreachable_period: Duration::seconds(self.unreachable_period_secs as i64),
            unreachable_delay: Duration::seconds(self.unreachable_delay_secs as i64),
            unavailable_delay: Duration::seconds(self.unavailable_delay_secs as i64),
        }
    }

    /// Items de la config en planning, tous dus au démarrage
    pub fn schedule_items(&self, now: OffsetDateTime) -> Vec<ScheduleItem> {
        self.items
            .iter()
            .map(|item| ScheduleItem {
                item_id: item.item_id,
                host_id: item.host_id,
                sensor: item.sensor.clone(),
                value_type: item.value_type,
                state: ItemState::Normal,
                delay: Duration::seconds(item.delay_secs.max(1) as i64),
                next_check: now,
            })
            .collect()
    }
}

pub fn parse_config(txt: &str) -> Result<ManagerConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(ManagerConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> ManagerConfig {
    let path = std::env::var("SYMBION_IPMI_CONFIG").unwrap_or_else(|_| "ipmi-manager.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("config invalide ({path}): {e}");
            ManagerConfig::default()
        })
    } else {
        warn!("pas de {path}, usage config par défaut");
        ManagerConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_defaults() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.pool_size, 4);
        assert_eq!(cfg.host_cache_ttl(), Duration::hours(24));
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.worker_loss, WorkerLossPolicy::Fatal);
        assert_eq!(cfg.backoff_policy().unreachable_delay, Duration::seconds(15));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
pool_size: 2
worker_loss: requeue
hosts:
  10:
    address: 192.168.1.50
    username: admin
    password: secret
    privilege: ADMINISTRATOR
items:
  - item_id: 100
    host_id: 10
    sensor: CPU Temp
    delay_secs: 30
  - item_id: 101
    host_id: 10
    sensor: Fan 1
    value_type: unsigned
"#;
        let cfg = parse_config(yaml).unwrap();
        assert_eq!(cfg.pool_size, 2);
        assert_eq!(cfg.worker_loss, WorkerLossPolicy::Requeue);
        assert_eq!(cfg.mqtt.port, 1883);
        let host = &cfg.hosts[&10];
        assert_eq!(host.port, 623);
        assert_eq!(host.privilege, "ADMINISTRATOR");

        let now = datetime!(2024-05-01 10:00 UTC);
        let items = cfg.schedule_items(now);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].delay, Duration::seconds(30));
        assert_eq!(items[1].value_type, ValueType::Unsigned);
        assert_eq!(items[1].delay, Duration::seconds(60));
        assert!(items.iter().all(|i| i.next_check == now));
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        assert_eq!(parse_config("  \n").unwrap().pool_size, 4);
        assert!(parse_config("pool_size: [").is_err());
    }
}
