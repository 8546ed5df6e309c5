/**
 * POOL DE POLLERS - Lancement des processus symbion-ipmi-poller
 *
 * RÔLE :
 * Démarre `pool_size` pollers enfants quand `poller_binary` est configuré.
 * Chaque enfant reçoit par variables d'environnement l'identité de famille
 * du manager (vérifiée à l'enregistrement), son identifiant et le broker MQTT.
 *
 * CYCLE DE VIE : enfants tués à la destruction du pool (kill_on_drop).
 * La perte d'un poller remonte au manager par le last will MQTT, pas ici.
 */

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::MqttConf;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("poller binary not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to start poller {index}: {source}")]
    StartFailed {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

pub struct PollerPool {
    children: Vec<(String, Child)>,
}

/// Identifiant MQTT du poller `index` de la famille
pub fn worker_id(family: &str, index: usize) -> String {
    let short: String = family.chars().take(8).collect();
    format!("poller-{}-{}", short, index)
}

/// Variables d'environnement passées à un poller
pub fn poller_env(family: &str, index: usize, mqtt: &MqttConf) -> Vec<(&'static str, String)> {
    vec![
        ("SYMBION_IPMI_FAMILY", family.to_string()),
        ("SYMBION_IPMI_WORKER", worker_id(family, index)),
        ("SYMBION_MQTT_HOST", mqtt.host.clone()),
        ("SYMBION_MQTT_PORT", mqtt.port.to_string()),
    ]
}

impl PollerPool {
    pub fn spawn(binary: &Path, pool_size: usize, family: &str, mqtt: &MqttConf) -> Result<Self, PoolError> {
        if !binary.exists() {
            return Err(PoolError::NotFound(binary.to_path_buf()));
        }

        let mut children = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let mut cmd = Command::new(binary);
            cmd.stdin(Stdio::null()).kill_on_drop(true);
            for (k, v) in poller_env(family, index, mqtt) {
                cmd.env(k, v);
            }

            let child = cmd.spawn().map_err(|source| PoolError::StartFailed { index, source })?;
            let worker = worker_id(family, index);
            info!(%worker, pid = child.id(), "poller started");
            children.push((worker, child));
        }
        Ok(Self { children })
    }

    /// Pollers encore vivants; journalise ceux qui se sont terminés
    pub fn reap(&mut self) -> usize {
        self.children.retain_mut(|(worker, child)| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(%worker, %status, "poller exited");
                false
            }
            Err(e) => {
                warn!(%worker, "poller status unavailable: {}", e);
                true
            }
        });
        self.children.len()
    }

    pub async fn shutdown(&mut self) {
        for (worker, child) in &mut self.children {
            if let Err(e) = child.kill().await {
                warn!(%worker, "kill failed: {}", e);
            }
        }
        self.children.clear();
    }
}
