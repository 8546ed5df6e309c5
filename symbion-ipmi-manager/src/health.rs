use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tracing::{info, warn};

use crate::error::ManagerError;
use crate::manager::ManagerStats;
use crate::protocol::HEALTH_TOPIC;
use crate::transport::ManagerEvent;

#[derive(Debug, Serialize)]
pub struct ManagerHealth {
    pub uptime_seconds: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub stats: ManagerStats,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn report(&self, stats: ManagerStats) -> ManagerHealth {
        ManagerHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            stats,
        }
    }

    /// Publie l'état du manager sur le topic health toutes les `period`
    pub fn spawn_health_publisher(&self, client: AsyncClient, events: mpsc::Sender<ManagerEvent>, period: Duration) {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let stats = match query_stats(&events).await {
                    Ok(stats) => stats,
                    Err(_) => {
                        info!("manager stopped, health publisher exiting");
                        return;
                    }
                };
                let health = tracker.report(stats);
                let Ok(payload) = serde_json::to_string(&health) else {
                    continue;
                };
                if let Err(e) = client.publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                    warn!("failed to publish health: {}", e);
                } else {
                    info!(
                        uptime = health.uptime_seconds,
                        hosts = health.stats.hosts_tracked,
                        backoff = health.stats.hosts_in_backoff,
                        sent = health.stats.requests_sent,
                        "published manager health"
                    );
                }
            }
        });
    }
}

/// Demande un instantané à la boucle du manager
pub async fn query_stats(events: &mpsc::Sender<ManagerEvent>) -> Result<ManagerStats, ManagerError> {
    let (tx, rx) = oneshot::channel();
    events
        .send(ManagerEvent::Stats { reply: tx })
        .await
        .map_err(|_| ManagerError::Stopped)?;
    rx.await.map_err(|_| ManagerError::Stopped)
}
