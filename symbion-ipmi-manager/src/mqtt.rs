/**
 * PONT MQTT - Transport entre le manager et les pollers externes
 *
 * RÔLE :
 * - Abonnements register / result / gone (last will des pollers)
 * - Traduction de chaque publication en `ManagerEvent` pour la boucle du manager
 * - `MqttLink` : envoi des requêtes sur le topic du poller
 *
 * Le client est partagé (health publie avec le même), la boucle d'événements
 * rumqttc vit ici.
 */

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::protocol::{self, WorkerMessage, WorkerRequest};
use crate::transport::{LinkError, ManagerEvent, WorkerLink};

pub fn create_mqtt_client(client_id: &str, conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    opts.set_clean_session(true);
    AsyncClient::new(opts, 64)
}

/// Lien vers un poller : publie sur `symbion/ipmi/{worker}/request@v1`
pub struct MqttLink {
    client: AsyncClient,
    topic: String,
    closed: AtomicBool,
}

impl MqttLink {
    pub fn new(client: AsyncClient, worker: &str) -> Self {
        Self {
            client,
            topic: protocol::request_topic(worker),
            closed: AtomicBool::new(false),
        }
    }
}

impl WorkerLink for MqttLink {
    fn send(&self, request: &WorkerRequest) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(LinkError::Closed);
        }
        let payload = serde_json::to_vec(request)?;
        self.client
            .try_publish(&self.topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| LinkError::Mqtt(e.to_string()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Publication entrante décodée
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Register { worker: String, family: String },
    Message { worker: String, message: WorkerMessage },
    Gone { worker: String },
}

/// Décode une publication reçue. None pour un topic inconnu ou un JSON invalide.
pub fn decode_publish(topic: &str, payload: &[u8]) -> Option<Inbound> {
    if topic == protocol::REGISTER_TOPIC {
        return match serde_json::from_slice::<WorkerMessage>(payload) {
            Ok(WorkerMessage::Register { family, worker }) => Some(Inbound::Register { worker, family }),
            Ok(other) => {
                warn!("unexpected message on register topic: {:?}", other);
                None
            }
            Err(e) => {
                warn!("invalid register JSON: {}", e);
                None
            }
        };
    }

    let worker = protocol::worker_from_topic(topic)?.to_string();
    if topic == protocol::gone_topic(&worker) {
        return Some(Inbound::Gone { worker });
    }
    if topic == protocol::result_topic(&worker) {
        return match serde_json::from_slice::<WorkerMessage>(payload) {
            Ok(message) => Some(Inbound::Message { worker, message }),
            Err(e) => {
                warn!(%worker, "invalid result JSON: {}", e);
                None
            }
        };
    }
    None
}

fn subscribe_all(client: &AsyncClient) {
    for topic in [protocol::REGISTER_TOPIC, protocol::RESULT_FILTER, protocol::GONE_FILTER] {
        if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
            error!("subscribe {} failed: {}", topic, e);
        }
    }
}

/// Fait tourner la boucle rumqttc jusqu'à l'arrêt du manager
pub async fn run_bridge(
    client: AsyncClient,
    mut eventloop: EventLoop,
    events: mpsc::Sender<ManagerEvent>,
    health: HealthTracker,
) {
    loop {
        let inbound = match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("MQTT connected, subscribing to poller topics");
                health.mark_mqtt_connected();
                // session propre : abonnements perdus à chaque reconnexion
                subscribe_all(&client);
                continue;
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => decode_publish(&p.topic, &p.payload),
            Ok(_) => continue,
            Err(e) => {
                error!("MQTT error: {}", e);
                health.increment_reconnects();
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let event = match inbound {
            Some(Inbound::Register { worker, family }) => {
                debug!(%worker, "poller registration");
                ManagerEvent::Connected {
                    link: Box::new(MqttLink::new(client.clone(), &worker)),
                    conn: worker,
                    family,
                }
            }
            Some(Inbound::Message { worker, message }) => ManagerEvent::Message { conn: worker, message },
            Some(Inbound::Gone { worker }) => ManagerEvent::Disconnected { conn: worker },
            None => continue,
        };

        if events.send(event).await.is_err() {
            info!("manager stopped, MQTT bridge exiting");
            return;
        }
    }
}
