//! Symbion IPMI Poller - worker process for the Symbion IPMI manager
//!
//! One poller serves the hosts the manager assigned to it:
//! - Registers over MQTT with the manager's family identity
//! - Executes one request at a time with ipmitool (sensor reads, power commands)
//! - Publishes a last will so the manager notices when it goes away

mod config;
mod execution;

use anyhow::{Context, Result};
use config::PollerConfig;
use execution::IpmiExecutor;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use symbion_ipmi_manager::protocol::{self, WorkerMessage, WorkerRequest};

/// Main poller state
struct Poller {
    config: PollerConfig,
    mqtt_client: AsyncClient,
    executor: IpmiExecutor,
    requests: mpsc::Receiver<WorkerRequest>,
}

impl Poller {
    /// Create the poller and start its MQTT event loop
    fn new(config: PollerConfig) -> Self {
        info!("Initializing Symbion IPMI poller {}", config.worker);

        let mut mqtt_options = MqttOptions::new(&config.worker, &config.mqtt_host, config.mqtt_port);
        mqtt_options.set_keep_alive(Duration::from_secs(15));
        mqtt_options.set_clean_session(true);
        mqtt_options.set_last_will(LastWill::new(
            protocol::gone_topic(&config.worker),
            Vec::new(),
            QoS::AtLeastOnce,
            false,
        ));

        let (mqtt_client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
        let (tx, requests) = mpsc::channel(64);

        // Register (again) on every connection: the manager treats a repeated
        // registration on the same worker id as a no-op
        let client = mqtt_client.clone();
        let request_topic = protocol::request_topic(&config.worker);
        let registration = WorkerMessage::Register {
            family: config.family.clone(),
            worker: config.worker.clone(),
        };
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        if let Err(e) = client.try_subscribe(&request_topic, QoS::AtLeastOnce) {
                            error!("Failed to subscribe to {}: {}", request_topic, e);
                        }
                        match serde_json::to_vec(&registration) {
                            Ok(payload) => {
                                if let Err(e) = client.try_publish(protocol::REGISTER_TOPIC, QoS::AtLeastOnce, false, payload) {
                                    error!("Failed to publish registration: {}", e);
                                } else {
                                    info!("Registration sent");
                                }
                            }
                            Err(e) => error!("Failed to serialize registration: {}", e),
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) if publish.topic == request_topic => {
                        match serde_json::from_slice::<WorkerRequest>(&publish.payload) {
                            Ok(request) => {
                                if tx.send(request).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("Invalid request JSON: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        let executor = IpmiExecutor::new(config.ipmitool.clone(), config.timeout);
        Poller {
            config,
            mqtt_client,
            executor,
            requests,
        }
    }

    /// Serve requests one at a time until the MQTT loop stops
    async fn run(&mut self) -> Result<()> {
        info!("Waiting for requests on {}", protocol::request_topic(&self.config.worker));

        while let Some(request) = self.requests.recv().await {
            let reply = match request {
                WorkerRequest::SensorRead { seq, item_id, host, sensor } => {
                    let (class, text) = self.executor.read_sensor(&host, &sensor).await;
                    debug!("Item {} on {}: {:?} {}", item_id, host.address, class, text);
                    WorkerMessage::SensorResult {
                        seq,
                        item_id,
                        timestamp: OffsetDateTime::now_utc(),
                        class,
                        text,
                    }
                }
                WorkerRequest::Command { seq, host_id, host, payload } => {
                    let result = self.executor.execute_command(&host, &payload).await;
                    info!("Command on host {} finished (success: {})", host_id, result.success);
                    WorkerMessage::CommandResult {
                        seq,
                        payload: serde_json::to_value(&result).context("Failed to serialize command result")?,
                    }
                }
                WorkerRequest::Cleanup => {
                    self.executor.cleanup();
                    continue;
                }
            };
            self.publish(&reply).await?;
        }
        Ok(())
    }

    async fn publish(&self, message: &WorkerMessage) -> Result<()> {
        let payload = serde_json::to_vec(message).context("Failed to serialize result")?;
        self.mqtt_client
            .publish(protocol::result_topic(&self.config.worker), QoS::AtLeastOnce, false, payload)
            .await
            .context("Failed to publish result")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = PollerConfig::from_env().context("Invalid poller environment")?;
    let mut poller = Poller::new(config);

    tokio::select! {
        res = poller.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    }
}
