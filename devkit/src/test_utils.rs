/*!
Test Harness pour le manager IPMI

Facilite l'écriture de tests du coordinateur avec:
- Manager construit sur des collaborateurs enregistreurs
- Pollers simulés par des `MockWorkerLink`
- Horloge virtuelle (`now`), avancée explicitement par le test
*/

use std::collections::HashMap;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use tokio::sync::oneshot;

use symbion_ipmi_manager::models::{CommandReply, ErrorClass, HostId, ItemId, ItemState, ValueType};
use symbion_ipmi_manager::protocol::{WorkerMessage, WorkerRequest};
use symbion_ipmi_manager::schedule::ScheduleItem;
use symbion_ipmi_manager::{Manager, ManagerConfig, ManagerError};

use crate::link_stub::MockWorkerLink;
use crate::recorders::{RecordingDirectory, RecordingHistory, RecordingSchedule};

/// Instant de départ de l'horloge virtuelle
pub const T0: OffsetDateTime = datetime!(2024-05-01 10:00 UTC);

pub const FAMILY: &str = "test-family";

/// Item capteur dû à `next_check`, relu toutes les `delay_secs`
pub fn sensor_item(item_id: ItemId, host_id: HostId, delay_secs: i64, next_check: OffsetDateTime) -> ScheduleItem {
    ScheduleItem {
        item_id,
        host_id,
        sensor: format!("Sensor {}", item_id),
        value_type: ValueType::Float,
        state: ItemState::Normal,
        delay: Duration::seconds(delay_secs),
        next_check,
    }
}

/// Harness de test complet pour le manager
pub struct TestHarness {
    pub manager: Manager,
    pub schedule: RecordingSchedule,
    pub history: RecordingHistory,
    pub directory: RecordingDirectory,
    pub now: OffsetDateTime,
    /// Lien courant de chaque poller enregistré (par index)
    links: HashMap<usize, (String, MockWorkerLink)>,
    next_conn: usize,
}

impl TestHarness {
    /// `pool_size` pollers tous enregistrés, hôtes 1..=64 connus, pas d'items
    pub fn new(pool_size: usize) -> Self {
        let config = ManagerConfig {
            pool_size,
            ..ManagerConfig::default()
        };
        let mut harness = Self::with_config(config, Vec::new());
        harness.register_all();
        harness
    }

    /// Manager sans poller enregistré
    pub fn with_config(config: ManagerConfig, items: Vec<ScheduleItem>) -> Self {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        let schedule = RecordingSchedule::new(items);
        let history = RecordingHistory::new();
        let directory = RecordingDirectory::new(1..=64);
        let manager = Manager::new(
            &config,
            FAMILY,
            Box::new(schedule.clone()),
            Box::new(history.clone()),
            Box::new(directory.clone()),
        );

        Self {
            manager,
            schedule,
            history,
            directory,
            now: T0,
            links: HashMap::new(),
            next_conn: 0,
        }
    }

    /// Enregistre un nouveau poller avec l'identité de famille donnée
    pub fn register_as(&mut self, family: &str) -> (Result<usize, ManagerError>, MockWorkerLink) {
        let conn = format!("conn-{}", self.next_conn);
        self.next_conn += 1;
        let link = MockWorkerLink::new();
        let result = self
            .manager
            .on_worker_register(conn.clone(), Box::new(link.clone()), family, self.now);
        if let Ok(index) = result {
            self.links.insert(index, (conn, link.clone()));
        }
        (result, link)
    }

    pub fn register(&mut self) -> Result<usize, ManagerError> {
        self.register_as(FAMILY).0
    }

    pub fn register_all(&mut self) {
        for _ in 0..self.manager.pool_size() {
            self.register().ok();
        }
    }

    pub fn link(&self, worker: usize) -> &MockWorkerLink {
        &self.links[&worker].1
    }

    pub fn conn(&self, worker: usize) -> &str {
        &self.links[&worker].0
    }

    /// Requêtes reçues par un poller depuis le dernier appel (cleanup exclus)
    pub fn drain(&self, worker: usize) -> Vec<WorkerRequest> {
        self.link(worker)
            .take_sent()
            .into_iter()
            .filter(|r| !matches!(r, WorkerRequest::Cleanup))
            .collect()
    }

    pub fn advance(&mut self, secs: i64) {
        self.now += Duration::seconds(secs);
    }

    pub fn tick(&mut self) -> Result<(), ManagerError> {
        self.manager.on_schedule_tick(self.now)
    }

    pub fn cleanup_tick(&mut self) -> Result<(), ManagerError> {
        self.manager.on_host_cleanup_tick(self.now)
    }

    /// Commande client; le receiver joue le rôle du client
    pub fn command(
        &mut self,
        host_id: HostId,
        payload: serde_json::Value,
    ) -> Result<oneshot::Receiver<CommandReply>, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.manager.on_command_request(host_id, payload, tx, self.now)?;
        Ok(rx)
    }

    /// `seq` de la requête en vol du poller (0 si aucune)
    pub fn in_flight_seq(&self, worker: usize) -> u64 {
        self.manager
            .worker(worker)
            .and_then(|w| w.in_flight())
            .map(|r| r.seq)
            .unwrap_or(0)
    }

    /// Résultat de la requête en vol, `seq` renseigné automatiquement
    pub fn sensor_result(
        &mut self,
        worker: usize,
        item_id: ItemId,
        class: ErrorClass,
        text: &str,
    ) -> Result<(), ManagerError> {
        let message = WorkerMessage::SensorResult {
            seq: self.in_flight_seq(worker),
            item_id,
            timestamp: self.now,
            class,
            text: text.to_string(),
        };
        self.send_message(worker, message)
    }

    pub fn command_result(&mut self, worker: usize, payload: serde_json::Value) -> Result<(), ManagerError> {
        let seq = self.in_flight_seq(worker);
        self.send_message(worker, WorkerMessage::CommandResult { seq, payload })
    }

    /// Message brut d'un poller, tel que reçu du transport
    pub fn send_message(&mut self, worker: usize, message: WorkerMessage) -> Result<(), ManagerError> {
        let conn = self.conn(worker).to_string();
        self.manager.on_worker_result(&conn, message, self.now)
    }

    pub fn disconnect(&mut self, worker: usize) -> Result<(), ManagerError> {
        let conn = self.conn(worker).to_string();
        self.manager.on_worker_disconnect(&conn)
    }

    /// Index du poller affecté à l'hôte, s'il est dans le registre
    pub fn worker_of(&self, host_id: HostId) -> Option<usize> {
        self.manager.host(host_id).map(|e| e.worker)
    }
}
