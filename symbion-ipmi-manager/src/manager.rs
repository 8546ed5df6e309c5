/**
 * MANAGER - Coordinateur des pollers IPMI
 *
 * RÔLE :
 * - Boucle unique propriétaire de tout l'état (pollers, registre d'hôtes, balancer)
 * - Tirage du planning, routage hôte → poller, une requête en vol par poller
 * - Circuit breaker : requêtes pour un hôte en backoff sautées sans tentative réseau
 * - Retour des résultats vers l'historique, le planning ou le client d'une commande
 *
 * ENTRÉES : un seul channel de `ManagerEvent` (transports, API REST, health).
 * Les opérations synchrones prennent `now` en paramètre : testables sans horloge.
 */

use serde::Serialize;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::balancer::LoadBalancer;
use crate::config::{ManagerConfig, WorkerLossPolicy};
use crate::directory::HostDirectory;
use crate::error::ManagerError;
use crate::history::HistorySink;
use crate::hosts::{BackoffPolicy, HostEntry, HostRegistry};
use crate::models::{
    CommandReply, ErrorClass, HostId, ItemId, ItemState, ReplyToken, Request, RequestClass, RequestKind, ValueType,
};
use crate::protocol::{WorkerMessage, WorkerRequest};
use crate::schedule::ScheduleSource;
use crate::transport::{ConnectionId, ManagerEvent, WorkerLink};
use crate::worker::WorkerHandle;

/// Vue instantanée d'un poller
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub index: usize,
    pub bound: bool,
    pub connection: Option<String>,
    pub assigned_hosts: usize,
    pub queued: usize,
    pub in_flight: Option<RequestClass>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub workers: Vec<WorkerStats>,
    pub hosts_tracked: usize,
    pub hosts_in_backoff: usize,
    pub requests_sent: u64,
    pub requests_skipped: u64,
    pub results_received: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: u64,
    skipped: u64,
    results: u64,
}

pub struct Manager {
    family: String,
    workers: Vec<WorkerHandle>,
    connections: HashMap<ConnectionId, usize>,
    balancer: LoadBalancer,
    hosts: HostRegistry,
    policy: BackoffPolicy,
    schedule: Box<dyn ScheduleSource>,
    history: Box<dyn HistorySink>,
    directory: Box<dyn HostDirectory>,
    batch_size: usize,
    max_idle: Duration,
    cleanup_interval: Duration,
    worker_loss: WorkerLossPolicy,
    next_seq: u64,
    counters: Counters,
}

impl Manager {
    /// Crée `pool_size` pollers non connectés (au moins un). `family` est
    /// l'identité que chaque poller doit présenter à l'enregistrement.
    pub fn new(
        config: &ManagerConfig,
        family: impl Into<String>,
        schedule: Box<dyn ScheduleSource>,
        history: Box<dyn HistorySink>,
        directory: Box<dyn HostDirectory>,
    ) -> Self {
        let pool_size = config.pool_size.max(1);
        let policy = config.backoff_policy();
        Self {
            family: family.into(),
            workers: (0..pool_size).map(WorkerHandle::new).collect(),
            connections: HashMap::new(),
            balancer: LoadBalancer::new(pool_size),
            hosts: HostRegistry::new(config.host_cache_ttl(), policy),
            policy,
            schedule,
            history,
            directory,
            batch_size: config.batch_size.max(1),
            max_idle: config.max_idle(),
            cleanup_interval: config.cleanup_interval(),
            worker_loss: config.worker_loss,
            next_seq: 0,
            counters: Counters::default(),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&self, index: usize) -> Option<&WorkerHandle> {
        self.workers.get(index)
    }

    pub fn host(&self, host_id: HostId) -> Option<&HostEntry> {
        self.hosts.get(host_id)
    }

    pub fn assigned_hosts(&self, index: usize) -> usize {
        self.balancer.assigned_hosts(index)
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Enregistre un poller sur le premier handle libre (ordre de création)
    /// puis vide immédiatement la file de ce handle.
    pub fn on_worker_register(
        &mut self,
        conn: ConnectionId,
        link: Box<dyn WorkerLink>,
        family: &str,
        now: OffsetDateTime,
    ) -> Result<usize, ManagerError> {
        if family != self.family {
            link.close();
            return Err(ManagerError::Rejected(format!("connection {} belongs to another manager", conn)));
        }
        if let Some(&index) = self.connections.get(&conn) {
            // ré-enregistrement sur la même connexion : le lien existant reste en place
            link.close();
            return Ok(index);
        }
        let Some(index) = self.workers.iter().position(|w| !w.is_bound()) else {
            link.close();
            return Err(ManagerError::PoolFull(self.workers.len()));
        };

        self.workers[index].bind(conn.clone(), link);
        info!(worker = index, %conn, queued = self.workers[index].queue_len(), "poller registered");
        self.connections.insert(conn, index);
        self.pump_queue(index, now)?;
        Ok(index)
    }

    /// Tire les items dus (par lots bornés) et les route vers leur poller
    pub fn on_schedule_tick(&mut self, now: OffsetDateTime) -> Result<(), ManagerError> {
        let due = self.schedule.pull_due(now, self.batch_size);
        if !due.is_empty() {
            debug!(count = due.len(), "sensor reads due");
        }
        for item in due {
            let Some(host) = self.directory.lookup(item.host_id) else {
                let reason = ManagerError::UnknownHost(item.host_id).to_string();
                warn!(item_id = item.item_id, host_id = item.host_id, "{}", reason);
                self.history
                    .emit(item.item_id, item.value_type, now, ItemState::NotSupported, &reason);
                self.schedule
                    .requeue(item.item_id, ItemState::NotSupported, now, ErrorClass::ConfigError);
                continue;
            };
            let seq = self.next_seq();
            let request = Request {
                seq,
                host_id: item.host_id,
                kind: RequestKind::SensorRead {
                    item_id: item.item_id,
                    item_state: item.state,
                    value_type: item.value_type,
                },
                message: WorkerRequest::SensorRead {
                    seq,
                    item_id: item.item_id,
                    host,
                    sensor: item.sensor,
                },
            };
            self.dispatch(request, now)?;
        }
        Ok(())
    }

    /// Commande d'un client : la réponse part sur `reply`, quoi qu'il arrive
    pub fn on_command_request(
        &mut self,
        host_id: HostId,
        payload: serde_json::Value,
        reply: oneshot::Sender<CommandReply>,
        now: OffsetDateTime,
    ) -> Result<(), ManagerError> {
        let token = ReplyToken::new(reply);
        let Some(host) = self.directory.lookup(host_id) else {
            token.deliver(Err(ManagerError::UnknownHost(host_id)));
            return Ok(());
        };
        let seq = self.next_seq();
        let request = Request {
            seq,
            host_id,
            kind: RequestKind::Command { reply: token },
            message: WorkerRequest::Command { seq, host_id, host, payload },
        };
        self.dispatch(request, now)
    }

    /// Route la requête vers le poller de l'hôte (affecté à la première vue)
    pub fn dispatch(&mut self, request: Request, now: OffsetDateTime) -> Result<(), ManagerError> {
        let Some(worker) = self.hosts.resolve(request.host_id, now, &mut self.balancer).map(|e| e.worker) else {
            // pool vide : impossible avec pool_size >= 1
            let until = now + self.policy.unreachable_delay;
            self.skip(request, until);
            return Ok(());
        };
        self.workers[worker].enqueue(request);
        self.pump_queue(worker, now)
    }

    /// Tant que le poller est libre : sort la requête la plus prioritaire,
    /// saute celles dont l'hôte est en backoff, envoie la première restante.
    pub fn pump_queue(&mut self, index: usize, now: OffsetDateTime) -> Result<(), ManagerError> {
        loop {
            let Some(handle) = self.workers.get_mut(index) else {
                return Ok(());
            };
            if !handle.is_idle() {
                return Ok(());
            }
            let Some(request) = handle.pop_next() else {
                return Ok(());
            };

            if self.hosts.is_skippable(request.host_id, now) {
                let until = self
                    .hosts
                    .get(request.host_id)
                    .and_then(|e| e.unreachable_until)
                    .unwrap_or(now);
                self.skip(request, until);
                continue;
            }

            match self.workers[index].send(request) {
                Ok(()) => {
                    self.counters.sent += 1;
                    return Ok(());
                }
                Err(e) => {
                    error!(worker = index, error = %e, "send to poller failed");
                    return self.lose_worker(index);
                }
            }
        }
    }

    /// Abandon sans tentative réseau : l'item repasse à la fin du backoff,
    /// la commande reçoit une erreur immédiate
    fn skip(&mut self, request: Request, until: OffsetDateTime) {
        self.counters.skipped += 1;
        let host_id = request.host_id;
        match request.kind {
            RequestKind::SensorRead { item_id, item_state, .. } => {
                debug!(host_id, item_id, "host in backoff, sensor read skipped");
                self.schedule.requeue(item_id, item_state, until, ErrorClass::NetworkError);
            }
            RequestKind::Command { reply } => {
                debug!(host_id, "host in backoff, command refused");
                reply.deliver(Err(ManagerError::HostUnreachable(host_id)));
            }
        }
    }

    /// Résultat d'un poller : libère le slot en vol, applique le résultat,
    /// puis envoie la requête suivante. Un résultat dont le `seq` n'est pas
    /// celui de la requête en vol (doublon après reconnexion, résultat
    /// périmé) est rejeté sans toucher au slot.
    pub fn on_worker_result(
        &mut self,
        conn: &str,
        message: WorkerMessage,
        now: OffsetDateTime,
    ) -> Result<(), ManagerError> {
        let index = *self
            .connections
            .get(conn)
            .ok_or_else(|| ManagerError::UnknownConnection(conn.to_string()))?;
        let handle = &mut self.workers[index];
        let in_flight_seq = handle.in_flight().map(|r| r.seq);

        match message {
            WorkerMessage::SensorResult { seq, item_id, timestamp, class, text } => {
                if in_flight_seq != Some(seq) || handle.in_flight().and_then(|r| r.item_id()) != Some(item_id) {
                    return Err(ManagerError::Protocol {
                        worker: index,
                        reason: format!("unexpected result for item {} (seq {})", item_id, seq),
                    });
                }
                let Some(request) = handle.take_in_flight() else {
                    return Ok(());
                };
                let RequestKind::SensorRead { item_state, value_type, .. } = request.kind else {
                    return Ok(());
                };
                self.counters.results += 1;
                self.apply_sensor_result(request.host_id, item_id, item_state, value_type, timestamp, class, &text, now);
            }
            WorkerMessage::CommandResult { seq, payload } => {
                if in_flight_seq != Some(seq) || handle.in_flight().map(|r| r.class()) != Some(RequestClass::Command) {
                    return Err(ManagerError::Protocol {
                        worker: index,
                        reason: format!("unexpected command result (seq {})", seq),
                    });
                }
                let Some(request) = handle.take_in_flight() else {
                    return Ok(());
                };
                self.counters.results += 1;
                if let RequestKind::Command { reply } = request.kind {
                    if !reply.deliver(Ok(payload)) {
                        debug!(host_id = request.host_id, "command client gone, result discarded");
                    }
                }
            }
            WorkerMessage::Register { .. } => {
                return Err(ManagerError::Protocol {
                    worker: index,
                    reason: "register on an already bound connection".into(),
                });
            }
        }

        self.pump_queue(index, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_sensor_result(
        &mut self,
        host_id: HostId,
        item_id: ItemId,
        item_state: ItemState,
        value_type: ValueType,
        timestamp: OffsetDateTime,
        class: ErrorClass,
        text: &str,
        now: OffsetDateTime,
    ) {
        match class {
            ErrorClass::Success => {
                self.host_responded(host_id, now);
                self.history.emit(item_id, value_type, timestamp, ItemState::Normal, text);
                self.schedule.requeue(item_id, ItemState::Normal, timestamp, class);
            }
            ErrorClass::NotSupported => {
                self.host_responded(host_id, now);
                self.history.emit(item_id, value_type, timestamp, ItemState::NotSupported, text);
                self.schedule.requeue(item_id, ItemState::NotSupported, timestamp, class);
            }
            ErrorClass::ConfigError => {
                self.history.emit(item_id, value_type, timestamp, ItemState::NotSupported, text);
                self.schedule.requeue(item_id, ItemState::NotSupported, timestamp, class);
            }
            ErrorClass::NetworkError | ErrorClass::GatewayError | ErrorClass::TimeoutError => {
                let until = match self.hosts.record_link_error(host_id, now) {
                    Some(backoff) => {
                        if backoff.became_unavailable {
                            self.directory.deactivate_host(host_id, now, text);
                        }
                        backoff.until
                    }
                    // entrée évincée entre-temps
                    None => now + self.policy.unreachable_delay,
                };
                debug!(host_id, item_id, ?class, %until, "link error, host in backoff");
                self.schedule.requeue(item_id, item_state, until, class);
            }
        }
    }

    fn host_responded(&mut self, host_id: HostId, now: OffsetDateTime) {
        if self.hosts.mark_reachable(host_id, now) {
            self.directory.activate_host(host_id, now, "host responded");
        }
    }

    /// Éviction TTL du cache d'hôtes et notice de cleanup à chaque poller connecté
    pub fn on_host_cleanup_tick(&mut self, now: OffsetDateTime) -> Result<(), ManagerError> {
        let evicted = self.hosts.sweep(now, &mut self.balancer);
        for entry in &evicted {
            debug!(host_id = entry.host_id, worker = entry.worker, "host evicted");
        }

        let failed: Vec<usize> = self
            .workers
            .iter()
            .filter(|w| w.is_bound())
            .filter_map(|w| w.notify(&WorkerRequest::Cleanup).err().map(|_| w.index))
            .collect();
        for index in failed {
            warn!(worker = index, "cleanup notice failed");
            self.lose_worker(index)?;
        }
        Ok(())
    }

    /// Perte de la connexion d'un poller (last will, fin de tâche...)
    pub fn on_worker_disconnect(&mut self, conn: &str) -> Result<(), ManagerError> {
        let index = self
            .connections
            .get(conn)
            .copied()
            .ok_or_else(|| ManagerError::UnknownConnection(conn.to_string()))?;
        self.lose_worker(index)
    }

    fn lose_worker(&mut self, index: usize) -> Result<(), ManagerError> {
        self.connections.retain(|_, bound| *bound != index);
        self.workers[index].unbind();
        match self.worker_loss {
            WorkerLossPolicy::Fatal => Err(ManagerError::WorkerLost(index)),
            WorkerLossPolicy::Requeue => {
                warn!(
                    worker = index,
                    queued = self.workers[index].queue_len(),
                    "poller lost, requests kept for the next registration"
                );
                Ok(())
            }
        }
    }

    pub fn stats(&self, now: OffsetDateTime) -> ManagerStats {
        ManagerStats {
            workers: self
                .workers
                .iter()
                .map(|w| WorkerStats {
                    index: w.index,
                    bound: w.is_bound(),
                    connection: w.connection().map(str::to_string),
                    assigned_hosts: self.balancer.assigned_hosts(w.index),
                    queued: w.queue_len(),
                    in_flight: w.in_flight().map(|r| r.class()),
                })
                .collect(),
            hosts_tracked: self.hosts.tracked(),
            hosts_in_backoff: self.hosts.in_backoff(now),
            requests_sent: self.counters.sent,
            requests_skipped: self.counters.skipped,
            results_received: self.counters.results,
        }
    }

    pub fn handle_event(&mut self, event: ManagerEvent, now: OffsetDateTime) -> Result<(), ManagerError> {
        match event {
            ManagerEvent::Connected { conn, link, family } => {
                self.on_worker_register(conn, link, &family, now).map(|_| ())
            }
            ManagerEvent::Message { conn, message } => self.on_worker_result(&conn, message, now),
            ManagerEvent::Disconnected { conn } => self.on_worker_disconnect(&conn),
            ManagerEvent::Command { host_id, payload, reply } => {
                self.on_command_request(host_id, payload, reply, now)
            }
            ManagerEvent::Stats { reply } => {
                let _ = reply.send(self.stats(now));
                Ok(())
            }
        }
    }

    /// Boucle principale. Se termine quand le channel d'entrée est fermé,
    /// ou en erreur sur perte fatale d'un poller.
    pub async fn run(mut self, mut events: mpsc::Receiver<ManagerEvent>) -> Result<(), ManagerError> {
        info!(pool_size = self.workers.len(), "IPMI manager started");
        let mut next_cleanup = OffsetDateTime::now_utc() + self.cleanup_interval;

        loop {
            let now = OffsetDateTime::now_utc();
            self.on_schedule_tick(now)?;
            if now >= next_cleanup {
                self.on_host_cleanup_tick(now)?;
                next_cleanup = now + self.cleanup_interval;
            }

            let mut wake = (now + self.max_idle).min(next_cleanup);
            if let Some(next_check) = self.schedule.next_check() {
                wake = wake.min(next_check);
            }
            let wait = std::time::Duration::try_from(wake - now).unwrap_or_default();

            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("event channel closed, manager stopping");
                        return Ok(());
                    };
                    match self.handle_event(event, OffsetDateTime::now_utc()) {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "manager stopping");
                            return Err(e);
                        }
                        Err(e) => warn!(error = %e, "event rejected"),
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
