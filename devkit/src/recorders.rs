/*!
Collaborateurs enregistreurs : planning, historique et annuaire d'hôtes

Chaque recorder est clonable; les clones partagent le même état, ce qui
permet d'en donner un au manager et d'inspecter l'autre dans le test.
*/

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;

use symbion_ipmi_manager::directory::HostDirectory;
use symbion_ipmi_manager::history::HistorySink;
use symbion_ipmi_manager::models::{ErrorClass, HostAddress, HostId, ItemId, ItemState, ValueType};
use symbion_ipmi_manager::schedule::{MemorySchedule, ScheduleItem, ScheduleSource};

/// Un appel à `requeue`
#[derive(Debug, Clone, PartialEq)]
pub struct Requeued {
    pub item_id: ItemId,
    pub state: ItemState,
    pub check_after: OffsetDateTime,
    pub class: ErrorClass,
}

/// Planning en mémoire qui garde la trace des replanifications
#[derive(Clone)]
pub struct RecordingSchedule {
    inner: Arc<Mutex<(MemorySchedule, Vec<Requeued>)>>,
}

impl RecordingSchedule {
    pub fn new(items: impl IntoIterator<Item = ScheduleItem>) -> Self {
        Self {
            inner: Arc::new(Mutex::new((MemorySchedule::new(items), Vec::new()))),
        }
    }

    pub fn requeued(&self) -> Vec<Requeued> {
        self.inner.lock().1.clone()
    }

    /// Dernière replanification d'un item
    pub fn last_requeue(&self, item_id: ItemId) -> Option<Requeued> {
        self.inner.lock().1.iter().rev().find(|r| r.item_id == item_id).cloned()
    }

    pub fn item(&self, item_id: ItemId) -> Option<ScheduleItem> {
        self.inner.lock().0.get(item_id).cloned()
    }
}

impl ScheduleSource for RecordingSchedule {
    fn pull_due(&mut self, now: OffsetDateTime, max_batch: usize) -> Vec<ScheduleItem> {
        self.inner.lock().0.pull_due(now, max_batch)
    }

    fn requeue(&mut self, item_id: ItemId, state: ItemState, check_after: OffsetDateTime, class: ErrorClass) {
        let mut inner = self.inner.lock();
        inner.0.requeue(item_id, state, check_after, class);
        inner.1.push(Requeued {
            item_id,
            state,
            check_after,
            class,
        });
    }

    fn next_check(&self) -> Option<OffsetDateTime> {
        self.inner.lock().0.next_check()
    }
}

/// Un appel à `emit`
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub item_id: ItemId,
    pub value_type: ValueType,
    pub timestamp: OffsetDateTime,
    pub state: ItemState,
    pub value: String,
}

#[derive(Clone, Default)]
pub struct RecordingHistory {
    emitted: Arc<Mutex<Vec<Emitted>>>,
}

impl RecordingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<Emitted> {
        self.emitted.lock().clone()
    }

    pub fn for_item(&self, item_id: ItemId) -> Vec<Emitted> {
        self.emitted.lock().iter().filter(|e| e.item_id == item_id).cloned().collect()
    }
}

impl HistorySink for RecordingHistory {
    fn emit(&mut self, item_id: ItemId, value_type: ValueType, timestamp: OffsetDateTime, state: ItemState, value: &str) {
        self.emitted.lock().push(Emitted {
            item_id,
            value_type,
            timestamp,
            state,
            value: value.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    Activated { host_id: HostId, timestamp: OffsetDateTime },
    Deactivated { host_id: HostId, timestamp: OffsetDateTime, reason: String },
}

/// Annuaire d'hôtes de test : adresses générées, disponibilité enregistrée
#[derive(Clone, Default)]
pub struct RecordingDirectory {
    hosts: Arc<Mutex<HashSet<HostId>>>,
    events: Arc<Mutex<Vec<Availability>>>,
}

impl RecordingDirectory {
    pub fn new(hosts: impl IntoIterator<Item = HostId>) -> Self {
        Self {
            hosts: Arc::new(Mutex::new(hosts.into_iter().collect())),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_host(&self, host_id: HostId) {
        self.hosts.lock().insert(host_id);
    }

    pub fn events(&self) -> Vec<Availability> {
        self.events.lock().clone()
    }
}

/// Adresse BMC factice d'un hôte de test
pub fn test_address(host_id: HostId) -> HostAddress {
    HostAddress {
        address: format!("10.0.{}.{}", host_id / 256, host_id % 256),
        port: 623,
        username: "admin".into(),
        password: "secret".into(),
        authtype: None,
        privilege: "USER".into(),
    }
}

impl HostDirectory for RecordingDirectory {
    fn lookup(&self, host_id: HostId) -> Option<HostAddress> {
        self.hosts.lock().contains(&host_id).then(|| test_address(host_id))
    }

    fn activate_host(&mut self, host_id: HostId, timestamp: OffsetDateTime, _reason: &str) {
        self.events.lock().push(Availability::Activated { host_id, timestamp });
    }

    fn deactivate_host(&mut self, host_id: HostId, timestamp: OffsetDateTime, reason: &str) {
        self.events.lock().push(Availability::Deactivated {
            host_id,
            timestamp,
            reason: reason.to_string(),
        });
    }
}
