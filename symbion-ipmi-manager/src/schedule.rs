//! Planning : les lectures capteurs que le manager doit déclencher.
//!
//! Le manager tire les items dus par lots bornés et rend chaque item via
//! [`ScheduleSource::requeue`] dès que son résultat (ou son abandon) est connu.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use time::{Duration, OffsetDateTime};

use crate::models::{ErrorClass, HostId, ItemId, ItemState, ValueType};

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleItem {
    pub item_id: ItemId,
    pub host_id: HostId,
    pub sensor: String,
    pub value_type: ValueType,
    pub state: ItemState,
    pub delay: Duration,
    pub next_check: OffsetDateTime,
}

pub trait ScheduleSource: Send {
    /// Items dus à `now`, au plus `max_batch`. Un item retourné n'est plus
    /// planifié tant qu'il n'a pas été remis par `requeue`.
    fn pull_due(&mut self, now: OffsetDateTime, max_batch: usize) -> Vec<ScheduleItem>;

    /// Replanifie un item. Pour une erreur de lien l'item repasse à
    /// `check_after` exactement, sinon à `check_after + delay`.
    fn requeue(&mut self, item_id: ItemId, state: ItemState, check_after: OffsetDateTime, class: ErrorClass);

    /// Prochaine échéance connue, pour borner l'attente de la boucle
    fn next_check(&self) -> Option<OffsetDateTime>;
}

/// Planning en mémoire construit depuis la configuration
#[derive(Default)]
pub struct MemorySchedule {
    items: HashMap<ItemId, ScheduleItem>,
    /// Items planifiés (non sortis) et leur échéance en vigueur
    queued: HashMap<ItemId, OffsetDateTime>,
    due: BinaryHeap<Reverse<(OffsetDateTime, ItemId)>>,
}

impl MemorySchedule {
    pub fn new(items: impl IntoIterator<Item = ScheduleItem>) -> Self {
        let mut schedule = Self::default();
        for item in items {
            schedule.due.push(Reverse((item.next_check, item.item_id)));
            schedule.queued.insert(item.item_id, item.next_check);
            schedule.items.insert(item.item_id, item);
        }
        schedule
    }

    pub fn get(&self, item_id: ItemId) -> Option<&ScheduleItem> {
        self.items.get(&item_id)
    }
}

impl ScheduleSource for MemorySchedule {
    fn pull_due(&mut self, now: OffsetDateTime, max_batch: usize) -> Vec<ScheduleItem> {
        let mut batch = Vec::new();
        while batch.len() < max_batch {
            let Some(Reverse((next_check, item_id))) = self.due.peek().copied() else {
                break;
            };
            if next_check > now {
                break;
            }
            self.due.pop();
            // entrée périmée si l'item a été replanifié ou déjà sorti
            if self.queued.get(&item_id) != Some(&next_check) {
                continue;
            }
            self.queued.remove(&item_id);
            if let Some(item) = self.items.get(&item_id) {
                batch.push(item.clone());
            }
        }
        batch
    }

    fn requeue(&mut self, item_id: ItemId, state: ItemState, check_after: OffsetDateTime, class: ErrorClass) {
        let Some(item) = self.items.get_mut(&item_id) else {
            return;
        };
        item.state = state;
        item.next_check = if class.is_link_error() {
            check_after
        } else {
            check_after + item.delay
        };
        self.queued.insert(item_id, item.next_check);
        self.due.push(Reverse((item.next_check, item_id)));
    }

    fn next_check(&self) -> Option<OffsetDateTime> {
        self.queued.values().min().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-01 10:00 UTC);

    fn item(item_id: ItemId, offset_secs: i64) -> ScheduleItem {
        ScheduleItem {
            item_id,
            host_id: 1,
            sensor: format!("Sensor {}", item_id),
            value_type: ValueType::Float,
            state: ItemState::Normal,
            delay: Duration::seconds(60),
            next_check: T0 + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn test_pull_due_respects_time_and_batch() {
        let mut schedule = MemorySchedule::new(vec![item(1, 0), item(2, 5), item(3, 30)]);
        assert_eq!(schedule.pull_due(T0 - Duration::seconds(1), 10).len(), 0);

        let due = schedule.pull_due(T0 + Duration::seconds(10), 1);
        assert_eq!(due.iter().map(|i| i.item_id).collect::<Vec<_>>(), vec![1]);
        let due = schedule.pull_due(T0 + Duration::seconds(10), 10);
        assert_eq!(due.iter().map(|i| i.item_id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(schedule.next_check(), Some(T0 + Duration::seconds(30)));
    }

    #[test]
    fn test_requeue_delays() {
        let mut schedule = MemorySchedule::new(vec![item(1, 0), item(2, 0)]);
        schedule.pull_due(T0, 10);

        schedule.requeue(1, ItemState::Normal, T0, ErrorClass::Success);
        schedule.requeue(2, ItemState::Normal, T0 + Duration::seconds(15), ErrorClass::NetworkError);
        assert_eq!(schedule.get(1).unwrap().next_check, T0 + Duration::seconds(60));
        assert_eq!(schedule.get(2).unwrap().next_check, T0 + Duration::seconds(15));

        schedule.requeue(1, ItemState::NotSupported, T0, ErrorClass::ConfigError);
        assert_eq!(schedule.get(1).unwrap().state, ItemState::NotSupported);
        // l'ancienne échéance de l'item 1 est ignorée, une seule occurrence sort
        let due = schedule.pull_due(T0 + Duration::seconds(120), 10);
        assert_eq!(due.iter().map(|i| i.item_id).collect::<Vec<_>>(), vec![2, 1]);
    }
}
