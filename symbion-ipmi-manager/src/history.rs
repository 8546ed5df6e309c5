//! Historique : destination des lectures capteurs terminées.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

use crate::models::{ItemId, ItemState, ValueType};

pub trait HistorySink: Send {
    fn emit(&mut self, item_id: ItemId, value_type: ValueType, timestamp: OffsetDateTime, state: ItemState, value: &str);
}

/// Dernière valeur connue d'un item
#[derive(Debug, Clone, Serialize)]
pub struct ItemValue {
    pub item_id: ItemId,
    pub value_type: ValueType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub state: ItemState,
    /// Valeur si état normal, message d'erreur si non supporté
    pub value: String,
}

/// Sink par défaut : garde la dernière valeur par item. Les clones partagent
/// la même map (boucle du manager d'un côté, API REST de l'autre).
#[derive(Clone, Default)]
pub struct LatestValues {
    values: Arc<Mutex<HashMap<ItemId, ItemValue>>>,
}

impl LatestValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, item_id: ItemId) -> Option<ItemValue> {
        self.values.lock().get(&item_id).cloned()
    }

    /// Copie triée par item, relâche le verrou avant de rendre la main
    pub fn snapshot(&self) -> Vec<ItemValue> {
        let mut values: Vec<ItemValue> = self.values.lock().values().cloned().collect();
        values.sort_by_key(|v| v.item_id);
        values
    }
}

impl HistorySink for LatestValues {
    fn emit(&mut self, item_id: ItemId, value_type: ValueType, timestamp: OffsetDateTime, state: ItemState, value: &str) {
        debug!(item_id, ?state, value, "history value");
        self.values.lock().insert(
            item_id,
            ItemValue {
                item_id,
                value_type,
                timestamp,
                state,
                value: value.to_string(),
            },
        );
    }
}
