//! Messages échangés entre le manager et les pollers.
//!
//! Un message = un document JSON tagué par `type`. Les payloads de commande
//! et leurs résultats restent des `serde_json::Value` opaques pour le manager.
//! Chaque requête porte un `seq` que le poller renvoie dans son résultat :
//! le manager n'accepte que le résultat de la requête en vol.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{ErrorClass, HostAddress, HostId, ItemId};

pub const REGISTER_TOPIC: &str = "symbion/ipmi/register@v1";
pub const HEALTH_TOPIC: &str = "symbion/ipmi/health@v1";
/// Abonnements du manager (wildcard sur l'identifiant du poller)
pub const RESULT_FILTER: &str = "symbion/ipmi/+/result@v1";
pub const GONE_FILTER: &str = "symbion/ipmi/+/gone@v1";

/// Manager → poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    SensorRead {
        seq: u64,
        item_id: ItemId,
        host: HostAddress,
        sensor: String,
    },
    Command {
        seq: u64,
        host_id: HostId,
        host: HostAddress,
        payload: serde_json::Value,
    },
    Cleanup,
}

/// Poller → manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        /// Identité du manager parent (famille de processus)
        family: String,
        worker: String,
    },
    SensorResult {
        seq: u64,
        item_id: ItemId,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
        class: ErrorClass,
        /// Valeur lue si succès, texte d'erreur sinon
        text: String,
    },
    CommandResult {
        seq: u64,
        payload: serde_json::Value,
    },
}

pub fn request_topic(worker: &str) -> String {
    format!("symbion/ipmi/{}/request@v1", worker)
}

pub fn result_topic(worker: &str) -> String {
    format!("symbion/ipmi/{}/result@v1", worker)
}

pub fn gone_topic(worker: &str) -> String {
    format!("symbion/ipmi/{}/gone@v1", worker)
}

/// Extrait l'identifiant du poller depuis un topic par-poller
/// Ex: "symbion/ipmi/abc/result@v1" -> Some("abc")
pub fn worker_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("symbion"), Some("ipmi"), Some(worker), Some(_), None) if !worker.is_empty() => Some(worker),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_from_topic() {
        assert_eq!(worker_from_topic("symbion/ipmi/abc/result@v1"), Some("abc"));
        assert_eq!(worker_from_topic(&gone_topic("p-1")), Some("p-1"));
        assert_eq!(worker_from_topic("symbion/ipmi/register@v1"), None);
        assert_eq!(worker_from_topic("symbion/hosts/abc/result@v1"), None);
    }

    #[test]
    fn test_messages_are_tagged_by_type() {
        let cleanup = serde_json::to_value(WorkerRequest::Cleanup).unwrap();
        assert_eq!(cleanup, serde_json::json!({ "type": "cleanup" }));

        let raw = r#"{"type":"sensor_result","seq":3,"item_id":7,"timestamp":"2024-05-01T10:00:00Z","class":"timeout_error","text":"timed out"}"#;
        match serde_json::from_str::<WorkerMessage>(raw).unwrap() {
            WorkerMessage::SensorResult { seq, item_id, class, text, .. } => {
                assert_eq!((seq, item_id), (3, 7));
                assert_eq!(class, ErrorClass::TimeoutError);
                assert_eq!(text, "timed out");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_host_address_defaults() {
        let raw = r#"{"type":"sensor_read","seq":1,"item_id":1,"host":{"address":"10.0.0.5"},"sensor":"CPU Temp"}"#;
        let WorkerRequest::SensorRead { host, .. } = serde_json::from_str(raw).unwrap() else {
            panic!("expected sensor_read");
        };
        assert_eq!(host.port, 623);
        assert_eq!(host.privilege, "USER");
        assert_eq!(host.authtype, None);
    }
}
