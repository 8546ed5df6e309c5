/**
 * MODÈLE DE DONNÉES - Requêtes, classes d'erreur et adresses BMC
 *
 * RÔLE : Types partagés entre le manager, les pollers et les collaborateurs
 * (planning, historique, annuaire d'hôtes).
 *
 * ORDRE DES REQUÊTES : (classe, séquence). Les commandes passent avant les
 * lectures capteurs, puis FIFO par numéro de séquence.
 */

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tokio::sync::oneshot;

use crate::error::ManagerError;
use crate::protocol::WorkerRequest;

pub type HostId = u64;
pub type ItemId = u64;

/// Classe de requête. L'ordre de déclaration est l'ordre de priorité.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    Command,
    SensorRead,
}

/// État observé d'un item de supervision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Normal,
    NotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Float,
    Unsigned,
    Text,
}

/// Classification d'un résultat de lecture capteur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Success,
    /// Capteur/item non supporté : l'hôte a répondu, il est joignable
    NotSupported,
    /// Requête mal formée (macro non résolue, identifiants invalides...)
    ConfigError,
    NetworkError,
    GatewayError,
    TimeoutError,
}

impl ErrorClass {
    /// Erreurs de lien : font passer l'hôte en backoff
    pub fn is_link_error(self) -> bool {
        matches!(self, Self::NetworkError | Self::GatewayError | Self::TimeoutError)
    }
}

/// Adresse et identifiants d'un BMC (ce dont un poller a besoin pour s'y connecter)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAddress {
    pub address: String,
    #[serde(default = "default_ipmi_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// NONE, PASSWORD, MD2, MD5, OEM (ipmitool -A), défaut ipmitool si absent
    #[serde(default)]
    pub authtype: Option<String>,
    /// CALLBACK, USER, OPERATOR, ADMINISTRATOR (ipmitool -L)
    #[serde(default = "default_privilege")]
    pub privilege: String,
}

fn default_ipmi_port() -> u16 {
    623
}

fn default_privilege() -> String {
    "USER".to_string()
}

/// Réponse renvoyée au client d'une commande
pub type CommandReply = Result<serde_json::Value, ManagerError>;

/// Jeton de réponse d'une commande : un seul propriétaire, invalide dès que
/// le client a abandonné (receiver fermé)
#[derive(Debug)]
pub struct ReplyToken(oneshot::Sender<CommandReply>);

impl ReplyToken {
    pub fn new(sender: oneshot::Sender<CommandReply>) -> Self {
        Self(sender)
    }

    /// Renvoie la réponse au client; false si le client est parti entre-temps
    pub fn deliver(self, reply: CommandReply) -> bool {
        self.0.send(reply).is_ok()
    }
}

#[derive(Debug)]
pub enum RequestKind {
    SensorRead {
        item_id: ItemId,
        item_state: ItemState,
        value_type: ValueType,
    },
    Command {
        reply: ReplyToken,
    },
}

/// Une unité de travail destinée à un poller
#[derive(Debug)]
pub struct Request {
    pub seq: u64,
    pub host_id: HostId,
    pub kind: RequestKind,
    /// Message envoyé tel quel au poller, jamais inspecté par le manager
    pub message: WorkerRequest,
}

impl Request {
    pub fn class(&self) -> RequestClass {
        match self.kind {
            RequestKind::SensorRead { .. } => RequestClass::SensorRead,
            RequestKind::Command { .. } => RequestClass::Command,
        }
    }

    pub fn item_id(&self) -> Option<ItemId> {
        match self.kind {
            RequestKind::SensorRead { item_id, .. } => Some(item_id),
            RequestKind::Command { .. } => None,
        }
    }

    fn queue_key(&self) -> (RequestClass, u64) {
        (self.class(), self.seq)
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.queue_key() == other.queue_key()
    }
}

impl Eq for Request {}

impl PartialOrd for Request {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap est un tas max : on inverse pour sortir la plus petite clé d'abord
impl Ord for Request {
    fn cmp(&self, other: &Self) -> Ordering {
        other.queue_key().cmp(&self.queue_key())
    }
}
