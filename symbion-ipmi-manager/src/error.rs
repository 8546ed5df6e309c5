use crate::models::HostId;

/// Erreurs du coordinateur IPMI
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("poller registration rejected: {0}")]
    Rejected(String),
    #[error("poller pool is full ({0} pollers bound)")]
    PoolFull(usize),
    #[error("unknown poller connection: {0}")]
    UnknownConnection(String),
    #[error("host {0} is not configured")]
    UnknownHost(HostId),
    #[error("host {0} is unreachable")]
    HostUnreachable(HostId),
    #[error("poller {0} connection lost")]
    WorkerLost(usize),
    #[error("failed to send to poller {worker}: {reason}")]
    Send { worker: usize, reason: String },
    #[error("protocol violation from poller {worker}: {reason}")]
    Protocol { worker: usize, reason: String },
    #[error("manager stopped")]
    Stopped,
}

impl ManagerError {
    /// Erreurs qui arrêtent la boucle du manager (les autres rejettent seulement l'événement)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WorkerLost(_) | Self::Stopped)
    }
}
