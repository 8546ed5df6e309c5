//! Transport entre le manager et ses pollers.
//!
//! Le manager ne fait que pousser une requête opaque vers un poller. Tout ce
//! qui arrive (enregistrement, résultats, perte de connexion) lui parvient
//! sous forme de [`ManagerEvent`] sur son unique channel d'entrée.

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::manager::ManagerStats;
use crate::models::{CommandReply, HostId};
use crate::protocol::{WorkerMessage, WorkerRequest};

/// Identifiant d'une connexion poller, attribué par le transport
pub type ConnectionId = String;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("mqtt error: {0}")]
    Mqtt(String),
}

/// Côté émission d'une connexion poller
pub trait WorkerLink: Send {
    fn send(&self, request: &WorkerRequest) -> Result<(), LinkError>;
    fn close(&self);
}

/// Tout ce qui entre dans la boucle du manager
#[derive(Debug)]
pub enum ManagerEvent {
    Connected {
        conn: ConnectionId,
        link: Box<dyn WorkerLink>,
        family: String,
    },
    Message {
        conn: ConnectionId,
        message: WorkerMessage,
    },
    Disconnected {
        conn: ConnectionId,
    },
    Command {
        host_id: HostId,
        payload: serde_json::Value,
        reply: oneshot::Sender<CommandReply>,
    },
    Stats {
        reply: oneshot::Sender<ManagerStats>,
    },
}

impl std::fmt::Debug for dyn WorkerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkerLink")
    }
}

/// Lien in-process : le poller est une tâche tokio qui lit un channel
pub struct ChannelLink {
    tx: Mutex<Option<mpsc::UnboundedSender<WorkerRequest>>>,
}

pub fn channel_link() -> (ChannelLink, mpsc::UnboundedReceiver<WorkerRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelLink { tx: Mutex::new(Some(tx)) }, rx)
}

impl WorkerLink for ChannelLink {
    fn send(&self, request: &WorkerRequest) -> Result<(), LinkError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(LinkError::Closed)?;
        tx.send(request.clone()).map_err(|_| LinkError::Closed)
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_link_close_ends_stream() {
        let (link, mut rx) = channel_link();
        link.send(&WorkerRequest::Cleanup).unwrap();
        link.close();

        assert_eq!(rx.recv().await, Some(WorkerRequest::Cleanup));
        assert_eq!(rx.recv().await, None);
        assert!(matches!(link.send(&WorkerRequest::Cleanup), Err(LinkError::Closed)));
    }
}
