/**
 * WORKER HANDLE - Vue du manager sur un poller connecté
 *
 * RÔLE : Connexion (absente tant que le poller ne s'est pas enregistré),
 * file de requêtes prioritaire et requête en vol.
 *
 * INVARIANT : au plus une requête en vol par poller; tout le reste attend dans la file.
 */

use std::collections::BinaryHeap;

use crate::error::ManagerError;
use crate::models::Request;
use crate::transport::{ConnectionId, WorkerLink};

pub struct WorkerHandle {
    pub index: usize,
    conn: Option<ConnectionId>,
    link: Option<Box<dyn WorkerLink>>,
    queue: BinaryHeap<Request>,
    in_flight: Option<Request>,
}

impl WorkerHandle {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            conn: None,
            link: None,
            queue: BinaryHeap::new(),
            in_flight: None,
        }
    }

    pub fn bind(&mut self, conn: ConnectionId, link: Box<dyn WorkerLink>) {
        self.conn = Some(conn);
        self.link = Some(link);
    }

    /// Détache la connexion; la requête en vol retourne dans la file
    /// (son numéro de séquence lui garde sa place)
    pub fn unbind(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.conn = None;
        if let Some(request) = self.in_flight.take() {
            self.queue.push(request);
        }
    }

    pub fn is_bound(&self) -> bool {
        self.link.is_some()
    }

    pub fn connection(&self) -> Option<&str> {
        self.conn.as_deref()
    }

    /// Prêt à envoyer : connecté et rien en vol
    pub fn is_idle(&self) -> bool {
        self.is_bound() && self.in_flight.is_none()
    }

    pub fn enqueue(&mut self, request: Request) {
        self.queue.push(request);
    }

    pub fn pop_next(&mut self) -> Option<Request> {
        self.queue.pop()
    }

    /// Envoie la requête et la marque en vol. En cas d'échec la requête est
    /// remise en file et l'erreur remontée (le manager traite la perte du poller).
    pub fn send(&mut self, request: Request) -> Result<(), ManagerError> {
        let Some(link) = &self.link else {
            self.queue.push(request);
            return Err(ManagerError::WorkerLost(self.index));
        };

        match link.send(&request.message) {
            Ok(()) => {
                self.in_flight = Some(request);
                Ok(())
            }
            Err(e) => {
                self.queue.push(request);
                Err(ManagerError::Send {
                    worker: self.index,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Envoi hors file (notice de cleanup), sans toucher à la requête en vol
    pub fn notify(&self, message: &crate::protocol::WorkerRequest) -> Result<(), ManagerError> {
        let Some(link) = &self.link else {
            return Ok(());
        };
        link.send(message).map_err(|e| ManagerError::Send {
            worker: self.index,
            reason: e.to_string(),
        })
    }

    pub fn take_in_flight(&mut self) -> Option<Request> {
        self.in_flight.take()
    }

    pub fn in_flight(&self) -> Option<&Request> {
        self.in_flight.as_ref()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}
