/*!
Mock de lien poller pour tester le manager sans broker

Enregistre chaque requête envoyée et permet de simuler un lien cassé.
Les clones partagent le même enregistrement : le test garde un clone,
le manager possède l'autre.
*/

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use symbion_ipmi_manager::protocol::WorkerRequest;
use symbion_ipmi_manager::transport::{LinkError, WorkerLink};

#[derive(Clone, Default)]
pub struct MockWorkerLink {
    sent: Arc<Mutex<Vec<WorkerRequest>>>,
    closed: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
}

impl MockWorkerLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fait échouer (ou non) les prochains envois
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Tous les messages reçus par ce poller
    pub fn sent(&self) -> Vec<WorkerRequest> {
        self.sent.lock().clone()
    }

    /// Vide l'enregistrement et retourne son contenu
    pub fn take_sent(&self) -> Vec<WorkerRequest> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Requêtes hors notices de cleanup
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.sent
            .lock()
            .iter()
            .filter(|r| !matches!(r, WorkerRequest::Cleanup))
            .cloned()
            .collect()
    }
}

impl WorkerLink for MockWorkerLink {
    fn send(&self, request: &WorkerRequest) -> Result<(), LinkError> {
        if self.is_closed() || self.failing.load(Ordering::Relaxed) {
            return Err(LinkError::Closed);
        }
        self.sent.lock().push(request.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_and_fails() {
        let link = MockWorkerLink::new();
        let boxed: Box<dyn WorkerLink> = Box::new(link.clone());

        boxed.send(&WorkerRequest::Cleanup).unwrap();
        assert_eq!(link.sent_count(), 1);
        assert!(link.requests().is_empty());

        link.set_failing(true);
        assert!(boxed.send(&WorkerRequest::Cleanup).is_err());
        link.set_failing(false);

        boxed.close();
        assert!(link.is_closed());
        assert!(boxed.send(&WorkerRequest::Cleanup).is_err());
        assert_eq!(link.take_sent().len(), 1);
        assert_eq!(link.sent_count(), 0);
    }
}
