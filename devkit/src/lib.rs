/*!
# Symbion DevKit - Stubs et utilitaires de test du manager IPMI

- `MockWorkerLink` : poller simulé, sans broker
- Planning, historique et annuaire enregistreurs
- `TestHarness` : manager + pollers simulés + horloge virtuelle
*/

pub mod link_stub;
pub mod recorders;
pub mod test_utils;

pub use link_stub::MockWorkerLink;
pub use recorders::{Availability, Emitted, RecordingDirectory, RecordingHistory, RecordingSchedule, Requeued};
pub use test_utils::{sensor_item, TestHarness, FAMILY, T0};
