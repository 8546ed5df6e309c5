//! Coordinator behaviour driven through the devkit harness: routing,
//! priorities, circuit breaker, eviction and poller loss.

use serde_json::json;

use symbion_devkit::{sensor_item, Availability, TestHarness, T0};
use symbion_ipmi_manager::models::{ErrorClass, ItemState};
use symbion_ipmi_manager::protocol::{WorkerMessage, WorkerRequest};
use symbion_ipmi_manager::{ManagerConfig, ManagerError, WorkerLossPolicy};

fn sent_items(requests: &[WorkerRequest]) -> Vec<u64> {
    requests
        .iter()
        .filter_map(|r| match r {
            WorkerRequest::SensorRead { item_id, .. } => Some(*item_id),
            _ => None,
        })
        .collect()
}

fn config(pool_size: usize) -> ManagerConfig {
    ManagerConfig {
        pool_size,
        ..ManagerConfig::default()
    }
}

#[test]
fn new_hosts_are_spread_evenly() {
    let items = (1..=10).map(|host| sensor_item(100 + host, host, 60, T0)).collect();
    let mut h = TestHarness::with_config(config(3), items);
    h.register_all();
    h.tick().unwrap();

    let counts: Vec<usize> = (0..3).map(|w| h.manager.assigned_hosts(w)).collect();
    assert_eq!(counts.iter().sum::<usize>(), 10);
    let max = counts.iter().max().unwrap();
    let min = counts.iter().min().unwrap();
    assert!(max - min <= 1, "unbalanced: {:?}", counts);
}

#[test]
fn host_assignment_is_stable() {
    let mut h = TestHarness::with_config(config(2), vec![sensor_item(1, 5, 60, T0)]);
    h.register_all();
    h.tick().unwrap();
    let worker = h.worker_of(5).unwrap();

    h.sensor_result(worker, 1, ErrorClass::Success, "20").unwrap();
    // une autre affectation ne déplace pas l'hôte 5
    h.command(6, json!({"action": "power_status"})).unwrap();
    h.advance(60);
    h.tick().unwrap();

    assert_eq!(h.worker_of(5), Some(worker));
    assert_eq!(sent_items(&h.drain(worker)), vec![1, 1]);
}

#[test]
fn idle_worker_sends_immediately() {
    let mut h = TestHarness::new(1);
    let _rx = h.command(1, json!({"action": "power_on"})).unwrap();

    let sent = h.drain(0);
    assert_eq!(sent.len(), 1);
    let WorkerRequest::Command { host_id, payload, host, .. } = &sent[0] else {
        panic!("expected a command, got {:?}", sent[0]);
    };
    assert_eq!(*host_id, 1);
    assert_eq!(payload["action"], "power_on");
    assert_eq!(host.port, 623);
    assert!(h.manager.worker(0).unwrap().in_flight().is_some());
}

#[test]
fn commands_overtake_queued_sensor_reads() {
    let items = vec![sensor_item(1, 1, 60, T0), sensor_item(2, 1, 60, T0), sensor_item(3, 1, 60, T0)];
    let mut h = TestHarness::with_config(config(1), items);
    h.register_all();
    h.tick().unwrap();
    assert_eq!(sent_items(&h.drain(0)), vec![1]);

    let mut rx = h.command(1, json!({"action": "power_status"})).unwrap();
    assert!(h.drain(0).is_empty());

    h.sensor_result(0, 1, ErrorClass::Success, "40").unwrap();
    let sent = h.drain(0);
    assert!(matches!(sent.as_slice(), [WorkerRequest::Command { .. }]));

    h.command_result(0, json!({"success": true, "output": "Chassis Power is on"}))
        .unwrap();
    assert_eq!(rx.try_recv().unwrap().unwrap()["output"], "Chassis Power is on");
    assert_eq!(sent_items(&h.drain(0)), vec![2]);
}

#[test]
fn result_releases_slot_and_sends_one_request() {
    let items = vec![sensor_item(1, 1, 60, T0), sensor_item(2, 1, 60, T0), sensor_item(3, 1, 60, T0)];
    let mut h = TestHarness::with_config(config(1), items);
    h.register_all();
    h.tick().unwrap();
    h.drain(0);

    h.sensor_result(0, 1, ErrorClass::Success, "40").unwrap();
    assert_eq!(sent_items(&h.drain(0)), vec![2]);
    assert_eq!(h.manager.worker(0).unwrap().queue_len(), 1);

    h.sensor_result(0, 2, ErrorClass::Success, "41").unwrap();
    h.sensor_result(0, 3, ErrorClass::Success, "42").unwrap();
    assert_eq!(sent_items(&h.drain(0)), vec![3]);
    assert!(h.manager.worker(0).unwrap().is_idle());
    assert_eq!(h.history.emitted().len(), 3);
}

#[test]
fn unreachable_host_is_skipped_until_backoff_ends() {
    let items = vec![sensor_item(10, 1, 60, T0), sensor_item(11, 1, 60, T0 + time::Duration::seconds(5))];
    let mut h = TestHarness::with_config(config(1), items);
    h.register_all();
    h.tick().unwrap();
    h.drain(0);

    h.sensor_result(0, 10, ErrorClass::NetworkError, "Unable to establish IPMI v2 / RMCP+ session")
        .unwrap();
    let requeued = h.schedule.last_requeue(10).unwrap();
    assert_eq!(requeued.check_after, T0 + time::Duration::seconds(15));
    assert_eq!(requeued.state, ItemState::Normal);
    // erreur de lien : rien dans l'historique
    assert!(h.history.for_item(10).is_empty());

    h.advance(5);
    let mut rx = h.command(1, json!({"action": "power_status"})).unwrap();
    assert_eq!(rx.try_recv().unwrap(), Err(ManagerError::HostUnreachable(1)));
    h.tick().unwrap();
    assert!(h.drain(0).is_empty());
    let skipped = h.schedule.last_requeue(11).unwrap();
    assert_eq!(skipped.check_after, T0 + time::Duration::seconds(15));
    assert_eq!(skipped.class, ErrorClass::NetworkError);

    h.advance(10);
    h.tick().unwrap();
    assert_eq!(sent_items(&h.drain(0)), vec![10]);
    assert_eq!(h.manager.stats(h.now).requests_skipped, 2);
}

#[test]
fn config_error_does_not_change_reachability() {
    let items = vec![sensor_item(10, 1, 60, T0), sensor_item(11, 2, 60, T0)];
    let mut h = TestHarness::with_config(config(1), items);
    h.register_all();
    h.tick().unwrap();

    h.sensor_result(0, 10, ErrorClass::ConfigError, "Invalid user name").unwrap();
    assert!(h.manager.host(1).unwrap().unreachable_until.is_none());
    let emitted = h.history.for_item(10);
    assert_eq!(emitted[0].state, ItemState::NotSupported);
    assert_eq!(emitted[0].value, "Invalid user name");
    assert_eq!(h.schedule.item(10).unwrap().next_check, T0 + time::Duration::seconds(60));

    h.sensor_result(0, 11, ErrorClass::NotSupported, "Sensor 11 not found").unwrap();
    assert_eq!(h.schedule.item(11).unwrap().state, ItemState::NotSupported);
}

#[test]
fn backoff_escalates_to_unavailable_and_recovers() {
    let mut h = TestHarness::with_config(config(1), vec![sensor_item(10, 1, 60, T0)]);
    h.register_all();

    // erreurs à T0, T0+15, T0+30 : fenêtre courte
    for _ in 0..3 {
        h.tick().unwrap();
        assert_eq!(sent_items(&h.drain(0)), vec![10]);
        h.sensor_result(0, 10, ErrorClass::TimeoutError, "timeout").unwrap();
        h.advance(15);
    }
    assert!(h.directory.events().is_empty());

    // T0+45 : série de 45s, hôte indisponible, fenêtre longue
    h.tick().unwrap();
    h.drain(0);
    h.sensor_result(0, 10, ErrorClass::TimeoutError, "timeout").unwrap();
    let until = h.manager.host(1).unwrap().unreachable_until.unwrap();
    assert_eq!(until, T0 + time::Duration::seconds(105));
    assert_eq!(
        h.directory.events(),
        vec![Availability::Deactivated {
            host_id: 1,
            timestamp: T0 + time::Duration::seconds(45),
            reason: "timeout".into()
        }]
    );

    h.advance(59);
    h.tick().unwrap();
    assert!(h.drain(0).is_empty());

    h.advance(1);
    h.tick().unwrap();
    assert_eq!(sent_items(&h.drain(0)), vec![10]);
    h.sensor_result(0, 10, ErrorClass::Success, "38").unwrap();
    assert_eq!(
        h.directory.events().last(),
        Some(&Availability::Activated { host_id: 1, timestamp: T0 + time::Duration::seconds(105) })
    );
    assert!(h.manager.host(1).unwrap().errors_from.is_none());
}

#[test]
fn evicted_host_frees_its_slot() {
    let config = ManagerConfig {
        pool_size: 2,
        host_cache_ttl_secs: 60,
        ..ManagerConfig::default()
    };
    let mut h = TestHarness::with_config(config, Vec::new());
    h.register_all();

    let _rx = h.command(1, json!({"action": "power_status"})).unwrap();
    h.command_result(0, json!({"success": true})).unwrap();
    assert_eq!(h.manager.assigned_hosts(0), 1);

    h.advance(61);
    h.cleanup_tick().unwrap();
    assert_eq!(h.manager.assigned_hosts(0), 0);
    assert!(h.worker_of(1).is_none());
    for worker in 0..2 {
        assert_eq!(h.link(worker).sent().last(), Some(&WorkerRequest::Cleanup));
    }

    // hôte 2 prend le slot libéré, l'hôte 1 revient ailleurs
    let _rx2 = h.command(2, json!({"action": "power_status"})).unwrap();
    let _rx1 = h.command(1, json!({"action": "power_status"})).unwrap();
    assert_eq!(h.worker_of(2), Some(0));
    assert_eq!(h.worker_of(1), Some(1));
}

#[test]
fn two_workers_two_hosts_scenario() {
    let mut h = TestHarness::new(2);

    let _a = h.command(1, json!({"action": "power_status"})).unwrap();
    assert_eq!(h.worker_of(1), Some(0));
    assert_eq!((h.manager.assigned_hosts(0), h.manager.assigned_hosts(1)), (1, 0));

    let _b = h.command(2, json!({"action": "power_status"})).unwrap();
    assert_eq!(h.worker_of(2), Some(1));
    assert_eq!((h.manager.assigned_hosts(0), h.manager.assigned_hosts(1)), (1, 1));

    let _a2 = h.command(1, json!({"action": "power_on"})).unwrap();
    assert_eq!(h.worker_of(1), Some(0));
    assert_eq!(h.manager.worker(0).unwrap().queue_len(), 1);
    assert_eq!((h.manager.assigned_hosts(0), h.manager.assigned_hosts(1)), (1, 1));
}

#[test]
fn foreign_family_is_rejected() {
    let mut h = TestHarness::with_config(config(1), Vec::new());
    let (result, link) = h.register_as("someone-else");
    assert!(matches!(result, Err(ManagerError::Rejected(_))));
    assert!(link.is_closed());
    assert!(!h.manager.worker(0).unwrap().is_bound());

    assert_eq!(h.register(), Ok(0));
    let (result, link) = h.register_as(symbion_devkit::FAMILY);
    assert_eq!(result, Err(ManagerError::PoolFull(1)));
    assert!(link.is_closed());
}

#[test]
fn unknown_host_is_answered_without_registry_entry() {
    let mut h = TestHarness::with_config(config(1), vec![sensor_item(7, 999, 60, T0)]);
    h.register_all();

    let mut rx = h.command(999, json!({"action": "power_on"})).unwrap();
    assert_eq!(rx.try_recv().unwrap(), Err(ManagerError::UnknownHost(999)));

    h.tick().unwrap();
    let emitted = h.history.for_item(7);
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].state, ItemState::NotSupported);
    assert_eq!(h.schedule.last_requeue(7).unwrap().class, ErrorClass::ConfigError);
    assert!(h.worker_of(999).is_none());
    assert!(h.drain(0).is_empty());

    // déclaré plus tard dans l'annuaire : routé normalement
    h.directory.add_host(999);
    h.advance(60);
    h.tick().unwrap();
    assert_eq!(sent_items(&h.drain(0)), vec![7]);
}

#[test]
fn reply_for_vanished_client_is_discarded() {
    let mut h = TestHarness::new(1);
    let rx = h.command(1, json!({"action": "power_cycle"})).unwrap();
    let _next = h.command(1, json!({"action": "power_status"})).unwrap();
    drop(rx);

    // la commande est quand même exécutée, sa réponse jetée
    h.command_result(0, json!({"success": true})).unwrap();
    let sent = h.drain(0);
    assert_eq!(sent.len(), 2);
    let WorkerRequest::Command { payload, .. } = &sent[1] else {
        panic!("expected the second command");
    };
    assert_eq!(payload["action"], "power_status");
}

#[test]
fn unexpected_result_is_rejected() {
    let mut h = TestHarness::with_config(config(1), vec![sensor_item(10, 1, 60, T0)]);
    h.register_all();
    h.tick().unwrap();

    let err = h.sensor_result(0, 99, ErrorClass::Success, "1").unwrap_err();
    assert!(matches!(err, ManagerError::Protocol { worker: 0, .. }));
    assert!(!err.is_fatal());

    // bon item, mauvais seq : résultat d'une ancienne lecture
    let stale = WorkerMessage::SensorResult {
        seq: h.in_flight_seq(0) + 1,
        item_id: 10,
        timestamp: h.now,
        class: ErrorClass::Success,
        text: "1".into(),
    };
    assert!(matches!(h.send_message(0, stale), Err(ManagerError::Protocol { .. })));
    assert!(h.history.for_item(10).is_empty());
    let err = h.command_result(0, json!({})).unwrap_err();
    assert!(matches!(err, ManagerError::Protocol { .. }));
    assert!(h.manager.worker(0).unwrap().in_flight().is_some());
}

#[test]
fn worker_loss_is_fatal_by_default() {
    let mut h = TestHarness::new(1);
    let err = h.disconnect(0).unwrap_err();
    assert_eq!(err, ManagerError::WorkerLost(0));
    assert!(err.is_fatal());

    let mut h = TestHarness::new(1);
    h.link(0).set_failing(true);
    assert_eq!(
        h.command(1, json!({"action": "power_status"})).unwrap_err(),
        ManagerError::WorkerLost(0)
    );
}

#[test]
fn lost_worker_requests_go_to_next_registration() {
    let config = ManagerConfig {
        pool_size: 1,
        worker_loss: WorkerLossPolicy::Requeue,
        ..ManagerConfig::default()
    };
    let mut h = TestHarness::with_config(config, vec![sensor_item(10, 1, 60, T0), sensor_item(11, 1, 60, T0)]);
    h.register_all();
    h.tick().unwrap();
    let old_link = h.link(0).clone();
    assert_eq!(sent_items(&old_link.take_sent()), vec![10]);

    h.disconnect(0).unwrap();
    assert!(old_link.is_closed());
    assert!(!h.manager.worker(0).unwrap().is_bound());
    assert_eq!(h.manager.worker(0).unwrap().queue_len(), 2);

    // la requête en vol repart en premier vers le nouveau poller
    assert_eq!(h.register(), Ok(0));
    assert_eq!(sent_items(&h.drain(0)), vec![10]);
    h.sensor_result(0, 10, ErrorClass::Success, "30").unwrap();
    assert_eq!(sent_items(&h.drain(0)), vec![11]);
    assert_eq!(h.worker_of(1), Some(0));
}

#[test]
fn duplicate_command_result_after_reconnect_is_rejected() {
    let config = ManagerConfig {
        pool_size: 1,
        worker_loss: WorkerLossPolicy::Requeue,
        ..ManagerConfig::default()
    };
    let mut h = TestHarness::with_config(config, Vec::new());
    h.register_all();
    let mut cycle = h.command(1, json!({"action": "power_cycle"})).unwrap();
    let mut status = h.command(1, json!({"action": "power_status"})).unwrap();
    let cycle_seq = h.in_flight_seq(0);
    h.drain(0);

    // même poller qui revient : power_cycle renvoyé avec le même seq
    h.disconnect(0).unwrap();
    assert_eq!(h.register(), Ok(0));
    let resent = h.drain(0);
    assert!(matches!(resent.as_slice(), [WorkerRequest::Command { seq, .. }] if *seq == cycle_seq));

    // le poller répond aux deux livraisons de power_cycle
    let first = WorkerMessage::CommandResult {
        seq: cycle_seq,
        payload: json!({"for": "cycle-1"}),
    };
    h.send_message(0, first).unwrap();
    let duplicate = WorkerMessage::CommandResult {
        seq: cycle_seq,
        payload: json!({"for": "cycle-2"}),
    };
    assert!(matches!(h.send_message(0, duplicate), Err(ManagerError::Protocol { .. })));
    assert!(status.try_recv().is_err());

    h.command_result(0, json!({"for": "status"})).unwrap();
    assert_eq!(cycle.try_recv().unwrap().unwrap()["for"], "cycle-1");
    assert_eq!(status.try_recv().unwrap().unwrap()["for"], "status");
}
