//! Integration tests for route allocation against the simulated board
//!
//! These tests validate the complete route workflow:
//! - Processor chains and their log triggers
//! - One route built at a time, in submission order
//! - Rollback on timeouts and lost connections
//! - Timer routes with reactions and route removal

mod common;

use common::builders::{axis_route, fast_config, resetting_axis_route, z_threshold_route};
use common::mock_helpers::MockRig;
use common::{register_accel, wait_until, FIRMWARE};
use sensorboard::alloc::{Reaction, RouteSpec, TimerRoute};
use sensorboard::{BoardConfig, BoardError, ConnectionStatus, FirmwareVersion};
use std::thread;
use std::time::Duration;

#[test]
fn test_z_threshold_chain_is_built_on_the_board() {
    let rig = MockRig::spawn(BoardConfig::default());
    let accel = register_accel(&rig.handle);

    let route = rig.handle.create_route(z_threshold_route(accel)).unwrap();
    assert_eq!(route.processors, vec![0, 1]);
    assert_eq!(route.log_slots(), vec![0]);

    let processors = rig.control.processors();
    // Average reads the Z axis: two bytes at offset 4
    assert_eq!(processors[&0][..4], [0x03, 0x04, 0xff, 0x24]);
    assert_eq!(processors[&0][4..], [0x03, 0x15, 16]);
    // Threshold reads the average's output
    assert_eq!(processors[&1][..4], [0x09, 0x03, 0x00, 0x20]);
    assert_eq!(rig.control.triggers()[&0], [0x09, 0x03, 0x01, 0x20]);

    let creations: Vec<(u8, u8)> = rig
        .control
        .history()
        .iter()
        .map(|c| (c[0], c[1]))
        .collect();
    assert_eq!(creations, vec![(0x09, 0x02), (0x09, 0x02), (0x0b, 0x02)]);

    let status = rig.handle.status().unwrap();
    assert_eq!(status.routes, 1);
    assert_eq!(status.loggers, 1);
}

#[test]
fn test_concurrent_requests_never_interleave() {
    let rig = MockRig::spawn(BoardConfig::default());
    let accel = register_accel(&rig.handle);

    let workers: Vec<_> = (0..3)
        .map(|axis| {
            let handle = rig.handle.clone();
            thread::spawn(move || {
                handle
                    .create_route(axis_route(accel, axis, &format!("axis-{}", axis)))
                    .unwrap()
            })
        })
        .collect();
    let routes: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    // Each route's trigger follows its own processor directly
    let history = rig.control.history();
    assert_eq!(history.len(), 6);
    for pair in history.chunks(2) {
        assert_eq!((pair[0][0], pair[0][1]), (0x09, 0x02));
        assert_eq!((pair[1][0], pair[1][1]), (0x0b, 0x02));
    }
    let mut ids: Vec<_> = routes.iter().map(|r| r.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[test]
fn test_queued_routes_run_every_phase_in_submission_order() {
    let rig = MockRig::spawn(BoardConfig::default());
    let accel = register_accel(&rig.handle);

    let workers: Vec<_> = (0..3)
        .map(|axis| {
            let handle = rig.handle.clone();
            thread::spawn(move || {
                handle
                    .create_route(resetting_axis_route(accel, axis, &format!("avg-{}", axis)))
                    .unwrap()
            })
        })
        .collect();
    let mut routes: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    routes.sort_by_key(|r| r.processors[0]);

    // Processors, then the trigger, then the event entry and its parameters,
    // one request after the other
    let history = rig.control.history();
    assert_eq!(history.len(), 15);
    for (i, request) in history.chunks(5).enumerate() {
        let (average, threshold, slot) = (2 * i as u8, 2 * i as u8 + 1, i as u8);
        let shape: Vec<(u8, u8)> = request.iter().map(|c| (c[0], c[1])).collect();
        assert_eq!(
            shape,
            vec![(0x09, 0x02), (0x09, 0x02), (0x0b, 0x02), (0x0a, 0x02), (0x0a, 0x03)]
        );
        assert_eq!(request[1][2..6], [0x09, 0x03, average, 0x20]);
        assert_eq!(request[2][2..5], [0x09, 0x03, threshold]);
        assert_eq!(request[3][2..], [0x09, 0x03, threshold, 0x09, 0x04, 3]);
        assert_eq!(request[4][2..], [average, 0, 0]);

        assert_eq!(routes[i].processors, vec![average, threshold]);
        assert_eq!(routes[i].log_slots(), vec![slot]);
    }
}

#[test]
fn test_node_reaction_binds_threshold_to_average_reset() {
    let rig = MockRig::spawn(BoardConfig::default());
    let accel = register_accel(&rig.handle);

    let route = rig
        .handle
        .create_route(resetting_axis_route(accel, 2, "z-average"))
        .unwrap();
    assert_eq!(route.processors, vec![0, 1]);

    let events = rig.control.events();
    assert_eq!(events.len(), 1);
    // Threshold output resets processor 0
    assert_eq!(events[&0].entry, vec![0x09, 0x03, 0x01, 0x09, 0x04, 3]);
    assert_eq!(events[&0].params, vec![0x00, 0, 0]);

    rig.handle.remove_route(route.id).unwrap();
    assert!(rig.control.events().is_empty());
    assert!(rig.control.processors().is_empty());
}

#[test]
fn test_event_timeout_rolls_back_triggers_and_processors() {
    let rig = MockRig::spawn(fast_config());
    let accel = register_accel(&rig.handle);

    rig.control.silence(0x0a, 0x02);
    let result = rig.handle.create_route(resetting_axis_route(accel, 2, "z-average"));
    assert_eq!(
        result,
        Err(BoardError::CreationTimeout {
            module: 0x0a,
            register: 0x02
        })
    );

    // Trigger first, then processors newest first
    let history = rig.control.history();
    assert_eq!(
        &history[history.len() - 3..],
        &[
            vec![0x0b, 0x03, 0x00],
            vec![0x09, 0x06, 0x01],
            vec![0x09, 0x06, 0x00]
        ]
    );
    assert!(rig.control.processors().is_empty());
    assert!(rig.control.triggers().is_empty());
    // The unanswered entry is unknown to the host and stays on the board
    assert_eq!(rig.control.events().len(), 1);

    let status = rig.handle.status().unwrap();
    assert_eq!((status.routes, status.loggers, status.pending_routes), (0, 0, 0));

    rig.control.heal();
    rig.handle
        .create_route(resetting_axis_route(accel, 2, "z-average"))
        .unwrap();
}

#[test]
fn test_creation_timeout_rolls_back() {
    let rig = MockRig::spawn(fast_config());
    let accel = register_accel(&rig.handle);

    rig.control.silence(0x0b, 0x02);
    let result = rig.handle.create_route(z_threshold_route(accel));
    assert_eq!(
        result,
        Err(BoardError::CreationTimeout {
            module: 0x0b,
            register: 0x02
        })
    );
    // Both processors were removed, newest first
    assert!(rig.control.processors().is_empty());
    let history = rig.control.history();
    assert_eq!(
        &history[history.len() - 2..],
        &[vec![0x09, 0x06, 0x01], vec![0x09, 0x06, 0x00]]
    );

    // The name is free again and the next route succeeds
    rig.control.heal();
    let route = rig.handle.create_route(z_threshold_route(accel)).unwrap();
    assert_eq!(route.processors, vec![0, 1]);
    assert_eq!(rig.handle.status().unwrap().routes, 1);
}

#[test]
fn test_refused_write_fails_route() {
    let rig = MockRig::spawn(fast_config());
    let accel = register_accel(&rig.handle);

    rig.control.refuse(0x0b, 0x02);
    let result = rig.handle.create_route(z_threshold_route(accel));
    assert!(matches!(result, Err(BoardError::Transport(_))));
    assert!(rig.control.processors().is_empty());
}

#[test]
fn test_duplicate_name_is_rejected() {
    let rig = MockRig::spawn(BoardConfig::default());
    let accel = register_accel(&rig.handle);

    rig.handle.create_route(z_threshold_route(accel)).unwrap();
    let sent_before = rig.control.history().len();
    let result = rig.handle.create_route(axis_route(accel, 0, "z-threshold"));
    assert!(matches!(result, Err(BoardError::DuplicateProcessorName(_))));
    assert_eq!(rig.control.history().len(), sent_before);
}

#[test]
fn test_disconnect_defers_removals_until_reconnect() {
    let rig = MockRig::spawn(BoardConfig::default());
    let accel = register_accel(&rig.handle);
    rig.control.silence(0x0b, 0x02);

    let handle = rig.handle.clone();
    let pending = thread::spawn(move || handle.create_route(z_threshold_route(accel)));
    assert!(wait_until(Duration::from_secs(1), || rig
        .control
        .history()
        .iter()
        .any(|c| c[..2] == [0x0b, 0x02])));

    rig.control.disconnect();
    assert_eq!(pending.join().unwrap(), Err(BoardError::ConnectionLost));
    assert_eq!(rig.control.processors().len(), 2);

    rig.control.heal();
    rig.control.connect(None);
    assert!(wait_until(Duration::from_secs(1), || rig
        .control
        .processors()
        .is_empty()));
    assert_eq!(
        rig.handle.status().unwrap().connection,
        ConnectionStatus::Connected
    );
}

#[test]
fn test_requests_fail_while_disconnected() {
    let rig = MockRig::spawn(BoardConfig::default());
    let accel = register_accel(&rig.handle);

    rig.control.disconnect();
    assert!(wait_until(Duration::from_secs(1), || rig
        .handle
        .status()
        .map(|s| s.connection == ConnectionStatus::Disconnected)
        .unwrap_or(false)));
    assert_eq!(
        rig.handle.create_route(z_threshold_route(accel)),
        Err(BoardError::ConnectionLost)
    );
}

#[test]
fn test_firmware_change_drops_routes() {
    let rig = MockRig::spawn(BoardConfig::default());
    let accel = register_accel(&rig.handle);
    rig.handle.create_route(z_threshold_route(accel)).unwrap();

    rig.control.disconnect();
    rig.control.connect(Some(FirmwareVersion::new(1, 6, 0)));
    assert!(wait_until(Duration::from_secs(1), || rig
        .handle
        .status()
        .map(|s| s.firmware != FIRMWARE && s.routes == 0)
        .unwrap_or(false)));

    // Names were dropped with the routes; the source survives
    let route = rig.handle.create_route(z_threshold_route(accel)).unwrap();
    assert_eq!(route.processors, vec![0, 1]);
}

#[test]
fn test_timer_route_resets_named_processor() {
    let rig = MockRig::spawn(BoardConfig::default());
    let accel = register_accel(&rig.handle);
    rig.handle.create_route(z_threshold_route(accel)).unwrap();

    let timer = rig
        .handle
        .create_route(RouteSpec::Timer(
            TimerRoute::new(1000).react(Reaction::reset("z-threshold", vec![0, 0])),
        ))
        .unwrap();
    assert_eq!(timer.timer, Some(0));
    assert!(timer.timer_producer.is_some());

    assert_eq!(rig.control.timers()[&0], vec![0xe8, 0x03, 0, 0, 0xff, 0xff, 0]);
    let events = rig.control.events();
    let event = &events[&0];
    assert_eq!(event.entry[..5], [0x0c, 0x06, 0x00, 0x09, 0x04]);
    assert_eq!(event.params, vec![0x01, 0, 0]);
    assert_eq!(rig.control.history().last(), Some(&vec![0x0c, 0x03, 0x00]));
}

#[test]
fn test_remove_route_frees_board_entities() {
    let rig = MockRig::spawn(BoardConfig::default());
    let accel = register_accel(&rig.handle);
    let route = rig.handle.create_route(z_threshold_route(accel)).unwrap();

    rig.handle.remove_route(route.id).unwrap();
    assert!(rig.control.processors().is_empty());
    assert!(rig.control.triggers().is_empty());

    let status = rig.handle.status().unwrap();
    assert_eq!((status.routes, status.loggers), (0, 0));
    assert!(matches!(
        rig.handle.remove_route(route.id),
        Err(BoardError::UnknownRoute(_))
    ));

    // The name can be reused
    rig.handle.create_route(z_threshold_route(accel)).unwrap();
}
