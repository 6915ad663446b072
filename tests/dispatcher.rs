use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use triad_ams::testing::Simulator;
use triad_ams::{AmsConfig, AmsError, Dispatcher, Output, TransportConfig};

const ZONE_1_ON: [u8; 6] = [0xFF, 0x55, 0x03, 0x05, 0x50, 0x00];
const ZONE_1_OFF: [u8; 6] = [0xFF, 0x55, 0x03, 0x05, 0x51, 0x00];

fn fast_config(simulator: &Simulator) -> AmsConfig {
    let mut config = AmsConfig::new(simulator.host(), simulator.port(), 8);
    config.dispatcher.min_send_interval_ms = 1;
    config.dispatcher.poll_interval_ms = 60_000;
    config.dispatcher.connect_timeout_ms = 1_000;
    config.transport = TransportConfig {
        connect_settle_ms: 5,
        command_settle_ms: 1,
        read_timeout_ms: 200,
    };
    config
}

fn started(config: AmsConfig) -> Dispatcher {
    let dispatcher = Dispatcher::with_config(config).unwrap();
    dispatcher.start();
    dispatcher
}

fn count(received: &[Vec<u8>], command: &[u8]) -> usize {
    received.iter().filter(|c| c.as_slice() == command).count()
}

#[tokio::test]
async fn test_timeout_marks_unavailable() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let transitions_clone = transitions.clone();
    let _subscription = dispatcher
        .add_availability_listener(move |available| transitions_clone.lock().unwrap().push(available));

    assert!(dispatcher.is_available());
    simulator.stall_next(1);
    let result = dispatcher.get_output_volume(1).await;
    assert!(matches!(result, Err(AmsError::Timeout)), "{:?}", result);
    assert!(!dispatcher.is_available());

    // self-heals on the next command
    assert_eq!(dispatcher.get_output_volume(1).await.unwrap(), 0.5);
    assert!(dispatcher.is_available());
    assert_eq!(*transitions.lock().unwrap(), vec![false, true]);

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_availability_is_edge_triggered() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let transitions_clone = transitions.clone();
    let subscription = dispatcher
        .add_availability_listener(move |available| transitions_clone.lock().unwrap().push(available));

    dispatcher.get_output_mute(1).await.unwrap();
    simulator.fail_next();
    assert!(dispatcher.get_output_mute(1).await.is_err());
    simulator.fail_next();
    assert!(dispatcher.get_output_mute(1).await.is_err());
    dispatcher.get_output_mute(1).await.unwrap();
    dispatcher.get_output_mute(1).await.unwrap();
    assert_eq!(*transitions.lock().unwrap(), vec![false, true]);

    subscription.unsubscribe();
    simulator.fail_next();
    assert!(dispatcher.get_output_mute(1).await.is_err());
    assert_eq!(transitions.lock().unwrap().len(), 2);

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_non_transport_errors_leave_availability() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    let result = dispatcher.set_output_volume(0, 0.5).await;
    assert!(matches!(result, Err(AmsError::InvalidChannel(_))));
    assert!(dispatcher.is_available());
    assert!(simulator.received().is_empty());

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_protocol_error_reconnects_for_next_command() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    let result = dispatcher.send_raw(vec![0xFF, 0x55, 0x09, 0x09, 0x09, 0x00]).await;
    assert!(matches!(result, Err(AmsError::Protocol(_))), "{:?}", result);
    assert!(!dispatcher.is_available());
    // the best-effort reconnect already happened
    assert_eq!(simulator.connection_count(), 2);

    dispatcher.set_output_mute(1, true).await.unwrap();
    assert!(simulator.muted(1));
    assert_eq!(simulator.connection_count(), 2);

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_send_raw_passthrough() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    let reply = dispatcher
        .send_raw(vec![0xFF, 0x55, 0x04, 0x03, 0x1E, 0xF5, 0x00])
        .await
        .unwrap();
    assert_eq!(reply, "Volume : 0x32");

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_zone_trigger_follows_routing() {
    let simulator = Simulator::start(8, 16).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    dispatcher.set_output_to_input(1, 1).await.unwrap();
    dispatcher.set_output_to_input(2, 2).await.unwrap();
    assert!(simulator.zone_state(1));
    assert_eq!(dispatcher.trigger_zone_state(1), Some(true));
    assert_eq!(count(&simulator.received(), &ZONE_1_ON), 1);

    dispatcher.disconnect_output(1).await.unwrap();
    assert!(simulator.zone_state(1), "output 2 still routed");
    assert_eq!(count(&simulator.received(), &ZONE_1_OFF), 0);

    dispatcher.disconnect_output(2).await.unwrap();
    assert!(!simulator.zone_state(1));
    assert_eq!(dispatcher.trigger_zone_state(1), Some(false));
    assert_eq!(count(&simulator.received(), &ZONE_1_OFF), 1);

    // zone 2 is independent
    assert_eq!(dispatcher.trigger_zone_state(2), None);
    dispatcher.set_output_to_input(9, 3).await.unwrap();
    assert!(simulator.zone_state(2));
    assert!(!simulator.zone_state(1));

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_concurrent_route_keeps_zone_energized() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    dispatcher.set_output_to_input(1, 1).await.unwrap();
    assert!(simulator.zone_state(1));

    let (released, routed) = tokio::join!(
        dispatcher.disconnect_output(1),
        dispatcher.set_output_to_input(2, 2),
    );
    released.unwrap();
    routed.unwrap();

    assert_eq!(simulator.source(1), None);
    assert_eq!(simulator.source(2), Some(2));
    assert!(simulator.zone_state(1), "output 2 is routed in zone 1");
    assert_eq!(dispatcher.trigger_zone_state(1), Some(true));

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_concurrent_disconnects_release_zone() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    dispatcher.set_output_to_input(1, 1).await.unwrap();
    dispatcher.set_output_to_input(2, 2).await.unwrap();

    let (first, second) = tokio::join!(
        dispatcher.disconnect_output(1),
        dispatcher.disconnect_output(2),
    );
    first.unwrap();
    second.unwrap();

    assert!(!simulator.zone_state(1));
    assert_eq!(dispatcher.trigger_zone_state(1), Some(false));
    assert_eq!(count(&simulator.received(), &ZONE_1_OFF), 1);

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_failed_trigger_is_retried_by_next_route() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    simulator.stall_next(1);
    let result = dispatcher.set_trigger_zone(1, true).await;
    assert!(matches!(result, Err(AmsError::Timeout)), "{:?}", result);
    assert_eq!(dispatcher.trigger_zone_state(1), None);
    assert!(!simulator.zone_state(1));

    dispatcher.set_output_to_input(1, 1).await.unwrap();
    assert!(simulator.zone_state(1));
    assert_eq!(dispatcher.trigger_zone_state(1), Some(true));

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_source_reads_feed_zone_bookkeeping() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    // routed before this session started
    simulator.set_source(1, Some(3));
    assert_eq!(dispatcher.get_output_source(1).await.unwrap(), Some(3));

    dispatcher.disconnect_output(1).await.unwrap();
    assert_eq!(count(&simulator.received(), &ZONE_1_OFF), 1);

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_commands_run_in_fifo_order_with_pacing() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let mut config = fast_config(&simulator);
    config.dispatcher.min_send_interval_ms = 40;
    let dispatcher = started(config);

    let started_at = Instant::now();
    let (a, b, c) = tokio::join!(
        dispatcher.set_output_volume(1, 0.10),
        dispatcher.set_output_volume(2, 0.20),
        dispatcher.set_output_volume(3, 0.30),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert!(started_at.elapsed() >= Duration::from_millis(80));

    let outputs: Vec<u8> = simulator.received().iter().map(|c| c[5]).collect();
    assert_eq!(outputs, vec![0, 1, 2]);

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_queued_commands() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    // never started: everything stays queued
    let dispatcher = Dispatcher::with_config(fast_config(&simulator)).unwrap();

    let mut pending = Vec::new();
    for output in 1..=3 {
        let dispatcher = dispatcher.clone();
        pending.push(tokio::spawn(async move {
            dispatcher.get_output_volume(output).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    dispatcher.stop().await;
    for handle in pending {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(AmsError::Cancelled)), "{:?}", result);
    }
    assert!(simulator.received().is_empty());
    simulator.stop().await;
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));
    dispatcher.start();
    assert!(dispatcher.is_running());

    dispatcher.get_output_mute(1).await.unwrap();
    dispatcher.stop().await;
    dispatcher.stop().await;
    assert!(!dispatcher.is_running());

    // restart after stop
    dispatcher.start();
    dispatcher.get_output_mute(1).await.unwrap();
    dispatcher.stop().await;
    dispatcher.disconnect().await.unwrap();
    simulator.stop().await;
}

#[tokio::test]
async fn test_poller_refreshes_registered_outputs() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let mut config = fast_config(&simulator);
    config.dispatcher.poll_interval_ms = 20;
    let dispatcher = started(config);

    let first = Output::new(1, "Kitchen", dispatcher.clone());
    let second = Output::new(2, "Patio", dispatcher.clone());
    let _first_polling = dispatcher.register_output(&first);
    let _second_polling = dispatcher.register_output(&second);

    let notified = Arc::new(Mutex::new(0usize));
    let notified_clone = notified.clone();
    let _listener = second.add_listener(move || *notified_clone.lock().unwrap() += 1);

    simulator.set_volume(1, 20);
    simulator.set_volume(2, 30);
    simulator.set_source(2, Some(4));

    let deadline = Instant::now() + Duration::from_secs(3);
    while (first.volume() != Some(0.2) || second.source() != Some(4)) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(first.volume(), Some(0.2));
    assert_eq!(second.volume(), Some(0.3));
    assert_eq!(second.source(), Some(4));
    assert!(second.is_on());
    assert!(*notified.lock().unwrap() >= 1);

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_poller_survives_refresh_failure() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let mut config = fast_config(&simulator);
    config.dispatcher.poll_interval_ms = 20;
    let dispatcher = started(config);

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let transitions_clone = transitions.clone();
    let _availability = dispatcher
        .add_availability_listener(move |available| transitions_clone.lock().unwrap().push(available));

    let output = Output::new(1, "Kitchen", dispatcher.clone());
    let notified = Arc::new(Mutex::new(0usize));
    let notified_clone = notified.clone();
    let _listener = output.add_listener(move || *notified_clone.lock().unwrap() += 1);

    // the first poll times out
    simulator.stall_next(1);
    let _polling = dispatcher.register_output(&output);

    let deadline = Instant::now() + Duration::from_secs(3);
    while transitions.lock().unwrap().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(transitions.lock().unwrap().first(), Some(&false));

    simulator.set_volume(1, 20);
    while output.volume() != Some(0.2) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(output.volume(), Some(0.2));
    assert!(dispatcher.is_available());
    assert!(*notified.lock().unwrap() >= 2);

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_poller_refreshes_immediately() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    // 60 s interval: only the first poll can land in time
    let dispatcher = Dispatcher::with_config(fast_config(&simulator)).unwrap();
    simulator.set_volume(1, 70);

    let output = Output::new(1, "Kitchen", dispatcher.clone());
    let _polling = dispatcher.register_output(&output);
    dispatcher.start();

    let deadline = Instant::now() + Duration::from_secs(2);
    while output.volume().is_none() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(output.volume(), Some(0.7));

    dispatcher.stop().await;
    simulator.stop().await;
}

#[tokio::test]
async fn test_poll_registry_does_not_own_outputs() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = Dispatcher::with_config(fast_config(&simulator)).unwrap();

    let output = Output::new(1, "Kitchen", dispatcher.clone());
    let _polling = dispatcher.register_output(&output);
    assert_eq!(dispatcher.diagnostics().outputs.len(), 1);

    drop(output);
    assert!(dispatcher.diagnostics().outputs.is_empty());

    let kept = Output::new(2, "Patio", dispatcher.clone());
    let polling = dispatcher.register_output(&kept);
    polling.unsubscribe();
    assert!(dispatcher.diagnostics().outputs.is_empty());
    simulator.stop().await;
}

#[tokio::test]
async fn test_diagnostics_snapshot() {
    let simulator = Simulator::start(8, 8).await.unwrap();
    let dispatcher = started(fast_config(&simulator));

    let output = Output::new(3, "Den", dispatcher.clone());
    output.set_source(2).await;
    output.set_volume(0.25).await;
    let _polling = dispatcher.register_output(&output);

    let diagnostics = dispatcher.diagnostics();
    assert_eq!(diagnostics.port, simulator.port());
    assert_eq!(diagnostics.input_count, 8);
    assert!(diagnostics.available);
    let entry = &diagnostics.outputs[0];
    assert_eq!(entry.number, 3);
    assert_eq!(entry.name, "Den");
    assert_eq!(entry.volume, Some(0.25));
    assert_eq!(entry.source, Some(2));
    assert!(entry.has_source);

    let json = serde_json::to_value(&diagnostics).unwrap();
    assert!(json.get("host").is_none());
    assert!(!json.to_string().contains(&simulator.host()));

    dispatcher.stop().await;
    simulator.stop().await;
}
