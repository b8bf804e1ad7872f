//! End-to-end scenarios against the scriptable mock transport: connect
//! ordering, disconnect idempotence, stream retry behavior, control-point
//! exchanges and advertisement-driven reconnection.

use rowlink::infrastructure::bluetooth::codec::{
    build_cps_frame, build_handle_force_fragment,
};
use rowlink::infrastructure::bluetooth::mock::{MockAdapter, MockLink};
use rowlink::infrastructure::bluetooth::settings_codec::{
    build_general_settings_frame, build_stroke_settings_frame, GeneralSettingsFrame,
    MachineSettingsFrame, StrokeSettingsFrame,
};
use rowlink::infrastructure::bluetooth::transport::TransportError;
use rowlink::infrastructure::bluetooth::uuids;
use rowlink::{
    CommandOutcome, ConfigService, ConnectionStatus, MessageSeverity, MonitorEvent, RowerLink,
    StrokeDetectionType, TriState,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const DEVICE_ID: &str = "rower-1";
const DEVICE_NAME: &str = "Rower Monitor";

fn fixture() -> (
    Arc<MockAdapter>,
    Arc<MockLink>,
    Arc<RowerLink>,
    mpsc::UnboundedReceiver<MonitorEvent>,
) {
    let adapter = MockAdapter::new();
    let link = MockLink::new(DEVICE_ID, DEVICE_NAME);
    for (service, characteristic) in [
        (
            uuids::CYCLING_POWER_SERVICE,
            uuids::CYCLING_POWER_MEASUREMENT,
        ),
        (uuids::EXTENDED_METRICS_SERVICE, uuids::EXTENDED_METRICS),
        (uuids::EXTENDED_METRICS_SERVICE, uuids::HANDLE_FORCES),
        (uuids::EXTENDED_METRICS_SERVICE, uuids::DELTA_TIMES),
        (uuids::SETTINGS_SERVICE, uuids::GENERAL_SETTINGS),
        (uuids::SETTINGS_SERVICE, uuids::STROKE_SETTINGS),
        (uuids::SETTINGS_SERVICE, uuids::SETTINGS_CONTROL_POINT),
        (uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL),
    ] {
        link.add_characteristic(service, characteristic);
    }
    adapter.add_link(Arc::clone(&link));
    adapter.script_selection(Some(DEVICE_ID));

    let config = Arc::new(Mutex::new(ConfigService::ephemeral()));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let rower = RowerLink::new(Arc::clone(&adapter) as _, config, events_tx);
    (adapter, link, rower, events_rx)
}

async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<MonitorEvent>,
    description: &str,
    predicate: impl Fn(&MonitorEvent) -> bool,
) -> MonitorEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never observed: {description}"))
}

#[tokio::test(start_paused = true)]
async fn discover_connects_characteristics_in_fixed_order() {
    let (_adapter, link, rower, _events) = fixture();

    rower.discover().await;

    assert_eq!(
        *rower.status().borrow(),
        ConnectionStatus::Connected {
            device_name: Some(DEVICE_NAME.to_string())
        }
    );
    assert_eq!(
        link.resolved_order(),
        vec![
            uuids::CYCLING_POWER_MEASUREMENT,
            uuids::EXTENDED_METRICS,
            uuids::HANDLE_FORCES,
            uuids::DELTA_TIMES,
            uuids::GENERAL_SETTINGS,
            uuids::STROKE_SETTINGS,
            uuids::BATTERY_LEVEL,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_selection_falls_back_to_reconnect_and_stays_disconnected() {
    let (adapter, _link, rower, _events) = fixture();
    adapter.script_selection(None);

    // no remembered device yet, so the fallback ends quietly
    rower.discover().await;
    assert_eq!(*rower.status().borrow(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_device_is_idempotent() {
    let (_adapter, link, rower, _events) = fixture();
    rower.discover().await;

    rower.disconnect_device().await;
    rower.disconnect_device().await;

    assert_eq!(*rower.status().borrow(), ConnectionStatus::Disconnected);
    assert!(!link.is_connected_blocking());

    // and with nothing connected at all it is still a quiet no-op
    let (_adapter2, _link2, rower2, _events2) = fixture();
    rower2.disconnect_device().await;
    assert_eq!(*rower2.status().borrow(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn open_failure_aborts_before_characteristic_connects() {
    let (_adapter, link, rower, mut events) = fixture();
    link.set_open_fails(true);

    rower.discover().await;

    assert_eq!(*rower.status().borrow(), ConnectionStatus::Disconnected);
    assert!(link.resolved_order().is_empty());
    wait_for_event(&mut events, "connect failure notice", |event| {
        matches!(event, MonitorEvent::Notice(message)
            if message.severity == MessageSeverity::Error)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn measurement_notifications_become_metrics_with_duplicate_suppression() {
    let (_adapter, link, rower, mut events) = fixture();
    rower.discover().await;
    // let the stream tasks pick up the freshly populated slots
    tokio::time::sleep(Duration::from_millis(20)).await;

    let frame_a = build_cps_frame(120, 1_000, 2_000, 10, 2_000);
    let frame_b = build_cps_frame(130, 1_050, 2_400, 11, 2_400);
    link.notify(uuids::CYCLING_POWER_MEASUREMENT, frame_a.to_vec());
    link.notify(uuids::CYCLING_POWER_MEASUREMENT, frame_a.to_vec());
    link.notify(uuids::CYCLING_POWER_MEASUREMENT, frame_b.to_vec());

    let first = wait_for_event(&mut events, "first metrics", |event| {
        matches!(event, MonitorEvent::Metrics(_))
    })
    .await;
    let MonitorEvent::Metrics(first) = first else {
        unreachable!()
    };
    assert_eq!(first.distance_cm, 1_000);
    assert_eq!(first.stroke_count, 10);

    // the duplicate was suppressed, so the next metrics are frame B's
    let second = wait_for_event(&mut events, "second metrics", |event| {
        matches!(event, MonitorEvent::Metrics(_))
    })
    .await;
    let MonitorEvent::Metrics(second) = second else {
        unreachable!()
    };
    assert_eq!(second.distance_cm, 1_050);
    assert_eq!(second.stroke_count, 11);

    // low-cadence keep-alive re-emits the last value once the device goes
    // quiet
    let keepalive = wait_for_event(&mut events, "keep-alive metrics", |event| {
        matches!(event, MonitorEvent::Metrics(_))
    })
    .await;
    let MonitorEvent::Metrics(keepalive) = keepalive else {
        unreachable!()
    };
    assert_eq!(keepalive, second);
}

#[tokio::test(start_paused = true)]
async fn handle_force_fragments_reassemble_into_one_frame() {
    let (_adapter, link, rower, mut events) = fixture();
    rower.discover().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    link.notify(
        uuids::HANDLE_FORCES,
        build_handle_force_fragment(1, 3, &[1.0, 2.0]),
    );
    link.notify(
        uuids::HANDLE_FORCES,
        build_handle_force_fragment(2, 3, &[3.0]),
    );
    link.notify(
        uuids::HANDLE_FORCES,
        build_handle_force_fragment(3, 3, &[4.0, 5.0]),
    );

    let event = wait_for_event(&mut events, "handle force frame", |event| {
        matches!(event, MonitorEvent::HandleForces(_))
    })
    .await;
    let MonitorEvent::HandleForces(frame) = event else {
        unreachable!()
    };
    assert_eq!(frame.forces_n, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[tokio::test(start_paused = true)]
async fn settings_views_merge_across_both_characteristics() {
    let (_adapter, link, rower, mut events) = fixture();
    rower.discover().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    link.notify(
        uuids::GENERAL_SETTINGS,
        build_general_settings_frame(&GeneralSettingsFrame {
            log_delta_times: TriState::On,
            log_to_sd_card: TriState::Off,
            log_level: 4,
            runtime_settings_enabled: true,
            machine: Some(MachineSettingsFrame {
                flywheel_inertia: 0.1,
                magic_constant: 2.8,
                sprocket_radius: 0.014,
                impulses_per_revolution: 3,
                sensor_debounce: 15,
                sensor_stop_threshold: 60,
                drag_fit_goodness: 0.9,
                drag_fit_recovery_period: 6,
                drag_factor_lower: 75,
                drag_factor_upper: 250,
                drag_fit_curve_length: 9,
            }),
        }),
    );
    wait_for_event(&mut events, "general settings", |event| {
        matches!(event, MonitorEvent::Settings(_))
    })
    .await;

    link.notify(
        uuids::STROKE_SETTINGS,
        build_stroke_settings_frame(&StrokeSettingsFrame {
            stroke_detection: StrokeDetectionType::Both,
            impulse_data_array_length: 12,
            double_precision: true,
            minimum_drive_torque: 0.3,
            minimum_recovery_torque: 0.2,
            recovery_slope_margin: None,
            recovery_slope: -0.05,
            minimum_recovery_time_ms: 900,
            minimum_drive_time_ms: 1400,
            max_handle_force_capacity: 200,
        }),
    );
    let event = wait_for_event(&mut events, "merged settings", |event| {
        matches!(event, MonitorEvent::Settings(settings)
            if settings.general.compiled_with_double_precision)
    })
    .await;
    let MonitorEvent::Settings(settings) = event else {
        unreachable!()
    };
    // both views survive in the merged value, and the service flag comes
    // from the registered CPS measurement characteristic
    assert_eq!(settings.general.log_level, 4);
    assert_eq!(settings.rowing.impulses_per_revolution, 3);
    assert_eq!(settings.rowing.minimum_drive_time_ms, 1400);
    assert_eq!(
        settings.general.ble_service,
        rowlink::BleServiceFlag::Cps
    );
    assert_eq!(rower.settings(), settings);
}

#[tokio::test(start_paused = true)]
async fn battery_stream_reaches_fallback_after_exactly_four_retries() {
    let (_adapter, link, rower, mut events) = fixture();
    rower.discover().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let resolved_after_connect = link.resolution_count(uuids::BATTERY_LEVEL);

    // every subsequent read/subscribe fails with the "unknown" class of
    // hardware error, and the live stream errors out right now
    link.set_fault(
        uuids::BATTERY_LEVEL,
        TransportError::Gatt("Unknown GATT operation".to_string()),
    );
    link.notify_error(
        uuids::BATTERY_LEVEL,
        TransportError::Gatt("Unknown GATT operation".to_string()),
    );

    wait_for_event(&mut events, "battery fallback", |event| {
        matches!(event, MonitorEvent::BatteryLevel(0))
    })
    .await;

    // each of the four retries saw an unknown error on a live link, so each
    // forced one re-subscription through connect_to_battery
    assert_eq!(
        link.resolution_count(uuids::BATTERY_LEVEL),
        resolved_after_connect + 4
    );
}

#[tokio::test(start_paused = true)]
async fn ordinary_stream_errors_retry_without_forced_reconnect() {
    let (_adapter, link, rower, mut events) = fixture();
    rower.discover().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let resolved_after_connect = link.resolution_count(uuids::BATTERY_LEVEL);

    link.set_fault(
        uuids::BATTERY_LEVEL,
        TransportError::Gatt("read not permitted".to_string()),
    );
    link.notify_error(
        uuids::BATTERY_LEVEL,
        TransportError::Gatt("read not permitted".to_string()),
    );

    wait_for_event(&mut events, "battery fallback", |event| {
        matches!(event, MonitorEvent::BatteryLevel(0))
    })
    .await;

    // no "unknown" marker, so connect_to_battery was never invoked again
    assert_eq!(
        link.resolution_count(uuids::BATTERY_LEVEL),
        resolved_after_connect
    );
}

#[tokio::test(start_paused = true)]
async fn control_point_success_stops_notifications() {
    let (_adapter, link, rower, mut events) = fixture();
    rower.discover().await;
    link.set_responder(uuids::SETTINGS_CONTROL_POINT, |payload| {
        Some(vec![0x80, payload[0], 0x01])
    });

    let outcome = rower.change_log_level(4).await;

    assert_eq!(outcome, CommandOutcome::Success);
    assert_eq!(link.unsubscribe_count(uuids::SETTINGS_CONTROL_POINT), 1);
    wait_for_event(&mut events, "success notice", |event| {
        matches!(event, MonitorEvent::Notice(message)
            if message.severity == MessageSeverity::Success
                && message.message.contains("log level"))
    })
    .await;
    // the written frame is opcode + payload
    let writes = link.writes();
    let control_write = writes
        .iter()
        .find(|(uuid, _)| *uuid == uuids::SETTINGS_CONTROL_POINT)
        .expect("control point write");
    assert_eq!(control_write.1, vec![0x13, 0x04]);
}

#[tokio::test(start_paused = true)]
async fn control_point_rejection_surfaces_result_code() {
    let (_adapter, link, rower, mut events) = fixture();
    rower.discover().await;
    link.set_responder(uuids::SETTINGS_CONTROL_POINT, |payload| {
        Some(vec![0x80, payload[0], 0x04])
    });

    let outcome = rower.change_delta_time_logging(true).await;

    assert!(matches!(outcome, CommandOutcome::Rejected(_)));
    assert_eq!(link.unsubscribe_count(uuids::SETTINGS_CONTROL_POINT), 1);
    wait_for_event(&mut events, "failure notice", |event| {
        matches!(event, MonitorEvent::Notice(message)
            if message.severity == MessageSeverity::Error
                && message.message.contains("operation failed"))
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn control_point_timeout_skips_notification_stop() {
    let (_adapter, link, rower, mut events) = fixture();
    rower.discover().await;
    let status_before = rower.status().borrow().clone();

    // no responder scripted: the device never answers
    let outcome = rower.change_sensor_settings(15, 60).await;

    assert_eq!(outcome, CommandOutcome::TimedOut);
    assert_eq!(*rower.status().borrow(), status_before);
    // a timeout skips straight to the error handler without stopping
    // notifications
    assert_eq!(link.unsubscribe_count(uuids::SETTINGS_CONTROL_POINT), 0);
    wait_for_event(&mut events, "timeout notice", |event| {
        matches!(event, MonitorEvent::Notice(message)
            if message.message.contains("request timed out"))
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn commands_short_circuit_while_disconnected() {
    let (_adapter, link, rower, mut events) = fixture();

    let outcome = rower.change_log_level(2).await;

    assert_eq!(outcome, CommandOutcome::NotConnected);
    assert!(link.writes().is_empty());
    wait_for_event(&mut events, "not connected notice", |event| {
        matches!(event, MonitorEvent::Notice(message)
            if message.message.contains("Not connected"))
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn hardware_disconnect_searches_and_reconnects_on_advertisement() {
    let (adapter, _link, rower, _events) = fixture();
    rower.discover().await;
    let mut status = rower.status();

    adapter.drop_link(DEVICE_ID);

    tokio::time::timeout(
        Duration::from_secs(120),
        status.wait_for(|current| *current == ConnectionStatus::Searching),
    )
    .await
    .expect("search never started")
    .expect("status channel closed");

    adapter.advertise(DEVICE_ID);

    tokio::time::timeout(
        Duration::from_secs(120),
        status.wait_for(|current| {
            matches!(current, ConnectionStatus::Connected { device_name }
                if device_name.as_deref() == Some(DEVICE_NAME))
        }),
    )
    .await
    .expect("device never reconnected")
    .expect("status channel closed");
}

#[tokio::test(start_paused = true)]
async fn hidden_host_suspends_reconnect_scanning() {
    let (adapter, _link, rower, _events) = fixture();
    rower.discover().await;
    let mut status = rower.status();

    rower.set_foreground(false);
    adapter.drop_link(DEVICE_ID);

    // nothing happens in the background: the loop must not reach Searching
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Disconnected);

    rower.set_foreground(true);
    tokio::time::timeout(
        Duration::from_secs(120),
        status.wait_for(|current| *current == ConnectionStatus::Searching),
    )
    .await
    .expect("search never resumed")
    .expect("status channel closed");
}
