//! The main link service: owns the adapter, the registry and the connection
//! manager, wires one resilient stream per characteristic, merges the two
//! settings views, and exposes the connection commands plus every
//! control-point mutation.

use crate::domain::config::ConfigService;
use crate::domain::models::{
    BaseMetrics, ConnectionStatus, DeviceInfo, MonitorEvent, StatusMessage,
};
use crate::domain::settings::{BleServiceFlag, RowerSettings, SettingsStore};
use crate::infrastructure::bluetooth::codec::{
    decode_battery_level, decode_delta_times, decode_extended_metrics, CpsDecoder, CscDecoder,
    FtmsDecoder, HandleForceAssembler,
};
use crate::infrastructure::bluetooth::connection::ConnectionManager;
use crate::infrastructure::bluetooth::control::{self, Command, CommandOutcome};
use crate::infrastructure::bluetooth::registry::{CharacteristicRegistry, Slot};
use crate::infrastructure::bluetooth::settings_codec::{
    decode_general_settings, decode_stroke_settings, StrokeSettingsFrame,
};
use crate::infrastructure::bluetooth::stream::{
    self, ReconnectFn, StreamConfig, StreamParams, BATTERY_RETRY_DELAY, METRIC_RETRY_DELAY,
    STREAM_RETRIES,
};
use crate::infrastructure::bluetooth::transport::{BleAdapter, CharacteristicHandle, GattLink};
use crate::infrastructure::bluetooth::uuids;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Low-cadence keep-alive: the measurement feed re-emits its last value when
/// the monitor goes quiet for this long.
const MEASUREMENT_KEEPALIVE: Duration = Duration::from_millis(4500);

/// How long to let a restarting device settle before anything touches BLE
/// again.
const RESTART_SETTLE: Duration = Duration::from_millis(2000);

#[derive(Clone, Copy)]
enum StreamKind {
    Measurement,
    ExtendedMetrics,
    HandleForces,
    DeltaTimes,
    GeneralSettings,
    StrokeSettings,
    Battery,
}

pub struct RowerLink {
    adapter: Arc<dyn BleAdapter>,
    manager: Arc<ConnectionManager>,
    registry: Arc<CharacteristicRegistry>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    status_rx: watch::Receiver<ConnectionStatus>,
    settings: Arc<Mutex<SettingsStore>>,
    visibility_tx: watch::Sender<bool>,
}

impl RowerLink {
    /// Builds the service and spawns its stream tasks. The returned handle
    /// is cheap to clone through the `Arc`.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        config: Arc<Mutex<ConfigService>>,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Arc<Self> {
        let registry = Arc::new(CharacteristicRegistry::new());
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (visibility_tx, visibility_rx) = watch::channel(true);

        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&adapter),
            Arc::clone(&registry),
            config,
            status_tx,
            events.clone(),
            visibility_rx,
        ));

        let service = Arc::new(Self {
            adapter,
            manager,
            registry,
            events,
            status_rx,
            settings: Arc::new(Mutex::new(SettingsStore::new())),
            visibility_tx,
        });
        service.spawn_streams();
        service.spawn_disconnect_watcher();
        service.spawn_device_info_reader();
        service
    }

    /// The connection-status feed. The receiver always holds the current
    /// value.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Hosts report foreground visibility here; reconnection scanning is
    /// suspended while hidden.
    pub fn set_foreground(&self, visible: bool) {
        self.visibility_tx.send_replace(visible);
    }

    /// Current merged settings view.
    pub fn settings(&self) -> RowerSettings {
        let flag = current_service_flag(&self.registry);
        self.settings
            .lock()
            .map(|store| store.merged(flag))
            .unwrap_or_default()
    }

    pub async fn discover(&self) {
        self.manager.discover().await;
    }

    pub async fn reconnect(&self) {
        self.manager.reconnect().await;
    }

    pub async fn disconnect_device(&self) {
        self.manager.disconnect_device().await;
    }

    /// The OTA characteristic pair for an external updater. This crate only
    /// resolves the handles; it never drives an update.
    pub async fn ota_characteristics(
        &self,
    ) -> Option<(CharacteristicHandle, CharacteristicHandle)> {
        let link = self.manager.current_link()?;
        self.manager.resolve_ota(&link).await
    }

    // -- control-point commands --------------------------------------------

    pub async fn change_ble_service(&self, flag: BleServiceFlag) -> CommandOutcome {
        let outcome = self.execute_command(Command::ChangeBleService(flag)).await;
        if outcome == CommandOutcome::Success {
            // the device restarts under a different GATT profile; rediscover
            let manager = Arc::clone(&self.manager);
            tokio::spawn(async move {
                manager.reconnect().await;
            });
        }
        outcome
    }

    pub async fn change_delta_time_logging(&self, enabled: bool) -> CommandOutcome {
        self.execute_command(Command::ChangeDeltaTimeLogging(enabled))
            .await
    }

    pub async fn change_sd_card_logging(&self, enabled: bool) -> CommandOutcome {
        self.execute_command(Command::ChangeSdCardLogging(enabled))
            .await
    }

    pub async fn change_log_level(&self, level: u8) -> CommandOutcome {
        self.execute_command(Command::ChangeLogLevel(level)).await
    }

    pub async fn change_machine_settings(
        &self,
        flywheel_inertia: f32,
        magic_constant: f32,
        sprocket_radius: f32,
        impulses_per_revolution: u8,
    ) -> CommandOutcome {
        self.execute_command(Command::ChangeMachineSettings {
            flywheel_inertia,
            magic_constant,
            sprocket_radius,
            impulses_per_revolution,
        })
        .await
    }

    pub async fn change_sensor_settings(
        &self,
        sensor_debounce: u8,
        sensor_stop_threshold: u8,
    ) -> CommandOutcome {
        self.execute_command(Command::ChangeSensorSettings {
            sensor_debounce,
            sensor_stop_threshold,
        })
        .await
    }

    pub async fn change_drag_factor_settings(
        &self,
        drag_fit_goodness: f32,
        drag_fit_recovery_period: u8,
        drag_factor_lower: u16,
        drag_factor_upper: u16,
        drag_fit_curve_length: u8,
    ) -> CommandOutcome {
        self.execute_command(Command::ChangeDragFactorSettings {
            drag_fit_goodness,
            drag_fit_recovery_period,
            drag_factor_lower,
            drag_factor_upper,
            drag_fit_curve_length,
        })
        .await
    }

    pub async fn change_stroke_settings(&self, settings: StrokeSettingsFrame) -> CommandOutcome {
        self.execute_command(Command::ChangeStrokeSettings(settings))
            .await
    }

    pub async fn restart_device(&self) -> CommandOutcome {
        let outcome = self.execute_command(Command::RestartDevice).await;
        if outcome == CommandOutcome::Success {
            // the device drops the link on its own; disconnect locally and
            // let it settle
            self.manager.disconnect_device().await;
            tokio::time::sleep(RESTART_SETTLE).await;
        }
        outcome
    }

    /// One shared command path: precondition short-circuit, one exchange,
    /// exactly one user notice.
    async fn execute_command(&self, command: Command) -> CommandOutcome {
        let label = command.label();

        let link = self.manager.current_link();
        let settings_present = self.registry.general_settings.current().is_some()
            || self.registry.stroke_settings.current().is_some();
        let Some(link) = link else {
            self.notice(StatusMessage::warning("Not connected to a rower"));
            return CommandOutcome::NotConnected;
        };
        if !settings_present || !link.is_connected().await {
            self.notice(StatusMessage::warning("Not connected to a rower"));
            return CommandOutcome::NotConnected;
        }
        let Some(control) = self.manager.resolve_control_point(&link).await else {
            self.notice(StatusMessage::warning("Not connected to a rower"));
            return CommandOutcome::NotConnected;
        };

        let outcome = control::execute(&link, &control, &command).await;
        match &outcome {
            CommandOutcome::Success => {
                self.notice(StatusMessage::success(format!("{label} was successful")));
            }
            CommandOutcome::Rejected(code) => {
                self.notice(StatusMessage::error(format!(
                    "{label} failed ({})",
                    code.name()
                )));
            }
            CommandOutcome::TimedOut => {
                self.notice(StatusMessage::error(format!(
                    "{label} failed: request timed out"
                )));
            }
            CommandOutcome::Failed => {
                self.notice(StatusMessage::error(format!("{label} failed")));
            }
            CommandOutcome::NotConnected => {}
        }
        outcome
    }

    fn notice(&self, message: StatusMessage) {
        let _ = self.events.send(MonitorEvent::Notice(message));
    }

    // -- stream wiring ------------------------------------------------------

    fn reconnect_fn(&self, kind: StreamKind) -> ReconnectFn {
        let manager = Arc::clone(&self.manager);
        Box::new(move || {
            let manager = Arc::clone(&manager);
            Box::pin(async move {
                let Some(link) = manager.current_link() else {
                    return;
                };
                let _ = match kind {
                    StreamKind::Measurement => manager.connect_to_measurement(&link).await,
                    StreamKind::ExtendedMetrics => {
                        manager.connect_to_extended_metrics(&link).await
                    }
                    StreamKind::HandleForces => manager.connect_to_handle_forces(&link).await,
                    StreamKind::DeltaTimes => manager.connect_to_delta_times(&link).await,
                    StreamKind::GeneralSettings => {
                        manager.connect_to_general_settings(&link).await
                    }
                    StreamKind::StrokeSettings => manager.connect_to_stroke_settings(&link).await,
                    StreamKind::Battery => manager.connect_to_battery(&link).await,
                };
            })
        })
    }

    fn base_params(
        &self,
        slot: fn(&CharacteristicRegistry) -> &Slot,
        kind: StreamKind,
        config: StreamConfig,
        on_payload: Box<dyn FnMut(&[u8]) + Send>,
        on_exhausted: Box<dyn Fn() + Send + Sync>,
    ) -> StreamParams {
        let manager = Arc::clone(&self.manager);
        StreamParams {
            registry: Arc::clone(&self.registry),
            slot,
            link: Box::new(move || manager.current_link()),
            reconnect: self.reconnect_fn(kind),
            on_payload,
            on_exhausted,
            config,
            events: self.events.clone(),
        }
    }

    fn metric_config(label: &'static str, failure_notice: &'static str) -> StreamConfig {
        StreamConfig {
            label,
            retries: STREAM_RETRIES,
            retry_delay: METRIC_RETRY_DELAY,
            failure_notice: Some(failure_notice),
        }
    }

    fn spawn_streams(self: &Arc<Self>) {
        self.spawn_measurement_stream();
        self.spawn_extended_metrics_stream();
        self.spawn_handle_forces_stream();
        self.spawn_delta_times_stream();
        self.spawn_settings_streams();
        self.spawn_battery_stream();
    }

    fn spawn_measurement_stream(self: &Arc<Self>) {
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let last_emit: Arc<Mutex<Option<(BaseMetrics, Instant)>>> = Arc::new(Mutex::new(None));

        let mut pipeline = MeasurementPipeline {
            registry: Arc::clone(&registry),
            events: events.clone(),
            decoder: None,
            last: None,
            last_emit: Arc::clone(&last_emit),
        };
        let params = self.base_params(
            |registry| &registry.measurement,
            StreamKind::Measurement,
            Self::metric_config("measurement stream", "Rowing metrics are not being received"),
            Box::new(move |payload| pipeline.handle(payload)),
            Box::new(|| {}),
        );
        tokio::spawn(stream::run(params));

        // low-cadence keep-alive: re-emit the last metrics when the device
        // goes quiet
        tokio::spawn(async move {
            loop {
                let deadline = last_emit
                    .lock()
                    .ok()
                    .and_then(|guard| guard.map(|(_, at)| at + MEASUREMENT_KEEPALIVE));
                match deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(deadline).await;
                        let stale = last_emit.lock().ok().and_then(|mut guard| {
                            match guard.as_mut() {
                                Some((metrics, at)) if at.elapsed() >= MEASUREMENT_KEEPALIVE => {
                                    *at = Instant::now();
                                    Some(*metrics)
                                }
                                _ => None,
                            }
                        });
                        if let Some(metrics) = stale {
                            let _ = events.send(MonitorEvent::Metrics(metrics));
                        }
                    }
                    None => tokio::time::sleep(MEASUREMENT_KEEPALIVE).await,
                }
            }
        });
    }

    fn spawn_extended_metrics_stream(self: &Arc<Self>) {
        let events = self.events.clone();
        let params = self.base_params(
            |registry| &registry.extended_metrics,
            StreamKind::ExtendedMetrics,
            Self::metric_config("extended metrics stream", "Extended metrics are not being received"),
            Box::new(move |payload| match decode_extended_metrics(payload) {
                Ok(metrics) => {
                    let _ = events.send(MonitorEvent::ExtendedMetrics(metrics));
                }
                Err(error) => debug!("dropping malformed extended metrics frame: {error}"),
            }),
            Box::new(|| {}),
        );
        tokio::spawn(stream::run(params));
    }

    fn spawn_handle_forces_stream(self: &Arc<Self>) {
        let events = self.events.clone();
        let mut assembler = HandleForceAssembler::new();
        let params = self.base_params(
            |registry| &registry.handle_forces,
            StreamKind::HandleForces,
            Self::metric_config("handle forces stream", "Handle forces are not being received"),
            Box::new(move |payload| match assembler.push(payload) {
                Ok(frames) => {
                    for frame in frames {
                        let _ = events.send(MonitorEvent::HandleForces(frame));
                    }
                }
                Err(error) => debug!("dropping malformed handle force fragment: {error}"),
            }),
            Box::new(|| {}),
        );
        tokio::spawn(stream::run(params));
    }

    fn spawn_delta_times_stream(self: &Arc<Self>) {
        let events = self.events.clone();
        let params = self.base_params(
            |registry| &registry.delta_times,
            StreamKind::DeltaTimes,
            Self::metric_config("delta times stream", "Delta times are not being received"),
            Box::new(move |payload| match decode_delta_times(payload) {
                Ok(frame) => {
                    let _ = events.send(MonitorEvent::DeltaTimes(frame));
                }
                Err(error) => debug!("dropping malformed delta times frame: {error}"),
            }),
            Box::new(|| {}),
        );
        tokio::spawn(stream::run(params));
    }

    fn spawn_settings_streams(self: &Arc<Self>) {
        // general/rowing settings
        let events = self.events.clone();
        let settings = Arc::clone(&self.settings);
        let registry = Arc::clone(&self.registry);
        let params = self.base_params(
            |registry| &registry.general_settings,
            StreamKind::GeneralSettings,
            Self::metric_config("settings stream", "Settings are not being received"),
            Box::new(move |payload| match decode_general_settings(payload) {
                Ok(frame) => {
                    let merged = settings.lock().ok().map(|mut store| {
                        store.update_general(frame);
                        store.merged(current_service_flag(&registry))
                    });
                    if let Some(merged) = merged {
                        let _ = events.send(MonitorEvent::Settings(merged));
                    }
                }
                Err(error) => debug!("dropping malformed settings frame: {error}"),
            }),
            Box::new(|| {}),
        );
        tokio::spawn(stream::run(params));

        // stroke-detection settings
        let events = self.events.clone();
        let settings = Arc::clone(&self.settings);
        let registry = Arc::clone(&self.registry);
        let params = self.base_params(
            |registry| &registry.stroke_settings,
            StreamKind::StrokeSettings,
            Self::metric_config("stroke settings stream", "Stroke settings are not being received"),
            Box::new(move |payload| match decode_stroke_settings(payload) {
                Ok(frame) => {
                    let merged = settings.lock().ok().map(|mut store| {
                        store.update_stroke(frame);
                        store.merged(current_service_flag(&registry))
                    });
                    if let Some(merged) = merged {
                        let _ = events.send(MonitorEvent::Settings(merged));
                    }
                }
                Err(error) => debug!("dropping malformed stroke settings frame: {error}"),
            }),
            Box::new(|| {}),
        );
        tokio::spawn(stream::run(params));
    }

    fn spawn_battery_stream(self: &Arc<Self>) {
        let events = self.events.clone();
        let fallback_events = self.events.clone();
        let params = self.base_params(
            |registry| &registry.battery,
            StreamKind::Battery,
            StreamConfig {
                label: "battery stream",
                retries: STREAM_RETRIES,
                retry_delay: BATTERY_RETRY_DELAY,
                failure_notice: Some("Battery level is not being received"),
            },
            Box::new(move |payload| match decode_battery_level(payload) {
                Ok(level) => {
                    let _ = events.send(MonitorEvent::BatteryLevel(level));
                }
                Err(error) => debug!("dropping malformed battery frame: {error}"),
            }),
            Box::new(move || {
                let _ = fallback_events.send(MonitorEvent::BatteryLevel(0));
            }),
        );
        tokio::spawn(stream::run(params));
    }

    fn spawn_disconnect_watcher(self: &Arc<Self>) {
        let manager = Arc::clone(&self.manager);
        let mut events = self.adapter.disconnect_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(device_id) => manager.handle_disconnect_event(&device_id).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("disconnect event watcher lagged by {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    fn spawn_device_info_reader(self: &Arc<Self>) {
        let manager = Arc::clone(&self.manager);
        let events = self.events.clone();
        let mut status = self.status_rx.clone();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let connected = matches!(
                    *status.borrow_and_update(),
                    ConnectionStatus::Connected { .. }
                );
                if !connected {
                    continue;
                }
                let Some(link) = manager.current_link() else {
                    continue;
                };
                let info = read_device_info(&link).await;
                if info != DeviceInfo::default() {
                    let _ = events.send(MonitorEvent::DeviceInfo(info));
                }
            }
        });
    }
}

/// The effective BLE-service flag is derived from which measurement
/// characteristic is currently registered, defaulting to CPS.
fn current_service_flag(registry: &CharacteristicRegistry) -> BleServiceFlag {
    match registry.measurement.current() {
        Some(handle) if handle.uuid == uuids::CSC_MEASUREMENT => BleServiceFlag::Csc,
        Some(handle) if handle.uuid == uuids::ROWER_DATA => BleServiceFlag::Ftms,
        _ => BleServiceFlag::Cps,
    }
}

/// Best-effort one-shot read of the device-information service.
async fn read_device_info(link: &Arc<dyn GattLink>) -> DeviceInfo {
    let mut info = DeviceInfo::default();
    let read_string = |handle: CharacteristicHandle| {
        let link = Arc::clone(link);
        async move {
            let bytes = link.read(&handle).await.ok()?;
            String::from_utf8(bytes).ok().filter(|s| !s.is_empty())
        }
    };
    if let Ok(handle) = link
        .characteristic(uuids::DEVICE_INFORMATION_SERVICE, uuids::MANUFACTURER_NAME)
        .await
    {
        info.manufacturer = read_string(handle).await;
    }
    if let Ok(handle) = link
        .characteristic(uuids::DEVICE_INFORMATION_SERVICE, uuids::FIRMWARE_REVISION)
        .await
    {
        info.firmware_revision = read_string(handle).await;
    }
    info
}

/// Selects and drives the decoder matching the registered measurement
/// characteristic, suppresses consecutive duplicates, and feeds the
/// keep-alive timestamp.
struct MeasurementPipeline {
    registry: Arc<CharacteristicRegistry>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    decoder: Option<(Uuid, MeasurementDecoder)>,
    last: Option<BaseMetrics>,
    last_emit: Arc<Mutex<Option<(BaseMetrics, Instant)>>>,
}

enum MeasurementDecoder {
    Cps(CpsDecoder),
    Csc(CscDecoder),
    Ftms(FtmsDecoder),
}

impl MeasurementDecoder {
    fn for_uuid(uuid: Uuid) -> Self {
        if uuid == uuids::CSC_MEASUREMENT {
            Self::Csc(CscDecoder::new())
        } else if uuid == uuids::ROWER_DATA {
            Self::Ftms(FtmsDecoder::new())
        } else {
            Self::Cps(CpsDecoder::new())
        }
    }

    fn decode(
        &mut self,
        payload: &[u8],
    ) -> Result<BaseMetrics, crate::infrastructure::bluetooth::codec::CodecError> {
        match self {
            Self::Cps(decoder) => decoder.decode(payload),
            Self::Csc(decoder) => decoder.decode(payload),
            Self::Ftms(decoder) => decoder.decode(payload),
        }
    }
}

impl MeasurementPipeline {
    fn handle(&mut self, payload: &[u8]) {
        let Some(handle) = self.registry.measurement.current() else {
            return;
        };

        // a reconnect can swap the device between formats; restart decoding
        if self.decoder.as_ref().map(|(uuid, _)| *uuid) != Some(handle.uuid) {
            self.decoder = Some((handle.uuid, MeasurementDecoder::for_uuid(handle.uuid)));
            self.last = None;
        }
        let Some((_, decoder)) = self.decoder.as_mut() else {
            return;
        };

        match decoder.decode(payload) {
            Ok(metrics) => {
                // drop frames where nothing the consumer cares about moved
                let duplicate = self.last.is_some_and(|previous| {
                    previous.distance_cm == metrics.distance_cm
                        && previous.stroke_count == metrics.stroke_count
                });
                if duplicate {
                    return;
                }
                self.last = Some(metrics);
                if let Ok(mut guard) = self.last_emit.lock() {
                    *guard = Some((metrics, Instant::now()));
                }
                let _ = self.events.send(MonitorEvent::Metrics(metrics));
            }
            Err(error) => debug!("dropping malformed measurement frame: {error}"),
        }
    }
}
