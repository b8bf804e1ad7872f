//! Connection lifecycle: discovery, the ordered connect sequence, disconnect
//! and advertisement-driven reconnection.

use crate::domain::config::ConfigService;
use crate::domain::models::{ConnectionStatus, MonitorEvent, StatusMessage};
use crate::infrastructure::bluetooth::registry::{CharacteristicRegistry, Slot};
use crate::infrastructure::bluetooth::transport::{
    BleAdapter, CharacteristicHandle, DeviceFilter, GattLink, TransportError,
};
use crate::infrastructure::bluetooth::uuids;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Grace delay before each characteristic resolution, tolerating firmware
/// that is still enumerating its services right after the link comes up.
const STARTUP_GRACE: Duration = Duration::from_millis(100);

pub struct ConnectionManager {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<CharacteristicRegistry>,
    config: Arc<Mutex<ConfigService>>,
    status_tx: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    device: Mutex<Option<Arc<dyn GattLink>>>,
    /// Root scope of the running reconnect watch, if any. Explicit
    /// disconnect cancels it before touching anything else so the two paths
    /// cannot race.
    reconnect_scope: Mutex<Option<CancellationToken>>,
    visibility: watch::Receiver<bool>,
}

fn supported_services() -> DeviceFilter {
    DeviceFilter {
        primary_services: vec![
            uuids::CYCLING_POWER_SERVICE,
            uuids::CYCLING_SPEED_CADENCE_SERVICE,
            uuids::FITNESS_MACHINE_SERVICE,
        ],
        optional_services: vec![
            uuids::OTA_SERVICE,
            uuids::DEVICE_INFORMATION_SERVICE,
            uuids::BATTERY_SERVICE,
            uuids::SETTINGS_SERVICE,
            uuids::EXTENDED_METRICS_SERVICE,
        ],
    }
}

impl ConnectionManager {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<CharacteristicRegistry>,
        config: Arc<Mutex<ConfigService>>,
        status_tx: watch::Sender<ConnectionStatus>,
        events: mpsc::UnboundedSender<MonitorEvent>,
        visibility: watch::Receiver<bool>,
    ) -> Self {
        Self {
            adapter,
            registry,
            config,
            status_tx,
            events,
            device: Mutex::new(None),
            reconnect_scope: Mutex::new(None),
            visibility,
        }
    }

    pub fn current_link(&self) -> Option<Arc<dyn GattLink>> {
        self.device.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status.clone());
        let _ = self.events.send(MonitorEvent::ConnectionStatus(status));
    }

    fn notice(&self, message: StatusMessage) {
        let _ = self.events.send(MonitorEvent::Notice(message));
    }

    /// User-initiated entry point: tear down any existing session, then ask
    /// the adapter for a device exposing one of the supported metric
    /// profiles. A cancelled or failed selection falls back to the
    /// advertisement-driven reconnect instead of surfacing an error.
    pub async fn discover(&self) {
        self.disconnect_device().await;

        match self.adapter.select_device(&supported_services()).await {
            Ok(link) => {
                if let Err(error) = self.connect(link).await {
                    warn!("connect after device selection failed: {error}");
                }
            }
            Err(error) => {
                debug!("device selection failed ({error}), falling back to reconnect");
                self.reconnect().await;
            }
        }
    }

    /// The ordered connect sequence. Every step below the link open is
    /// independently fault-tolerant: a missing optional characteristic logs
    /// a warning and moves on, only a dead link aborts.
    pub async fn connect(&self, link: Arc<dyn GattLink>) -> Result<()> {
        self.set_status(ConnectionStatus::Connecting);

        if let Err(error) = link.open().await {
            self.set_status(ConnectionStatus::Disconnected);
            self.notice(StatusMessage::error("Could not connect to the rower"));
            return Err(error.into());
        }
        info!("link opened to {:?}", link.device_name());
        if let Ok(mut device) = self.device.lock() {
            *device = Some(Arc::clone(&link));
        }

        if let Err(error) = self.connect_characteristics(&link).await {
            self.registry.clear_all();
            self.set_status(ConnectionStatus::Disconnected);
            self.notice(StatusMessage::error("Connection to the rower was lost"));
            return Err(error);
        }

        if link.is_connected().await {
            let device_name = link.device_name();
            if let Ok(mut config) = self.config.lock() {
                if let Err(error) = config.set_last_device_id(&link.device_id()) {
                    warn!("could not persist device id: {error}");
                }
            }
            self.set_status(ConnectionStatus::Connected {
                device_name: device_name.clone(),
            });
            self.notice(StatusMessage::success(format!(
                "Connected to {}",
                device_name.as_deref().unwrap_or("rower")
            )));
        } else {
            self.set_status(ConnectionStatus::Disconnected);
        }
        Ok(())
    }

    async fn connect_characteristics(&self, link: &Arc<dyn GattLink>) -> Result<()> {
        // strict order; the GATT link does not tolerate concurrent resolution
        self.connect_to_measurement(link).await?;
        self.connect_to_extended_metrics(link).await?;
        self.connect_to_handle_forces(link).await?;
        self.connect_to_delta_times(link).await?;
        self.connect_to_general_settings(link).await?;
        self.connect_to_stroke_settings(link).await?;
        self.connect_to_battery(link).await?;
        Ok(())
    }

    /// Resolve one characteristic from a candidate list and publish it to
    /// its registry slot. A failure while the link is still up means the
    /// device simply lacks that feature: warn and return `None`. A failure
    /// on a dead link propagates so the caller's sequence aborts cleanly.
    async fn connect_characteristic(
        &self,
        link: &Arc<dyn GattLink>,
        candidates: &[(Uuid, Uuid)],
        slot: &Slot,
        label: &str,
        unavailable_notice: &str,
    ) -> Result<Option<CharacteristicHandle>> {
        tokio::time::sleep(STARTUP_GRACE).await;

        let mut last_error = TransportError::CharacteristicNotFound(candidates[0].1);
        for (service, characteristic) in candidates {
            match link.characteristic(*service, *characteristic).await {
                Ok(handle) => {
                    debug!("{label} characteristic resolved ({characteristic})");
                    slot.set(handle.clone());
                    return Ok(Some(handle));
                }
                Err(error) => last_error = error,
            }
        }

        if link.is_connected().await {
            warn!("{label} characteristic unavailable: {last_error}");
            self.notice(StatusMessage::warning(unavailable_notice.to_string()));
            Ok(None)
        } else {
            Err(last_error.into())
        }
    }

    pub async fn connect_to_measurement(
        &self,
        link: &Arc<dyn GattLink>,
    ) -> Result<Option<CharacteristicHandle>> {
        self.connect_characteristic(
            link,
            &[
                (
                    uuids::CYCLING_POWER_SERVICE,
                    uuids::CYCLING_POWER_MEASUREMENT,
                ),
                (
                    uuids::CYCLING_SPEED_CADENCE_SERVICE,
                    uuids::CSC_MEASUREMENT,
                ),
                (uuids::FITNESS_MACHINE_SERVICE, uuids::ROWER_DATA),
            ],
            &self.registry.measurement,
            "measurement",
            "Rowing metrics are unavailable on this device",
        )
        .await
    }

    pub async fn connect_to_extended_metrics(
        &self,
        link: &Arc<dyn GattLink>,
    ) -> Result<Option<CharacteristicHandle>> {
        self.connect_characteristic(
            link,
            &[(uuids::EXTENDED_METRICS_SERVICE, uuids::EXTENDED_METRICS)],
            &self.registry.extended_metrics,
            "extended metrics",
            "Extended metrics are unavailable on this device",
        )
        .await
    }

    pub async fn connect_to_handle_forces(
        &self,
        link: &Arc<dyn GattLink>,
    ) -> Result<Option<CharacteristicHandle>> {
        self.connect_characteristic(
            link,
            &[(uuids::EXTENDED_METRICS_SERVICE, uuids::HANDLE_FORCES)],
            &self.registry.handle_forces,
            "handle forces",
            "Handle forces are unavailable on this device",
        )
        .await
    }

    pub async fn connect_to_delta_times(
        &self,
        link: &Arc<dyn GattLink>,
    ) -> Result<Option<CharacteristicHandle>> {
        self.connect_characteristic(
            link,
            &[(uuids::EXTENDED_METRICS_SERVICE, uuids::DELTA_TIMES)],
            &self.registry.delta_times,
            "delta times",
            "Delta times are unavailable on this device",
        )
        .await
    }

    pub async fn connect_to_general_settings(
        &self,
        link: &Arc<dyn GattLink>,
    ) -> Result<Option<CharacteristicHandle>> {
        self.connect_characteristic(
            link,
            &[(uuids::SETTINGS_SERVICE, uuids::GENERAL_SETTINGS)],
            &self.registry.general_settings,
            "settings",
            "Settings are unavailable on this device",
        )
        .await
    }

    pub async fn connect_to_stroke_settings(
        &self,
        link: &Arc<dyn GattLink>,
    ) -> Result<Option<CharacteristicHandle>> {
        self.connect_characteristic(
            link,
            &[(uuids::SETTINGS_SERVICE, uuids::STROKE_SETTINGS)],
            &self.registry.stroke_settings,
            "stroke settings",
            "Stroke settings are unavailable on this device",
        )
        .await
    }

    pub async fn connect_to_battery(
        &self,
        link: &Arc<dyn GattLink>,
    ) -> Result<Option<CharacteristicHandle>> {
        self.connect_characteristic(
            link,
            &[(uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)],
            &self.registry.battery,
            "battery",
            "Battery level is unavailable on this device",
        )
        .await
    }

    /// Resolve-and-cache the settings control point. Cleared on disconnect
    /// with every other slot.
    pub async fn resolve_control_point(
        &self,
        link: &Arc<dyn GattLink>,
    ) -> Option<CharacteristicHandle> {
        if let Some(handle) = self.registry.control_point.current() {
            return Some(handle);
        }
        match link
            .characteristic(uuids::SETTINGS_SERVICE, uuids::SETTINGS_CONTROL_POINT)
            .await
        {
            Ok(handle) => {
                self.registry.control_point.set(handle.clone());
                Some(handle)
            }
            Err(error) => {
                warn!("control point unavailable: {error}");
                None
            }
        }
    }

    /// Resolve-and-cache the OTA pass-through pair for an external updater.
    pub async fn resolve_ota(
        &self,
        link: &Arc<dyn GattLink>,
    ) -> Option<(CharacteristicHandle, CharacteristicHandle)> {
        if let Some(pair) = self.registry.ota.current() {
            return Some(pair);
        }
        let rx = link.characteristic(uuids::OTA_SERVICE, uuids::OTA_RX).await;
        let tx = link.characteristic(uuids::OTA_SERVICE, uuids::OTA_TX).await;
        match (rx, tx) {
            (Ok(rx), Ok(tx)) => {
                self.registry.ota.set((rx.clone(), tx.clone()));
                Some((rx, tx))
            }
            _ => None,
        }
    }

    /// Idempotent teardown: always ends in `Disconnected` with every
    /// registry slot absent, whether or not anything was connected.
    pub async fn disconnect_device(&self) {
        // cancel any pending reconnection watch before anything else
        if let Ok(mut scope) = self.reconnect_scope.lock() {
            if let Some(token) = scope.take() {
                token.cancel();
            }
        }

        let link = self.device.lock().ok().and_then(|mut guard| guard.take());
        if let Some(link) = link {
            if link.is_connected().await {
                if let Err(error) = link.close().await {
                    warn!("hardware disconnect failed: {error}");
                }
            }
        }

        self.registry.clear_all();
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Advertisement-driven reconnection to the last-known device. Runs only
    /// while the host reports itself foreground-visible; each watch cycle
    /// renews its cancellation scope so no two scans overlap. The loop is
    /// unbounded on purpose — it is the background retry policy — and ends
    /// only on an advertisement, an explicit disconnect, or an unresolvable
    /// device.
    pub async fn reconnect(&self) {
        self.disconnect_device().await;

        let Some(device_id) = self.config.lock().ok().and_then(|c| c.last_device_id()) else {
            debug!("no remembered device, staying disconnected");
            return;
        };
        let link = match self.adapter.known_device(&device_id).await {
            Ok(Some(link)) => link,
            Ok(None) => {
                debug!("remembered device {device_id} not resolvable, staying disconnected");
                return;
            }
            Err(error) => {
                warn!("could not resolve remembered device: {error}");
                return;
            }
        };

        let root = CancellationToken::new();
        if let Ok(mut scope) = self.reconnect_scope.lock() {
            if let Some(previous) = scope.replace(root.clone()) {
                previous.cancel();
            }
        }

        let mut visibility = self.visibility.clone();
        let mut cycle: Option<CancellationToken> = None;

        loop {
            if root.is_cancelled() {
                return;
            }

            // hidden hosts must not spin the scan loop
            while !*visibility.borrow_and_update() {
                tokio::select! {
                    _ = root.cancelled() => return,
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            // renew the watch scope: cancel the predecessor, take a child
            if let Some(previous) = cycle.take() {
                previous.cancel();
            }
            let token = root.child_token();
            cycle = Some(token.clone());

            self.set_status(ConnectionStatus::Searching);
            debug!("watching advertisements from {device_id}");

            tokio::select! {
                _ = root.cancelled() => return,
                changed = visibility.changed() => {
                    // restart the cycle when visibility flips
                    token.cancel();
                    if changed.is_err() {
                        return;
                    }
                }
                watched = self.adapter.watch_advertisements(&device_id, token.clone()) => {
                    match watched {
                        Ok(()) => {
                            token.cancel();
                            if let Ok(mut scope) = self.reconnect_scope.lock() {
                                scope.take();
                            }
                            info!("advertisement received from {device_id}, connecting");
                            if let Err(error) = self.connect(Arc::clone(&link)).await {
                                warn!("reconnect attempt failed: {error}");
                            }
                            return;
                        }
                        Err(TransportError::Cancelled) => continue,
                        Err(error) => {
                            // scan start failures just retry the loop
                            warn!("advertisement watch failed: {error}");
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Asynchronous hardware-disconnect handling (not user-initiated): emit
    /// one notice and start searching for the device again.
    pub async fn handle_disconnect_event(&self, device_id: &str) {
        let is_current = self
            .device
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|link| link.device_id()))
            .is_some_and(|current| current == device_id);
        if !is_current {
            // already torn down by an explicit disconnect
            return;
        }

        info!("hardware disconnect from {device_id}");
        self.notice(StatusMessage::warning("Connection to the rower was lost"));
        self.reconnect().await;
    }
}
