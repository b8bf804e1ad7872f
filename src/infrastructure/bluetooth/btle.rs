//! The btleplug-backed transport: the real BLE central on Linux, macOS and
//! Windows.

use crate::infrastructure::bluetooth::transport::{
    BleAdapter, CharacteristicHandle, DeviceFilter, GattLink, NotificationStream, TransportError,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long a user-initiated device selection scans before giving up.
const SELECTION_SCAN_WINDOW: Duration = Duration::from_secs(15);
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

impl From<btleplug::Error> for TransportError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::DeviceNotFound => TransportError::DeviceNotFound,
            other => TransportError::Gatt(other.to_string()),
        }
    }
}

pub struct BtleplugAdapter {
    adapter: Adapter,
    disconnect_tx: broadcast::Sender<String>,
}

impl BtleplugAdapter {
    /// Takes the first local adapter and starts pumping its central events
    /// into the disconnect feed.
    pub async fn new() -> Result<Arc<Self>, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterUnavailable)?;

        let (disconnect_tx, _) = broadcast::channel(16);
        let mut events = adapter.events().await?;
        let event_tx = disconnect_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    debug!("peripheral {id} disconnected");
                    let _ = event_tx.send(id.to_string());
                }
            }
        });

        Ok(Arc::new(Self {
            adapter,
            disconnect_tx,
        }))
    }

    async fn peripheral_by_id(&self, device_id: &str) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.id().to_string() == device_id {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn select_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn GattLink>, TransportError> {
        self.adapter
            .start_scan(ScanFilter {
                services: filter.primary_services.clone(),
            })
            .await?;

        let deadline = tokio::time::Instant::now() + SELECTION_SCAN_WINDOW;
        let selected = 'scan: loop {
            if tokio::time::Instant::now() >= deadline {
                break Err(TransportError::SelectionCancelled);
            }
            for peripheral in self.adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                let matches = filter.primary_services.is_empty()
                    || properties
                        .services
                        .iter()
                        .any(|advertised| filter.primary_services.contains(advertised));
                if matches {
                    break 'scan Ok(peripheral);
                }
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        };

        if let Err(error) = self.adapter.stop_scan().await {
            debug!("could not stop selection scan cleanly: {error}");
        }
        let peripheral = selected?;
        Ok(BtleplugLink::from_peripheral(peripheral).await)
    }

    async fn known_device(
        &self,
        device_id: &str,
    ) -> Result<Option<Arc<dyn GattLink>>, TransportError> {
        match self.peripheral_by_id(device_id).await? {
            Some(peripheral) => Ok(Some(BtleplugLink::from_peripheral(peripheral).await)),
            None => Ok(None),
        }
    }

    async fn watch_advertisements(
        &self,
        device_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(TransportError::Cancelled),
                event = events.next() => match event {
                    Some(
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id),
                    ) if id.to_string() == device_id => break Ok(()),
                    Some(_) => continue,
                    None => break Err(TransportError::Gatt(
                        "central event stream closed".to_string(),
                    )),
                },
            }
        };

        if let Err(error) = self.adapter.stop_scan().await {
            debug!("could not stop advertisement scan cleanly: {error}");
        }
        result
    }

    fn disconnect_events(&self) -> broadcast::Receiver<String> {
        self.disconnect_tx.subscribe()
    }
}

pub struct BtleplugLink {
    peripheral: Peripheral,
    name: Mutex<Option<String>>,
}

impl BtleplugLink {
    pub async fn from_peripheral(peripheral: Peripheral) -> Arc<Self> {
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|properties| properties.local_name);
        Arc::new(Self {
            peripheral,
            name: Mutex::new(name),
        })
    }

    fn resolve(&self, handle: &CharacteristicHandle) -> Result<Characteristic, TransportError> {
        for service in self.peripheral.services() {
            if service.uuid != handle.service {
                continue;
            }
            for characteristic in &service.characteristics {
                if characteristic.uuid == handle.uuid {
                    return Ok(characteristic.clone());
                }
            }
        }
        Err(TransportError::CharacteristicNotFound(handle.uuid))
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn device_id(&self) -> String {
        self.peripheral.id().to_string()
    }

    fn device_name(&self) -> Option<String> {
        self.name.lock().ok().and_then(|name| name.clone())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn open(&self) -> Result<(), TransportError> {
        if !self.peripheral.is_connected().await? {
            self.peripheral.connect().await?;
        }
        self.peripheral.discover_services().await?;
        if let Some(properties) = self.peripheral.properties().await? {
            if let Ok(mut name) = self.name.lock() {
                if properties.local_name.is_some() {
                    *name = properties.local_name;
                }
            }
        }
        Ok(())
    }

    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle, TransportError> {
        let handle = CharacteristicHandle {
            service,
            uuid: characteristic,
        };
        self.resolve(&handle)?;
        Ok(handle)
    }

    async fn read(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<Vec<u8>, TransportError> {
        let resolved = self.resolve(characteristic)?;
        Ok(self.peripheral.read(&resolved).await?)
    }

    async fn write_without_response(
        &self,
        characteristic: &CharacteristicHandle,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let resolved = self.resolve(characteristic)?;
        self.peripheral
            .write(&resolved, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<NotificationStream, TransportError> {
        let resolved = self.resolve(characteristic)?;
        self.peripheral.subscribe(&resolved).await?;

        // btleplug delivers one stream for the whole peripheral; fan out to
        // a per-characteristic channel
        let mut notifications = self.peripheral.notifications().await?;
        let uuid = characteristic.uuid;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if tx.send(Ok(notification.value)).await.is_err() {
                    return;
                }
            }
            debug!("notification stream for {uuid} ended");
        });
        Ok(rx)
    }

    async fn unsubscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), TransportError> {
        let resolved = self.resolve(characteristic)?;
        self.peripheral.unsubscribe(&resolved).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.peripheral.is_connected().await? {
            if let Err(error) = self.peripheral.disconnect().await {
                warn!("disconnect request failed: {error}");
                return Err(error.into());
            }
        }
        Ok(())
    }
}
