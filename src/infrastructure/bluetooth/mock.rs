//! Scriptable in-memory transport.
//!
//! Stands in for the OS BLE stack in tests and in hosts that want to demo
//! the engine without hardware: fixture characteristics with canned read
//! values, injected notifications and channel faults, recorded writes and
//! resolution order, and an optional control-point responder.

use crate::infrastructure::bluetooth::transport::{
    BleAdapter, CharacteristicHandle, DeviceFilter, GattLink, NotificationStream, TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct LinkState {
    characteristics: Vec<(Uuid, Uuid)>,
    read_values: HashMap<Uuid, Vec<u8>>,
    /// Characteristics whose read/subscribe fail with the given error.
    faults: HashMap<Uuid, TransportError>,
    subscribers: HashMap<Uuid, Vec<mpsc::Sender<Result<Vec<u8>, TransportError>>>>,
    writes: Vec<(Uuid, Vec<u8>)>,
    resolved: Vec<Uuid>,
    unsubscribed: Vec<Uuid>,
    responder: Option<(Uuid, Responder)>,
}

pub struct MockLink {
    id: String,
    name: Option<String>,
    connected: AtomicBool,
    open_fails: AtomicBool,
    state: Mutex<LinkState>,
}

impl MockLink {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            name: Some(name.into()),
            connected: AtomicBool::new(false),
            open_fails: AtomicBool::new(false),
            state: Mutex::new(LinkState::default()),
        })
    }

    pub fn add_characteristic(&self, service: Uuid, characteristic: Uuid) {
        let mut state = self.state.lock().unwrap();
        state.characteristics.push((service, characteristic));
    }

    pub fn set_read_value(&self, characteristic: Uuid, payload: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .read_values
            .insert(characteristic, payload);
    }

    /// Make read and subscribe on one characteristic fail with this error
    /// until cleared.
    pub fn set_fault(&self, characteristic: Uuid, error: TransportError) {
        self.state
            .lock()
            .unwrap()
            .faults
            .insert(characteristic, error);
    }

    pub fn clear_fault(&self, characteristic: Uuid) {
        self.state.lock().unwrap().faults.remove(&characteristic);
    }

    pub fn set_open_fails(&self, fails: bool) {
        self.open_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Synchronous peek at the link state, for assertions.
    pub fn is_connected_blocking(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Auto-respond to writes on one characteristic with a notification.
    pub fn set_responder(
        &self,
        characteristic: Uuid,
        responder: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) {
        self.state.lock().unwrap().responder = Some((characteristic, Box::new(responder)));
    }

    /// Push one notification payload to all subscribers of a characteristic.
    pub fn notify(&self, characteristic: Uuid, payload: Vec<u8>) {
        let senders = {
            let state = self.state.lock().unwrap();
            state
                .subscribers
                .get(&characteristic)
                .cloned()
                .unwrap_or_default()
        };
        for sender in senders {
            let _ = sender.try_send(Ok(payload.clone()));
        }
    }

    /// Push one channel fault to all subscribers of a characteristic.
    pub fn notify_error(&self, characteristic: Uuid, error: TransportError) {
        let senders = {
            let state = self.state.lock().unwrap();
            state
                .subscribers
                .get(&characteristic)
                .cloned()
                .unwrap_or_default()
        };
        for sender in senders {
            let _ = sender.try_send(Err(error.clone()));
        }
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Every successfully resolved characteristic, in resolution order.
    pub fn resolved_order(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().resolved.clone()
    }

    pub fn resolution_count(&self, characteristic: Uuid) -> usize {
        self.state
            .lock()
            .unwrap()
            .resolved
            .iter()
            .filter(|uuid| **uuid == characteristic)
            .count()
    }

    pub fn unsubscribe_count(&self, characteristic: Uuid) -> usize {
        self.state
            .lock()
            .unwrap()
            .unsubscribed
            .iter()
            .filter(|uuid| **uuid == characteristic)
            .count()
    }

    fn fault_for(&self, characteristic: &Uuid) -> Option<TransportError> {
        self.state
            .lock()
            .unwrap()
            .faults
            .get(characteristic)
            .cloned()
    }
}

#[async_trait]
impl GattLink for MockLink {
    fn device_id(&self) -> String {
        self.id.clone()
    }

    fn device_name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.open_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Gatt("link open failed".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state
            .characteristics
            .iter()
            .any(|(s, c)| *s == service && *c == characteristic)
        {
            state.resolved.push(characteristic);
            Ok(CharacteristicHandle {
                service,
                uuid: characteristic,
            })
        } else {
            Err(TransportError::CharacteristicNotFound(characteristic))
        }
    }

    async fn read(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<Vec<u8>, TransportError> {
        if let Some(error) = self.fault_for(&characteristic.uuid) {
            return Err(error);
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .read_values
            .get(&characteristic.uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_without_response(
        &self,
        characteristic: &CharacteristicHandle,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let response = {
            let mut state = self.state.lock().unwrap();
            state.writes.push((characteristic.uuid, payload.to_vec()));
            match &state.responder {
                Some((uuid, responder)) if *uuid == characteristic.uuid => responder(payload),
                _ => None,
            }
        };
        if let Some(frame) = response {
            self.notify(characteristic.uuid, frame);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<NotificationStream, TransportError> {
        if let Some(error) = self.fault_for(&characteristic.uuid) {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(32);
        self.state
            .lock()
            .unwrap()
            .subscribers
            .entry(characteristic.uuid)
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn unsubscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.unsubscribed.push(characteristic.uuid);
        state.subscribers.remove(&characteristic.uuid);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockAdapter {
    links: Mutex<HashMap<String, Arc<MockLink>>>,
    selection: Mutex<Option<String>>,
    advertisements: Mutex<HashMap<String, Arc<Notify>>>,
    disconnect_tx: broadcast::Sender<String>,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        let (disconnect_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            links: Mutex::new(HashMap::new()),
            selection: Mutex::new(None),
            advertisements: Mutex::new(HashMap::new()),
            disconnect_tx,
        })
    }

    pub fn add_link(&self, link: Arc<MockLink>) {
        self.links
            .lock()
            .unwrap()
            .insert(link.device_id(), link);
    }

    /// Which device the next `select_device` returns; `None` means the user
    /// cancelled the chooser.
    pub fn script_selection(&self, device_id: Option<&str>) {
        *self.selection.lock().unwrap() = device_id.map(str::to_string);
    }

    fn advertisement_gate(&self, device_id: &str) -> Arc<Notify> {
        Arc::clone(
            self.advertisements
                .lock()
                .unwrap()
                .entry(device_id.to_string())
                .or_default(),
        )
    }

    /// Let a pending (or the next) advertisement watch see this device.
    pub fn advertise(&self, device_id: &str) {
        self.advertisement_gate(device_id).notify_one();
    }

    /// Simulate an unexpected hardware drop of a connected link.
    pub fn drop_link(&self, device_id: &str) {
        if let Some(link) = self.links.lock().unwrap().get(device_id) {
            link.set_connected(false);
        }
        let _ = self.disconnect_tx.send(device_id.to_string());
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn select_device(
        &self,
        _filter: &DeviceFilter,
    ) -> Result<Arc<dyn GattLink>, TransportError> {
        let selected = self.selection.lock().unwrap().clone();
        let Some(device_id) = selected else {
            return Err(TransportError::SelectionCancelled);
        };
        self.links
            .lock()
            .unwrap()
            .get(&device_id)
            .cloned()
            .map(|link| link as Arc<dyn GattLink>)
            .ok_or(TransportError::DeviceNotFound)
    }

    async fn known_device(
        &self,
        device_id: &str,
    ) -> Result<Option<Arc<dyn GattLink>>, TransportError> {
        Ok(self
            .links
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .map(|link| link as Arc<dyn GattLink>))
    }

    async fn watch_advertisements(
        &self,
        device_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let gate = self.advertisement_gate(device_id);
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = gate.notified() => Ok(()),
        }
    }

    fn disconnect_events(&self) -> broadcast::Receiver<String> {
        self.disconnect_tx.subscribe()
    }
}
