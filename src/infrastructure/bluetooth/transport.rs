//! Transport seam between the link engine and the OS BLE stack.
//!
//! Everything above this module talks to [`BleAdapter`] and [`GattLink`]
//! only; the btleplug-backed implementation lives in [`super::btle`] and a
//! scriptable in-memory implementation in [`super::mock`].

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("bluetooth adapter unavailable")]
    AdapterUnavailable,
    #[error("device selection cancelled")]
    SelectionCancelled,
    #[error("device not found")]
    DeviceNotFound,
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("link not connected")]
    NotConnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error("gatt failure: {0}")]
    Gatt(String),
}

impl TransportError {
    /// The "unknown" class of hardware error some stacks report for a
    /// characteristic that silently dropped its subscription. A stream that
    /// sees one of these while the link is still up should force a
    /// re-subscription before retrying.
    pub fn is_unknown_gatt(&self) -> bool {
        matches!(self, TransportError::Gatt(message)
            if message.to_ascii_lowercase().contains("unknown"))
    }
}

/// A resolved characteristic, identified by its owning service and its own
/// UUID. Cheap to clone; the link re-resolves the platform object on use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Notification feed for one characteristic. The channel carries decode-ready
/// payloads; an `Err` item is a channel fault the subscriber should recover
/// from, not the end of the world.
pub type NotificationStream = mpsc::Receiver<Result<Vec<u8>, TransportError>>;

/// Service filter used for user-initiated device selection.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub primary_services: Vec<Uuid>,
    pub optional_services: Vec<Uuid>,
}

/// One BLE peripheral's GATT session.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Stable platform identifier, persisted for reconnection.
    fn device_id(&self) -> String;

    fn device_name(&self) -> Option<String>;

    async fn is_connected(&self) -> bool;

    /// Open the physical link and enumerate services. Must be called before
    /// any characteristic operation.
    async fn open(&self) -> Result<(), TransportError>;

    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle, TransportError>;

    async fn read(&self, characteristic: &CharacteristicHandle)
        -> Result<Vec<u8>, TransportError>;

    async fn write_without_response(
        &self,
        characteristic: &CharacteristicHandle,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<NotificationStream, TransportError>;

    async fn unsubscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), TransportError>;

    /// Request a hardware disconnect and wait until the link reports down.
    /// Resolves immediately if the link is already down.
    async fn close(&self) -> Result<(), TransportError>;
}

/// The local BLE central.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// User-initiated device selection, filtered on the supported primary
    /// services. Cancellation or failure is reported as an error; the caller
    /// decides the fallback.
    async fn select_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn GattLink>, TransportError>;

    /// Resolve a previously-granted device by its persisted identifier.
    async fn known_device(
        &self,
        device_id: &str,
    ) -> Result<Option<Arc<dyn GattLink>>, TransportError>;

    /// Scan for advertisements from one remembered device. Resolves `Ok(())`
    /// when the first advertisement is seen, `Err(Cancelled)` when the token
    /// fires, and any other error if the scan cannot be started.
    async fn watch_advertisements(
        &self,
        device_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;

    /// Device identifiers whose links dropped without a local `close()`.
    fn disconnect_events(&self) -> broadcast::Receiver<String>;
}
