//! The characteristic registry: the only mutable state shared between the
//! connection manager, the characteristic streams and the control-point
//! protocol.
//!
//! Each slot is a versioned state cell holding the currently-live handle for
//! one characteristic, or nothing while that characteristic is unavailable.
//! Consumers observe the cell and re-resolve whenever its version changes,
//! which removes the stale-handle race a plain `Option` field would have.
//! Writers are the connection manager (populate) and each stream's teardown
//! hook (clear).

use crate::infrastructure::bluetooth::transport::CharacteristicHandle;
use tokio::sync::watch;

/// One "current handle or absent" cell. Absent means temporarily
/// unavailable, never terminal.
#[derive(Debug)]
pub struct Slot<T: Clone + Send + Sync + 'static = CharacteristicHandle> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Slot<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn set(&self, value: T) {
        // send_replace never fails even with no receivers
        self.tx.send_replace(Some(value));
    }

    pub fn clear(&self) {
        // only bump the version when there is something to clear, so idle
        // streams do not wake up for a no-op
        if self.tx.borrow().is_some() {
            self.tx.send_replace(None);
        }
    }

    pub fn current(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The nine registry cells. Seven are populated by the ordered connect
/// sequence; the control point and the OTA pass-through pair are resolved
/// lazily on first use and cleared on disconnect like the rest.
#[derive(Debug, Default)]
pub struct CharacteristicRegistry {
    pub measurement: Slot,
    pub extended_metrics: Slot,
    pub handle_forces: Slot,
    pub delta_times: Slot,
    pub general_settings: Slot,
    pub stroke_settings: Slot,
    pub battery: Slot,
    pub control_point: Slot,
    pub ota: Slot<(CharacteristicHandle, CharacteristicHandle)>,
}

impl CharacteristicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every cell to absent. Called on disconnect.
    pub fn clear_all(&self) {
        self.measurement.clear();
        self.extended_metrics.clear();
        self.handle_forces.clear();
        self.delta_times.clear();
        self.general_settings.clear();
        self.stroke_settings.clear();
        self.battery.clear();
        self.control_point.clear();
        self.ota.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::uuids;

    fn handle() -> CharacteristicHandle {
        CharacteristicHandle {
            service: uuids::CYCLING_POWER_SERVICE,
            uuid: uuids::CYCLING_POWER_MEASUREMENT,
        }
    }

    #[test]
    fn slot_set_and_clear_round_trip() {
        let slot: Slot = Slot::new();
        assert!(slot.current().is_none());
        slot.set(handle());
        assert_eq!(slot.current(), Some(handle()));
        slot.clear();
        assert!(slot.current().is_none());
    }

    #[tokio::test]
    async fn subscribers_observe_version_changes() {
        let slot: Slot = Slot::new();
        let mut rx = slot.subscribe();
        slot.set(handle());
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_some());
        slot.clear();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_none());
    }

    #[test]
    fn clear_all_resets_every_cell() {
        let registry = CharacteristicRegistry::new();
        registry.measurement.set(handle());
        registry.battery.set(handle());
        registry.ota.set((handle(), handle()));
        registry.clear_all();
        assert!(registry.measurement.current().is_none());
        assert!(registry.battery.current().is_none());
        assert!(registry.ota.current().is_none());
    }
}
