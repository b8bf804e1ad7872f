//! The resilient characteristic stream adapter.
//!
//! Every metric and settings feed follows the same contract, so it is
//! implemented once here and instantiated per characteristic: wait for the
//! registry slot to hold a handle, perform an initial read so the current
//! state is emitted before live updates, subscribe to notifications, and on a
//! channel fault retry a bounded number of times with a fixed delay —
//! forcing a re-subscription through the owning `connect_to_*` when the
//! error looks like the "unknown" class of hardware failure and the link is
//! still up. After the retries are exhausted the stream emits its terminal
//! fallback, surfaces one notice, and resets its slot so a future reconnect
//! can repopulate it cleanly. An absent slot emits nothing and errors
//! nothing.

use crate::domain::models::{MonitorEvent, StatusMessage};
use crate::infrastructure::bluetooth::registry::{CharacteristicRegistry, Slot};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, GattLink, TransportError,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Retry budget shared by every characteristic stream.
pub const STREAM_RETRIES: u32 = 4;
pub const METRIC_RETRY_DELAY: Duration = Duration::from_millis(2000);
pub const BATTERY_RETRY_DELAY: Duration = Duration::from_millis(5000);

pub struct StreamConfig {
    pub label: &'static str,
    pub retries: u32,
    pub retry_delay: Duration,
    /// Notice shown once when the stream gives up.
    pub failure_notice: Option<&'static str>,
}

pub type LinkFn = Box<dyn Fn() -> Option<Arc<dyn GattLink>> + Send + Sync>;
pub type ReconnectFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
pub type PayloadFn = Box<dyn FnMut(&[u8]) + Send>;
pub type FallbackFn = Box<dyn Fn() + Send + Sync>;

pub struct StreamParams {
    pub registry: Arc<CharacteristicRegistry>,
    pub slot: fn(&CharacteristicRegistry) -> &Slot,
    /// The currently-connected link, if any.
    pub link: LinkFn,
    /// The owning `connect_to_*`, used to force a re-subscription.
    pub reconnect: ReconnectFn,
    /// Receives every raw payload; decoding and malformed-frame dropping
    /// happen inside.
    pub on_payload: PayloadFn,
    /// Emits the terminal fallback value once the retries are exhausted.
    pub on_exhausted: FallbackFn,
    pub config: StreamConfig,
    pub events: mpsc::UnboundedSender<MonitorEvent>,
}

enum PumpEnd {
    /// The slot changed under us; the outer loop re-evaluates.
    Teardown,
    Error(TransportError),
}

enum SessionEnd {
    Teardown,
    Exhausted,
}

/// Drives one characteristic stream until the registry is dropped. Meant to
/// be spawned as its own task.
pub async fn run(mut params: StreamParams) {
    let registry = Arc::clone(&params.registry);
    let slot = (params.slot)(&registry);
    let mut slot_rx = slot.subscribe();

    loop {
        let handle = match slot_rx.wait_for(|current| current.is_some()).await {
            Ok(current) => match current.clone() {
                Some(handle) => handle,
                None => continue,
            },
            Err(_) => return,
        };

        match session(&mut params, slot, &mut slot_rx, handle).await {
            SessionEnd::Teardown => continue,
            SessionEnd::Exhausted => {
                warn!(
                    "{}: stream gave up after {} retries",
                    params.config.label, params.config.retries
                );
                (params.on_exhausted)();
                if let Some(text) = params.config.failure_notice {
                    let _ = params
                        .events
                        .send(MonitorEvent::Notice(StatusMessage::warning(text)));
                }
                slot.clear();
            }
        }
    }
}

async fn session(
    params: &mut StreamParams,
    slot: &Slot,
    slot_rx: &mut watch::Receiver<Option<CharacteristicHandle>>,
    mut handle: CharacteristicHandle,
) -> SessionEnd {
    let mut attempt: u32 = 0;
    loop {
        let error = match pump(params, slot_rx, &handle).await {
            PumpEnd::Teardown => return SessionEnd::Teardown,
            PumpEnd::Error(error) => error,
        };

        if attempt >= params.config.retries {
            return SessionEnd::Exhausted;
        }
        attempt += 1;
        debug!(
            "{}: {error}, retry {attempt}/{}",
            params.config.label, params.config.retries
        );
        tokio::time::sleep(params.config.retry_delay).await;

        // re-resolve from the registry; a reconnect may have swapped handles
        if let Some(current) = slot.current() {
            handle = current;
        }

        if error.is_unknown_gatt() {
            if let Some(link) = (params.link)() {
                if link.is_connected().await {
                    (params.reconnect)().await;
                    if let Some(current) = slot.current() {
                        handle = current;
                    }
                }
            }
        }
    }
}

async fn pump(
    params: &mut StreamParams,
    slot_rx: &mut watch::Receiver<Option<CharacteristicHandle>>,
    handle: &CharacteristicHandle,
) -> PumpEnd {
    let Some(link) = (params.link)() else {
        return PumpEnd::Error(TransportError::NotConnected);
    };

    // initial read first, so the current state precedes live updates
    let initial = match link.read(handle).await {
        Ok(payload) => payload,
        Err(error) => return PumpEnd::Error(error),
    };
    let mut notifications = match link.subscribe(handle).await {
        Ok(stream) => stream,
        Err(error) => return PumpEnd::Error(error),
    };
    (params.on_payload)(&initial);

    loop {
        tokio::select! {
            changed = slot_rx.changed() => match changed {
                Ok(()) => {
                    let still_current = slot_rx.borrow_and_update().as_ref() == Some(handle);
                    if !still_current {
                        let _ = link.unsubscribe(handle).await;
                        return PumpEnd::Teardown;
                    }
                }
                Err(_) => return PumpEnd::Teardown,
            },
            item = notifications.recv() => match item {
                Some(Ok(payload)) => (params.on_payload)(&payload),
                Some(Err(error)) => return PumpEnd::Error(error),
                None => return PumpEnd::Error(TransportError::Gatt(
                    "notification channel closed".to_string(),
                )),
            },
        }
    }
}
