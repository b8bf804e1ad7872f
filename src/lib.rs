//! rowlink — BLE link engine for rowing ergometers.
//!
//! Connects to a rowing monitor over BLE GATT, normalizes its metrics from
//! three incompatible wire formats (cycling power, cycling speed/cadence,
//! fitness machine) into one stream, merges its two settings
//! characteristics into a single view, and drives on-device configuration
//! through a control-point command protocol. Connection loss is handled with
//! advertisement-driven reconnection; every characteristic feed retries and
//! re-subscribes on its own.
//!
//! ```no_run
//! use rowlink::{ConfigService, RowerLink};
//! use rowlink::infrastructure::bluetooth::btle::BtleplugAdapter;
//! use std::sync::{Arc, Mutex};
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let adapter = BtleplugAdapter::new().await?;
//! let config = Arc::new(Mutex::new(ConfigService::new()?));
//! let (events_tx, mut events_rx) = mpsc::unbounded_channel();
//!
//! let rower = RowerLink::new(adapter, config, events_tx);
//! rower.discover().await;
//! while let Some(event) = events_rx.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod domain;
pub mod infrastructure;

pub use domain::config::{Config, ConfigService, LogSettings};
pub use domain::models::{
    BaseMetrics, ConnectionStatus, DeltaTimesFrame, DeviceInfo, ExtendedMetrics,
    HandleForceFrame, MessageSeverity, MonitorEvent, StatusMessage,
};
pub use domain::settings::{
    BleServiceFlag, GeneralSettings, RowerSettings, RowingSettings, StrokeDetectionType, TriState,
};
pub use infrastructure::bluetooth::control::CommandOutcome;
pub use infrastructure::bluetooth::RowerLink;
