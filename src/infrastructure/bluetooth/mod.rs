//! Bluetooth Module
//!
//! The BLE link engine for the rowing monitor.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        RowerLink                         │
//! │   (Main coordinator - public API for the application)    │
//! └───────┬──────────────┬──────────────┬───────────────────┘
//!         │              │              │
//!         ▼              ▼              ▼
//! ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//! │ Connection  │ │   Stream    │ │   Control   │
//! │  Manager    │ │  Adapter    │ │    Point    │
//! │             │ │             │ │             │
//! │ - discover  │ │ - read +    │ │ - command / │
//! │ - connect   │ │   notify    │ │   response  │
//! │ - reconnect │ │ - retry     │ │ - timeouts  │
//! └──────┬──────┘ └──────┬──────┘ └──────┬──────┘
//!        │               │               │
//!        └───────┬───────┴───────┬───────┘
//!                ▼               ▼
//!        ┌──────────────┐ ┌──────────────┐
//!        │   Registry   │ │    Codecs    │
//!        │ (hot-swapped │ │ (pure wire   │
//!        │   handles)   │ │  transforms) │
//!        └──────────────┘ └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - the adapter/link trait seam over the OS BLE stack
//! - [`btle`] - the btleplug-backed transport
//! - [`mock`] - a scriptable in-memory transport for tests and demos
//! - [`uuids`] - GATT service and characteristic identifiers
//! - [`registry`] - hot-swappable characteristic handle slots
//! - [`codec`] - metric wire codecs (CPS, CSC, FTMS, vendor characteristics)
//! - [`settings_codec`] - settings blob codec and control-point payloads
//! - [`stream`] - the resilient per-characteristic stream adapter
//! - [`control`] - the control-point request/response protocol
//! - [`connection`] - the connection lifecycle state machine
//! - [`service`] - main service coordinator

pub mod btle;
pub mod codec;
pub mod connection;
pub mod control;
pub mod mock;
pub mod registry;
pub mod service;
pub mod settings_codec;
pub mod stream;
pub mod transport;
pub mod uuids;

// Re-export main service for convenience
pub use service::RowerLink;
