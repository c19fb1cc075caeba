//! Async engine for the Nikobus home automation bus.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  lines   ┌───────────────┐  responses  ┌────────────────┐
//! │ BusTransport │ ───────▶ │ FrameListener │ ──────────▶ │ CommandWorker  │
//! │ (TCP/serial) │ ◀─────── │               │             │ (one at a time)│
//! └──────────────┘  frames  └───────┬───────┘             └────────────────┘
//!                                   │ inventory                  ▲
//!                                   ▼                            │ sweeps
//!                           ┌──────────────────┐                 │
//!                           │ DiscoveryService │ ────────────────┘
//!                           └──────────────────┘
//! ```
//!
//! Button presses, feedback states and discovery results are published on
//! a broadcast channel ([`BusEvent`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nikobus_bridge::{BridgeConfig, JsonFileStore, NikobusBridge};
//! use nikobus_protocol::{Group, ModuleAddress};
//!
//! # async fn run() -> nikobus_bridge::Result<()> {
//! let config = BridgeConfig::load(None)?;
//! let store = Arc::new(JsonFileStore::new(&config.storage.config_dir));
//! let bridge = NikobusBridge::connect(&config, store).await?;
//!
//! let module = ModuleAddress::new("4707")?;
//! let state = bridge.commands().get_output_state(&module, Group::One).await?;
//! println!("group 1: {}", state);
//! bridge.shutdown().await
//! # }
//! ```

pub mod bridge;
pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod listener;
pub mod logging;
pub mod store;
pub mod transport;

pub use bridge::NikobusBridge;
pub use command::{Command, CommandConfig, CommandHandler, ResponseHandler};
pub use config::BridgeConfig;
pub use discovery::{DiscoveryConfig, DiscoveryHandle, DiscoveryRequest, ModuleKind};
pub use error::{BridgeError, Result};
pub use event::{BusEvent, DiscoveryScope};
pub use listener::{FrameListener, InventoryFrame};
pub use store::{ConfigKind, ConfigStore, JsonFileStore, MemoryStore};
pub use transport::{BusTransport, ConnectionConfig, LineTransport};
