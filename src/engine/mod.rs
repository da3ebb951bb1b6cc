//! Session and connection engine for datacenter devices.
//!
//! - `registry`: interactive local and remote shell sessions
//! - `pool`: reusable remote command connections, keyed per client, device and scope
//! - `executor`: stats, service, process and file operations over pooled connections
//! - `monitor`: fleet-wide reachability sweep
//! - `bridge`: per-client routing and the [`Engine`] facade
//! - `events`: the event-channel vocabulary
//! - `client`, `auth`, `handler`: russh connection plumbing
//! - `config`, `error`, `types`: shared settings, errors and data types

pub(crate) mod auth;
pub mod bridge;
pub(crate) mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub(crate) mod handler;
pub mod monitor;
pub mod pool;
pub mod registry;
pub mod types;

pub use bridge::Engine;
pub use config::EngineSettings;
pub use error::EngineError;
pub use events::{ClientEvent, ServerEvent};
pub use monitor::{Inventory, StaticInventory};
