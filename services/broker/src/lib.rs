//! Resource Allocation Broker
//!
//! Mediates between applications requesting CPU/memory on cluster nodes and
//! an external cluster resource manager, and pushes allocation outcomes to
//! registered clients.
//!
//! ## Architecture
//!
//! ```text
//! client ──register──▶ ClientRegistry ◀──resolve── NotificationDispatcher ──▶ callback
//!    │                                                      ▲
//!    └──reserve/release──▶ CachingConnector ──events────────┘
//!                            │        ▲
//!                  ResourceCache   ResourceManager (simulated, ...)
//! ```
//!
//! ## Modules
//!
//! - `registry`: client registrations and callback addresses
//! - `cache`: released allocations held for reuse
//! - `connector`: resource-manager connector, backends and the listener contract
//! - `dispatcher`: per-destination ordered notification delivery with retries
//! - `service`: `Register`/`Unregister` RPC surface and client operations
//! - `config`: environment configuration

pub mod cache;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod service;

pub use error::{BrokerError, BrokerResult, StatusCode};
pub use service::BrokerService;
