//! # Axon Message Bus
//!
//! A message-bus framework linking cooperating services over a shared
//! broker (Redis in practice). Two primitives: **RPCs** with a single
//! responding worker per call, and **events** with fan-out to every
//! subscribing consumer group.
//!
//! ## Architecture
//!
//! ```text
//! caller ──call──▶ BusClient ──▶ RpcTransport ──▶ broker ──▶ Dispatcher ──▶ handler
//!                     ▲                                          │
//!                     └───────── ResultTransport ◀── reply ──────┘
//!
//! firer ──fire──▶ BusClient ──▶ EventTransport ──▶ broker ──▶ one loop per
//!                                                            listener group
//! ```
//!
//! ## Modules
//!
//! - [`client`]: The user-facing [`BusClient`]: `call`, `fire`, `listen`,
//!   `start`, `stop`
//! - [`api`]: API descriptors, handler traits, the in-process registry
//! - [`message`]: RPC, result and event envelopes
//! - [`transport`]: The four broker-facing transport traits, plus the Redis
//!   and in-memory realisations
//! - [`schema`]: Schema derivation, publication and validation
//! - [`dispatcher`]: Consumer loops, acknowledgement, retries, dead-letter
//! - [`hooks`]: Ordered lifecycle hooks
//! - [`config`]: TOML configuration with environment substitution

pub mod api;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod hooks;
pub mod message;
pub mod schema;
pub mod shutdown;
pub mod transport;

// Re-export commonly used types at crate root
pub use api::{event_handler, rpc_handler, ApiDescriptor, EventHandler, HandlerError, RpcHandler};
pub use client::{bus, clear_bus, set_bus, BusClient, CallOptions, FireOptions};
pub use config::BusConfig;
pub use dispatcher::{ListenOptions, OnError};
pub use error::BusError;
pub use message::{EventMessage, Kwargs, ResultMessage, RpcMessage};
pub use schema::ValidationScope;
