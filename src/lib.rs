//! Real-time synchronization client for the parking facility API.
//!
//! Keeps a local cache of zone lists and the admin parking-state report
//! consistent with server-pushed updates over a WebSocket, with bounded
//! reconnects and replay of gate subscriptions.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod dispatch;
pub mod reconcile;
pub mod refresh;
pub mod session;
pub mod subscriptions;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use api::{ApiError, HttpParkingApi, ParkingApi};
pub use cache::{CachePort, QueryCache, Snapshot};
pub use client::{ClientError, SyncClient, SyncClientBuilder};
pub use config::Config;
pub use connection::{ConnectionEvent, ConnectionState, ConnectionStatus, RetryPolicy};
pub use types::{AdminUpdate, CollectionKey, Entity, Zone};
