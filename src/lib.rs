//! sensor state synchronization and geospatial clustering for the
//! fire-detection dashboard.
//!
//! `hub` is the entry point: it owns the `sync::Synchronizer` and the
//! `channel::EventChannel` and publishes views the `server` routes read.

pub mod channel;
pub mod config;
pub mod domain;
pub mod error;
pub mod filter;
pub mod geo;
pub mod hub;
pub mod loader;
pub mod projector;
pub mod proximity;
pub mod server;
pub mod sync;
