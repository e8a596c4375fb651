//! Core domain + application logic for the clinic messaging gateway.
//!
//! This crate is intentionally framework-agnostic. The chat network (Telegram),
//! the record store (Supabase) and the HTTP trigger live behind ports (traits)
//! implemented in adapter crates.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod inbound;
pub mod logging;
pub mod messaging;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use errors::{Error, Result};
