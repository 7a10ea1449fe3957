//! Core types for guest memory tracking.
//!
//! Address types, host page permissions, the contract the host
//! virtual-memory manager has to fulfil ([`TrackingBackend`]), the error type
//! and the tracker configuration.

mod backend;
mod config;
mod core;
mod error;

pub use self::{
    backend::TrackingBackend,
    config::TrackingConfig,
    core::{AddressRange, Chunks, MemoryPermission, Va},
    error::TrackingError,
};
