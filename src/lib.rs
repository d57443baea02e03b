//! todoly-sync - A local-first task cache with offline reconciliation
//!
//! This library keeps a device-local SQLite store of tasks and groups
//! consistent with a remote REST store under intermittent connectivity.
//! Every write lands locally first; writes made while offline are queued and
//! replayed in order once the remote store is reachable again, with
//! temporary identifiers replaced by the remote ones.
//!
//! # Modules
//!
//! The library is organized into several key modules:
//!
//! * [`config`] - Configuration management
//! * [`storage`] - Local database and schema
//! * [`repositories`] - Row, queue and tombstone access
//! * [`backend`] - Remote store abstraction (REST and in-memory)
//! * [`sync`] - Engines, identity promotion and the reconciliation scheduler
//! * [`connectivity`] - Observable online/offline flag

/// Remote store abstraction and implementations
pub mod backend;

/// Configuration module for managing settings
pub mod config;

/// Observable reachability of the remote store
pub mod connectivity;

/// Constants and default values
pub mod constants;

/// SeaORM entity models for database tables
pub mod entities;

/// Change notifications
pub mod events;

/// Temporary and permanent entity identifiers
pub mod identifier;

/// Log output setup
pub mod logger;

/// Repository layer for database operations
pub mod repositories;

/// Local storage layer
pub mod storage;

/// Synchronization engine for keeping local and remote data in step
pub mod sync;

/// Date/time helpers
pub mod utils;

// Re-export entity models for convenient access
pub use entities::{group, task};
pub use sync::SyncService;
