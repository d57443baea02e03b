//! Durable local store
//!
//! This module owns the SQLite connection and the schema for:
//! - Tasks and groups
//! - Per-entity pending-operation queues
//! - Per-entity tombstones
//! - The remembered owner session
//!
//! Row-level access goes through [`crate::repositories`].

pub mod db;

pub use db::LocalStorage;
