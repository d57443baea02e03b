//! Utility modules shared by the store and the sync engines.
//!
//! - [`datetime`] - timestamp generation, formatting and retention cutoffs

pub mod datetime;
