//! Disk cache for proxied responses.
//!
//! - [`key`]: request normalization and content addressing
//! - [`store`]: TTL-bounded lookup, fetch-on-miss and persistence
//! - [`single_flight`]: one origin fetch per key at a time
//! - [`evictor`]: periodic sweep of expired entries

pub mod evictor;
pub mod key;
pub mod single_flight;
pub mod store;

pub use evictor::{sweep_expired, CacheEvictor, EvictorHandle, SweepReport};
pub use key::CacheKey;
pub use single_flight::{FlightGuard, FlightRole, InflightTracker};
pub use store::{CacheOutcome, CacheStore};
