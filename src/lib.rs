//! rsflight: keyed duplicate-call suppression for tokio.
//!
//! When several tasks ask for the same expensive thing at the same time,
//! only one of them should actually do the work. A [`Group`] guarantees
//! at-most-one in-flight execution per key and hands the outcome to every
//! caller that overlapped it; [`ShardedGroup`] spreads hot registries
//! across independent groups by a user-supplied hash.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  rsflight                    │
//! ├─────────────────────────────────────────────┤
//! │  group/     - per-key call registry,        │
//! │               batched + channel variants    │
//! │  sharded    - hash-partitioned dispatcher   │
//! │  hasher     - key -> shard projection       │
//! │  error      - shared terminal outcomes      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rsflight::Group;
//!
//! let group: Arc<Group<String, String>> = Arc::new(Group::new());
//!
//! // Concurrent calls with the same key execute the closure once; every
//! // caller receives the same result.
//! let res = group
//!     .work("profile:42".to_string(), || async {
//!         fetch_profile(42).await
//!     })
//!     .await;
//! ```
//!
//! Results are not cached: a caller arriving after the flight settles
//! starts a fresh one.

pub mod error;
pub mod group;
pub mod hasher;
mod partition;
pub mod sharded;

// Re-export commonly used types at the crate root
pub use error::FlightError;
pub use group::{register_flight_metrics, FlightResult, Group};
pub use hasher::{KeyHasher, StdKeyHasher};
pub use sharded::ShardedGroup;
