//! Per-key duplicate-call suppression.
//!
//! A [`Group`] guarantees at-most-one in-flight execution per key:
//!
//! 1. **Leading**: the first caller for a key registers a call record and
//!    runs the work function.
//! 2. **Joining**: callers arriving while the record exists attach to it
//!    and receive the same outcome, without running anything.
//!
//! Outcomes are delivered either synchronously ([`Group::work`],
//! [`Group::work_many`]) or through one-slot channels with the executor
//! spawned on its own task ([`Group::work_chan`],
//! [`Group::work_many_chan`]). [`Group::forget`] detaches a key so the
//! next caller starts fresh while existing waiters keep their flight.

mod call;
mod registry;
mod types;

pub use registry::{register_flight_metrics, Group};
pub use types::FlightResult;

pub(crate) use registry::ChanFlight;
