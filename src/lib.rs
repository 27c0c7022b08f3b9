//! Time-shared wavemeter server and wavemeter-referenced laser locks.
//!
//! A single wavemeter behind a 1xN optical switch is shared between several
//! lasers. The [`arbiter::ResourceArbiter`] hands the switch to each
//! registered client in turn and attributes readings to whoever holds it.
//! Each [`lock::LockController`] reads its laser's wavelength through the
//! arbiter and drives the laser with a PI loop.
//!
//! Both sides are reachable over a small JSON-lines RPC layer ([`rpc`]) and
//! find each other through a name registry ([`registry`]).

pub mod adapters;
pub mod arbiter;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod lock;
pub mod logging;
pub mod registry;
pub mod rpc;
pub mod units;
