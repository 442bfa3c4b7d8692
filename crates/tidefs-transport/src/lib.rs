#![warn(missing_docs)]

//! TideFS transport plumbing.
//!
//! Every tier that dials another tier goes through [`ConnectPool`]: a
//! map of per-target bounded idle queues with a background reaper and
//! error-aware teardown, so a stream of packets to one replica reuses a
//! socket instead of re-dialing per packet.

pub mod error;
pub mod pool;

pub use error::{TransportError, TransportResult};
pub use pool::{is_connection_teardown, ConnectPool, PoolConfig, PoolStats};
