//! The UDP circuit engine: per-simulator connection state, reliability,
//!  duplicate detection, ack piggybacking, liveness and bandwidth throttling.

mod circuit;
mod config;
mod engine;
mod socket;
mod throttle;

pub use circuit::{Circuit, CircuitState, CircuitStats, DisconnectReason};
pub use config::EngineConfig;
pub use engine::{CircuitEngine, EngineEvent, EventHandle};
pub use socket::SendSocket;
pub use throttle::ThrottleRates;
