//! Edgeway gateway engine.
//!
//! Probes the edge fleet, mints signed playback URLs after checking the
//! caller's credential with the origin, and answers edge nodes' per-request
//! verification calls, steering clients away from unhealthy nodes.

pub mod access;
pub mod access_log;
pub mod app;
pub mod config;
pub mod health_check;
pub mod logging;
pub mod server;
pub mod tls;

pub use app::{launch, LaunchError, RunningGateway};
pub use config::GatewayConfig;
