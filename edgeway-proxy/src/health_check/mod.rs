//! Out-of-band health checking of the edge fleet.

mod prober;

pub use prober::{build_probe_url, CheckerControl, HealthCheckHandle, HealthChecker};
