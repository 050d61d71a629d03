//! Edge node models and the per-node health state machine.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

use crate::health::HealthCheckPolicy;

/// A roster entry as supplied by configuration or an administrative reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique node name.
    pub name: String,
    /// Base URL the node serves clients on, e.g. `http://10.0.0.7:46621`.
    pub host: String,
    /// Relative selection weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Disabled nodes are left out of the roster entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_weight() -> u32 {
    1
}

const fn default_enabled() -> bool {
    true
}

impl NodeSpec {
    /// Create an enabled spec.
    pub fn new(name: impl Into<String>, host: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            weight,
            enabled: true,
        }
    }
}

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe got an HTTP 200.
    Success,
    /// Network error, timeout or any other status.
    Failure,
}

/// A committed change of a node's health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// Unhealthy -> healthy after an unbroken success streak.
    BecameHealthy,
    /// Healthy -> unhealthy after an unbroken failure streak.
    BecameUnhealthy,
}

/// Health attributes of a node, mutated only by the health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeHealth {
    /// Current committed state.
    pub healthy: bool,
    /// When the node was last probed.
    pub last_check: Option<SystemTime>,
    /// Length of the current failure streak.
    pub consecutive_failures: u32,
    /// Length of the current success streak.
    pub consecutive_successes: u32,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            healthy: true, // optimistic until probed
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

/// Point-in-time view of a node for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node name.
    pub name: String,
    /// Base URL.
    pub host: String,
    /// Selection weight.
    pub weight: u32,
    /// Committed health state.
    pub healthy: bool,
    /// Last probe time in unix seconds.
    pub last_check_unix: Option<u64>,
    /// Current failure streak.
    pub consecutive_failures: u32,
    /// Current success streak.
    pub consecutive_successes: u32,
}

/// A single edge node in the roster.
///
/// Identity and routing attributes are fixed at creation; a roster reload
/// builds fresh records instead of editing these. Health lives behind the
/// node's own lock so probing one node never blocks readers of another.
#[derive(Debug)]
pub struct NodeRecord {
    name: String,
    host: String,
    weight: u32,
    enabled: bool,
    health: RwLock<NodeHealth>,
}

impl NodeRecord {
    /// Create a record from a roster spec, starting healthy.
    pub fn new(spec: NodeSpec) -> Self {
        Self {
            name: spec.name,
            host: spec.host,
            weight: spec.weight,
            enabled: spec.enabled,
            health: RwLock::new(NodeHealth::default()),
        }
    }

    /// Unique node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base URL of the node.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Selection weight.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Administrative flag the node was loaded with.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the node is currently considered healthy.
    pub fn is_healthy(&self) -> bool {
        self.health.read().healthy
    }

    /// Copy of the node's health attributes.
    pub fn health(&self) -> NodeHealth {
        *self.health.read()
    }

    /// Snapshot of identity and health for reporting.
    pub fn status(&self) -> NodeStatus {
        let health = self.health();
        NodeStatus {
            name: self.name.clone(),
            host: self.host.clone(),
            weight: self.weight,
            healthy: health.healthy,
            last_check_unix: health
                .last_check
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            consecutive_failures: health.consecutive_failures,
            consecutive_successes: health.consecutive_successes,
        }
    }

    /// Feed one probe result through the hysteresis state machine.
    ///
    /// Any observation resets the opposite streak to zero before extending its
    /// own. The state only flips once a streak reaches its threshold.
    pub fn observe(
        &self,
        outcome: ProbeOutcome,
        policy: &HealthCheckPolicy,
    ) -> Option<HealthTransition> {
        let mut health = self.health.write();
        health.last_check = Some(SystemTime::now());

        match outcome {
            ProbeOutcome::Success => {
                health.consecutive_failures = 0;
                health.consecutive_successes = health.consecutive_successes.saturating_add(1);
                if !health.healthy && health.consecutive_successes >= policy.succ_threshold {
                    health.healthy = true;
                    return Some(HealthTransition::BecameHealthy);
                }
            }
            ProbeOutcome::Failure => {
                health.consecutive_successes = 0;
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                if health.healthy && health.consecutive_failures >= policy.fail_threshold {
                    health.healthy = false;
                    return Some(HealthTransition::BecameUnhealthy);
                }
            }
        }
        None
    }

    /// Whether `request_host` (as seen in a `Host`-style header) refers to this node.
    ///
    /// Ports are ignored when comparing hostnames, so a request arriving on the
    /// node's public port still matches a roster entry that lists another one.
    pub fn matches_host(&self, request_host: &str) -> bool {
        if self.host == request_host {
            return true;
        }
        let Ok(url) = Url::parse(&self.host) else {
            return false;
        };
        let Some(hostname) = url.host_str() else {
            return false;
        };
        if hostname.eq_ignore_ascii_case(strip_port(request_host)) {
            return true;
        }
        match url.port() {
            Some(port) => format!("{hostname}:{port}") == request_host,
            None => false,
        }
    }
}

/// Drop a trailing `:port` from a host header value, keeping IPv6 brackets.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        // a bare IPv6 literal has several colons and no port
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// A thread-safe reference to a NodeRecord.
pub type SharedNode = Arc<NodeRecord>;
