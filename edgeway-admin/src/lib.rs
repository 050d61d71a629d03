//! Edgeway Admin Control Plane
//!
//! Serves roster administration over a Unix socket. Each request and response
//! is one line of JSON. The only mutating call is a full roster `reload`; there
//! is no partial or merge semantics.

use edgeway_core::{NodeSpec, NodeStatus};
use serde::{Deserialize, Serialize};

#[cfg(unix)]
mod server;

#[cfg(unix)]
pub use server::AdminServer;

/// Why a reload entry is refused, if it is.
fn invalid_node(node: &NodeSpec) -> Option<String> {
    if node.name.is_empty() || node.host.is_empty() {
        return Some(format!("node entries need a name and a host (got name={:?})", node.name));
    }
    match url::Url::parse(&node.host) {
        Ok(url) if url.host_str().is_some() => None,
        Ok(_) => Some(format!("node {}: host {:?} has no hostname", node.name, node.host)),
        Err(e) => Some(format!("node {}: invalid host {:?}: {e}", node.name, node.host)),
    }
}

/// Errors raised by the control plane listener.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// The socket could not be prepared or bound.
    #[error("failed to bind admin socket {path}: {source}")]
    Bind {
        /// Socket path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// What the control plane needs from the running gateway.
pub trait FleetControl: Send + Sync + 'static {
    /// Replace the whole roster, returning the number of nodes loaded.
    fn reload(&self, nodes: Vec<NodeSpec>) -> usize;

    /// Current status of every node in the roster.
    fn status(&self) -> Vec<NodeStatus>;
}

/// A control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum AdminRequest {
    /// Replace the roster with `nodes`.
    Reload {
        /// Full replacement roster; disabled entries are dropped.
        nodes: Vec<NodeSpec>,
    },
    /// Report every node's status.
    Status,
}

/// A control response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdminResponse {
    /// Whether the request was applied.
    pub ok: bool,
    /// Nodes in the roster after a reload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded: Option<usize>,
    /// Node statuses for a status request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeStatus>>,
    /// Why the request failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdminResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Decode and apply one request line.
pub fn handle_line(control: &dyn FleetControl, line: &str) -> AdminResponse {
    let request: AdminRequest = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(e) => return AdminResponse::failure(format!("invalid request: {e}")),
    };

    match request {
        AdminRequest::Reload { nodes } => {
            if let Some(reason) = nodes.iter().find_map(invalid_node) {
                return AdminResponse::failure(reason);
            }
            let loaded = control.reload(nodes);
            tracing::info!(loaded, "roster reloaded through admin socket");
            AdminResponse {
                ok: true,
                loaded: Some(loaded),
                ..Default::default()
            }
        }
        AdminRequest::Status => AdminResponse {
            ok: true,
            nodes: Some(control.status()),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeFleet {
        nodes: Mutex<Vec<NodeSpec>>,
    }

    impl FleetControl for FakeFleet {
        fn reload(&self, nodes: Vec<NodeSpec>) -> usize {
            let enabled: Vec<NodeSpec> = nodes.into_iter().filter(|n| n.enabled).collect();
            let len = enabled.len();
            *self.nodes.lock().unwrap() = enabled;
            len
        }

        fn status(&self) -> Vec<NodeStatus> {
            self.nodes
                .lock()
                .unwrap()
                .iter()
                .map(|n| NodeStatus {
                    name: n.name.clone(),
                    host: n.host.clone(),
                    weight: n.weight,
                    healthy: true,
                    last_check_unix: None,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                })
                .collect()
        }
    }

    #[test]
    fn reload_replaces_roster() {
        let fleet = FakeFleet::default();
        let response = handle_line(
            &fleet,
            r#"{"op":"reload","nodes":[
                {"name":"a","host":"http://a"},
                {"name":"b","host":"http://b","enabled":false}
            ]}"#,
        );
        assert!(response.ok);
        assert_eq!(response.loaded, Some(1));

        let status = handle_line(&fleet, r#"{"op":"status"}"#);
        let nodes = status.nodes.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "a");
        assert_eq!(nodes[0].weight, 1);
    }

    #[test]
    fn malformed_line_is_reported() {
        let fleet = FakeFleet::default();
        let response = handle_line(&fleet, "{not json");
        assert!(!response.ok);
        assert!(response.error.unwrap().starts_with("invalid request"));
    }

    #[test]
    fn nameless_nodes_are_refused() {
        let fleet = FakeFleet::default();
        let response =
            handle_line(&fleet, r#"{"op":"reload","nodes":[{"name":"","host":"http://a"}]}"#);
        assert!(!response.ok);
        assert!(fleet.nodes.lock().unwrap().is_empty());
    }

    #[test]
    fn unparsable_hosts_are_refused() {
        let fleet = FakeFleet::default();
        for host in ["not a url", "10.0.0.1:46621", "mailto:ops@example.com"] {
            let line = serde_json::json!({
                "op": "reload",
                "nodes": [
                    {"name": "good", "host": "http://10.0.0.1:46621"},
                    {"name": "bad", "host": host},
                ],
            })
            .to_string();
            let response = handle_line(&fleet, &line);
            assert!(!response.ok, "{host} accepted");
            assert!(response.error.unwrap().contains("bad"));
        }
        assert!(fleet.nodes.lock().unwrap().is_empty(), "roster left untouched");
    }

    #[test]
    fn response_omits_empty_fields() {
        let json = serde_json::to_string(&AdminResponse {
            ok: true,
            loaded: Some(2),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json, r#"{"ok":true,"loaded":2}"#);
    }
}
