//! Background prober for active HTTP health checks.
//!
//! Each probe is a `GET` to the node's hostname on the administrative port,
//! with a fixed virtual host so the request lands on the health handler no
//! matter how the node is addressed publicly. Redirects are never followed.

use std::sync::Arc;
use std::time::Duration;

use edgeway_admin::FleetControl;
use edgeway_core::{
    HealthCheckPolicy, HealthTransition, NodeSpec, NodeStatus, ProbeOutcome, SharedNode,
    SharedRoster,
};
use reqwest::header::HOST;
use reqwest::StatusCode;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ProbeTarget;

/// Extra time granted to in-flight passes on stop, on top of the probe timeout.
const DRAIN_SLACK: Duration = Duration::from_secs(1);

/// Owns the roster and keeps every node's health current.
#[derive(Debug)]
pub struct HealthChecker {
    roster: SharedRoster,
    policy: HealthCheckPolicy,
    target: ProbeTarget,
    client: reqwest::Client,
    /// Asks the running loop for an out-of-schedule pass.
    recheck: Notify,
}

impl HealthChecker {
    /// Create a checker over `roster`.
    pub fn new(
        roster: SharedRoster,
        policy: HealthCheckPolicy,
        target: ProbeTarget,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(policy.timeout)
            .pool_max_idle_per_host(1)
            .build()?;

        Ok(Self {
            roster,
            policy,
            target,
            client,
            recheck: Notify::new(),
        })
    }

    /// The roster this checker maintains.
    pub fn roster(&self) -> &SharedRoster {
        &self.roster
    }

    /// The probe policy in effect.
    pub fn policy(&self) -> &HealthCheckPolicy {
        &self.policy
    }

    /// Snapshot of the currently healthy nodes.
    pub fn healthy_nodes(&self) -> Vec<SharedNode> {
        self.roster.healthy()
    }

    /// Snapshot of every node.
    pub fn all_nodes(&self) -> Vec<SharedNode> {
        self.roster.snapshot().as_ref().clone()
    }

    /// The roster node a request host refers to, if any.
    pub fn find_node_for_host(&self, request_host: &str) -> Option<SharedNode> {
        self.roster.find_by_host(request_host)
    }

    /// Spawn the periodic probe loop. The first pass starts immediately.
    ///
    /// Every pass runs as its own task, so a pass that overruns the interval
    /// does not hold back the next tick. Passes requested by a roster reload
    /// run on the same task set and are drained with it on stop.
    pub fn start(self: &Arc<Self>) -> HealthCheckHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let checker = Arc::clone(self);
        let grace = self.policy.timeout + DRAIN_SLACK;

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(checker.policy.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut passes = JoinSet::new();

            info!(
                interval = ?checker.policy.interval,
                port = checker.target.port,
                path = %checker.target.path,
                nodes = checker.roster.len(),
                "Starting health check loop"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let checker = Arc::clone(&checker);
                        passes.spawn(async move { checker.check_all().await });
                    }
                    _ = checker.recheck.notified() => {
                        debug!("roster changed, running an extra pass");
                        let checker = Arc::clone(&checker);
                        passes.spawn(async move { checker.check_all().await });
                    }
                    Some(_) = passes.join_next(), if !passes.is_empty() => {}
                    _ = stop_rx.changed() => break,
                }
            }

            let drained = time::timeout(grace, async {
                while passes.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("health check passes still running at shutdown, aborting them");
                passes.abort_all();
            }
            info!("health check loop stopped");
        });

        HealthCheckHandle {
            stop_tx,
            task: Some(task),
        }
    }

    /// Probe every node of the current roster concurrently and wait for all of them.
    pub async fn check_all(self: &Arc<Self>) {
        let nodes = self.roster.snapshot();
        let mut probes = JoinSet::new();

        for node in nodes.iter() {
            let checker = Arc::clone(self);
            let node = Arc::clone(node);
            probes.spawn(async move { checker.check_node(&node).await });
        }

        while let Some(result) = probes.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "health probe task failed");
            }
        }
    }

    /// Probe one node and feed the result into its hysteresis counters.
    pub async fn check_node(&self, node: &SharedNode) {
        let outcome = self.probe(node).await;

        match node.observe(outcome, &self.policy) {
            Some(HealthTransition::BecameUnhealthy) => warn!(
                node = node.name(),
                host = node.host(),
                failures = node.health().consecutive_failures,
                "node marked unhealthy"
            ),
            Some(HealthTransition::BecameHealthy) => {
                info!(node = node.name(), host = node.host(), "node recovered")
            }
            None => {}
        }
    }

    async fn probe(&self, node: &SharedNode) -> ProbeOutcome {
        let url = build_probe_url(node.host(), &self.target);
        let request = self
            .client
            .get(&url)
            .header(HOST, self.target.host_header.as_str())
            .timeout(self.policy.timeout)
            .send();

        match time::timeout(self.policy.timeout, request).await {
            Ok(Ok(response)) if response.status() == StatusCode::OK => {
                debug!(node = node.name(), "health probe passed");
                ProbeOutcome::Success
            }
            Ok(Ok(response)) => {
                warn!(
                    node = node.name(),
                    status = %response.status(),
                    "health probe returned non-200"
                );
                ProbeOutcome::Failure
            }
            Ok(Err(e)) => {
                warn!(node = node.name(), url = %url, error = %e, "health probe failed");
                ProbeOutcome::Failure
            }
            Err(_) => {
                warn!(node = node.name(), timeout = ?self.policy.timeout, "health probe timed out");
                ProbeOutcome::Failure
            }
        }
    }

    /// Replace the roster and ask the running loop to check the new nodes
    /// right away.
    pub fn reload_nodes(&self, specs: Vec<NodeSpec>) -> usize {
        let loaded = self.roster.reload(specs);
        info!(nodes = loaded, "node roster reloaded");
        self.recheck.notify_one();
        loaded
    }
}

/// Lets the admin control plane reload and inspect the fleet.
#[derive(Debug, Clone)]
pub struct CheckerControl(pub Arc<HealthChecker>);

impl FleetControl for CheckerControl {
    fn reload(&self, nodes: Vec<NodeSpec>) -> usize {
        self.0.reload_nodes(nodes)
    }

    fn status(&self) -> Vec<NodeStatus> {
        self.0.roster.snapshot().iter().map(|n| n.status()).collect()
    }
}

/// Handle to the running probe loop.
///
/// Dropping it without [`HealthCheckHandle::stop`] aborts the loop.
#[derive(Debug)]
pub struct HealthCheckHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl HealthCheckHandle {
    /// Stop scheduling passes, drain the running ones and wait for the loop to exit.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HealthCheckHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The probe URL for a node: its scheme and hostname, the administrative
/// port and the health path.
///
/// Hosts that do not parse as URLs get the health path appended verbatim.
pub fn build_probe_url(node_host: &str, target: &ProbeTarget) -> String {
    let fallback = || format!("{}{}", node_host.trim_end_matches('/'), target.path);

    let Ok(mut url) = Url::parse(node_host) else {
        return fallback();
    };
    if url.host_str().is_none() || url.set_port(Some(target.port)).is_err() {
        return fallback();
    }
    url.set_path(&target.path);
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeway_core::Roster;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    /// A health endpoint whose status code can be changed while it runs.
    struct FakeHealthEndpoint {
        addr: SocketAddr,
        status: Arc<AtomicU16>,
        seen: Arc<Mutex<Vec<(String, String)>>>,
    }

    async fn spawn_endpoint(status: u16) -> FakeHealthEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let status = Arc::new(AtomicU16::new(status));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (status_c, seen_c) = (status.clone(), seen.clone());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let (status, seen) = (status_c.clone(), seen_c.clone());
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let host = req
                            .headers()
                            .get(hyper::header::HOST)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        seen.lock().unwrap().push((host, req.uri().path().to_string()));
                        let code = status.load(Ordering::SeqCst);
                        async move {
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .status(code)
                                    .header("location", "http://127.0.0.1:1/elsewhere")
                                    .body(Full::new(Bytes::from_static(b"ok")))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        FakeHealthEndpoint { addr, status, seen }
    }

    fn checker_for(endpoint: &FakeHealthEndpoint, fail: u32, succ: u32) -> Arc<HealthChecker> {
        checker_every(endpoint, Duration::from_millis(200), fail, succ)
    }

    fn checker_every(
        endpoint: &FakeHealthEndpoint,
        interval: Duration,
        fail: u32,
        succ: u32,
    ) -> Arc<HealthChecker> {
        // serving port differs from the probe port on purpose
        let roster = Arc::new(Roster::new(vec![NodeSpec::new(
            "edge-a",
            "http://127.0.0.1:46621",
            100,
        )]));
        let policy = HealthCheckPolicy::new(interval, Duration::from_millis(500), fail, succ);
        let target = ProbeTarget {
            port: endpoint.addr.port(),
            ..ProbeTarget::default()
        };
        Arc::new(HealthChecker::new(roster, policy, target).unwrap())
    }

    #[test]
    fn probe_url_replaces_port_and_path() {
        let target = ProbeTarget::default();
        assert_eq!(
            build_probe_url("http://1.2.3.4:46621", &target),
            "http://1.2.3.4/gtm-health"
        );
        let target = ProbeTarget {
            port: 8080,
            ..ProbeTarget::default()
        };
        assert_eq!(
            build_probe_url("https://edge.example.com/media?x=1", &target),
            "https://edge.example.com:8080/gtm-health"
        );
    }

    #[test]
    fn probe_url_falls_back_for_unparsable_hosts() {
        let target = ProbeTarget::default();
        assert_eq!(build_probe_url("10.0.0.1:46621/", &target), "10.0.0.1:46621/gtm-health");
    }

    #[tokio::test]
    async fn probe_uses_admin_port_and_sentinel_host() {
        let endpoint = spawn_endpoint(200).await;
        let checker = checker_for(&endpoint, 1, 1);
        checker.check_all().await;

        let seen = endpoint.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("gtm-health".to_string(), "/gtm-health".to_string())]);
        assert_eq!(checker.healthy_nodes().len(), 1);
        assert_eq!(checker.all_nodes()[0].health().consecutive_successes, 1);
    }

    #[tokio::test]
    async fn non_200_counts_as_failure_and_respects_threshold() {
        let endpoint = spawn_endpoint(500).await;
        let checker = checker_for(&endpoint, 2, 1);

        checker.check_all().await;
        assert_eq!(checker.healthy_nodes().len(), 1, "one failure is below threshold");
        checker.check_all().await;
        assert!(checker.healthy_nodes().is_empty());

        endpoint.status.store(200, Ordering::SeqCst);
        checker.check_all().await;
        assert_eq!(checker.healthy_nodes().len(), 1);
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let endpoint = spawn_endpoint(302).await;
        let checker = checker_for(&endpoint, 1, 1);
        checker.check_all().await;
        assert!(checker.healthy_nodes().is_empty());
        assert_eq!(endpoint.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connection_refused_is_a_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let roster = Arc::new(Roster::new(vec![NodeSpec::new("gone", "http://127.0.0.1:1", 1)]));
        let policy =
            HealthCheckPolicy::new(Duration::from_secs(1), Duration::from_millis(300), 1, 1);
        let target = ProbeTarget {
            port,
            ..ProbeTarget::default()
        };
        let checker = Arc::new(HealthChecker::new(roster, policy, target).unwrap());
        checker.check_all().await;
        assert!(checker.healthy_nodes().is_empty());
    }

    #[tokio::test]
    async fn start_probes_immediately_and_stop_joins() {
        let endpoint = spawn_endpoint(500).await;
        let checker = checker_for(&endpoint, 1, 1);
        let handle = checker.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !checker.healthy_nodes().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "first pass never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.stop().await;

        let probes = endpoint.seen.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(endpoint.seen.lock().unwrap().len(), probes, "no probes after stop");
    }

    async fn wait_for_requests(endpoint: &FakeHealthEndpoint, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while endpoint.seen.lock().unwrap().len() < count {
            assert!(tokio::time::Instant::now() < deadline, "expected {count} health requests");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn reload_swaps_roster_and_checks_new_nodes() {
        let endpoint = spawn_endpoint(200).await;
        // long interval so only the first tick and the reload trigger passes
        let checker = checker_every(&endpoint, Duration::from_secs(60), 1, 1);
        let handle = checker.start();
        wait_for_requests(&endpoint, 1).await;

        let loaded = checker.reload_nodes(vec![
            NodeSpec::new("edge-b", "http://127.0.0.1:5000", 10),
            NodeSpec {
                enabled: false,
                ..NodeSpec::new("edge-c", "http://127.0.0.1:5001", 10)
            },
        ]);
        assert_eq!(loaded, 1);
        assert_eq!(checker.all_nodes()[0].name(), "edge-b");
        wait_for_requests(&endpoint, 2).await;

        handle.stop().await;
    }

    #[tokio::test]
    async fn reload_after_stop_runs_no_pass() {
        let endpoint = spawn_endpoint(200).await;
        let checker = checker_every(&endpoint, Duration::from_secs(60), 1, 1);
        let handle = checker.start();
        wait_for_requests(&endpoint, 1).await;
        handle.stop().await;

        checker.reload_nodes(vec![NodeSpec::new("edge-b", "http://127.0.0.1:5000", 10)]);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(endpoint.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn checker_control_reports_status() {
        let endpoint = spawn_endpoint(200).await;
        let checker = checker_for(&endpoint, 1, 1);
        let control = CheckerControl(checker);
        let status = control.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "edge-a");
        assert!(status[0].healthy);
    }
}
