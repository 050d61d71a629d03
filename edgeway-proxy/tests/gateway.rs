//! End-to-end tests against a running gateway with a fake origin and fake
//! edge node health endpoints.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use edgeway_core::{HealthCheckPolicy, NodeSpec};
use edgeway_proxy::config::{GatewayConfig, ProbeTarget};
use edgeway_proxy::{launch, RunningGateway};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use reqwest::StatusCode;
use tokio::net::TcpListener;
use url::Url;

const GOOD_KEY: &str = "good-key-123";
const NODE_A: &str = "127.0.0.1:46621";
const NODE_B: &str = "127.0.0.2:46621";

async fn serve<F>(listener: TcpListener, respond: F)
where
    F: Fn(&Request<hyper::body::Incoming>, SocketAddr) -> u16 + Send + Sync + 'static,
{
    let respond = Arc::new(respond);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let Ok(local) = stream.local_addr() else { continue };
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let code = respond(&req, local);
                    async move {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(code)
                                .body(Full::new(Bytes::from_static(b"{}")))
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
}

/// Origin that accepts only `GOOD_KEY` and counts validation calls.
async fn fake_origin() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    serve(listener, move |req, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        let raw = req.uri().query().unwrap_or("");
        let query: HashMap<String, String> =
            url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect();
        let key = query.get("api_key").map(String::as_str);
        if req.uri().path() == "/emby/System/Info" && key == Some(GOOD_KEY) {
            200
        } else {
            401
        }
    })
    .await;
    (addr, calls)
}

/// Health endpoint for both nodes: node A always passes, node B answers
/// with whatever `node_b_status` holds. Nodes are told apart by the local
/// address the probe connected to.
async fn fake_health() -> (u16, Arc<AtomicU16>) {
    let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let node_b_status = Arc::new(AtomicU16::new(200));
    let status = Arc::clone(&node_b_status);
    serve(listener, move |req, local| {
        assert_eq!(req.uri().path(), "/gtm-health");
        if local.ip() == IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)) {
            status.load(Ordering::SeqCst)
        } else {
            200
        }
    })
    .await;
    (port, node_b_status)
}

struct Harness {
    gateway: RunningGateway,
    base: String,
    client: reqwest::Client,
    origin_calls: Arc<AtomicUsize>,
    node_b_status: Arc<AtomicU16>,
}

async fn start(configure: impl FnOnce(&mut GatewayConfig)) -> Harness {
    let (origin, origin_calls) = fake_origin().await;
    let (probe_port, node_b_status) = fake_health().await;

    let mut config = GatewayConfig::default();
    config.server.listen = "127.0.0.1:0".parse().unwrap();
    config.server.shutdown_grace = Duration::from_secs(2);
    config.origin.host = format!("http://{origin}");
    config.nodes.health_check =
        HealthCheckPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 1, 1);
    config.nodes.probe = ProbeTarget {
        port: probe_port,
        ..ProbeTarget::default()
    };
    config.nodes.list = vec![
        NodeSpec::new("edge-a", format!("http://{NODE_A}"), 100),
        NodeSpec::new("edge-b", format!("http://{NODE_B}"), 50),
    ];
    config.access.secret = "integration-secret".to_string();
    configure(&mut config);

    let gateway = launch(config).await.unwrap();
    let base = format!("http://{}", gateway.local_addr());
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    Harness {
        gateway,
        base,
        client,
        origin_calls,
        node_b_status,
    }
}

impl Harness {
    async fn get(&self, path: &str, node: Option<&str>) -> reqwest::Response {
        let mut request = self.client.get(format!("{}{path}", self.base));
        if let Some(node) = node {
            request = request.header("X-Node-Host", node);
        }
        request.send().await.unwrap()
    }

    /// Mint for `media_path` and return the verify query for it.
    async fn mint(&self, media_path: &str) -> String {
        let response = self
            .get(&format!("/api/video-auth/{media_path}?api_key={GOOD_KEY}"), None)
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()["location"].to_str().unwrap().to_string();
        let signed = Url::parse("http://edge").unwrap().join(&location).unwrap();
        let path = percent_decode_str(signed.path()).decode_utf8().unwrap();
        assert_eq!(path, format!("/internal/{media_path}"));

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.extend_pairs(signed.query_pairs());
        query.append_pair("path", &path);
        query.finish()
    }

    async fn wait_for_health(&self, node: &str, healthy: bool) {
        let roster = self.gateway.checker().roster();
        for _ in 0..100 {
            if roster.get(node).is_some_and(|n| n.is_healthy() == healthy) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{node} never became healthy={healthy}");
    }
}

#[tokio::test]
async fn mint_then_verify_keeps_session() {
    let h = start(|_| {}).await;

    let query = h.mint("data/Movie/a.mkv").await;
    let verify = format!("/api/verify-token?{query}");
    assert_eq!(h.get(&verify, Some(NODE_A)).await.status(), StatusCode::OK);
    assert_eq!(h.get(&verify, Some(NODE_A)).await.status(), StatusCode::OK);

    // second mint reuses the memoized validation
    h.mint("data/Movie/a.mkv").await;
    assert_eq!(h.origin_calls.load(Ordering::SeqCst), 1);

    let tampered = verify.replace("a.mkv", "b.mkv");
    assert_eq!(h.get(&tampered, Some(NODE_A)).await.status(), StatusCode::FORBIDDEN);

    h.gateway.shutdown().await;
}

#[tokio::test]
async fn escaped_paths_mint_and_verify() {
    let h = start(|_| {}).await;

    let query = h.mint("data/Movie/My Film (2020).mkv").await;
    let verify = format!("/api/verify-token?{query}");
    assert_eq!(h.get(&verify, Some(NODE_A)).await.status(), StatusCode::OK);

    h.gateway.shutdown().await;
}

#[tokio::test]
async fn steer_and_auth_endpoints() {
    let h = start(|_| {}).await;

    let auth = h.get(&format!("/api/auth?api_key={GOOD_KEY}"), None).await;
    assert_eq!(auth.status(), StatusCode::OK);
    let auth = h.get("/api/auth?api_key=wrong", None).await;
    assert_eq!(auth.status(), StatusCode::FORBIDDEN);

    h.node_b_status.store(503, Ordering::SeqCst);
    h.wait_for_health("edge-b", false).await;

    let steered = h
        .get(&format!("/api/stream/data/Movie/a.mkv?api_key={GOOD_KEY}"), None)
        .await;
    assert_eq!(steered.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = Url::parse(steered.headers()["location"].to_str().unwrap()).unwrap();
    assert_eq!(location.host_str(), Some("127.0.0.1"));
    assert_eq!(location.path(), "/video/data/Movie/a.mkv");

    // reload to a single node that then fails
    h.gateway
        .checker()
        .roster()
        .reload(vec![NodeSpec::new("edge-b", format!("http://{NODE_B}"), 50)]);
    h.wait_for_health("edge-b", false).await;
    let none = h
        .get(&format!("/api/stream/data/Movie/a.mkv?api_key={GOOD_KEY}"), None)
        .await;
    assert_eq!(none.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = none.json().await.unwrap();
    assert!(body["error"].is_string());

    h.gateway.shutdown().await;
}

#[tokio::test]
async fn mint_rejects_bad_credentials() {
    let h = start(|_| {}).await;

    let response = h.get("/api/video-auth/a.mkv?api_key=wrong", None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    let response = h.get("/api/video-auth/a.mkv", None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = h
        .client
        .get(format!("{}/api/video-auth/a.mkv", h.base))
        .header("X-Emby-Token", GOOD_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    h.gateway.shutdown().await;
}

#[tokio::test]
async fn unhealthy_node_redirects_to_healthy_one() {
    let h = start(|_| {}).await;
    let query = h.mint("data/Show/s01e01.mkv").await;

    h.node_b_status.store(503, Ordering::SeqCst);
    h.wait_for_health("edge-b", false).await;

    let response = h.get(&format!("/api/verify-token?{query}"), Some(NODE_B)).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = Url::parse(response.headers()["location"].to_str().unwrap()).unwrap();
    assert_eq!(location.host_str(), Some("127.0.0.1"));
    assert_eq!(location.port(), Some(46621));
    assert_eq!(location.path(), "/video/data/Show/s01e01.mkv");
    let params: HashMap<String, String> = location.query_pairs().into_owned().collect();
    assert_eq!(params["api_key"], GOOD_KEY);
    assert_eq!(params["_retry"], "1");

    let capped = h
        .get(&format!("/api/verify-token?{query}&_retry=3"), Some(NODE_B))
        .await;
    assert_eq!(capped.status(), StatusCode::SERVICE_UNAVAILABLE);

    // the healthy node keeps serving
    let ok = h.get(&format!("/api/verify-token?{query}"), Some(NODE_A)).await;
    assert_eq!(ok.status(), StatusCode::OK);

    h.node_b_status.store(200, Ordering::SeqCst);
    h.wait_for_health("edge-b", true).await;
    let ok = h.get(&format!("/api/verify-token?{query}"), Some(NODE_B)).await;
    assert_eq!(ok.status(), StatusCode::OK);

    h.gateway.shutdown().await;
}

#[tokio::test]
async fn status_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("access.log");
    let path = log_path.clone();
    let h = start(move |config| {
        config.access_log.enabled = true;
        config.access_log.path = path;
    })
    .await;

    assert_eq!(h.get("/healthz", None).await.status(), StatusCode::OK);
    assert_eq!(h.get("/nope", None).await.status(), StatusCode::NOT_FOUND);

    let nodes: Vec<serde_json::Value> = h.get("/api/nodes", None).await.json().await.unwrap();
    let names: Vec<&str> = nodes.iter().filter_map(|n| n["name"].as_str()).collect();
    assert_eq!(names, ["edge-a", "edge-b"]);

    let query = h.mint("a.mkv").await;
    h.get(&format!("/api/verify-token?{query}"), Some(NODE_A)).await;
    h.get("/api/verify-token?token=x", Some(NODE_A)).await;

    // records are written asynchronously
    let mut stats = serde_json::Value::Null;
    for _ in 0..50 {
        stats = h.get("/api/auth-stats", None).await.json().await.unwrap();
        if stats["total_requests"] == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stats["total_requests"], 3);
    assert_eq!(stats["success_requests"], 2);
    assert_eq!(stats["fail_reasons"]["missing_parameters"], 1);

    h.gateway.shutdown().await;

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(log.lines().count(), 3);
    assert!(!log.contains(GOOD_KEY), "credentials are masked in the access log");
}

#[cfg(unix)]
#[tokio::test]
async fn admin_socket_reloads_roster() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("admin.sock");
    let path = socket.clone();
    let h = start(move |config| {
        config.admin.enabled = true;
        config.admin.socket = path;
    })
    .await;
    assert_eq!(h.gateway.admin_socket(), Some(&socket));

    let stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let request = r#"{"op":"reload","nodes":[{"name":"edge-c","host":"http://127.0.0.1:46621"}]}"#;
    write.write_all(format!("{request}\n").as_bytes()).await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["loaded"], 1);

    let nodes: Vec<serde_json::Value> = h.get("/api/nodes", None).await.json().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["name"], "edge-c");

    h.gateway.shutdown().await;
    assert!(!socket.exists());
}
