//! End-to-end tests for the proxy surface: a real listener in front of a
//! recording mock upstream.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Request, State};
use chrono::Utc;
use tagkeep_index::UsageIndex;
use tagkeep_node::gate::MaintenanceGate;
use tagkeep_node::proxy::{ProxyState, router};

#[derive(Debug, Clone)]
struct SeenRequest {
    method: String,
    path: String,
    forwarded_for: Option<String>,
    forwarded_proto: Option<String>,
}

type Seen = Arc<Mutex<Vec<SeenRequest>>>;

async fn record(State(seen): State<Seen>, req: Request) -> &'static str {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    seen.lock().unwrap().push(SeenRequest {
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
        forwarded_for: header("x-forwarded-for"),
        forwarded_proto: header("x-forwarded-proto"),
    });
    "upstream-ok"
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Harness {
    proxy: SocketAddr,
    seen: Seen,
    index: UsageIndex,
    gate: MaintenanceGate,
    _db_dir: tempfile::TempDir,
}

async fn harness(use_forwarded_headers: bool) -> Harness {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let upstream = serve(Router::new().fallback(record).with_state(seen.clone())).await;

    let db_dir = tempfile::tempdir().unwrap();
    let index = UsageIndex::open(db_dir.path()).unwrap();
    let gate = MaintenanceGate::new();
    let state = ProxyState {
        upstream: reqwest::Url::parse(&format!("http://{upstream}")).unwrap(),
        client: reqwest::Client::new(),
        index: index.clone(),
        gate: gate.clone(),
        use_forwarded_headers,
        tls_enabled: false,
    };
    let proxy = serve(router(state)).await;

    Harness {
        proxy,
        seen,
        index,
        gate,
        _db_dir: db_dir,
    }
}

#[tokio::test]
async fn healthz_answers_directly() {
    let h = harness(false).await;
    let resp = reqwest::get(format!("http://{}/healthz", h.proxy))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
    // Health checks never reach the upstream.
    assert!(h.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn head_pull_is_forwarded_and_indexed() {
    let h = harness(false).await;
    let client = reqwest::Client::new();

    let before = Utc::now();
    let resp = client
        .head(format!(
            "http://{}/v2/library/alpine/manifests/3.18",
            h.proxy
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let seen = h.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "HEAD");
    assert_eq!(seen[0].path, "/v2/library/alpine/manifests/3.18");

    let lru = h.index.lru_list().await.unwrap();
    assert_eq!(lru.len(), 1);
    assert_eq!(lru[0].repo, "library/alpine");
    assert_eq!(lru[0].tag, "3.18");
    assert!(lru[0].access_time >= before && lru[0].access_time <= Utc::now());
}

#[tokio::test]
async fn maintenance_turns_writes_away_but_not_reads() {
    let h = harness(false).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/v2/foo/manifests/bar", h.proxy);

    let held = h.gate.maintenance().await.unwrap();

    let put = client.put(&url).body("manifest").send().await.unwrap();
    assert_eq!(put.status(), 503);

    let get = client.get(&url).send().await.unwrap();
    assert_eq!(get.status(), 200);
    assert_eq!(get.text().await.unwrap(), "upstream-ok");

    // Only the read made it upstream, and the refused push left no trace
    // in the index.
    {
        let seen = h.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "GET");
    }
    assert!(h.index.lru_list().await.unwrap().is_empty());

    drop(held);
    let put = client.put(&url).body("manifest").send().await.unwrap();
    assert_eq!(put.status(), 200);

    let lru = h.index.lru_list().await.unwrap();
    assert_eq!(lru.len(), 1);
    assert_eq!(lru[0].repo, "foo");
    assert_eq!(lru[0].tag, "bar");
}

#[tokio::test]
async fn untrusted_forward_headers_are_stripped() {
    let h = harness(false).await;
    let client = reqwest::Client::new();

    client
        .get(format!("http://{}/v2/_catalog", h.proxy))
        .header("x-forwarded-for", "203.0.113.9")
        .send()
        .await
        .unwrap();

    let seen = h.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].forwarded_for, None);
    assert_eq!(seen[0].forwarded_proto.as_deref(), Some("http"));
}

#[tokio::test]
async fn trusted_forward_headers_pass_through() {
    let h = harness(true).await;
    let client = reqwest::Client::new();

    client
        .get(format!("http://{}/v2/_catalog", h.proxy))
        .header("x-forwarded-for", "203.0.113.9")
        .header("x-forwarded-proto", "https")
        .send()
        .await
        .unwrap();

    let seen = h.seen.lock().unwrap().clone();
    assert_eq!(seen[0].forwarded_for.as_deref(), Some("203.0.113.9"));
    assert_eq!(seen[0].forwarded_proto.as_deref(), Some("https"));
}

#[tokio::test]
async fn unreachable_upstream_surfaces_bad_gateway() {
    // Bind-then-drop to get a port with nothing listening.
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let db_dir = tempfile::tempdir().unwrap();
    let state = ProxyState {
        upstream: reqwest::Url::parse(&format!("http://{dead}")).unwrap(),
        client: reqwest::Client::new(),
        index: UsageIndex::open(db_dir.path()).unwrap(),
        gate: MaintenanceGate::new(),
        use_forwarded_headers: false,
        tls_enabled: false,
    };
    let proxy = serve(router(state)).await;

    let resp = reqwest::get(format!("http://{proxy}/v2/_catalog"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
}
