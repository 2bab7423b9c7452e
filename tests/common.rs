//! Shared harness for integration tests: stub upstream servers plus a
//! fully wired balancer on a loopback port, backed by an in-memory
//! catalog.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use relayd::config::{BalancerMode, Settings};
use relayd::{BackendCache, BackendRecord, Catalog, MemoryCatalog, SharedState};

pub const API_KEY: &str = "user-secret";
pub const ADMIN_KEY: &str = "admin-secret";

/// Build a catalog record. `url` must be an absolute origin.
pub fn record(id: i32, url: &str, rate: i32, burst: i32, active: bool) -> BackendRecord {
    let now = Utc::now();
    BackendRecord {
        id,
        url: url.to_string(),
        rate_limit: rate,
        burst_limit: burst,
        is_active: active,
        created_at: now,
        updated_at: now,
    }
}

/// One request as the upstream saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub uri: String,
    pub body: Vec<u8>,
}

/// A stub backend answering every request with a fixed status and body,
/// recording what it was sent.
pub struct Upstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    seen: Arc<parking_lot::Mutex<Vec<SeenRequest>>>,
    accept_task: JoinHandle<()>,
}

impl Upstream {
    pub async fn start(status: StatusCode, marker: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen: Arc<parking_lot::Mutex<Vec<SeenRequest>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        let hit_counter = hits.clone();
        let seen_log = seen.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let hits = hit_counter.clone();
                let seen = seen_log.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let hits = hits.clone();
                        let seen = seen.clone();
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            let (parts, body) = req.into_parts();
                            let body = {
                                use http_body_util::BodyExt;
                                body.collect().await.unwrap().to_bytes()
                            };
                            seen.lock().push(SeenRequest {
                                method: parts.method.to_string(),
                                uri: parts.uri.to_string(),
                                body: body.to_vec(),
                            });
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("x-upstream", marker)
                                    .body(Full::new(Bytes::from(marker)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        Self {
            addr,
            hits,
            seen,
            accept_task,
        }
    }

    /// Requests this upstream has served, oldest first.
    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }

    /// Bind a port and immediately close it, yielding an origin that
    /// refuses connections.
    pub async fn dead_origin() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// A running balancer with direct handles on its cache and catalog.
pub struct TestBalancer {
    pub addr: SocketAddr,
    pub catalog: Arc<MemoryCatalog>,
    pub cache: Arc<BackendCache>,
    pub state: Arc<SharedState>,
    client: reqwest::Client,
    shutdown: watch::Sender<bool>,
}

impl TestBalancer {
    /// Boot the real server on a loopback port. The cache is primed from
    /// the records marked active, like the binary does at startup.
    pub async fn start(mode: BalancerMode, records: Vec<BackendRecord>) -> Self {
        let catalog = Arc::new(MemoryCatalog::with_records(records));
        let active = catalog.list_active().await.unwrap();
        let cache = Arc::new(BackendCache::new(active));

        let settings = Settings {
            postgres_url: "postgres://unused".to_string(),
            api_key: API_KEY.to_string(),
            admin_api_key: ADMIN_KEY.to_string(),
            mode,
        };
        let catalog_dyn: Arc<dyn Catalog> = catalog.clone();
        let state = Arc::new(SharedState::new(&settings, cache.clone(), catalog_dyn));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(relayd::serve(listener, state.clone(), shutdown_rx));

        // The balancer answers redirects itself; the test client must not
        // follow them.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        Self {
            addr,
            catalog,
            cache,
            state,
            client,
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// GET with the user bearer key.
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("Authorization", format!("Bearer {API_KEY}"))
            .send()
            .await
            .unwrap()
    }

    /// POST with the user bearer key.
    pub async fn post(&self, path: &str, body: &'static str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("Authorization", format!("Bearer {API_KEY}"))
            .body(body)
            .send()
            .await
            .unwrap()
    }

    /// GET with the admin bearer key.
    pub async fn get_admin(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("Authorization", format!("Bearer {ADMIN_KEY}"))
            .send()
            .await
            .unwrap()
    }

    /// GET with no credentials at all.
    pub async fn get_anonymous(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    /// Rendered metrics, straight from the sink.
    pub fn metrics(&self) -> String {
        self.state.metrics.render()
    }
}

impl Drop for TestBalancer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
