//! Connection pool for container HTTP connections
//!
//! Requests are forwarded to the container's published port on the loopback
//! interface. Connections are reused across requests.

use crate::platform::GatewayBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// Nothing accepted the connection on the container's port
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Client(e) if e.is_connect())
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests forwarded through the pool
    pub total_requests: AtomicU64,
    /// Readiness probes sent while a container was starting
    pub probes: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to containers
pub struct ConnectionPool {
    client: Client<HttpConnector, GatewayBody>,
    /// Separate client for readiness probes (Empty body type)
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        // Probes never reuse connections; a half-started container may drop them
        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `127.0.0.1:{port}`.
    ///
    /// Method, path, query, headers and body go through as received; only the
    /// URI authority changes. The response comes back untouched.
    pub async fn send_request(
        &self,
        req: Request<GatewayBody>,
        port: u16,
    ) -> Result<Response<GatewayBody>, PoolError> {
        let uri = format!(
            "http://127.0.0.1:{}{}",
            port,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let container_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self.client.request(container_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Whether anything answers HTTP on `127.0.0.1:{port}{path}`.
    ///
    /// Any status counts: the workload is listening, which is all a
    /// readiness check needs.
    pub async fn probe(&self, port: u16, path: &str) -> bool {
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        self.stats.record_probe();

        self.probe_client.request(req).await.is_ok()
    }
}
