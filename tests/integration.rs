//! Integration tests for Containergate

use std::convert::Infallible;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use containergate::binding::{ContainerBinding, ContainerSettings, LifecycleHooks};
use containergate::config::{Config, ContainerConfig};
use containergate::docker::DockerPlatform;
use containergate::platform::{ContainerHandle, ContainerPlatform, GatewayBody, PlatformError};
use containergate::pool::{ConnectionPool, PoolConfig};
use containergate::proxy::ProxyServer;
use containergate::router::Router;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Start an upstream that echoes what it received.
///
/// Responds 203 with `x-upstream: echo`, the request's `x-trace` header echoed
/// back as `x-seen-trace`, and a body of `{method} {path?query} {body}`.
async fn spawn_echo_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let (parts, body) = req.into_parts();
                    let body = body.collect().await.unwrap().to_bytes();
                    let trace = parts
                        .headers
                        .get("x-trace")
                        .map(|v| v.to_str().unwrap().to_string())
                        .unwrap_or_default();
                    let text = format!(
                        "{} {} {}",
                        parts.method,
                        parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
                        String::from_utf8_lossy(&body)
                    );
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(StatusCode::NON_AUTHORITATIVE_INFORMATION)
                            .header("x-upstream", "echo")
                            .header("x-seen-trace", trace)
                            .body(Full::new(Bytes::from(text)))
                            .unwrap(),
                    )
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    port
}

/// Handle that forwards through a real pool to a fixed port
struct PortHandle {
    pool: ConnectionPool,
    port: u16,
    forwards: AtomicUsize,
}

#[async_trait]
impl ContainerHandle for PortHandle {
    async fn forward(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, PlatformError> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        Ok(self.pool.send_request(req, self.port).await?)
    }
}

/// Platform with a single handle under CONTAINER
struct SinglePlatform {
    handle: Arc<PortHandle>,
    lookups: Mutex<Vec<String>>,
}

impl SinglePlatform {
    fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            handle: Arc::new(PortHandle {
                pool: ConnectionPool::new(PoolConfig::default()),
                port,
                forwards: AtomicUsize::new(0),
            }),
            lookups: Mutex::new(Vec::new()),
        })
    }

    fn forwards(&self) -> usize {
        self.handle.forwards.load(Ordering::SeqCst)
    }
}

impl ContainerPlatform for SinglePlatform {
    fn get_instance(&self, binding: &str) -> Result<Arc<dyn ContainerHandle>, PlatformError> {
        self.lookups.lock().push(binding.to_string());
        if binding != "CONTAINER" {
            return Err(PlatformError::UnknownBinding(binding.to_string()));
        }
        let handle: Arc<dyn ContainerHandle> = self.handle.clone();
        Ok(handle)
    }
}

/// Start the gateway on an ephemeral port
async fn start_gateway(platform: Arc<dyn ContainerPlatform>) -> (u16, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router = Arc::new(Router::new("CONTAINER", platform));
    let server = ProxyServer::new(addr, router, shutdown_rx);

    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    (port, shutdown_tx)
}

/// Send a raw HTTP request and read the whole response
async fn http_request(port: u16, request: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(
        port,
        &format!(
            "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
            path, port
        ),
    )
    .await
}

fn gateway_body(text: &'static str) -> GatewayBody {
    Full::new(Bytes::from(text)).map_err(|e| match e {}).boxed()
}

#[tokio::test]
async fn test_get_root_is_forwarded_unchanged() {
    let upstream = spawn_echo_upstream().await;
    let platform = SinglePlatform::new(upstream);
    let (port, shutdown_tx) = start_gateway(platform.clone()).await;

    let response = http_request(
        port,
        &format!(
            "GET /?name=value HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nX-Trace: abc123\r\nConnection: close\r\n\r\n",
            port
        ),
    )
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 203"), "unexpected response: {}", response);
    assert!(response.to_lowercase().contains("x-upstream: echo"));
    assert!(response.to_lowercase().contains("x-seen-trace: abc123"));
    assert!(response.ends_with("GET /?name=value "));

    assert_eq!(platform.forwards(), 1);
    assert_eq!(platform.lookups.lock().as_slice(), ["CONTAINER".to_string()]);

    let _ = shutdown_tx.send(true);
}

/// Handle that answers every request itself
struct OkHandle;

#[async_trait]
impl ContainerHandle for OkHandle {
    async fn forward(&self, _req: Request<GatewayBody>) -> Result<Response<GatewayBody>, PlatformError> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(gateway_body("ok"))
            .unwrap())
    }
}

struct OkPlatform;

impl ContainerPlatform for OkPlatform {
    fn get_instance(&self, _binding: &str) -> Result<Arc<dyn ContainerHandle>, PlatformError> {
        Ok(Arc::new(OkHandle))
    }
}

#[tokio::test]
async fn test_container_response_reaches_caller() {
    let (port, shutdown_tx) = start_gateway(Arc::new(OkPlatform)).await;

    let response = http_get(port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);
    assert!(response.ends_with("\r\n\r\nok"));

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_unmatched_routes_return_404_without_lookup() {
    let upstream = spawn_echo_upstream().await;
    let platform = SinglePlatform::new(upstream);
    let (port, shutdown_tx) = start_gateway(platform.clone()).await;

    let response = http_get(port, "/container").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "unexpected response: {}", response);
    assert!(response.contains("NOT_FOUND"));

    let response = http_request(
        port,
        &format!(
            "POST / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping",
            port
        ),
    )
    .await
    .unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "unexpected response: {}", response);

    assert_eq!(platform.forwards(), 0);
    assert!(platform.lookups.lock().is_empty());

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_unreachable_container_returns_generic_500() {
    // Nothing listens on this port once the listener is dropped
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_port = closed.local_addr().unwrap().port();
    drop(closed);

    let platform = SinglePlatform::new(closed_port);
    let (port, shutdown_tx) = start_gateway(platform.clone()).await;

    let response = http_get(port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 500"), "unexpected response: {}", response);
    assert!(response.contains("Internal Server Error"));
    assert!(!response.contains(&closed_port.to_string()));

    // No retry
    assert_eq!(platform.forwards(), 1);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_concurrent_requests_are_independent() {
    let upstream = spawn_echo_upstream().await;
    let platform = SinglePlatform::new(upstream);
    let (port, shutdown_tx) = start_gateway(platform.clone()).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(tokio::spawn(async move {
            http_get(port, &format!("/?n={}", i)).await.unwrap()
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap();
        assert!(response.ends_with(&format!("GET /?n={} ", i)));
    }
    assert_eq!(platform.forwards(), 8);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_gateway_stops_accepting_after_shutdown() {
    let upstream = spawn_echo_upstream().await;
    let (port, shutdown_tx) = start_gateway(SinglePlatform::new(upstream)).await;

    assert!(http_get(port, "/").await.is_ok());

    shutdown_tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_err());
}

#[tokio::test]
async fn test_pool_passes_request_and_response_through() {
    let upstream = spawn_echo_upstream().await;
    let pool = ConnectionPool::new(PoolConfig::default());

    let req = Request::builder()
        .method("POST")
        .uri("http://gateway.example/submit?x=1&y=2")
        .header("x-trace", "t-42")
        .body(gateway_body("hello container"))
        .unwrap();

    let response = pool.send_request(req, upstream).await.unwrap();
    assert_eq!(response.status(), StatusCode::NON_AUTHORITATIVE_INFORMATION);
    assert_eq!(response.headers()["x-upstream"], "echo");
    assert_eq!(response.headers()["x-seen-trace"], "t-42");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from("POST /submit?x=1&y=2 hello container"));
    assert_eq!(pool.stats().get_total_requests(), 1);
}

#[tokio::test]
async fn test_pool_probe() {
    let upstream = spawn_echo_upstream().await;
    let pool = ConnectionPool::new(PoolConfig::default());

    assert!(pool.probe(upstream, "/").await);
    assert_eq!(pool.stats().get_probes(), 1);
}

fn offline_docker() -> Docker {
    Docker::connect_with_http("http://127.0.0.1:1", 2, bollard::API_DEFAULT_VERSION).unwrap()
}

#[tokio::test]
async fn test_docker_platform_unknown_binding_returns_500() {
    let platform = DockerPlatform::with_client(offline_docker(), Arc::new(ConnectionPool::new(PoolConfig::default())));
    let (port, shutdown_tx) = start_gateway(platform).await;

    let response = http_get(port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 500"), "unexpected response: {}", response);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_docker_start_failure_reaches_error_hook() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&errors);
    let hooks = LifecycleHooks::silent().with_error_hook(move |e| recorded.lock().push(e.to_string()));
    let binding = ContainerBinding::new("CONTAINER", ContainerSettings::worker(), hooks);

    let platform = DockerPlatform::with_client(offline_docker(), Arc::new(ConnectionPool::new(PoolConfig::default())));
    platform.register(binding, ContainerConfig::new("sample-container:latest"));
    let (port, shutdown_tx) = start_gateway(platform).await;

    let response = http_get(port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 500"), "unexpected response: {}", response);

    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("container daemon error"), "unexpected error: {}", errors[0]);

    let _ = shutdown_tx.send(true);
}

#[test]
fn test_example_config_is_valid() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config.example.toml");
    let config = Config::load(&path).unwrap();

    assert_eq!(config.container.binding, "CONTAINER");
    assert_eq!(config.container.image, "sample-container:latest");
    assert_eq!(config.container.env.get("MESSAGE"), Some(&"I was passed in via the gateway config".to_string()));
}

#[test]
fn test_full_config_parsing() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[server]
port = 9000
bind = "127.0.0.1"
pool_max_idle_per_host = 4

[container]
binding = "WORKER"
image = "registry.example/worker:1.2"
container_name = "worker-1"
pull_policy = "always"
memory = "256m"
cpus = "0.5"
host_port = 18080
ready_path = "/health"
stop_on_shutdown = false

[container.env]
MESSAGE = "hi"
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.server.pool_max_idle_per_host, 4);
    assert_eq!(config.container.container_name(), "worker-1");
    assert_eq!(config.container.memory.as_deref(), Some("256m"));
    assert_eq!(config.container.host_port, Some(18080));
    assert!(!config.container.stop_on_shutdown);
}
