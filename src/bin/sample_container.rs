//! Sample workload for the managed container
//!
//! Environment variables:
//! - PORT: Port to listen on (default: 8080)
//! - MESSAGE: Text echoed back by `GET /` (default: empty)
//! - CONTAINER_INSTANCE_ID: Instance id assigned by the gateway (default: empty)

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info};

const DEFAULT_PORT: u16 = 8080;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct Greeting {
    message: String,
    instance_id: String,
}

impl Greeting {
    fn from_env() -> Self {
        Self {
            message: std::env::var("MESSAGE").unwrap_or_default(),
            instance_id: std::env::var("CONTAINER_INSTANCE_ID").unwrap_or_default(),
        }
    }

    fn text(&self) -> String {
        format!(
            "Hi, I'm a container and this is my message: \"{}\", my instance ID is: {}",
            self.message, self.instance_id
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sample_container=info".parse().expect("valid log directive")),
        )
        .init();

    let port = match std::env::var("PORT") {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("PORT must be a valid port number: {}", e))?,
        Err(_) => DEFAULT_PORT,
    };

    let greeting = Arc::new(Greeting::from_env());

    info!("Server starting up...");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Server listening on :{}", port);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!("Received signal ({}), shutting down server...", signal);
        let _ = shutdown_tx.send(true);
    });

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        debug!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let greeting = Arc::clone(&greeting);
                let mut conn_shutdown = shutdown_rx.clone();

                connections.spawn(async move {
                    let service = service_fn(move |req| {
                        let greeting = Arc::clone(&greeting);
                        async move { Ok::<_, Infallible>(handle(&greeting, req)) }
                    });

                    let builder = AutoBuilder::new(TokioExecutor::new());
                    let conn = builder.serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);

                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(e) = result {
                                debug!(client = %addr, error = %e, "Connection error");
                            }
                        }
                        _ = conn_shutdown.changed() => {
                            conn.as_mut().graceful_shutdown();
                            let _ = conn.await;
                        }
                    }
                });
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    drop(listener);
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        connections.abort_all();
    }

    info!("Server shutdown successfully");
    Ok(())
}

fn handle(greeting: &Greeting, req: Request<Incoming>) -> Response<Full<Bytes>> {
    info!(method = %req.method(), path = req.uri().path(), "Request");
    respond(greeting, req.method(), req.uri().path())
}

fn respond(greeting: &Greeting, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if method != Method::GET {
        return json_detail(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }

    match path {
        "/" | "/container" => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(greeting.text())))
            .expect("valid response"),
        "/error" => json_detail(StatusCode::INTERNAL_SERVER_ERROR, "This is a panic"),
        _ => json_detail(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn json_detail(status: StatusCode, detail: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "detail": detail }).to_string();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response")
}

async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_text() {
        let greeting = Greeting {
            message: "hello".to_string(),
            instance_id: "abc-123".to_string(),
        };
        assert_eq!(
            greeting.text(),
            "Hi, I'm a container and this is my message: \"hello\", my instance ID is: abc-123"
        );
    }

    #[test]
    fn test_greeting_with_empty_env() {
        let greeting = Greeting {
            message: String::new(),
            instance_id: String::new(),
        };
        assert_eq!(
            greeting.text(),
            "Hi, I'm a container and this is my message: \"\", my instance ID is: "
        );
    }

    #[test]
    fn test_routes() {
        let greeting = Greeting {
            message: "hi".to_string(),
            instance_id: "id-1".to_string(),
        };

        for path in ["/", "/container"] {
            let response = respond(&greeting, &Method::GET, path);
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(
            respond(&greeting, &Method::GET, "/error").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(respond(&greeting, &Method::GET, "/missing").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            respond(&greeting, &Method::POST, "/").status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_json_detail() {
        let response = json_detail(StatusCode::INTERNAL_SERVER_ERROR, "This is a panic");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }
}
