//! The container platform seam
//!
//! The router never manages containers itself. It asks a platform for a
//! handle by binding name and hands the request to that handle. Anything
//! that can look up a container and forward a request to it can stand in
//! here: the Docker binding in [`crate::docker`], or a test double.

use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::{Request, Response};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Body type shared by forwarded requests and responses
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Errors raised by a platform while resolving or reaching a container
#[derive(Debug, Error)]
pub enum PlatformError {
    /// No container is registered under this binding name
    #[error("no container registered for binding '{0}'")]
    UnknownBinding(String),
    /// The container daemon rejected a request
    #[error("container daemon error: {0}")]
    Daemon(#[from] bollard::errors::Error),
    /// The image could not be pulled or is missing
    #[error("image error: {0}")]
    Image(String),
    /// The container's port is not published to the host
    #[error("container port {0}/tcp is not published")]
    PortNotPublished(u16),
    /// The container did not answer within its startup timeout
    #[error("container did not become ready within {0:?}")]
    StartupTimeout(Duration),
    /// Forwarding the request to the container failed
    #[error("failed to forward request to container: {0}")]
    Forward(#[from] crate::pool::PoolError),
    /// The container is misconfigured (image, limits)
    #[error("container configuration error: {0}")]
    Config(String),
}

/// Handle to one container instance
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    /// Forward a request to the container's listener and return its response.
    ///
    /// Suspends until the container answers or the platform gives up. The
    /// container is started first if it is not already running.
    async fn forward(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, PlatformError>;
}

/// A platform that owns container instances, keyed by binding name
pub trait ContainerPlatform: Send + Sync {
    /// Resolve the instance registered under `binding`.
    ///
    /// Cheap: does not start the container.
    fn get_instance(&self, binding: &str) -> Result<Arc<dyn ContainerHandle>, PlatformError>;
}
