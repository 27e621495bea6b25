//! Request routing
//!
//! One route: `GET /` goes to the container registered under the configured
//! binding. The request is forwarded as received and the container's response
//! is returned as is. No validation, retries or timeouts happen here.

use crate::error::{internal_error, not_found};
use crate::platform::{ContainerPlatform, GatewayBody, PlatformError};
use hyper::{Method, Request, Response};
use std::sync::Arc;
use tracing::{debug, error};

pub struct Router {
    binding: String,
    platform: Arc<dyn ContainerPlatform>,
}

impl Router {
    pub fn new(binding: impl Into<String>, platform: Arc<dyn ContainerPlatform>) -> Self {
        Self {
            binding: binding.into(),
            platform,
        }
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// Serve one request, turning a failed route into a generic 500.
    pub async fn handle(&self, req: Request<GatewayBody>) -> Response<GatewayBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.route(req).await {
            Ok(response) => response,
            Err(e) => {
                error!(binding = %self.binding, %method, path, error = %e, "Route handler failed");
                internal_error()
            }
        }
    }

    /// Dispatch a request. Errors from the matched route are returned unhandled.
    pub async fn route(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, PlatformError> {
        debug!(method = %req.method(), uri = %req.uri(), "Incoming request");

        if req.method() == Method::GET && req.uri().path() == "/" {
            self.forward_to_container(req).await
        } else {
            Ok(not_found())
        }
    }

    async fn forward_to_container(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, PlatformError> {
        let container = self.platform.get_instance(&self.binding)?;
        container.forward(req).await
    }
}
