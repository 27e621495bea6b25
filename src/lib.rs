//! Containergate - an HTTP gateway in front of a managed container
//!
//! The gateway exposes a single route, `GET /`, and hands every request on
//! it to the container registered under a binding name:
//! - The request is forwarded as received and the response returned as is
//! - The container listens on a fixed port and is started on first use
//! - Lifecycle transitions reported by the platform go to logging hooks
//! - Docker is the platform; anything implementing the platform traits works

pub mod binding;
pub mod config;
pub mod docker;
pub mod error;
pub mod platform;
pub mod pool;
pub mod proxy;
pub mod router;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
