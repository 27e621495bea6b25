use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The managed container behind the binding
    pub container: ContainerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8787)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections kept open to the container (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Image pull policy for the managed container
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before creating the container
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

/// How the platform runs the container behind the binding
///
/// The listening port and the idle-sleep threshold are not here: they belong
/// to the binding itself and are fixed.
#[derive(Debug, Deserialize, Clone)]
pub struct ContainerConfig {
    /// Binding name the router resolves on every request (default: CONTAINER)
    #[serde(default = "default_binding")]
    pub binding: String,

    /// Image to run
    pub image: String,

    /// Container name (default: containergate-{binding})
    pub container_name: Option<String>,

    /// Docker host URL (default: DOCKER_HOST or the usual socket paths)
    pub docker_host: Option<String>,

    /// Docker network to attach to (default: bridge)
    pub network: Option<String>,

    /// "always", "never" or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Memory limit (e.g., "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5", "2")
    pub cpus: Option<String>,

    /// Host port the container port is published on (default: picked by Docker)
    pub host_port: Option<u16>,

    /// Path probed while waiting for the container to answer
    #[serde(default = "default_ready_path")]
    pub ready_path: String,

    /// Seconds to wait for a cold container to answer
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Milliseconds between readiness probes
    #[serde(default = "default_ready_check_interval")]
    pub ready_check_interval_ms: u64,

    /// Seconds between SIGTERM and SIGKILL when stopping the container
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Stop and remove the container when the gateway shuts down
    #[serde(default = "default_stop_on_shutdown")]
    pub stop_on_shutdown: bool,

    /// Environment variables for the container process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ContainerConfig {
    pub fn new(image: &str) -> Self {
        Self {
            binding: default_binding(),
            image: image.to_string(),
            container_name: None,
            docker_host: None,
            network: None,
            pull_policy: PullPolicy::default(),
            memory: None,
            cpus: None,
            host_port: None,
            ready_path: default_ready_path(),
            startup_timeout_secs: default_startup_timeout(),
            ready_check_interval_ms: default_ready_check_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            stop_on_shutdown: default_stop_on_shutdown(),
            env: HashMap::new(),
        }
    }

    pub fn with_binding(mut self, binding: &str) -> Self {
        self.binding = binding.to_string();
        self
    }

    /// Container name, derived from the binding unless set
    pub fn container_name(&self) -> String {
        self.container_name.clone().unwrap_or_else(|| {
            let slug: String = self
                .binding
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
                .collect();
            format!("containergate-{}", slug)
        })
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn ready_check_interval(&self) -> Duration {
        Duration::from_millis(self.ready_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.binding.trim().is_empty() {
            errors.push("container 'binding' must not be empty".to_string());
        }
        if self.image.trim().is_empty() {
            errors.push(format!("container '{}': 'image' must not be empty", self.binding));
        }
        if !self.ready_path.starts_with('/') {
            errors.push(format!(
                "container '{}': 'ready_path' must start with '/'",
                self.binding
            ));
        }
        if self.host_port == Some(0) {
            errors.push(format!(
                "container '{}': 'host_port' must be greater than 0",
                self.binding
            ));
        }
        if self.ready_check_interval_ms == 0 {
            errors.push(format!(
                "container '{}': 'ready_check_interval_ms' must be greater than 0",
                self.binding
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8787
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_binding() -> String {
    "CONTAINER".to_string()
}

fn default_ready_path() -> String {
    "/".to_string()
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_ready_check_interval() -> u64 {
    100
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_stop_on_shutdown() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.container.validate() {
            errors.extend(e);
        }

        if self.server.bind.trim().is_empty() {
            errors.push("server 'bind' must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
