//! Docker-backed container platform
//!
//! Binds the router's platform seam to a Docker-compatible daemon:
//! - `get_instance` resolves the container registered for a binding
//! - `forward` creates and starts the container on first use, waits for its
//!   published port to answer, then sends the request through the pool
//! - the daemon's event stream drives the binding's lifecycle hooks
//!
//! The idle-sleep threshold is recorded on the container as a label for
//! whatever scheduler manages the daemon; it is not enforced here.

use crate::binding::{ContainerBinding, LifecycleEvent};
use crate::config::{ContainerConfig, PullPolicy};
use crate::platform::{ContainerHandle, ContainerPlatform, GatewayBody, PlatformError};
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use bollard::container::{
    Config as CreateConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, EventMessage, HostConfig, PortBinding};
use bollard::system::EventsOptions;
use bollard::Docker;
use dashmap::DashMap;
use futures::StreamExt;
use hyper::body::Bytes;
use hyper::{Request, Response};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label carrying the binding name; also used to filter daemon events
pub const LABEL_BINDING: &str = "containergate.binding";
/// Label carrying the idle-sleep threshold as written in the binding
pub const LABEL_SLEEP_AFTER: &str = "containergate.sleep-after";
/// Label carrying the instance id handed to the container
pub const LABEL_INSTANCE_ID: &str = "containergate.instance-id";

/// Environment variable holding the instance id inside the container
pub const INSTANCE_ID_ENV: &str = "CONTAINER_INSTANCE_ID";

const RESUBSCRIBE_DELAY_MIN: Duration = Duration::from_secs(1);
const RESUBSCRIBE_DELAY_MAX: Duration = Duration::from_secs(30);

/// Container platform backed by the Docker API
pub struct DockerPlatform {
    client: Docker,
    pool: Arc<ConnectionPool>,
    /// One instance per binding name
    instances: DashMap<String, Arc<DockerContainer>>,
}

impl DockerPlatform {
    /// Connect to the daemon and verify it answers
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths
    pub async fn connect(docker_host: Option<&str>, pool: Arc<ConnectionPool>) -> anyhow::Result<Arc<Self>> {
        let client = match docker_host {
            Some(host) => connect_to_host(host)?,
            None => match std::env::var("DOCKER_HOST") {
                Ok(host) => connect_to_host(&host)?,
                Err(_) => connect_with_defaults().await?,
            },
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure Docker, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self::with_client(client, pool))
    }

    /// Wrap an existing client without contacting the daemon
    pub fn with_client(client: Docker, pool: Arc<ConnectionPool>) -> Arc<Self> {
        Arc::new(Self {
            client,
            pool,
            instances: DashMap::new(),
        })
    }

    /// Register a binding and the settings of the container behind it.
    ///
    /// Registering the same name again replaces the earlier registration.
    pub fn register(&self, binding: ContainerBinding, config: ContainerConfig) {
        let name = binding.name().to_string();
        info!(
            binding = %name,
            image = %config.image,
            default_port = binding.settings().default_port(),
            sleep_after = %binding.settings().sleep_after(),
            "Container binding registered"
        );

        let instance = DockerContainer {
            container_name: config.container_name(),
            binding,
            config,
            client: self.client.clone(),
            pool: Arc::clone(&self.pool),
            ready_port: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        };
        self.instances.insert(name, Arc::new(instance));
    }

    /// Follow the daemon's container events and fire the binding hooks.
    ///
    /// The subscription is renewed with a growing delay whenever the event
    /// stream fails or ends, until shutdown.
    pub fn watch_lifecycle(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let platform = Arc::clone(self);

        tokio::spawn(async move {
            let mut stopping = HashSet::new();
            let mut delay = RESUBSCRIBE_DELAY_MIN;

            loop {
                let mut events = platform.client.events(Some(lifecycle_events_options()));

                loop {
                    // Events already delivered are handled before shutdown
                    tokio::select! {
                        biased;
                        event = events.next() => {
                            match event {
                                Some(Ok(message)) => {
                                    delay = RESUBSCRIBE_DELAY_MIN;
                                    platform.handle_event(&message, &mut stopping);
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, retry_in = ?delay, "Error reading container events");
                                    break;
                                }
                                None => {
                                    debug!(retry_in = ?delay, "Container event stream ended");
                                    break;
                                }
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                debug!("Lifecycle watcher stopped");
                                return;
                            }
                        }
                    }
                }

                // Events may have been missed; the next request inspects the container again
                for instance in platform.instances.iter() {
                    instance.value().invalidate();
                }

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Lifecycle watcher stopped");
                            return;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(RESUBSCRIBE_DELAY_MAX);
            }
        })
    }

    /// Map one daemon event to a lifecycle transition of a registered binding.
    ///
    /// `stopping` holds ids of containers that received a kill, so the `die`
    /// that follows counts as a graceful stop.
    fn handle_event(&self, message: &EventMessage, stopping: &mut HashSet<String>) {
        let Some(actor) = message.actor.as_ref() else {
            return;
        };
        let Some(attributes) = actor.attributes.as_ref() else {
            return;
        };
        let Some(binding) = attributes.get(LABEL_BINDING) else {
            return;
        };
        let Some(instance) = self.instances.get(binding).map(|i| Arc::clone(i.value())) else {
            return;
        };

        let container_id = actor.id.clone().unwrap_or_default();
        let action = message.action.as_deref().unwrap_or_default();

        match action {
            "kill" => {
                stopping.insert(container_id);
                return;
            }
            // A kill that did not end the process (e.g. SIGHUP) is over once it runs again
            "start" => {
                stopping.remove(&container_id);
            }
            _ => {}
        }

        let was_stopping = action == "die" && stopping.remove(&container_id);
        let exit_code = attributes.get("exitCode").map(String::as_str);

        if let Some(event) = classify_event(action, exit_code, was_stopping) {
            debug!(binding = %binding, container_id = %container_id, action, ?event, "Container lifecycle event");
            if event != LifecycleEvent::Started {
                instance.invalidate();
            }
            instance.binding.hooks().dispatch(&event);
        }
    }

    /// Stop every container whose config asks for it
    pub async fn stop_all(&self) {
        let instances: Vec<Arc<DockerContainer>> =
            self.instances.iter().map(|e| Arc::clone(e.value())).collect();

        for instance in instances {
            if instance.config.stop_on_shutdown {
                instance.stop().await;
            }
        }
    }
}

impl ContainerPlatform for DockerPlatform {
    fn get_instance(&self, binding: &str) -> Result<Arc<dyn ContainerHandle>, PlatformError> {
        let instance: Arc<dyn ContainerHandle> = self
            .instances
            .get(binding)
            .map(|i| Arc::clone(i.value()))
            .ok_or_else(|| PlatformError::UnknownBinding(binding.to_string()))?;
        Ok(instance)
    }
}

/// The container behind one binding
pub struct DockerContainer {
    binding: ContainerBinding,
    config: ContainerConfig,
    container_name: String,
    client: Docker,
    pool: Arc<ConnectionPool>,
    /// Host port of a container known to be answering
    ready_port: Mutex<Option<u16>>,
    /// Serializes cold starts so concurrent first requests share one
    start_lock: tokio::sync::Mutex<()>,
}

#[async_trait]
impl ContainerHandle for DockerContainer {
    async fn forward(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, PlatformError> {
        let port = self.ensure_running().await?;
        match self.pool.send_request(req, port).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // The container is gone; the next request starts it again
                if e.is_connect() {
                    warn!(binding = self.binding.name(), port, "Container port refused connection");
                    self.invalidate();
                }
                Err(e.into())
            }
        }
    }
}

impl DockerContainer {
    /// Forget the cached port; the next request inspects the container again
    fn invalidate(&self) {
        *self.ready_port.lock() = None;
    }

    async fn ensure_running(&self) -> Result<u16, PlatformError> {
        let cached = *self.ready_port.lock();
        if let Some(port) = cached {
            return Ok(port);
        }

        let _guard = self.start_lock.lock().await;

        // Another request may have finished the start while we waited
        let cached = *self.ready_port.lock();
        if let Some(port) = cached {
            return Ok(port);
        }

        match self.start().await {
            Ok(port) => {
                *self.ready_port.lock() = Some(port);
                Ok(port)
            }
            Err(e) => {
                warn!(binding = self.binding.name(), error = %e, "Container failed to start");
                self.binding.hooks().on_error(&e);
                Err(e)
            }
        }
    }

    async fn start(&self) -> Result<u16, PlatformError> {
        let container_port = self.binding.settings().default_port();
        let started_at = unix_now();

        let existing = match self
            .client
            .inspect_container(&self.container_name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Some(info),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => None,
            Err(e) => return Err(e.into()),
        };

        let running = existing
            .as_ref()
            .and_then(|info| info.state.as_ref())
            .and_then(|state| state.running)
            .unwrap_or(false);

        if existing.is_none() {
            self.create().await?;
        }

        if !running {
            info!(binding = self.binding.name(), container = %self.container_name, "Starting container");
            self.client
                .start_container(&self.container_name, None::<StartContainerOptions<String>>)
                .await?;
        }

        let info = self
            .client
            .inspect_container(&self.container_name, None::<InspectContainerOptions>)
            .await?;

        let port = match published_port(&info, container_port) {
            Some(port) => port,
            None if self.config.network.as_deref() == Some("host") => container_port,
            None => return Err(PlatformError::PortNotPublished(container_port)),
        };

        self.wait_until_ready(port).await?;
        info!(binding = self.binding.name(), port, "Container is answering");

        relay_logs(
            self.client.clone(),
            self.container_name.clone(),
            self.binding.name().to_string(),
            started_at,
        );

        Ok(port)
    }

    async fn create(&self) -> Result<(), PlatformError> {
        let settings = self.binding.settings();
        let container_port = settings.default_port();

        pull_image_if_needed(&self.client, &self.config.image, &self.config.pull_policy).await?;

        let instance_id = Uuid::new_v4().to_string();

        let mut env: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("PORT={}", container_port));
        env.push(format!("{}={}", INSTANCE_ID_ENV, instance_id));

        let mut labels = HashMap::new();
        labels.insert(LABEL_BINDING.to_string(), self.binding.name().to_string());
        labels.insert(LABEL_SLEEP_AFTER.to_string(), settings.sleep_after().to_string());
        labels.insert(LABEL_INSTANCE_ID.to_string(), instance_id.clone());

        let port_key = format!("{}/tcp", container_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: self.config.host_port.map(|p| p.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: self.config.network.clone(),
            ..Default::default()
        };

        if let Some(ref memory) = self.config.memory {
            host_config.memory = Some(parse_memory_limit(memory)?);
        }
        if let Some(ref cpus) = self.config.cpus {
            let cpu_count: f64 = cpus
                .parse()
                .map_err(|_| PlatformError::Config(format!("invalid CPU limit: {}", cpus)))?;
            host_config.nano_cpus = Some((cpu_count * 1_000_000_000.0) as i64);
        }

        let container_config = CreateConfig {
            image: Some(self.config.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: self.container_name.clone(),
            platform: None,
        };

        match self.client.create_container(Some(options), container_config).await {
            Ok(response) => {
                info!(
                    binding = self.binding.name(),
                    container_id = %response.id,
                    container = %self.container_name,
                    instance_id,
                    "Created container"
                );
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => {
                // Created by someone else between inspect and create
                debug!(container = %self.container_name, "Container already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_until_ready(&self, port: u16) -> Result<(), PlatformError> {
        let timeout = self.config.startup_timeout();
        let interval = self.config.ready_check_interval();
        let path = self.config.ready_path.as_str();

        tokio::time::timeout(timeout, async {
            while !self.pool.probe(port, path).await {
                tokio::time::sleep(interval).await;
            }
        })
        .await
        .map_err(|_| PlatformError::StartupTimeout(timeout))
    }

    /// Stop and remove the container
    async fn stop(&self) {
        self.invalidate();
        let name = self.container_name.as_str();
        let grace_period = self.config.shutdown_grace_period();

        info!(binding = self.binding.name(), container = name, "Stopping container");

        let options = StopContainerOptions {
            t: grace_period.as_secs() as i64,
        };
        match self.client.stop_container(name, Some(options)).await {
            Ok(_) => info!(container = name, "Stopped container"),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(container = name, "Container was already stopped");
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(container = name, "Container not found");
                return;
            }
            Err(e) => {
                warn!(container = name, error = %e, "Error stopping container, forcing kill");
                if let Err(e) = self.client.kill_container::<String>(name, None).await {
                    debug!(container = name, error = %e, "Kill failed");
                }
            }
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(name, Some(options)).await {
            Ok(_) => debug!(container = name, "Removed container"),
            Err(e) => warn!(container = name, error = %e, "Failed to remove container"),
        }
    }
}

/// Turn a daemon event into a lifecycle transition.
///
/// `start` means the process runs. `die` is a graceful stop when the exit
/// code is 0 or a kill was requested first, and a crash otherwise.
pub fn classify_event(action: &str, exit_code: Option<&str>, stopping: bool) -> Option<LifecycleEvent> {
    match action {
        "start" => Some(LifecycleEvent::Started),
        "die" => match exit_code {
            Some("0") => Some(LifecycleEvent::Stopped),
            _ if stopping => Some(LifecycleEvent::Stopped),
            Some(code) => Some(LifecycleEvent::Crashed(format!(
                "container exited with code {}",
                code
            ))),
            None => Some(LifecycleEvent::Crashed(
                "container exited unexpectedly".to_string(),
            )),
        },
        _ => None,
    }
}

/// Container events for every binding this gateway labels
fn lifecycle_events_options() -> EventsOptions<String> {
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    filters.insert("label".to_string(), vec![LABEL_BINDING.to_string()]);
    EventsOptions {
        filters,
        ..Default::default()
    }
}

/// Host port a container port is published on
fn published_port(info: &ContainerInspectResponse, container_port: u16) -> Option<u16> {
    info.network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&format!("{}/tcp", container_port))?
        .as_ref()?
        .iter()
        .find_map(|b| b.host_port.as_deref().and_then(|p| p.parse().ok()))
}

async fn pull_image_if_needed(client: &Docker, image: &str, policy: &PullPolicy) -> Result<(), PlatformError> {
    let should_pull = match policy {
        PullPolicy::Always => true,
        PullPolicy::Never => {
            if client.inspect_image(image).await.is_err() {
                return Err(PlatformError::Image(format!(
                    "'{}' not found locally and pull_policy is 'never'",
                    image
                )));
            }
            false
        }
        PullPolicy::IfNotPresent => client.inspect_image(image).await.is_err(),
    };

    if !should_pull {
        debug!(image, "Image present locally, skipping pull");
        return Ok(());
    }

    info!(image, "Pulling image");
    let options = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };

    let mut stream = client.create_image(Some(options), None, None);
    while let Some(result) = stream.next().await {
        let progress = result.map_err(|e| PlatformError::Image(format!("failed to pull '{}': {}", image, e)))?;
        if let Some(error) = progress.error {
            return Err(PlatformError::Image(format!("failed to pull '{}': {}", image, error)));
        }
        if let Some(status) = progress.status {
            debug!(image, status, "Pull progress");
        }
    }

    info!(image, "Image pulled");
    Ok(())
}

/// Relay container stdout/stderr to tracing until the container stops
fn relay_logs(client: Docker, container: String, binding: String, since: i64) {
    tokio::spawn(async move {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since,
            ..Default::default()
        };

        let mut logs = client.logs(&container, Some(options));

        while let Some(result) = logs.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    if let Some(line) = log_line(&message) {
                        info!(target: "container", binding, stream = "stdout", "{}", line);
                    }
                }
                Ok(LogOutput::StdErr { message }) => {
                    if let Some(line) = log_line(&message) {
                        warn!(target: "container", binding, stream = "stderr", "{}", line);
                    }
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    debug!(binding, container, error = %e, "Container log stream failed");
                    break;
                }
            }
        }

        debug!(binding, container, "Container log stream ended");
    });
}

fn log_line(message: &Bytes) -> Option<String> {
    let line = String::from_utf8_lossy(message);
    let line = line.trim_end();
    (!line.is_empty()).then(|| line.to_string())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

async fn connect_with_defaults() -> anyhow::Result<Docker> {
    let home = std::env::var("HOME").unwrap_or_default();

    let mut candidates = vec!["/var/run/docker.sock".to_string()];
    if !home.is_empty() {
        candidates.push(format!("{}/.docker/run/docker.sock", home));
        candidates.push(format!("{}/.colima/default/docker.sock", home));
    }

    for path in &candidates {
        if !std::path::Path::new(path).exists() {
            continue;
        }
        debug!(path, "Found Docker socket");
        if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
            if client.ping().await.is_ok() {
                return Ok(client);
            }
        }
    }

    Docker::connect_with_socket_defaults().map_err(|e| {
        anyhow::anyhow!(
            "Cannot connect to Docker daemon (tried {}). Start the daemon, set DOCKER_HOST, \
             or set docker_host in the [container] section: {}",
            candidates.join(", "),
            e
        )
    })
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64, PlatformError> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if let Some(num) = limit.strip_suffix("gb").or_else(|| limit.strip_suffix('g')) {
        (num, 1024 * 1024 * 1024i64)
    } else if let Some(num) = limit.strip_suffix("mb").or_else(|| limit.strip_suffix('m')) {
        (num, 1024 * 1024i64)
    } else if let Some(num) = limit.strip_suffix("kb").or_else(|| limit.strip_suffix('k')) {
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| PlatformError::Config(format!("invalid memory limit: {}", limit)))?;

    Ok((num * multiplier as f64) as i64)
}
