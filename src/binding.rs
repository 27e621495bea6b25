//! Container binding configuration
//!
//! A binding is what the platform needs to manage one container: a static
//! configuration record (listening port, idle-sleep threshold) plus three
//! lifecycle callbacks. The platform consults the record when it creates,
//! suspends, or destroys the container and fires the callbacks on the
//! transitions it observes:
//!
//! ```text
//! Stopped -> Starting -> Running -> (idle timeout | explicit stop | crash) -> Stopped
//! ```
//!
//! `on_start` fires on entry to Running, `on_stop` on a graceful entry to
//! Stopped, and `on_error` on a crash or a failed start. Nothing here drives
//! those transitions.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Error parsing an idle-sleep duration string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SleepAfterError {
    #[error("sleep-after value is empty")]
    Empty,
    #[error("invalid sleep-after amount in '{0}'")]
    InvalidAmount(String),
    #[error("unknown sleep-after unit '{unit}' in '{value}'")]
    UnknownUnit { value: String, unit: String },
}

/// Parse a duration string such as `"2m"`, `"30s"`, `"1h"`, `"90"` or
/// `"2 minutes"`. A bare number is read as seconds.
pub fn parse_sleep_after(value: &str) -> Result<Duration, SleepAfterError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SleepAfterError::Empty);
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (amount, unit) = trimmed.split_at(split);

    let amount: u64 = amount
        .parse()
        .map_err(|_| SleepAfterError::InvalidAmount(value.to_string()))?;

    let unit = unit.trim().to_ascii_lowercase();
    let multiplier = match unit.as_str() {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 60 * 60,
        _ => {
            return Err(SleepAfterError::UnknownUnit {
                value: value.to_string(),
                unit,
            })
        }
    };

    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| SleepAfterError::InvalidAmount(value.to_string()))
}

/// Idle-sleep threshold, kept in both its written and parsed form
///
/// The written form is what gets handed to the platform; the parsed form is
/// for anything that needs to reason about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SleepAfter {
    raw: String,
    duration: Duration,
}

impl SleepAfter {
    pub fn minutes(minutes: u64) -> Self {
        Self {
            raw: format!("{}m", minutes),
            duration: Duration::from_secs(minutes * 60),
        }
    }

    pub fn as_duration(&self) -> Duration {
        self.duration
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for SleepAfter {
    type Err = SleepAfterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let duration = parse_sleep_after(s)?;
        Ok(Self {
            raw: s.trim().to_string(),
            duration,
        })
    }
}

impl fmt::Display for SleepAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Static configuration record consumed by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    default_port: u16,
    sleep_after: SleepAfter,
}

impl ContainerSettings {
    /// Port the worker container's process listens on
    pub const DEFAULT_PORT: u16 = 8080;
    /// Minutes of inactivity before the platform may put the worker container to sleep
    pub const SLEEP_AFTER_MINUTES: u64 = 2;

    pub fn new(default_port: u16, sleep_after: SleepAfter) -> Self {
        Self {
            default_port,
            sleep_after,
        }
    }

    /// Settings of the worker container: port 8080, asleep after 2 minutes idle
    pub fn worker() -> Self {
        Self::new(
            Self::DEFAULT_PORT,
            SleepAfter::minutes(Self::SLEEP_AFTER_MINUTES),
        )
    }

    /// Port the containerized process binds.
    ///
    /// Not checked against the workload; a mismatch shows up as a platform
    /// connection failure.
    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    pub fn sleep_after(&self) -> &SleepAfter {
        &self.sleep_after
    }
}

/// Transition observed by the platform and delivered to the hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The container process is confirmed running
    Started,
    /// The container process terminated gracefully
    Stopped,
    /// The container process failed; carries an opaque diagnostic
    Crashed(String),
}

type Hook = Arc<dyn Fn() + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&dyn fmt::Display) + Send + Sync>;

/// The three lifecycle callbacks of a binding
///
/// Each callback is registered independently. The default set only logs.
#[derive(Clone)]
pub struct LifecycleHooks {
    start: Hook,
    stop: Hook,
    error: ErrorHook,
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self {
            start: Arc::new(log_started),
            stop: Arc::new(log_stopped),
            error: Arc::new(log_error),
        }
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks").finish_non_exhaustive()
    }
}

impl LifecycleHooks {
    /// Hooks that do nothing
    pub fn silent() -> Self {
        Self {
            start: Arc::new(|| {}),
            stop: Arc::new(|| {}),
            error: Arc::new(|_| {}),
        }
    }

    pub fn with_start_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.start = Arc::new(hook);
        self
    }

    pub fn with_stop_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.stop = Arc::new(hook);
        self
    }

    pub fn with_error_hook(
        mut self,
        hook: impl Fn(&dyn fmt::Display) + Send + Sync + 'static,
    ) -> Self {
        self.error = Arc::new(hook);
        self
    }

    pub fn on_start(&self) {
        (self.start)()
    }

    pub fn on_stop(&self) {
        (self.stop)()
    }

    pub fn on_error(&self, error: &dyn fmt::Display) {
        (self.error)(error)
    }

    pub fn dispatch(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Started => self.on_start(),
            LifecycleEvent::Stopped => self.on_stop(),
            LifecycleEvent::Crashed(reason) => self.on_error(reason),
        }
    }
}

fn log_started() {
    info!("Container successfully started");
}

fn log_stopped() {
    info!("Container successfully shut down");
}

fn log_error(error: &dyn fmt::Display) {
    info!("Container error: {}", error);
}

/// A named container binding as registered with the platform
#[derive(Debug, Clone)]
pub struct ContainerBinding {
    name: String,
    settings: ContainerSettings,
    hooks: LifecycleHooks,
}

impl ContainerBinding {
    pub fn new(name: impl Into<String>, settings: ContainerSettings, hooks: LifecycleHooks) -> Self {
        Self {
            name: name.into(),
            settings,
            hooks,
        }
    }

    /// The worker container: fixed worker settings and logging hooks
    pub fn worker(name: impl Into<String>) -> Self {
        Self::new(name, ContainerSettings::worker(), LifecycleHooks::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }
}
