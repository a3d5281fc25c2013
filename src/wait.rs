//! Timeout reports for convergence waits
//!
//! A `WaitError` says what was awaited, what the harness last saw and which
//! events the cluster recorded for it meanwhile.
//!
//! # Example
//!
//! ```ignore
//! match locator.wait_for_pod_exists(&selector, timeout).await {
//!     Err(ConditionError::Timeout(err)) => {
//!         println!("Resource: {}", err.resource);
//!         println!("Last state: {}", err.last_state);
//!         println!("Elapsed: {:?}", err.elapsed);
//!         for event in &err.events {
//!             println!("  {} - {}", event.reason, event.message);
//!         }
//!     }
//!     _ => {}
//! }
//! ```

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ContainerStatus, Event, Pod, Service};

/// Event attached to a timeout report
#[derive(Debug, Clone)]
pub struct WaitEvent {
    /// e.g. "FailedMount", "BackOff"
    pub reason: String,
    pub message: String,
    /// `HH:MM:SS` of the last occurrence
    pub timestamp: Option<String>,
}

impl From<&Event> for WaitEvent {
    fn from(event: &Event) -> Self {
        Self {
            reason: event.reason.clone().unwrap_or_else(|| "Unknown".to_string()),
            message: event.message.clone().unwrap_or_default(),
            timestamp: event
                .last_timestamp
                .as_ref()
                .map(|t| t.0.format("%H:%M:%S").to_string()),
        }
    }
}

/// Rich error context for wait operations
#[derive(Debug, Clone)]
pub struct WaitError {
    /// Resource reference (e.g., "pod/samba-operator.samba.org/service=tshare1")
    pub resource: String,
    /// Description of the last observed state
    pub last_state: String,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// The timeout that was configured
    pub timeout: Duration,
    /// How many times the condition was checked
    pub attempts: u32,
    /// Recent events related to the resource
    pub events: Vec<WaitEvent>,
}

impl WaitError {
    /// Create a new WaitError
    pub fn new(resource: impl Into<String>, timeout: Duration, elapsed: Duration) -> Self {
        Self {
            resource: resource.into(),
            last_state: "unknown".to_string(),
            elapsed,
            timeout,
            attempts: 0,
            events: Vec::new(),
        }
    }

    /// Set the last observed state
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.last_state = state.into();
        self
    }

    /// Record how many checks were made
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Add events to the error
    pub fn with_events(mut self, events: Vec<WaitEvent>) -> Self {
        self.events = events;
        self
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} did not converge within {:?} (gave up after {:?}, {} checks)",
            self.resource, self.timeout, self.elapsed, self.attempts
        )?;
        write!(f, "    last seen: {}", self.last_state)?;

        for event in &self.events {
            write!(
                f,
                "\n    event {} {}: {}",
                event.timestamp.as_deref().unwrap_or("-"),
                event.reason,
                event.message
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for WaitError {}

/// Describes why a resource has not converged yet
pub trait ResourceState {
    /// Short, single-line summary used as `last_state`
    fn state_description(&self) -> String;
}

impl ResourceState for Pod {
    fn state_description(&self) -> String {
        let Some(status) = self.status.as_ref() else {
            return "no status reported".to_string();
        };
        let phase = status.phase.as_deref().unwrap_or("Unknown");
        let containers = status.container_statuses.as_deref().unwrap_or_default();
        if containers.is_empty() {
            return format!("phase={phase}, no container status");
        }

        let ready = containers.iter().filter(|c| c.ready).count();
        let mut summary = format!("phase={phase}, containers {ready}/{} ready", containers.len());

        let held: Vec<String> = containers
            .iter()
            .filter(|c| !c.ready)
            .filter_map(held_container)
            .collect();
        if !held.is_empty() {
            summary.push_str(&format!(" ({})", held.join(", ")));
        }
        summary
    }
}

/// `name: reason` for a container stuck waiting or terminated
fn held_container(status: &ContainerStatus) -> Option<String> {
    let state = status.state.as_ref()?;
    let reason = state
        .waiting
        .as_ref()
        .and_then(|w| w.reason.as_deref())
        .or_else(|| state.terminated.as_ref().and_then(|t| t.reason.as_deref()))?;
    Some(format!("{}: {reason}", status.name))
}

impl ResourceState for Service {
    fn state_description(&self) -> String {
        let cluster_ip = self
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.as_deref())
            .unwrap_or("none");
        let ports: Vec<String> = self
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| ports.iter().map(|p| p.port.to_string()).collect())
            .unwrap_or_default();

        format!("clusterIP={}, ports=[{}]", cluster_ip, ports.join(","))
    }
}
