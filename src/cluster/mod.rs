//! Cluster capability seam
//!
//! Everything the harness needs from the Kubernetes API goes through
//! [`ClusterApi`]. The live implementation is [`TestClient`]; tests use
//! [`memory::InMemoryCluster`].
//!
//! # Example
//!
//! ```ignore
//! use sharecheck::{ClusterApi, HarnessConfig, LabelSelector, TestClient};
//!
//! let config = HarnessConfig::from_env()?;
//! let tc = TestClient::shared(&config).await?;
//! let pods = tc
//!     .list_pods(&config.namespace, &LabelSelector::for_service("tshare1"))
//!     .await?;
//! ```

mod live;
pub mod memory;

pub use live::TestClient;

use crate::events::InvolvedObject;
use crate::locator::LabelSelector;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Pod, Service};
use kube::api::DynamicObject;
use std::fmt;

/// Errors from cluster API operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("Failed to create Kubernetes client: {0}")]
    Client(String),

    #[error("Failed to resolve API resource for {0}")]
    Discovery(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Failed to get {target}: {message}")]
    Get { target: String, message: String },

    #[error("Failed to create {target}: {message}")]
    Create { target: String, message: String },

    #[error("Failed to delete {target}: {message}")]
    Delete { target: String, message: String },

    #[error("Failed to list {target}: {message}")]
    List { target: String, message: String },

    #[error("Failed to exec in pod {pod}: {message}")]
    Exec { pod: String, message: String },

    #[error("Failed to get logs for pod {pod}: {message}")]
    Logs { pod: String, message: String },
}

/// Identity of a declarative object as written in a fixture file
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    /// `apiVersion` (e.g., "samba-operator.samba.org/v1alpha1", "v1")
    pub api_version: String,
    /// Kind (e.g., "SmbShare")
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectRef {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace,
            name: name.into(),
        }
    }

    /// Build a reference from a dynamic object carrying type metadata
    pub fn from_object(obj: &DynamicObject) -> Result<Self, ClusterError> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| ClusterError::InvalidObject("missing apiVersion/kind".to_string()))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidObject("missing metadata.name".to_string()))?;

        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    /// Split `apiVersion` into (group, version); the core group is ""
    pub fn group_version(&self) -> (&str, &str) {
        self.api_version
            .split_once('/')
            .unwrap_or(("", self.api_version.as_str()))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Output of a command executed inside a pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the command exited successfully
    pub success: bool,
    /// Failure message reported by the API server, if any
    pub message: Option<String>,
}

impl ExecOutput {
    /// Combined stdout and stderr, for matching tool diagnostics
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Namespaced view of the cluster used by every harness component
///
/// Implementations only read state, except for `create_object` and
/// `delete_object`, which the fixture manager uses for setup and teardown.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List pods matching a label selector
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError>;

    /// List services matching a label selector
    async fn list_services(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Service>, ClusterError>;

    /// List events whose involved object matches the filter
    async fn list_events(
        &self,
        namespace: &str,
        involved: &InvolvedObject,
    ) -> Result<Vec<Event>, ClusterError>;

    /// Get an object, `Ok(None)` when it does not exist
    async fn get_object(&self, obj: &ObjectRef) -> Result<Option<DynamicObject>, ClusterError>;

    /// Create an object and return the server's view of it
    async fn create_object(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete_object(&self, obj: &ObjectRef) -> Result<(), ClusterError>;

    /// Run a command in the first container of a pod
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput, ClusterError>;

    /// Fetch the current logs of a pod
    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String, ClusterError>;
}
