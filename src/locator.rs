//! Label-keyed resource discovery
//!
//! The controller names its pods itself, so the harness finds them through
//! the service label it attaches: `samba-operator.samba.org/service=<name>`.
//!
//! # Example
//!
//! ```ignore
//! use sharecheck::locator::{LabelSelector, Locator};
//!
//! let locator = Locator::new(&tc, "default");
//! let selector = LabelSelector::for_service("tshare1");
//! locator.wait_for_pod_exists(&selector, Duration::from_secs(10)).await?;
//! let pod = locator.wait_for_pod_ready(&selector, Duration::from_secs(60)).await?;
//! let ip = locator.pod_address(&selector).await?;
//! ```

use crate::cluster::{ClusterApi, ClusterError};
use crate::eventually::{eventually, ConditionError, Probe, DEFAULT_INTERVAL};
use crate::events::InvolvedObject;
use crate::readiness::{ReadyState, Readiness};
use crate::wait::{ResourceState, WaitError, WaitEvent};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label the controller puts on every object it manages for a share
pub const SERVICE_LABEL_KEY: &str = "samba-operator.samba.org/service";

/// Number of recent events attached to a readiness timeout
const RECENT_EVENTS: usize = 5;

/// Equality-based label selector (`key=value,key2=value2`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    terms: BTreeMap<String, String>,
}

impl LabelSelector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector for the objects managed for one share resource
    #[must_use]
    pub fn for_service(resource_name: &str) -> Self {
        Self::new().equals(SERVICE_LABEL_KEY, resource_name)
    }

    /// Add a `key=value` term
    #[must_use]
    pub fn equals(mut self, key: &str, value: &str) -> Self {
        self.terms.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse `key=value[,key=value...]`
    ///
    /// # Errors
    ///
    /// Returns `LocateError::InvalidSelector` for terms without `=` or with
    /// an empty key. Set-based expressions are not supported.
    pub fn parse(expr: &str) -> Result<Self, LocateError> {
        let mut selector = Self::new();
        for term in expr.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = term
                .split_once('=')
                .ok_or_else(|| LocateError::InvalidSelector(format!("'{term}' in '{expr}'")))?;
            let key = key.trim();
            if key.is_empty() || key.ends_with('!') {
                return Err(LocateError::InvalidSelector(format!("'{term}' in '{expr}'")));
            }
            selector = selector.equals(key, value.trim_start_matches('=').trim());
        }
        Ok(selector)
    }

    /// Whether a label set satisfies every term
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.terms
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self.terms.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", terms.join(","))
    }
}

/// Errors from resolving a selector to a single object
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("no {kind} matches {selector} in namespace {namespace}")]
    NotFound {
        kind: String,
        selector: String,
        namespace: String,
    },

    #[error(
        "{} {kind}s match {selector} in namespace {namespace}, expected exactly one: {}",
        .names.len(),
        .names.join(", ")
    )]
    Ambiguous {
        kind: String,
        selector: String,
        namespace: String,
        names: Vec<String>,
    },

    #[error("pod {0} has no IP address assigned")]
    NoAddress(String),

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("{0}")]
    Cluster(#[from] ClusterError),

    #[error("{0}")]
    Wait(#[from] ConditionError),
}

impl LocateError {
    /// The timeout detail, if a wait ran out of time
    pub fn as_timeout(&self) -> Option<&WaitError> {
        match self {
            Self::Wait(err) => err.as_timeout(),
            _ => None,
        }
    }
}

/// Cluster-internal DNS name of a share's service
#[must_use]
pub fn service_dns_name(resource_name: &str, namespace: &str) -> String {
    format!("{resource_name}.{namespace}.svc.cluster.local")
}

/// Resolves label selectors to live objects within one namespace
///
/// Nothing is cached: every call re-lists, because the controller may
/// replace a pod between two calls.
pub struct Locator<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: String,
    interval: Duration,
}

impl<'a> Locator<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Set the polling interval used by the wait methods
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// All pods currently matching the selector
    pub async fn pods(&self, selector: &LabelSelector) -> Result<Vec<Pod>, ClusterError> {
        self.cluster.list_pods(&self.namespace, selector).await
    }

    /// The single pod matching the selector
    pub async fn pod(&self, selector: &LabelSelector) -> Result<Pod, LocateError> {
        let pods = self.pods(selector).await?;
        exactly_one("pod", selector, &self.namespace, pods)
    }

    /// The single service matching the selector
    pub async fn service(&self, selector: &LabelSelector) -> Result<Service, LocateError> {
        let services = self.cluster.list_services(&self.namespace, selector).await?;
        exactly_one("service", selector, &self.namespace, services)
    }

    /// IP address of the single pod matching the selector
    pub async fn pod_address(&self, selector: &LabelSelector) -> Result<String, LocateError> {
        let pod = self.pod(selector).await?;
        pod.status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| LocateError::NoAddress(pod.name_any()))
    }

    /// Wait until at least one pod matches the selector
    pub async fn wait_for_pod_exists(
        &self,
        selector: &LabelSelector,
        timeout: Duration,
    ) -> Result<Vec<Pod>, ConditionError> {
        debug!(
            namespace = %self.namespace,
            selector = %selector,
            timeout = ?timeout,
            "Waiting for pod to exist"
        );

        let pods = eventually(format!("pod/{selector}"), || async move {
            match self.pods(selector).await {
                Ok(pods) if !pods.is_empty() => Probe::Ready(pods),
                Ok(_) => Probe::Pending("no pods match".to_string()),
                Err(e) => Probe::Pending(format!("query failed: {e}")),
            }
        })
        .timeout(timeout)
        .interval(self.interval)
        .await_condition()
        .await?;

        info!(
            namespace = %self.namespace,
            selector = %selector,
            count = pods.len(),
            "Pod exists"
        );
        Ok(pods)
    }

    /// Wait until exactly one pod matches the selector and it is ready
    ///
    /// Several matching pods count as "not yet" while the controller may be
    /// replacing its pod. If several still match at the deadline the wait
    /// ends with `LocateError::Ambiguous` instead of a timeout. A pod that
    /// exited ends the wait with `ConditionError::Failed`.
    pub async fn wait_for_pod_ready(
        &self,
        selector: &LabelSelector,
        timeout: Duration,
    ) -> Result<Pod, LocateError> {
        debug!(
            namespace = %self.namespace,
            selector = %selector,
            timeout = ?timeout,
            "Waiting for pod to be ready"
        );

        // Names matched by the most recent successful query
        let last_seen: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let result = eventually(format!("pod/{selector}"), || {
            let last_seen = &last_seen;
            async move {
                let pods = match self.pods(selector).await {
                    Ok(pods) => pods,
                    Err(e) => return Probe::Pending(format!("query failed: {e}")),
                };
                if let Ok(mut guard) = last_seen.lock() {
                    *guard = object_names(&pods);
                }

                match pods.as_slice() {
                    [] => Probe::Pending("no pods match".to_string()),
                    [pod] => match pod.ready_state() {
                        ReadyState::Ready => Probe::Ready(pod.clone()),
                        ReadyState::NotReady => Probe::Pending(pod.state_description()),
                        ReadyState::Terminal => Probe::Failed(pod.state_description()),
                    },
                    many => Probe::Pending(format!(
                        "{} pods match, expected exactly one: {}",
                        many.len(),
                        object_names(many).join(", ")
                    )),
                }
            }
        })
        .timeout(timeout)
        .interval(self.interval)
        .await_condition()
        .await;

        match result {
            Ok(pod) => {
                info!(
                    namespace = %self.namespace,
                    pod = %pod.name_any(),
                    "Pod is ready"
                );
                Ok(pod)
            }
            Err(ConditionError::Timeout(err)) => {
                let mut names = last_seen.into_inner().unwrap_or_default();
                match names.len() {
                    0 => Err(ConditionError::Timeout(err).into()),
                    1 => {
                        let err = self.with_recent_events(err, names.pop()).await;
                        Err(ConditionError::Timeout(err).into())
                    }
                    _ => {
                        warn!(
                            namespace = %self.namespace,
                            selector = %selector,
                            pods = ?names,
                            "Several pods still match at the readiness deadline"
                        );
                        Err(LocateError::Ambiguous {
                            kind: "pod".to_string(),
                            selector: selector.to_string(),
                            namespace: self.namespace.clone(),
                            names,
                        })
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until exactly one service matches the selector
    pub async fn wait_for_service(
        &self,
        selector: &LabelSelector,
        timeout: Duration,
    ) -> Result<Service, ConditionError> {
        eventually(format!("service/{selector}"), || async move {
            match self.service(selector).await {
                Ok(svc) if svc.is_ready() => Probe::Ready(svc),
                Ok(svc) => Probe::Pending(svc.state_description()),
                Err(e) => Probe::Pending(e.to_string()),
            }
        })
        .timeout(timeout)
        .interval(self.interval)
        .await_condition()
        .await
    }

    async fn with_recent_events(&self, err: WaitError, pod_name: Option<String>) -> WaitError {
        let Some(pod_name) = pod_name else {
            return err;
        };

        let involved = InvolvedObject::new("Pod", &pod_name);
        match self.cluster.list_events(&self.namespace, &involved).await {
            Ok(mut events) => {
                events.sort_by_key(|e| e.last_timestamp.as_ref().map(|t| t.0));
                let skip = events.len().saturating_sub(RECENT_EVENTS);
                let recent = events.iter().skip(skip).map(WaitEvent::from).collect();
                err.with_events(recent)
            }
            Err(e) => {
                debug!(pod = %pod_name, error = %e, "Could not fetch events for wait error");
                err
            }
        }
    }
}

fn object_names<K: ResourceExt>(objects: &[K]) -> Vec<String> {
    objects.iter().map(ResourceExt::name_any).collect()
}

fn exactly_one<K: ResourceExt>(
    kind: &str,
    selector: &LabelSelector,
    namespace: &str,
    mut objects: Vec<K>,
) -> Result<K, LocateError> {
    match objects.len() {
        0 => Err(LocateError::NotFound {
            kind: kind.to_string(),
            selector: selector.to_string(),
            namespace: namespace.to_string(),
        }),
        1 => Ok(objects.remove(0)),
        _ => Err(LocateError::Ambiguous {
            kind: kind.to_string(),
            selector: selector.to_string(),
            namespace: namespace.to_string(),
            names: object_names(&objects),
        }),
    }
}
