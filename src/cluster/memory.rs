//! In-process cluster for tests
//!
//! Holds fixture objects, pods, services and events in memory and applies
//! the same label and field matching the API server does, so the harness can
//! be exercised without a cluster. A test plays the controller by mutating
//! the state from a spawned task.

use super::{ClusterApi, ClusterError, ExecOutput, ObjectRef};
use crate::events::InvolvedObject;
use crate::locator::{LabelSelector, SERVICE_LABEL_KEY};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ContainerStatus, Event, ObjectReference, Pod, PodCondition, PodStatus, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use chrono::Utc;
use kube::api::{DynamicObject, ObjectMeta};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type ExecHandler = Arc<dyn Fn(&str, &[String]) -> Result<ExecOutput, ClusterError> + Send + Sync>;

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectRef, DynamicObject>,
    pods: BTreeMap<(String, String), Pod>,
    services: BTreeMap<(String, String), Service>,
    logs: BTreeMap<(String, String), String>,
    events: Vec<Event>,
    failing_queries: u32,
    rejected_creates: BTreeMap<String, String>,
    rejected_deletes: BTreeMap<String, String>,
    delayed_removals: BTreeSet<String>,
    exec_handler: Option<ExecHandler>,
    exec_calls: Vec<(String, Vec<String>)>,
    creates: usize,
    next_uid: u64,
}

/// Deterministic [`ClusterApi`] backed by in-memory state
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a pod (keyed by namespace and name)
    pub fn upsert_pod(&self, pod: Pod) {
        let key = key_of(&pod.metadata);
        self.state().pods.insert(key, pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.state()
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Insert or replace a service
    pub fn upsert_service(&self, service: Service) {
        let key = key_of(&service.metadata);
        self.state().services.insert(key, service);
    }

    pub fn remove_service(&self, namespace: &str, name: &str) {
        self.state()
            .services
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn record_event(&self, event: Event) {
        self.state().events.push(event);
    }

    pub fn set_pod_logs(&self, namespace: &str, pod: &str, logs: impl Into<String>) {
        self.state()
            .logs
            .insert((namespace.to_string(), pod.to_string()), logs.into());
    }

    /// Answer `exec` calls with `handler(pod, command)`
    pub fn on_exec<F>(&self, handler: F)
    where
        F: Fn(&str, &[String]) -> Result<ExecOutput, ClusterError> + Send + Sync + 'static,
    {
        self.state().exec_handler = Some(Arc::new(handler));
    }

    /// Commands executed so far, with the pod they ran in
    pub fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state().exec_calls.clone()
    }

    /// Make the next `n` list and get calls fail with a transient error
    pub fn fail_next_queries(&self, n: u32) {
        self.state().failing_queries = n;
    }

    /// Make creating the object named `name` fail
    pub fn reject_create(&self, name: &str, message: &str) {
        self.state()
            .rejected_creates
            .insert(name.to_string(), message.to_string());
    }

    /// Make deleting the object named `name` fail
    pub fn reject_delete(&self, name: &str, message: &str) {
        self.state()
            .rejected_deletes
            .insert(name.to_string(), message.to_string());
    }

    /// Keep the object named `name` after it is deleted, as a finalizer would
    pub fn delay_removal(&self, name: &str) {
        self.state().delayed_removals.insert(name.to_string());
    }

    /// Finish a delayed removal
    pub fn complete_removal(&self, obj: &ObjectRef) {
        let mut state = self.state();
        state.delayed_removals.remove(&obj.name);
        if state
            .objects
            .get(obj)
            .is_some_and(|o| o.metadata.deletion_timestamp.is_some())
        {
            state.objects.remove(obj);
        }
    }

    /// Snapshot of all stored fixture objects
    pub fn objects(&self) -> Vec<DynamicObject> {
        self.state().objects.values().cloned().collect()
    }

    /// Stored fixture objects of one kind
    pub fn objects_of_kind(&self, kind: &str) -> Vec<DynamicObject> {
        self.state()
            .objects
            .iter()
            .filter(|(r, _)| r.kind == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Number of successful `create_object` calls
    pub fn create_count(&self) -> usize {
        self.state().creates
    }

    fn take_query_failure(&self, target: &str) -> Result<(), ClusterError> {
        let mut state = self.state();
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(ClusterError::List {
                target: target.to_string(),
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(())
    }
}

fn key_of(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError> {
        self.take_query_failure(&format!("pods matching {selector}"))?;
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && selector.matches(pod.metadata.labels.as_ref()))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Service>, ClusterError> {
        self.take_query_failure(&format!("services matching {selector}"))?;
        Ok(self
            .state()
            .services
            .iter()
            .filter(|((ns, _), svc)| ns == namespace && selector.matches(svc.metadata.labels.as_ref()))
            .map(|(_, svc)| svc.clone())
            .collect())
    }

    async fn list_events(
        &self,
        namespace: &str,
        involved: &InvolvedObject,
    ) -> Result<Vec<Event>, ClusterError> {
        self.take_query_failure(&format!("events for {involved}"))?;
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| e.metadata.namespace.as_deref() == Some(namespace) && involved.matches(e))
            .cloned()
            .collect())
    }

    async fn get_object(&self, obj: &ObjectRef) -> Result<Option<DynamicObject>, ClusterError> {
        self.take_query_failure(&obj.to_string())?;
        Ok(self.state().objects.get(obj).cloned())
    }

    async fn create_object(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let target = ObjectRef::from_object(obj)?;
        let mut state = self.state();

        if let Some(message) = state.rejected_creates.get(&target.name) {
            return Err(ClusterError::Create {
                target: target.to_string(),
                message: message.clone(),
            });
        }
        if state.objects.contains_key(&target) {
            return Err(ClusterError::Create {
                target: target.to_string(),
                message: format!("{} '{}' already exists", target.kind, target.name),
            });
        }

        state.next_uid += 1;
        let mut created = obj.clone();
        created.metadata.uid = Some(format!("uid-{:04}", state.next_uid));
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        state.objects.insert(target, created.clone());
        state.creates += 1;

        Ok(created)
    }

    async fn delete_object(&self, obj: &ObjectRef) -> Result<(), ClusterError> {
        let mut state = self.state();

        if let Some(message) = state.rejected_deletes.get(&obj.name) {
            return Err(ClusterError::Delete {
                target: obj.to_string(),
                message: message.clone(),
            });
        }

        if state.delayed_removals.contains(&obj.name) {
            if let Some(existing) = state.objects.get_mut(obj) {
                existing.metadata.deletion_timestamp = Some(Time(Utc::now()));
            }
        } else {
            state.objects.remove(obj);
        }
        Ok(())
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput, ClusterError> {
        let handler = {
            let mut state = self.state();
            state.exec_calls.push((pod.to_string(), command.to_vec()));
            state.exec_handler.clone()
        };

        match handler {
            Some(handler) => handler(pod, command),
            None => Err(ClusterError::Exec {
                pod: pod.to_string(),
                message: "no exec handler installed".to_string(),
            }),
        }
    }

    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String, ClusterError> {
        let key = (namespace.to_string(), pod.to_string());
        let state = self.state();
        if !state.pods.contains_key(&key) {
            return Err(ClusterError::Logs {
                pod: pod.to_string(),
                message: format!("Pod '{pod}' not found"),
            });
        }
        Ok(state.logs.get(&key).cloned().unwrap_or_default())
    }
}

/// A ready share server pod labelled for `service`
pub fn running_pod(namespace: &str, name: &str, service: &str, ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(SERVICE_LABEL_KEY.to_string(), service.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()).filter(|ip| !ip.is_empty()),
            container_statuses: Some(vec![ContainerStatus {
                name: "samba".to_string(),
                ready: true,
                ..Default::default()
            }]),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// An event the controller records against a share
pub fn share_event(namespace: &str, share: &str, uid: Option<&str>, reason: &str) -> Event {
    Event {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some("samba-operator.samba.org/v1alpha1".to_string()),
            kind: Some(crate::events::SMBSHARE_KIND.to_string()),
            name: Some(share.to_string()),
            namespace: Some(namespace.to_string()),
            uid: uid.map(str::to_string),
            ..Default::default()
        },
        reason: Some(reason.to_string()),
        message: Some(format!("{reason} for {share}")),
        type_: Some("Normal".to_string()),
        last_timestamp: Some(Time(Utc::now())),
        ..Default::default()
    }
}
