//! Kind-specific readiness predicates

use k8s_openapi::api::core::v1::{Pod, Service};

/// Readiness verdict for one observed object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Ready,
    NotReady,
    /// The object can never become ready (e.g., a pod that exited)
    Terminal,
}

/// Objects that can report whether they are ready to serve traffic
pub trait Readiness {
    fn ready_state(&self) -> ReadyState;

    fn is_ready(&self) -> bool {
        self.ready_state() == ReadyState::Ready
    }
}

impl Readiness for Pod {
    /// Ready when Running, every container reports ready, and the `Ready`
    /// condition (when published) is `True`
    fn ready_state(&self) -> ReadyState {
        let Some(status) = self.status.as_ref() else {
            return ReadyState::NotReady;
        };

        match status.phase.as_deref() {
            Some("Running") => {}
            Some("Failed") | Some("Succeeded") => return ReadyState::Terminal,
            _ => return ReadyState::NotReady,
        }

        let containers_ready = status
            .container_statuses
            .as_ref()
            .is_some_and(|containers| !containers.is_empty() && containers.iter().all(|c| c.ready));

        let condition_ready = status
            .conditions
            .as_ref()
            .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
            .map_or(true, |c| c.status == "True");

        if containers_ready && condition_ready {
            ReadyState::Ready
        } else {
            ReadyState::NotReady
        }
    }
}

impl Readiness for Service {
    // Services have no readiness of their own; existing is enough.
    fn ready_state(&self) -> ReadyState {
        ReadyState::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodCondition, PodStatus};

    fn pod(phase: &str, ready: &[bool], condition: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(
                    ready
                        .iter()
                        .enumerate()
                        .map(|(i, r)| ContainerStatus {
                            name: format!("c{i}"),
                            ready: *r,
                            ..Default::default()
                        })
                        .collect(),
                ),
                conditions: condition.map(|status| {
                    vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_running_pod_with_ready_containers_is_ready() {
        assert!(pod("Running", &[true, true], Some("True")).is_ready());
        assert!(pod("Running", &[true], None).is_ready());
    }

    #[test]
    fn test_pod_with_unready_container_is_not_ready() {
        assert_eq!(
            pod("Running", &[true, false], None).ready_state(),
            ReadyState::NotReady
        );
    }

    #[test]
    fn test_pod_ready_condition_false_is_not_ready() {
        assert!(!pod("Running", &[true], Some("False")).is_ready());
    }

    #[test]
    fn test_pending_pod_is_not_ready() {
        assert_eq!(pod("Pending", &[], None).ready_state(), ReadyState::NotReady);
        assert_eq!(Pod::default().ready_state(), ReadyState::NotReady);
    }

    #[test]
    fn test_running_pod_without_containers_is_not_ready() {
        assert!(!pod("Running", &[], None).is_ready());
    }

    #[test]
    fn test_exited_pod_is_terminal() {
        assert_eq!(pod("Failed", &[false], None).ready_state(), ReadyState::Terminal);
        assert_eq!(
            pod("Succeeded", &[false], None).ready_state(),
            ReadyState::Terminal
        );
    }

    #[test]
    fn test_service_is_ready_once_it_exists() {
        assert!(Service::default().is_ready());
    }
}
