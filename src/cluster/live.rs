use super::{ClusterApi, ClusterError, ExecOutput, ObjectRef};
use crate::config::HarnessConfig;
use crate::events::InvolvedObject;
use crate::locator::LabelSelector;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Pod, Service};
use kube::api::{
    Api, ApiResource, AttachParams, DeleteParams, DynamicObject, GroupVersionKind, ListParams,
    LogParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{self, ApiCapabilities, Scope};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::OnceCell;
use tracing::{debug, info};

static SHARED: OnceCell<TestClient> = OnceCell::const_new();

/// Live cluster client shared by every scenario in a test process
///
/// The client is only connection configuration, so one instance is built at
/// suite start and handed to each component by reference.
#[derive(Clone)]
pub struct TestClient {
    client: Client,
}

impl TestClient {
    /// Build a client from the harness configuration
    ///
    /// Uses the explicit kubeconfig path and context when configured,
    /// otherwise the default in-cluster / `KUBECONFIG` discovery.
    pub async fn new(config: &HarnessConfig) -> Result<Self, ClusterError> {
        let client = if config.kubeconfig.is_none() && config.kube_context.is_none() {
            Client::try_default()
                .await
                .map_err(|e| ClusterError::Client(e.to_string()))?
        } else {
            let options = KubeConfigOptions {
                context: config.kube_context.clone(),
                ..Default::default()
            };
            let kube_config = match &config.kubeconfig {
                Some(path) => {
                    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                        ClusterError::Client(format!(
                            "failed to read kubeconfig {}: {e}",
                            path.display()
                        ))
                    })?;
                    kube::Config::from_custom_kubeconfig(kubeconfig, &options).await
                }
                None => kube::Config::from_kubeconfig(&options).await,
            }
            .map_err(|e| ClusterError::Client(e.to_string()))?;

            Client::try_from(kube_config).map_err(|e| ClusterError::Client(e.to_string()))?
        };

        info!(
            kubeconfig = ?config.kubeconfig,
            context = ?config.kube_context,
            "Connected test client"
        );

        Ok(Self { client })
    }

    /// Process-wide client, built on first use
    ///
    /// Later calls return the same instance and ignore `config`.
    pub async fn shared(config: &HarnessConfig) -> Result<&'static TestClient, ClusterError> {
        SHARED.get_or_try_init(|| Self::new(config)).await
    }

    /// Wrap an existing kube client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// The underlying kube client
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn resolve(
        &self,
        obj: &ObjectRef,
    ) -> Result<(ApiResource, ApiCapabilities), ClusterError> {
        let (group, version) = obj.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &obj.kind);

        discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| ClusterError::Discovery(format!("{}/{}: {e}", obj.api_version, obj.kind)))
    }

    fn dynamic_api(
        &self,
        obj: &ObjectRef,
        resource: &ApiResource,
        caps: &ApiCapabilities,
    ) -> Api<DynamicObject> {
        match (&caps.scope, &obj.namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, resource)
            }
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), resource),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), resource),
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Rewrite a kube error into a readable message with resource context
fn describe_error(err: &kube::Error, kind: &str, name: &str) -> String {
    if let kube::Error::Api(ae) = err {
        match ae.code {
            404 => return format!("{kind} '{name}' not found"),
            409 => return format!("{kind} '{name}' already exists"),
            403 => return format!("{kind} '{name}': permission denied (check RBAC)"),
            422 => return format!("{kind} '{name}' is invalid: {}", ae.message),
            _ => {}
        }
    }

    let raw = err.to_string();
    if raw.contains("connection refused") || raw.contains("ECONNREFUSED") {
        return format!("{kind} '{name}': cannot connect to Kubernetes API");
    }
    if raw.contains("timeout") || raw.contains("deadline exceeded") {
        return format!("{kind} '{name}': operation timed out");
    }

    format!("{kind} '{name}': {raw}")
}

async fn read_stream<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut output = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut output).await?;
    }
    Ok(output)
}

#[async_trait]
impl ClusterApi for TestClient {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&selector.to_string()))
            .await
            .map_err(|e| ClusterError::List {
                target: format!("pods matching {selector}"),
                message: e.to_string(),
            })?;

        Ok(list.items)
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Service>, ClusterError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = services
            .list(&ListParams::default().labels(&selector.to_string()))
            .await
            .map_err(|e| ClusterError::List {
                target: format!("services matching {selector}"),
                message: e.to_string(),
            })?;

        Ok(list.items)
    }

    async fn list_events(
        &self,
        namespace: &str,
        involved: &InvolvedObject,
    ) -> Result<Vec<Event>, ClusterError> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let list = events
            .list(&ListParams::default().fields(&involved.field_selector()))
            .await
            .map_err(|e| ClusterError::List {
                target: format!("events for {involved}"),
                message: e.to_string(),
            })?;

        Ok(list.items)
    }

    async fn get_object(&self, obj: &ObjectRef) -> Result<Option<DynamicObject>, ClusterError> {
        let (resource, caps) = self.resolve(obj).await?;
        let api = self.dynamic_api(obj, &resource, &caps);

        api.get_opt(&obj.name).await.map_err(|e| ClusterError::Get {
            target: obj.to_string(),
            message: describe_error(&e, &obj.kind, &obj.name),
        })
    }

    async fn create_object(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let target = ObjectRef::from_object(obj)?;
        let (resource, caps) = self.resolve(&target).await?;
        let api = self.dynamic_api(&target, &resource, &caps);

        let mut obj = obj.clone();
        if matches!(caps.scope, Scope::Cluster) {
            obj.metadata.namespace = None;
        }

        let created = api
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| ClusterError::Create {
                target: target.to_string(),
                message: describe_error(&e, &target.kind, &target.name),
            })?;

        info!(
            namespace = ?target.namespace,
            object = %target,
            uid = ?created.metadata.uid,
            "Created object"
        );

        Ok(created)
    }

    async fn delete_object(&self, obj: &ObjectRef) -> Result<(), ClusterError> {
        let (resource, caps) = self.resolve(obj).await?;
        let api = self.dynamic_api(obj, &resource, &caps);

        match api.delete(&obj.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = ?obj.namespace, object = %obj, "Deleted object");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(namespace = ?obj.namespace, object = %obj, "Object already gone");
                Ok(())
            }
            Err(e) => Err(ClusterError::Delete {
                target: obj.to_string(),
                message: describe_error(&e, &obj.kind, &obj.name),
            }),
        }
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let attach_params = AttachParams {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let exec_error = |message: String| ClusterError::Exec {
            pod: pod.to_string(),
            message,
        };

        let mut attached = pods
            .exec(pod, command.to_vec(), &attach_params)
            .await
            .map_err(|e| exec_error(describe_error(&e, "Pod", pod)))?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_stream(stdout), read_stream(stderr));
        let stdout = stdout.map_err(|e| exec_error(e.to_string()))?;
        let stderr = stderr.map_err(|e| exec_error(e.to_string()))?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        let success = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .is_some_and(|s| s == "Success");
        let message = status.and_then(|s| s.message);

        debug!(
            namespace = %namespace,
            pod = %pod,
            program = ?command.first(),
            success = %success,
            "Executed command in pod"
        );

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
            message,
        })
    }

    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        pods.logs(pod, &LogParams::default())
            .await
            .map_err(|e| ClusterError::Logs {
                pod: pod.to_string(),
                message: describe_error(&e, "Pod", pod),
            })
    }
}
