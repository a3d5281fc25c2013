//! Scenario runs against the in-memory cluster
//!
//! A spawned task plays the samba-operator: for every SmbShare it sees it
//! creates the labelled pod and service and records the creation events.
//! smbclient is simulated through the exec handler.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PodStatus, Service};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use sharecheck::cluster::memory::{running_pod, share_event, InMemoryCluster};
use sharecheck::events::{REASON_CREATED_DEPLOYMENT, REASON_CREATED_PVC};
use sharecheck::locator::SERVICE_LABEL_KEY;
use sharecheck::scenario::WaitPhase;
use sharecheck::{
    AccessError, Auth, ClusterApi, EventError, ExecOutput, FixtureManager, FixtureSource,
    HarnessConfig, LocateError, Scenario, ScenarioError, ScenarioRunner, ScenarioTable, Share,
    ShareAccess, SmbClientPod,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const NS: &str = "smbtest";
const POD_IP: &str = "10.244.0.7";
const PASSWORD: &str = "1nsecurely";

const SECURITY_CONFIG: &str = r#"---
apiVersion: v1
kind: Secret
metadata:
  name: users1
type: Opaque
stringData:
  demousers: |
    {"samba-container-config": "v0"}
---
apiVersion: samba-operator.samba.org/v1alpha1
kind: SmbSecurityConfig
metadata:
  name: users1
spec:
  mode: user
  users:
    secret: users1
    key: demousers
"#;

const SHARE: &str = r#"apiVersion: samba-operator.samba.org/v1alpha1
kind: SmbShare
metadata:
  name: tshare1
spec:
  securityConfig: users1
  readOnly: false
  shareName: "My Share"
  storage:
    pvc:
      spec:
        accessModes:
          - ReadWriteOnce
        resources:
          requests:
            storage: 1Gi
"#;

const LISTING: &str = "\n\tSharename       Type      Comment\n\t---------       ----      -------\n\tMy Share        Disk      \n\tIPC$            IPC       IPC Service (Samba 4.15.5)\n";

#[derive(Clone, Copy, Default)]
struct Behavior {
    never_ready: bool,
    duplicate_deployment_event: bool,
}

/// Reconciles SmbShares into pods, services and events until aborted
fn spawn_controller(cluster: Arc<InMemoryCluster>, behavior: Behavior) -> JoinHandle<()> {
    tokio::spawn(async move {
        // share uid -> share name
        let mut handled: BTreeMap<String, String> = BTreeMap::new();
        loop {
            let shares = cluster.objects_of_kind("SmbShare");
            for share in &shares {
                let name = share.name_any();
                let uid = share.metadata.uid.clone().unwrap_or_default();
                if share.metadata.deletion_timestamp.is_some() || handled.contains_key(&uid) {
                    continue;
                }
                handled.insert(uid.clone(), name.clone());

                let mut pod = running_pod(NS, &format!("{name}-6f8d9c"), &name, POD_IP);
                if behavior.never_ready {
                    pod.status = Some(PodStatus {
                        phase: Some("Pending".to_string()),
                        ..Default::default()
                    });
                }
                cluster.upsert_pod(pod);
                cluster.upsert_service(share_service(&name));
                cluster.record_event(share_event(NS, &name, Some(&uid), REASON_CREATED_PVC));
                cluster.record_event(share_event(NS, &name, Some(&uid), REASON_CREATED_DEPLOYMENT));
                if behavior.duplicate_deployment_event {
                    cluster.record_event(share_event(
                        NS,
                        &name,
                        Some(&uid),
                        REASON_CREATED_DEPLOYMENT,
                    ));
                }
            }

            let live: Vec<String> = shares.iter().filter_map(|s| s.metadata.uid.clone()).collect();
            handled.retain(|uid, name| {
                let keep = live.contains(uid);
                if !keep {
                    cluster.remove_pod(NS, &format!("{name}-6f8d9c"));
                    cluster.remove_service(NS, name.as_str());
                }
                keep
            });

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

fn share_service(name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(
                [(SERVICE_LABEL_KEY.to_string(), name.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// smbclient that accepts `password` for every user
fn install_smbclient(cluster: &InMemoryCluster, password: &'static str) {
    cluster.on_exec(move |_, command| {
        let user = command.get(2).map(String::as_str).unwrap_or_default();
        if user.split_once('%').map(|(_, p)| p) != Some(password) {
            return Ok(ExecOutput {
                stderr: "session setup failed: NT_STATUS_LOGON_FAILURE\n".to_string(),
                success: false,
                ..Default::default()
            });
        }
        let stdout = if command.iter().any(|a| a == "-L") {
            LISTING.to_string()
        } else {
            "  .                                   D        0  Mon Jan 15 10:42:01 2024\n".to_string()
        };
        Ok(ExecOutput {
            stdout,
            success: true,
            ..Default::default()
        })
    });
}

fn fixtures_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("smbsecurityconfig1.yaml"), SECURITY_CONFIG).unwrap();
    std::fs::write(dir.path().join("smbshare1.yaml"), SHARE).unwrap();
    dir
}

fn config(dir: &TempDir) -> HarnessConfig {
    HarnessConfig::new()
        .namespace(NS)
        .files_dir(dir.path())
        .smbclient_pod("smbclient")
        .exist_timeout(Duration::from_secs(10))
        .ready_timeout(Duration::from_secs(30))
        .removal_timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(100))
}

fn users1() -> Scenario {
    Scenario::new("users1")
        .fixture("smbsecurityconfig1.yaml")
        .fixture("smbshare1.yaml")
        .resource("tshare1")
        .share("My Share")
        .auth(Auth::new("sambauser", PASSWORD))
        .denied(Auth::new("sambauser", "not-the-password"))
}

#[tokio::test(start_paused = true)]
async fn test_scenario_passes_end_to_end() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    install_smbclient(&cluster, PASSWORD);
    let controller = spawn_controller(cluster.clone(), Behavior::default());

    let probe = SmbClientPod::new(&*cluster, NS, "smbclient");
    let report = ScenarioRunner::new(&*cluster, &probe, &config)
        .run(&users1())
        .await;
    controller.abort();

    assert!(report.passed(), "{report}");
    assert!(report.diagnostics.is_none());

    assert_eq!(report.access.len(), 2);
    assert_eq!(report.access[0].share.unc(), format!("//{POD_IP}/My Share"));
    assert_eq!(
        report.access[1].share.unc(),
        "//tshare1.smbtest.svc.cluster.local/My Share"
    );
    assert!(report.access.iter().all(|a| a.results.len() == 2));

    let tally = report.tally.as_ref().unwrap();
    assert_eq!(tally.count(REASON_CREATED_PVC), 1);
    assert_eq!(tally.count(REASON_CREATED_DEPLOYMENT), 1);

    // Every smbclient call ran in the client pod
    let calls = cluster.exec_calls();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|(pod, _)| pod == "smbclient"));

    assert!(cluster.objects().is_empty(), "fixtures should be torn down");
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_fails_and_tears_down() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    install_smbclient(&cluster, PASSWORD);
    let controller = spawn_controller(
        cluster.clone(),
        Behavior {
            never_ready: true,
            ..Default::default()
        },
    );

    let probe = SmbClientPod::new(&*cluster, NS, "smbclient");
    let report = ScenarioRunner::new(&*cluster, &probe, &config)
        .run(&users1())
        .await;
    controller.abort();

    assert!(!report.passed());
    assert_eq!(report.failures.len(), 1, "{report}");
    match &report.failures[0] {
        ScenarioError::Wait { phase, source } => {
            assert_eq!(*phase, WaitPhase::Ready);
            let timeout = source.as_timeout().expect("should be a timeout");
            assert_eq!(timeout.timeout, Duration::from_secs(30));
        }
        other => panic!("unexpected failure: {other}"),
    }

    // No access was attempted and no events were checked
    assert!(report.access.is_empty());
    assert!(report.tally.is_none());
    assert!(cluster.exec_calls().is_empty());

    let diag = report.diagnostics.as_ref().expect("diagnostics on failure");
    assert_eq!(diag.scenario.as_deref(), Some("users1"));
    assert!(diag.pod_logs.contains_key("tshare1-6f8d9c"));

    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_leftover_pod_fails_as_ambiguous() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    install_smbclient(&cluster, PASSWORD);
    // Still labelled for tshare1 from an earlier run
    cluster.upsert_pod(running_pod(NS, "tshare1-leftover", "tshare1", "10.244.0.9"));
    let controller = spawn_controller(cluster.clone(), Behavior::default());

    let smbclient = SmbClientPod::new(&*cluster, NS, "smbclient");
    let report = ScenarioRunner::new(&*cluster, &smbclient, &config)
        .run(&users1())
        .await;
    controller.abort();

    assert_eq!(report.failures.len(), 1, "{report}");
    match &report.failures[0] {
        ScenarioError::Locate(LocateError::Ambiguous { kind, names, .. }) => {
            assert_eq!(kind, "pod");
            assert_eq!(
                names,
                &vec!["tshare1-6f8d9c".to_string(), "tshare1-leftover".to_string()]
            );
        }
        other => panic!("unexpected failure: {other}"),
    }
    assert!(report.access.is_empty());
    assert!(cluster.exec_calls().is_empty());
    assert!(cluster.objects().is_empty());
}

/// Share access that dies mid-check
struct PanickingShareAccess;

#[async_trait]
impl ShareAccess for PanickingShareAccess {
    async fn check_access(&self, _share: &Share, _auth: &Auth) -> Result<(), AccessError> {
        panic!("smbclient pod vanished");
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_share_access_still_tears_down() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    let controller = spawn_controller(cluster.clone(), Behavior::default());

    let report = ScenarioRunner::new(&*cluster, &PanickingShareAccess, &config)
        .run(&users1())
        .await;
    controller.abort();

    assert_eq!(report.failures.len(), 1, "{report}");
    match &report.failures[0] {
        ScenarioError::Panicked(message) => {
            assert!(message.contains("smbclient pod vanished"), "{message}");
        }
        other => panic!("unexpected failure: {other}"),
    }
    assert!(report.diagnostics.is_some());
    assert!(cluster.objects().is_empty(), "fixtures should be torn down");
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_events_fail_only_the_event_check() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    install_smbclient(&cluster, PASSWORD);
    let controller = spawn_controller(
        cluster.clone(),
        Behavior {
            duplicate_deployment_event: true,
            ..Default::default()
        },
    );

    let probe = SmbClientPod::new(&*cluster, NS, "smbclient");
    let report = ScenarioRunner::new(&*cluster, &probe, &config)
        .run(&users1())
        .await;
    controller.abort();

    assert_eq!(report.failures.len(), 1, "{report}");
    match &report.failures[0] {
        ScenarioError::Events(EventError::Mismatch { mismatches, .. }) => {
            assert_eq!(mismatches.len(), 1);
            assert_eq!(mismatches[0].reason, REASON_CREATED_DEPLOYMENT);
            assert_eq!(mismatches[0].observed, 2);
        }
        other => panic!("unexpected failure: {other}"),
    }
    assert!(report.access.iter().all(|a| a.passed()));
    assert_eq!(
        report.tally.as_ref().map(|t| t.count(REASON_CREATED_DEPLOYMENT)),
        Some(2)
    );
}

#[tokio::test(start_paused = true)]
async fn test_events_of_an_earlier_share_are_not_counted() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    install_smbclient(&cluster, PASSWORD);

    // Left over from a previous share with the same name
    cluster.record_event(share_event(NS, "tshare1", Some("uid-old"), REASON_CREATED_PVC));
    cluster.record_event(share_event(
        NS,
        "tshare1",
        Some("uid-old"),
        REASON_CREATED_DEPLOYMENT,
    ));
    let controller = spawn_controller(cluster.clone(), Behavior::default());

    let probe = SmbClientPod::new(&*cluster, NS, "smbclient");
    let report = ScenarioRunner::new(&*cluster, &probe, &config)
        .run(&users1())
        .await;
    controller.abort();

    assert!(report.passed(), "{report}");
}

#[tokio::test(start_paused = true)]
async fn test_granted_denied_credential_fails_both_endpoints() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    // Accepts anything: the denied credential gets in
    cluster.on_exec(|_, command| {
        let stdout = if command.iter().any(|a| a == "-L") {
            LISTING.to_string()
        } else {
            String::new()
        };
        Ok(ExecOutput {
            stdout,
            success: true,
            ..Default::default()
        })
    });
    let controller = spawn_controller(cluster.clone(), Behavior::default());

    let probe = SmbClientPod::new(&*cluster, NS, "smbclient");
    let report = ScenarioRunner::new(&*cluster, &probe, &config)
        .run(&users1())
        .await;
    controller.abort();

    let access_failures: Vec<_> = report
        .failures
        .iter()
        .filter(|f| matches!(f, ScenarioError::Access { .. }))
        .collect();
    assert_eq!(access_failures.len(), 2, "{report}");
    assert!(access_failures[0]
        .to_string()
        .contains("expected denial, got access"));

    // The event check still ran
    assert!(report.tally.is_some());
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_setup_failure_tears_down_applied_fixtures() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    install_smbclient(&cluster, PASSWORD);
    cluster.reject_create("tshare1", "admission webhook denied the request");

    let probe = SmbClientPod::new(&*cluster, NS, "smbclient");
    let report = ScenarioRunner::new(&*cluster, &probe, &config)
        .run(&users1())
        .await;

    assert_eq!(report.failures.len(), 1, "{report}");
    assert!(matches!(report.failures[0], ScenarioError::Setup(_)));
    assert!(report.failures[0].to_string().contains("admission webhook"));

    // The security config applied before the failure was removed again
    assert_eq!(cluster.create_count(), 2);
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_teardown_failure_does_not_mask_earlier_failure() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    install_smbclient(&cluster, PASSWORD);
    cluster.reject_delete("tshare1", "the server is currently unable to handle the request");
    let controller = spawn_controller(
        cluster.clone(),
        Behavior {
            never_ready: true,
            ..Default::default()
        },
    );

    let probe = SmbClientPod::new(&*cluster, NS, "smbclient");
    let report = ScenarioRunner::new(&*cluster, &probe, &config)
        .run(&users1())
        .await;
    controller.abort();

    assert_eq!(report.failures.len(), 2, "{report}");
    assert!(matches!(
        report.failures[0],
        ScenarioError::Wait {
            phase: WaitPhase::Ready,
            ..
        }
    ));
    assert!(matches!(report.failures[1], ScenarioError::Teardown(_)));

    // Deletion continued past the rejected share
    let remaining: Vec<String> = cluster.objects().iter().map(|o| o.name_any()).collect();
    assert_eq!(remaining, vec!["tshare1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_lingering_fixture_fails_removal_check() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    install_smbclient(&cluster, PASSWORD);
    cluster.delay_removal("tshare1");
    let controller = spawn_controller(cluster.clone(), Behavior::default());

    let probe = SmbClientPod::new(&*cluster, NS, "smbclient");
    let report = ScenarioRunner::new(&*cluster, &probe, &config)
        .run(&users1())
        .await;
    controller.abort();

    assert_eq!(report.failures.len(), 1, "{report}");
    match &report.failures[0] {
        ScenarioError::NotRemoved(source) => {
            assert!(source.to_string().contains("SmbShare/tshare1"));
        }
        other => panic!("unexpected failure: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_suite_runs_every_scenario() {
    let dir = fixtures_dir();
    let config = config(&dir);
    let cluster = Arc::new(InMemoryCluster::new());
    install_smbclient(&cluster, PASSWORD);
    let controller = spawn_controller(cluster.clone(), Behavior::default());

    let table: ScenarioTable = [
        users1(),
        Scenario::new("missingFixture")
            .fixture("smbshare9.yaml")
            .resource("tshare9")
            .share("Nowhere"),
    ]
    .into_iter()
    .collect();

    let probe = SmbClientPod::new(&*cluster, NS, "smbclient");
    let suite = ScenarioRunner::new(&*cluster, &probe, &config)
        .run_all(&table)
        .await;
    controller.abort();

    assert_eq!(suite.reports.len(), 2);
    assert_eq!(suite.failed(), vec!["missingFixture"]);
    assert!(suite.get("users1").is_some_and(|r| r.passed()));
    assert!(suite.to_string().contains("2 scenarios: 1 passed, 1 failed"));
}

#[tokio::test]
async fn test_ensure_twice_creates_once() {
    let dir = fixtures_dir();
    let cluster = InMemoryCluster::new();
    let source = FixtureSource::new(dir.path().join("smbshare1.yaml"), NS);

    let mut fixtures = FixtureManager::new(&cluster);
    let first = fixtures.ensure(&source).await.unwrap();
    let second = fixtures.ensure(&source).await.unwrap();

    assert_eq!(cluster.create_count(), 1);
    assert_eq!(first[0].metadata.uid, second[0].metadata.uid);
    assert_eq!(fixtures.tracked().len(), 1);

    let removed = fixtures.teardown().await.unwrap();
    assert_eq!(removed.len(), 1);
    assert!(cluster.get_object(&removed[0]).await.unwrap().is_none());
}
