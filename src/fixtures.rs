//! Declarative fixtures applied from YAML files
//!
//! A fixture file holds one or more resource definitions. The manager
//! creates them if missing, remembers which file produced which objects,
//! and deletes them again at teardown.
//!
//! # Example
//!
//! ```ignore
//! use sharecheck::fixtures::{FixtureManager, FixtureSource};
//!
//! let mut fixtures = FixtureManager::new(&tc);
//! let source = FixtureSource::new(config.fixture_path("smbshare1.yaml"), "default");
//! let objects = fixtures.ensure(&source).await?;
//!
//! // ... assertions ...
//!
//! let removed = fixtures.teardown().await?;
//! fixtures.wait_removed(&removed, Duration::from_secs(60), Duration::from_secs(1)).await?;
//! ```

use crate::cluster::{ClusterApi, ClusterError, ObjectRef};
use crate::eventually::{eventually, ConditionError, Probe};
use kube::api::DynamicObject;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A fixture file and the namespace its objects go to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureSource {
    pub path: PathBuf,
    pub namespace: String,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for FixtureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (namespace {})", self.path.display(), self.namespace)
    }
}

/// Errors from fixture setup and teardown
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("failed to read fixture {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("failed to parse fixture {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("fixture {path}, document {document}: {message}")]
    Invalid {
        path: PathBuf,
        document: usize,
        message: String,
    },

    #[error("fixture {0} contains no resource definitions")]
    Empty(PathBuf),

    #[error("{0}")]
    Cluster(#[from] ClusterError),

    #[error(
        "{} teardown failure(s): {}",
        .0.len(),
        .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    Teardown(Vec<FixtureError>),
}

/// Read and parse every resource definition in a fixture file
///
/// Each object gets the source's namespace.
pub fn load_manifests(source: &FixtureSource) -> Result<Vec<DynamicObject>, FixtureError> {
    let text = std::fs::read_to_string(&source.path).map_err(|e| FixtureError::Read {
        path: source.path.clone(),
        message: e.to_string(),
    })?;
    parse_manifests(&text, &source.path, &source.namespace)
}

/// Parse multi-document YAML into dynamic objects
///
/// Empty documents are skipped. Every other document needs `apiVersion`,
/// `kind` and `metadata.name`.
pub fn parse_manifests(
    yaml: &str,
    path: &Path,
    namespace: &str,
) -> Result<Vec<DynamicObject>, FixtureError> {
    let mut objects = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value = serde_json::Value::deserialize(document).map_err(|e| FixtureError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if value.is_null() {
            continue;
        }

        let invalid = |message: String| FixtureError::Invalid {
            path: path.to_path_buf(),
            document: index + 1,
            message,
        };

        let mut obj: DynamicObject =
            serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
        ObjectRef::from_object(&obj).map_err(|e| invalid(e.to_string()))?;
        obj.metadata.namespace = Some(namespace.to_string());
        objects.push(obj);
    }

    if objects.is_empty() {
        return Err(FixtureError::Empty(path.to_path_buf()));
    }
    Ok(objects)
}

/// Applies fixtures and tracks them for teardown
pub struct FixtureManager<'a> {
    cluster: &'a dyn ClusterApi,
    applied: Vec<(FixtureSource, Vec<ObjectRef>)>,
}

impl<'a> FixtureManager<'a> {
    pub fn new(cluster: &'a dyn ClusterApi) -> Self {
        Self {
            cluster,
            applied: Vec::new(),
        }
    }

    /// Create the fixture's objects unless they already exist
    ///
    /// Returns the created or pre-existing objects in file order. Ensuring
    /// the same source twice creates nothing new and tracks it once. Each
    /// object is tracked as soon as it exists, so a file that fails partway
    /// through is still cleaned up by `teardown`.
    pub async fn ensure(&mut self, source: &FixtureSource) -> Result<Vec<DynamicObject>, FixtureError> {
        let objects = load_manifests(source)?;

        let slot = match self.applied.iter().position(|(s, _)| s == source) {
            Some(slot) => slot,
            None => {
                self.applied.push((source.clone(), Vec::new()));
                self.applied.len() - 1
            }
        };

        let result = self.apply_objects(source, &objects, slot).await;
        if result.is_err() && self.applied[slot].1.is_empty() {
            self.applied.remove(slot);
        }
        let live = result?;

        info!(
            fixture = %source.path.display(),
            namespace = %source.namespace,
            objects = live.len(),
            "Fixture ensured"
        );
        Ok(live)
    }

    async fn apply_objects(
        &mut self,
        source: &FixtureSource,
        objects: &[DynamicObject],
        slot: usize,
    ) -> Result<Vec<DynamicObject>, FixtureError> {
        let mut live = Vec::with_capacity(objects.len());

        for obj in objects {
            let target = ObjectRef::from_object(obj)?;
            match self.cluster.get_object(&target).await? {
                Some(existing) => {
                    debug!(
                        namespace = %source.namespace,
                        object = %target,
                        "Fixture object already present"
                    );
                    live.push(existing);
                }
                None => live.push(self.cluster.create_object(obj).await?),
            }

            let refs = &mut self.applied[slot].1;
            if !refs.contains(&target) {
                refs.push(target);
            }
        }

        Ok(live)
    }

    /// Ensure several fixtures in order, stopping at the first failure
    ///
    /// Fixtures applied before the failure stay tracked for teardown.
    pub async fn ensure_all(
        &mut self,
        sources: &[FixtureSource],
    ) -> Result<Vec<DynamicObject>, FixtureError> {
        let mut all = Vec::new();
        for source in sources {
            all.extend(self.ensure(source).await?);
        }
        Ok(all)
    }

    /// Delete the objects defined by a fixture file
    ///
    /// The file is re-read; when that fails for a tracked source the
    /// objects recorded at `ensure` time are deleted instead. Objects are
    /// deleted in reverse file order and every deletion is attempted; the
    /// returned references are in deletion order.
    pub async fn remove(&mut self, source: &FixtureSource) -> Result<Vec<ObjectRef>, FixtureError> {
        let position = self.applied.iter().position(|(s, _)| s == source);
        let tracked = position.map(|i| self.applied.remove(i).1);

        let mut refs = match (load_manifests(source), tracked) {
            (Ok(objects), _) => objects
                .iter()
                .map(ObjectRef::from_object)
                .collect::<Result<Vec<_>, _>>()?,
            (Err(e), Some(refs)) => {
                warn!(
                    fixture = %source.path.display(),
                    error = %e,
                    "Re-reading fixture failed, deleting recorded objects"
                );
                refs
            }
            (Err(e), None) => return Err(e),
        };

        refs.reverse();

        let mut failures = Vec::new();
        for target in &refs {
            if let Err(e) = self.cluster.delete_object(target).await {
                warn!(
                    namespace = ?target.namespace,
                    object = %target,
                    error = %e,
                    "Failed to delete fixture object"
                );
                failures.push(FixtureError::Cluster(e));
            }
        }

        match failures.len() {
            0 => {
                info!(
                    fixture = %source.path.display(),
                    namespace = %source.namespace,
                    "Fixture removed"
                );
                Ok(refs)
            }
            1 => Err(failures.remove(0)),
            _ => Err(FixtureError::Teardown(failures)),
        }
    }

    /// Remove every tracked fixture, most recently applied first
    ///
    /// Keeps going past failures. Returns the objects whose deletion was
    /// requested, or every failure encountered.
    pub async fn teardown(&mut self) -> Result<Vec<ObjectRef>, FixtureError> {
        let mut removed = Vec::new();
        let mut failures = Vec::new();

        // `remove` untracks the source even when a deletion fails.
        while let Some((source, _)) = self.applied.last().cloned() {
            match self.remove(&source).await {
                Ok(refs) => removed.extend(refs),
                Err(FixtureError::Teardown(errs)) => failures.extend(errs),
                Err(e) => failures.push(e),
            }
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(FixtureError::Teardown(failures))
        }
    }

    /// Wait until none of `refs` exists any more
    pub async fn wait_removed(
        &self,
        refs: &[ObjectRef],
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), ConditionError> {
        if refs.is_empty() {
            return Ok(());
        }

        eventually("fixtures/removal", || async move {
            let mut remaining = Vec::new();
            for target in refs {
                match self.cluster.get_object(target).await {
                    Ok(None) => {}
                    Ok(Some(_)) => remaining.push(target.to_string()),
                    Err(e) => return Probe::Pending(format!("query failed: {e}")),
                }
            }
            if remaining.is_empty() {
                Probe::Ready(())
            } else {
                Probe::Pending(format!("still present: {}", remaining.join(", ")))
            }
        })
        .timeout(timeout)
        .interval(interval)
        .await_condition()
        .await
    }

    /// Sources currently tracked, in application order
    pub fn tracked(&self) -> Vec<&FixtureSource> {
        self.applied.iter().map(|(s, _)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use std::fs;
    use tempfile::TempDir;

    const SECURITY_CONFIG: &str = r#"
apiVersion: v1
kind: Secret
metadata:
  name: users1
type: Opaque
stringData:
  demousers: '{"samba-container-config": "v0"}'
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

    const SHARE: &str = r#"
---
apiVersion: samba-operator.samba.org/v1alpha1
kind: SmbShare
metadata:
  name: tshare1
spec:
  shareName: My Share
  securityConfig: users1
  readOnly: false
  storage:
    pvc:
      spec:
        accessModes: [ReadWriteOnce]
        resources:
          requests:
            storage: 1Gi
"#;

    fn write(dir: &TempDir, name: &str, content: &str) -> FixtureSource {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        FixtureSource::new(path, "smbtest")
    }

    #[test]
    fn test_parse_multi_document() {
        let objs = parse_manifests(SECURITY_CONFIG, Path::new("x.yaml"), "smbtest").unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0].types.as_ref().unwrap().kind, "Secret");
        assert_eq!(objs[1].types.as_ref().unwrap().kind, "SmbSecurityConfig");
        assert!(objs
            .iter()
            .all(|o| o.metadata.namespace.as_deref() == Some("smbtest")));
        assert_eq!(objs[1].data["spec"]["mode"], "user");
    }

    #[test]
    fn test_parse_skips_empty_documents() {
        let objs = parse_manifests(SHARE, Path::new("x.yaml"), "default").unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].metadata.name.as_deref(), Some("tshare1"));
    }

    #[test]
    fn test_parse_overrides_namespace() {
        let yaml = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n  namespace: other\n";
        let objs = parse_manifests(yaml, Path::new("x.yaml"), "smbtest").unwrap();
        assert_eq!(objs[0].metadata.namespace.as_deref(), Some("smbtest"));
    }

    #[test]
    fn test_parse_requires_kind_and_name() {
        let no_name = "apiVersion: v1\nkind: Secret\nmetadata: {}\n";
        let err = parse_manifests(no_name, Path::new("x.yaml"), "default").unwrap_err();
        assert!(matches!(err, FixtureError::Invalid { document: 1, .. }));

        let no_kind = "metadata:\n  name: s\n";
        assert!(parse_manifests(no_kind, Path::new("x.yaml"), "default").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_file() {
        let err = parse_manifests("---\n", Path::new("x.yaml"), "default").unwrap_err();
        assert!(matches!(err, FixtureError::Empty(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_manifests(&FixtureSource::new("/nonexistent/f.yaml", "default")).unwrap_err();
        assert!(matches!(err, FixtureError::Read { .. }));
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let source = write(&dir, "smbshare1.yaml", SHARE);
        let cluster = InMemoryCluster::new();
        let mut fixtures = FixtureManager::new(&cluster);

        let first = fixtures.ensure(&source).await.unwrap();
        let second = fixtures.ensure(&source).await.unwrap();

        assert_eq!(cluster.create_count(), 1);
        assert_eq!(cluster.objects_of_kind("SmbShare").len(), 1);
        assert_eq!(first[0].metadata.uid, second[0].metadata.uid);
        assert_eq!(fixtures.tracked().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let security = write(&dir, "smbsecurityconfig1.yaml", SECURITY_CONFIG);
        let share = write(&dir, "smbshare1.yaml", SHARE);
        let cluster = InMemoryCluster::new();
        cluster.reject_create("tshare1", "SmbShare 'tshare1' is invalid: spec.storage");
        let mut fixtures = FixtureManager::new(&cluster);

        let err = fixtures
            .ensure_all(&[security.clone(), share])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is invalid"));
        // The first fixture is still tracked so teardown can clean it up.
        assert_eq!(fixtures.tracked(), vec![&security]);
    }

    #[tokio::test]
    async fn test_partly_applied_file_is_torn_down() {
        let dir = TempDir::new().unwrap();
        let source = write(
            &dir,
            "secrets.yaml",
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: first\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: second\n",
        );
        let cluster = InMemoryCluster::new();
        cluster.reject_create("second", "secrets \"second\" is forbidden");
        let mut fixtures = FixtureManager::new(&cluster);

        let err = fixtures.ensure(&source).await.unwrap_err();
        assert!(err.to_string().contains("forbidden"));
        assert_eq!(fixtures.tracked(), vec![&source]);
        assert_eq!(cluster.objects().len(), 1);

        let removed = fixtures.teardown().await.unwrap();
        let names: Vec<_> = removed.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["Secret/second", "Secret/first"]);
        assert!(cluster.objects().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_removes_everything_in_reverse() {
        let dir = TempDir::new().unwrap();
        let security = write(&dir, "smbsecurityconfig1.yaml", SECURITY_CONFIG);
        let share = write(&dir, "smbshare1.yaml", SHARE);
        let cluster = InMemoryCluster::new();
        let mut fixtures = FixtureManager::new(&cluster);

        fixtures.ensure_all(&[security, share]).await.unwrap();
        assert_eq!(cluster.objects().len(), 3);

        let removed = fixtures.teardown().await.unwrap();
        let names: Vec<_> = removed.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec!["SmbShare/tshare1", "SmbSecurityConfig/users1", "Secret/users1"]
        );
        assert!(cluster.objects().is_empty());
        assert!(fixtures.tracked().is_empty());

        fixtures
            .wait_removed(&removed, Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_teardown_collects_every_failure() {
        let dir = TempDir::new().unwrap();
        let security = write(&dir, "smbsecurityconfig1.yaml", SECURITY_CONFIG);
        let share = write(&dir, "smbshare1.yaml", SHARE);
        let cluster = InMemoryCluster::new();
        let mut fixtures = FixtureManager::new(&cluster);
        fixtures.ensure_all(&[security, share]).await.unwrap();

        cluster.reject_delete("tshare1", "permission denied");
        cluster.reject_delete("users1", "permission denied");

        let err = fixtures.teardown().await.unwrap_err();
        match err {
            // One share plus the secret and security config named users1.
            FixtureError::Teardown(failures) => assert_eq!(failures.len(), 3),
            other => panic!("expected Teardown, got {other:?}"),
        }
        assert!(fixtures.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_remove_falls_back_to_recorded_objects() {
        let dir = TempDir::new().unwrap();
        let share = write(&dir, "smbshare1.yaml", SHARE);
        let cluster = InMemoryCluster::new();
        let mut fixtures = FixtureManager::new(&cluster);
        fixtures.ensure(&share).await.unwrap();

        fs::remove_file(&share.path).unwrap();
        let removed = fixtures.remove(&share).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(cluster.objects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_removed_waits_for_finalizers() {
        let dir = TempDir::new().unwrap();
        let share = write(&dir, "smbshare1.yaml", SHARE);
        let cluster = std::sync::Arc::new(InMemoryCluster::new());
        let mut fixtures = FixtureManager::new(cluster.as_ref());
        fixtures.ensure(&share).await.unwrap();

        cluster.delay_removal("tshare1");
        let removed = fixtures.teardown().await.unwrap();

        let err = fixtures
            .wait_removed(&removed, Duration::from_secs(3), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err
            .as_timeout()
            .unwrap()
            .last_state
            .contains("SmbShare/tshare1"));

        cluster.complete_removal(&removed[0]);
        fixtures
            .wait_removed(&removed, Duration::from_secs(3), Duration::from_secs(1))
            .await
            .unwrap();
    }
}
