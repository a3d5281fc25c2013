//! Harness configuration
//!
//! Build it programmatically or read it from `SMBOP_TEST_*` environment
//! variables. Nothing is read from config files.
//!
//! # Example
//!
//! ```
//! use sharecheck::config::HarnessConfig;
//! use std::time::Duration;
//!
//! let config = HarnessConfig::new()
//!     .namespace("smbtest")
//!     .files_dir("./testfiles")
//!     .ready_timeout(Duration::from_secs(120));
//!
//! assert_eq!(config.namespace, "smbtest");
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_NAMESPACE: &str = "SMBOP_TEST_NAMESPACE";
pub const ENV_FILES_DIR: &str = "SMBOP_TEST_FILES_DIR";
pub const ENV_KUBECONFIG: &str = "SMBOP_TEST_KUBECONFIG";
pub const ENV_KUBE_CONTEXT: &str = "SMBOP_TEST_KUBE_CONTEXT";
pub const ENV_SMBCLIENT_POD: &str = "SMBOP_TEST_SMBCLIENT_POD";
pub const ENV_EXIST_TIMEOUT: &str = "SMBOP_TEST_EXIST_TIMEOUT_SECS";
pub const ENV_READY_TIMEOUT: &str = "SMBOP_TEST_READY_TIMEOUT_SECS";
pub const ENV_REMOVAL_TIMEOUT: &str = "SMBOP_TEST_REMOVAL_TIMEOUT_SECS";
pub const ENV_POLL_INTERVAL: &str = "SMBOP_TEST_POLL_INTERVAL_MS";

/// Errors from reading configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("{0} must be greater than zero")]
    Zero(String),

    #[error("{0} must not be empty")]
    Empty(String),
}

/// Settings shared by every scenario in a suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Namespace fixtures are applied to and managed objects are found in
    pub namespace: String,

    /// Base directory fixture paths are resolved against
    pub files_dir: PathBuf,

    /// Explicit kubeconfig file
    pub kubeconfig: Option<PathBuf>,

    /// Explicit kubeconfig context
    pub kube_context: Option<String>,

    /// Pod the share-access probe runs `smbclient` in
    pub smbclient_pod: String,

    /// Deadline for controller-managed pods to appear
    pub exist_timeout: Duration,

    /// Deadline for the share's pod to become ready
    pub ready_timeout: Duration,

    /// Deadline for fixtures to disappear after teardown
    pub removal_timeout: Duration,

    /// Interval between polls
    pub poll_interval: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            files_dir: PathBuf::from("../files"),
            kubeconfig: None,
            kube_context: None,
            smbclient_pod: "smbclient".to_string(),
            exist_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(60),
            removal_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl HarnessConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Read configuration from the process environment
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read configuration through a variable lookup function
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ns) = lookup(ENV_NAMESPACE) {
            config.namespace = non_empty(ENV_NAMESPACE, ns)?;
        }
        if let Some(dir) = lookup(ENV_FILES_DIR) {
            config.files_dir = PathBuf::from(non_empty(ENV_FILES_DIR, dir)?);
        }
        config.kubeconfig = lookup(ENV_KUBECONFIG)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        config.kube_context = lookup(ENV_KUBE_CONTEXT).filter(|v| !v.is_empty());
        if let Some(pod) = lookup(ENV_SMBCLIENT_POD) {
            config.smbclient_pod = non_empty(ENV_SMBCLIENT_POD, pod)?;
        }

        if let Some(v) = lookup(ENV_EXIST_TIMEOUT) {
            config.exist_timeout = Duration::from_secs(positive(ENV_EXIST_TIMEOUT, &v)?);
        }
        if let Some(v) = lookup(ENV_READY_TIMEOUT) {
            config.ready_timeout = Duration::from_secs(positive(ENV_READY_TIMEOUT, &v)?);
        }
        if let Some(v) = lookup(ENV_REMOVAL_TIMEOUT) {
            config.removal_timeout = Duration::from_secs(positive(ENV_REMOVAL_TIMEOUT, &v)?);
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL) {
            config.poll_interval = Duration::from_millis(positive(ENV_POLL_INTERVAL, &v)?);
        }

        Ok(config)
    }

    /// Set the namespace
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set the fixture base directory
    pub fn files_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.files_dir = dir.into();
        self
    }

    /// Set an explicit kubeconfig path
    pub fn kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Set an explicit kubeconfig context
    pub fn kube_context(mut self, context: impl Into<String>) -> Self {
        self.kube_context = Some(context.into());
        self
    }

    /// Set the client pod used for share access
    pub fn smbclient_pod(mut self, pod: impl Into<String>) -> Self {
        self.smbclient_pod = pod.into();
        self
    }

    pub fn exist_timeout(mut self, timeout: Duration) -> Self {
        self.exist_timeout = timeout;
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn removal_timeout(mut self, timeout: Duration) -> Self {
        self.removal_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Resolve a fixture file name against the base directory
    ///
    /// Absolute paths are returned unchanged.
    pub fn fixture_path(&self, file: impl AsRef<Path>) -> PathBuf {
        self.files_dir.join(file)
    }
}

fn non_empty(var: &str, value: String) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty(var.to_string()));
    }
    Ok(value)
}

fn positive(var: &str, value: &str) -> Result<u64, ConfigError> {
    let parsed: u64 = value.trim().parse().map_err(|e: std::num::ParseIntError| {
        ConfigError::Invalid {
            var: var.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        }
    })?;
    if parsed == 0 {
        return Err(ConfigError::Zero(var.to_string()));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::new();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.files_dir, PathBuf::from("../files"));
        assert_eq!(config.smbclient_pod, "smbclient");
        assert_eq!(config.exist_timeout, Duration::from_secs(10));
        assert_eq!(config.ready_timeout, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.kubeconfig.is_none());
    }

    #[test]
    fn test_builder() {
        let config = HarnessConfig::new()
            .namespace("smbtest")
            .files_dir("/srv/files")
            .kubeconfig("/tmp/kubeconfig")
            .kube_context("kind-smb")
            .smbclient_pod("client")
            .ready_timeout(Duration::from_secs(300));

        assert_eq!(config.namespace, "smbtest");
        assert_eq!(config.kubeconfig, Some(PathBuf::from("/tmp/kubeconfig")));
        assert_eq!(config.kube_context.as_deref(), Some("kind-smb"));
        assert_eq!(config.smbclient_pod, "client");
        assert_eq!(config.ready_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_from_lookup_empty_is_default() {
        let config = HarnessConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = HarnessConfig::from_lookup(lookup(&[
            (ENV_NAMESPACE, "smbtest"),
            (ENV_FILES_DIR, "/srv/files"),
            (ENV_KUBE_CONTEXT, "kind-smb"),
            (ENV_READY_TIMEOUT, "120"),
            (ENV_POLL_INTERVAL, "250"),
        ]))
        .unwrap();

        assert_eq!(config.namespace, "smbtest");
        assert_eq!(config.files_dir, PathBuf::from("/srv/files"));
        assert_eq!(config.kube_context.as_deref(), Some("kind-smb"));
        assert_eq!(config.ready_timeout, Duration::from_secs(120));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = HarnessConfig::from_lookup(lookup(&[(ENV_READY_TIMEOUT, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains(ENV_READY_TIMEOUT));
    }

    #[test]
    fn test_from_lookup_rejects_zero() {
        let err = HarnessConfig::from_lookup(lookup(&[(ENV_EXIST_TIMEOUT, "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero(ENV_EXIST_TIMEOUT.to_string()));
    }

    #[test]
    fn test_from_lookup_rejects_empty_namespace() {
        let err = HarnessConfig::from_lookup(lookup(&[(ENV_NAMESPACE, " ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Empty(_)));
    }

    #[test]
    fn test_fixture_path() {
        let config = HarnessConfig::new().files_dir("/srv/files");
        assert_eq!(
            config.fixture_path("smbshare1.yaml"),
            PathBuf::from("/srv/files/smbshare1.yaml")
        );
        assert_eq!(
            config.fixture_path("/abs/x.yaml"),
            PathBuf::from("/abs/x.yaml")
        );
    }
}
