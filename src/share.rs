//! Share access probe
//!
//! Proves that a credential can reach a share: connect, enumerate the
//! server's shares, find the expected one, and list its contents.
//! [`SmbClientPod`] does this by running `smbclient` inside a client pod
//! that lives in the test namespace.

use crate::cluster::{ClusterApi, ClusterError, ExecOutput};
use async_trait::async_trait;
use std::fmt;
use tracing::debug;

/// Status codes smbclient prints when the server refuses a credential
const DENIED_STATUSES: &[&str] = &["NT_STATUS_LOGON_FAILURE", "NT_STATUS_ACCESS_DENIED"];

/// Network endpoint of a share server: an IP address or DNS name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host(pub String);

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Host {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Host {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A named share on a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub host: Host,
    pub name: String,
}

impl Share {
    pub fn new(host: impl Into<Host>, name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            name: name.into(),
        }
    }

    /// UNC path in smbclient's slash form (`//host/share`)
    pub fn unc(&self) -> String {
        format!("//{}/{}", self.host, self.name)
    }
}

impl fmt::Display for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unc())
    }
}

/// Username and password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// smbclient `-U` argument
    fn user_arg(&self) -> String {
        format!("{}%{}", self.username, self.password)
    }
}

// Passwords stay out of logs and test output.
impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

/// Why a credential could not use a share
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("access to {share} denied for {user}: {detail}")]
    Denied {
        share: String,
        user: String,
        detail: String,
    },

    #[error("share '{name}' not listed by {host} for {user}")]
    NotListed {
        host: String,
        name: String,
        user: String,
    },

    #[error("accessing {share} as {user} failed: {detail}")]
    Failed {
        share: String,
        user: String,
        detail: String,
    },

    #[error("{0}")]
    Cluster(#[from] ClusterError),
}

impl AccessError {
    /// Whether the server refused the credential
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
}

/// Protocol-level access to shares
#[async_trait]
pub trait ShareAccess: Send + Sync {
    /// Connect with `auth`, enumerate the host's shares, and read `share`
    async fn check_access(&self, share: &Share, auth: &Auth) -> Result<(), AccessError>;
}

/// Runs `smbclient` inside an existing client pod
pub struct SmbClientPod<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: String,
    pod: String,
}

impl<'a> SmbClientPod<'a> {
    pub fn new(
        cluster: &'a dyn ClusterApi,
        namespace: impl Into<String>,
        pod: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            pod: pod.into(),
        }
    }

    async fn run(&self, command: Vec<String>) -> Result<ExecOutput, AccessError> {
        Ok(self.cluster.exec(&self.namespace, &self.pod, &command).await?)
    }
}

/// `smbclient -U user%pass -L //host`
pub fn list_command(host: &Host, auth: &Auth) -> Vec<String> {
    vec![
        "smbclient".to_string(),
        "-U".to_string(),
        auth.user_arg(),
        "-L".to_string(),
        format!("//{host}"),
    ]
}

/// `smbclient -U user%pass //host/share -c ls`
pub fn read_command(share: &Share, auth: &Auth) -> Vec<String> {
    vec![
        "smbclient".to_string(),
        "-U".to_string(),
        auth.user_arg(),
        share.unc(),
        "-c".to_string(),
        "ls".to_string(),
    ]
}

/// Whether `smbclient -L` output lists a share called `name`
pub fn lists_share(output: &str, name: &str) -> bool {
    output.lines().any(|line| {
        line.trim()
            .strip_prefix(name)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
    })
}

fn classify(output: &ExecOutput, share: &Share, auth: &Auth) -> Result<(), AccessError> {
    let combined = output.combined();
    if let Some(status) = DENIED_STATUSES.iter().find(|s| combined.contains(*s)) {
        return Err(AccessError::Denied {
            share: share.to_string(),
            user: auth.username.clone(),
            detail: (*status).to_string(),
        });
    }
    if !output.success {
        let detail = combined
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(str::to_string)
            .or_else(|| output.message.clone())
            .unwrap_or_else(|| "smbclient exited with an error".to_string());
        return Err(AccessError::Failed {
            share: share.to_string(),
            user: auth.username.clone(),
            detail,
        });
    }
    Ok(())
}

#[async_trait]
impl ShareAccess for SmbClientPod<'_> {
    async fn check_access(&self, share: &Share, auth: &Auth) -> Result<(), AccessError> {
        let listing = self.run(list_command(&share.host, auth)).await?;
        classify(&listing, share, auth)?;
        if !lists_share(&listing.stdout, &share.name) {
            return Err(AccessError::NotListed {
                host: share.host.to_string(),
                name: share.name.clone(),
                user: auth.username.clone(),
            });
        }

        let read = self.run(read_command(share, auth)).await?;
        classify(&read, share, auth)?;

        debug!(
            pod = %self.pod,
            share = %share,
            user = %auth.username,
            "Share access confirmed"
        );
        Ok(())
    }
}
