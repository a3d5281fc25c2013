//! Event tallies for exactly-once side-effect checks
//!
//! The controller emits one event per side effect it performs for a share
//! (creating the claim, creating the deployment). Counting events by reason
//! proves that repeated reconciliation did not repeat the side effect.
//!
//! # Example
//!
//! ```ignore
//! use sharecheck::events::{EventExpectations, EventVerifier, InvolvedObject};
//!
//! let verifier = EventVerifier::new(&tc, "default");
//! let share = InvolvedObject::new("SmbShare", "tshare1").with_uid(uid);
//! let tally = verifier.verify(&share, &EventExpectations::created_once()).await?;
//! println!("{tally}");
//! ```

use crate::cluster::{ClusterApi, ClusterError};
use k8s_openapi::api::core::v1::Event;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Kind of the share resource the controller reconciles
pub const SMBSHARE_KIND: &str = "SmbShare";

/// Reason emitted when the controller creates the share's volume claim
pub const REASON_CREATED_PVC: &str = "CreatedPersistentVolumeClaim";

/// Reason emitted when the controller creates the share's server deployment
pub const REASON_CREATED_DEPLOYMENT: &str = "CreatedDeployment";

/// Identity of the object events are filtered by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvolvedObject {
    pub kind: String,
    pub name: String,
    /// Unique id; when absent matching falls back to kind and name
    pub uid: Option<String>,
}

impl InvolvedObject {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            uid: None,
        }
    }

    /// Narrow the match to one incarnation of the object
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Field selector for the events list call
    pub fn field_selector(&self) -> String {
        let mut selector = format!(
            "involvedObject.kind={},involvedObject.name={}",
            self.kind, self.name
        );
        if let Some(uid) = &self.uid {
            selector.push_str(&format!(",involvedObject.uid={uid}"));
        }
        selector
    }

    /// Whether an event refers to this object
    pub fn matches(&self, event: &Event) -> bool {
        let involved = &event.involved_object;
        involved.kind.as_deref() == Some(self.kind.as_str())
            && involved.name.as_deref() == Some(self.name.as_str())
            && self
                .uid
                .as_ref()
                .map_or(true, |uid| involved.uid.as_deref() == Some(uid.as_str()))
    }
}

impl fmt::Display for InvolvedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{}/{} (uid {})", self.kind, self.name, uid),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Occurrence count per event reason
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTally {
    counts: BTreeMap<String, usize>,
}

impl EventTally {
    /// Tally a set of events by reason
    ///
    /// Events without a reason are counted under an empty string.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut counts = BTreeMap::new();
        for event in events {
            let reason = event.reason.clone().unwrap_or_default();
            *counts.entry(reason).or_insert(0) += 1;
        }
        Self { counts }
    }

    /// Occurrences of one reason (0 when never seen)
    pub fn count(&self, reason: &str) -> usize {
        self.counts.get(reason).copied().unwrap_or(0)
    }

    /// Total number of events tallied
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl fmt::Display for EventTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.counts.is_empty() {
            return write!(f, "{{}}");
        }
        let parts: Vec<String> = self.counts.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Exact counts expected for a set of reasons
///
/// Reasons not listed may occur any number of times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventExpectations {
    exact: BTreeMap<String, usize>,
}

impl EventExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expectations for a share: one claim and one deployment created
    pub fn created_once() -> Self {
        Self::new()
            .exactly(REASON_CREATED_PVC, 1)
            .exactly(REASON_CREATED_DEPLOYMENT, 1)
    }

    /// Require `reason` to occur exactly `count` times
    pub fn exactly(mut self, reason: impl Into<String>, count: usize) -> Self {
        self.exact.insert(reason.into(), count);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.exact.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Reasons whose observed count differs from the expected one
    pub fn mismatches(&self, tally: &EventTally) -> Vec<CountMismatch> {
        self.exact
            .iter()
            .filter(|(reason, expected)| tally.count(reason) != **expected)
            .map(|(reason, expected)| CountMismatch {
                reason: reason.clone(),
                expected: *expected,
                observed: tally.count(reason),
            })
            .collect()
    }
}

/// One reason whose count was off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMismatch {
    pub reason: String,
    pub expected: usize,
    pub observed: usize,
}

impl fmt::Display for CountMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, observed {}",
            self.reason, self.expected, self.observed
        )
    }
}

/// Errors from event verification
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("no events recorded for {0}")]
    NoEvents(String),

    #[error(
        "event counts for {object} do not match: {}; observed {observed}",
        .mismatches.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    Mismatch {
        object: String,
        mismatches: Vec<CountMismatch>,
        observed: EventTally,
    },

    #[error("{0}")]
    Cluster(#[from] ClusterError),
}

/// Lists and tallies events for a test-created object
pub struct EventVerifier<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: String,
}

impl<'a> EventVerifier<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }

    /// Tally every event whose involved object matches
    pub async fn tally(&self, involved: &InvolvedObject) -> Result<EventTally, EventError> {
        if involved.uid.is_none() {
            warn!(
                namespace = %self.namespace,
                object = %involved,
                "Correlating events by name only; events from an earlier object with the same name would be counted"
            );
        }

        let events = self.cluster.list_events(&self.namespace, involved).await?;
        // The server applies the field selector; re-check in case it ignored a term.
        let tally = EventTally::from_events(events.iter().filter(|e| involved.matches(e)));

        debug!(
            namespace = %self.namespace,
            object = %involved,
            tally = %tally,
            "Tallied events"
        );
        Ok(tally)
    }

    /// Tally events and check them against the expectations
    ///
    /// At least one event must exist, and every expected reason must occur
    /// exactly as often as declared. The observed tally is returned on
    /// success and carried in the error otherwise.
    pub async fn verify(
        &self,
        involved: &InvolvedObject,
        expected: &EventExpectations,
    ) -> Result<EventTally, EventError> {
        let tally = self.tally(involved).await?;

        if tally.is_empty() {
            return Err(EventError::NoEvents(involved.to_string()));
        }

        let mismatches = expected.mismatches(&tally);
        if !mismatches.is_empty() {
            return Err(EventError::Mismatch {
                object: involved.to_string(),
                mismatches,
                observed: tally,
            });
        }

        info!(
            namespace = %self.namespace,
            object = %involved,
            tally = %tally,
            "Event counts verified"
        );
        Ok(tally)
    }
}
