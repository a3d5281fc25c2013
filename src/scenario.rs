//! Table-driven share scenarios
//!
//! A [`Scenario`] is plain data: which fixtures to apply, which name the
//! controller's workload gets, which share it serves and who may use it.
//! [`ScenarioRunner`] runs the same sequence for every entry:
//!
//! 1. ensure fixtures
//! 2. wait for the share's pod to exist, then to be ready
//! 3. resolve the single pod and its address
//! 4. check share access by pod address and by service DNS name
//! 5. verify the share's event tally
//! 6. collect diagnostics if anything failed
//! 7. tear fixtures down and wait for them to disappear
//!
//! # Example
//!
//! ```ignore
//! use sharecheck::scenario::{Scenario, ScenarioRunner, ScenarioTable};
//! use sharecheck::share::{Auth, SmbClientPod};
//!
//! let table: ScenarioTable = [Scenario::new("users1")
//!     .fixture("smbsecurityconfig1.yaml")
//!     .fixture("smbshare1.yaml")
//!     .resource("tshare1")
//!     .share("My Share")
//!     .auth(Auth::new("sambauser", "1nsecurely"))]
//! .into_iter()
//! .collect();
//!
//! let probe = SmbClientPod::new(&tc, &config.namespace, &config.smbclient_pod);
//! let suite = ScenarioRunner::new(&tc, &probe, &config).run_all(&table).await;
//! suite.assert_passed();
//! ```

use crate::cluster::ClusterApi;
use crate::config::HarnessConfig;
use crate::diagnostics::Diagnostics;
use crate::eventually::ConditionError;
use crate::events::{EventError, EventExpectations, EventTally, EventVerifier, InvolvedObject, SMBSHARE_KIND};
use crate::fixtures::{FixtureError, FixtureManager, FixtureSource};
use crate::locator::{service_dns_name, LabelSelector, LocateError, Locator};
use crate::share::{AccessError, Auth, Host, Share, ShareAccess};
use futures::FutureExt;
use kube::api::DynamicObject;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

/// Which wait a scenario was in when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    Exists,
    Ready,
}

impl fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exists => f.write_str("existence"),
            Self::Ready => f.write_str("readiness"),
        }
    }
}

/// Error type for scenario runs
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("setup failed: {0}")]
    Setup(#[source] FixtureError),

    #[error("pod {phase} wait failed: {source}")]
    Wait {
        phase: WaitPhase,
        source: ConditionError,
    },

    #[error("could not resolve share pod: {0}")]
    Locate(#[from] LocateError),

    #[error("share access by {endpoint} failed: {}", .failures.join("; "))]
    Access {
        endpoint: Endpoint,
        failures: Vec<String>,
    },

    #[error("event check failed: {0}")]
    Events(#[from] EventError),

    #[error("teardown failed: {0}")]
    Teardown(#[source] FixtureError),

    #[error("fixtures still present after teardown: {0}")]
    NotRemoved(#[source] ConditionError),

    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),

    #[error("verification panicked: {0}")]
    Panicked(String),
}

/// One end-to-end share test case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub name: String,
    /// Fixture files, relative to the configured files directory
    pub fixtures: Vec<PathBuf>,
    /// Name the controller gives the share's workload and service
    pub resource_name: String,
    /// Share name clients see
    pub share_name: String,
    /// Credentials that must be able to use the share
    pub auths: Vec<Auth>,
    /// Credentials that must be refused
    pub denied_auths: Vec<Auth>,
    pub events: EventExpectations,
}

impl Scenario {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fixtures: Vec::new(),
            resource_name: String::new(),
            share_name: String::new(),
            auths: Vec::new(),
            denied_auths: Vec::new(),
            events: EventExpectations::created_once(),
        }
    }

    /// Add a fixture file; fixtures are applied in the order added
    #[must_use]
    pub fn fixture(mut self, path: impl Into<PathBuf>) -> Self {
        self.fixtures.push(path.into());
        self
    }

    #[must_use]
    pub fn resource(mut self, name: impl Into<String>) -> Self {
        self.resource_name = name.into();
        self
    }

    #[must_use]
    pub fn share(mut self, name: impl Into<String>) -> Self {
        self.share_name = name.into();
        self
    }

    #[must_use]
    pub fn auth(mut self, auth: Auth) -> Self {
        self.auths.push(auth);
        self
    }

    #[must_use]
    pub fn denied(mut self, auth: Auth) -> Self {
        self.denied_auths.push(auth);
        self
    }

    /// Replace the default event expectations
    #[must_use]
    pub fn expect_events(mut self, events: EventExpectations) -> Self {
        self.events = events;
        self
    }

    /// Selector for the controller-managed objects of this scenario
    pub fn selector(&self) -> LabelSelector {
        LabelSelector::for_service(&self.resource_name)
    }

    /// Fixture sources resolved against the configuration
    pub fn sources(&self, config: &HarnessConfig) -> Vec<FixtureSource> {
        self.fixtures
            .iter()
            .map(|f| FixtureSource::new(config.fixture_path(f), config.namespace.clone()))
            .collect()
    }
}

/// Scenarios keyed by name
#[derive(Debug, Clone, Default)]
pub struct ScenarioTable {
    scenarios: BTreeMap<String, Scenario>,
}

impl ScenarioTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a scenario, replacing any with the same name
    pub fn insert(&mut self, scenario: Scenario) {
        self.scenarios.insert(scenario.name.clone(), scenario);
    }

    pub fn get(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.scenarios.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.values()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// A table holding only the named scenarios
    pub fn select<'n>(
        &self,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Result<ScenarioTable, ScenarioError> {
        names
            .into_iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| ScenarioError::UnknownScenario(name.to_string()))
            })
            .collect()
    }
}

impl FromIterator<Scenario> for ScenarioTable {
    fn from_iter<I: IntoIterator<Item = Scenario>>(iter: I) -> Self {
        let mut table = Self::new();
        for scenario in iter {
            table.insert(scenario);
        }
        table
    }
}

/// How the share server was addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    PodAddress,
    ServiceName,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PodAddress => f.write_str("pod address"),
            Self::ServiceName => f.write_str("service name"),
        }
    }
}

/// What a credential was expected to get
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Granted,
    Denied,
}

/// What a credential actually got
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    Granted,
    Denied(String),
    Failed(String),
}

impl From<Result<(), AccessError>> for AccessOutcome {
    fn from(result: Result<(), AccessError>) -> Self {
        match result {
            Ok(()) => Self::Granted,
            Err(e) if e.is_denied() => Self::Denied(e.to_string()),
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// Result of one credential against one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialResult {
    pub user: String,
    pub expected: Expectation,
    pub outcome: AccessOutcome,
}

impl CredentialResult {
    pub fn passed(&self) -> bool {
        matches!(
            (self.expected, &self.outcome),
            (Expectation::Granted, AccessOutcome::Granted)
                | (Expectation::Denied, AccessOutcome::Denied(_))
        )
    }
}

impl fmt::Display for CredentialResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.expected, &self.outcome) {
            (Expectation::Granted, AccessOutcome::Granted) => write!(f, "{}: granted", self.user),
            (Expectation::Denied, AccessOutcome::Denied(_)) => {
                write!(f, "{}: denied as expected", self.user)
            }
            (Expectation::Denied, AccessOutcome::Granted) => {
                write!(f, "{}: expected denial, got access", self.user)
            }
            (_, AccessOutcome::Denied(detail)) | (_, AccessOutcome::Failed(detail)) => {
                write!(f, "{}: {}", self.user, detail)
            }
        }
    }
}

/// Credential results for one endpoint
#[derive(Debug, Clone)]
pub struct AccessReport {
    pub endpoint: Endpoint,
    pub share: Share,
    pub results: Vec<CredentialResult>,
}

impl AccessReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(CredentialResult::passed)
    }

    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed())
            .map(ToString::to_string)
            .collect()
    }
}

/// Checks every credential of a scenario against one endpoint
///
/// Used unchanged for the pod address and the service name.
pub struct ShareAccessCheck<'s> {
    share_name: &'s str,
    allowed: &'s [Auth],
    denied: &'s [Auth],
}

impl<'s> ShareAccessCheck<'s> {
    pub fn new(share_name: &'s str, allowed: &'s [Auth], denied: &'s [Auth]) -> Self {
        Self {
            share_name,
            allowed,
            denied,
        }
    }

    pub fn for_scenario(scenario: &'s Scenario) -> Self {
        Self::new(&scenario.share_name, &scenario.auths, &scenario.denied_auths)
    }

    /// Try every credential; one failure does not skip the rest
    pub async fn run(&self, probe: &dyn ShareAccess, endpoint: Endpoint, host: Host) -> AccessReport {
        let share = Share::new(host, self.share_name);
        let mut results = Vec::with_capacity(self.allowed.len() + self.denied.len());

        let expectations = self
            .allowed
            .iter()
            .map(|a| (a, Expectation::Granted))
            .chain(self.denied.iter().map(|a| (a, Expectation::Denied)));

        for (auth, expected) in expectations {
            let outcome = AccessOutcome::from(probe.check_access(&share, auth).await);
            let result = CredentialResult {
                user: auth.username.clone(),
                expected,
                outcome,
            };
            if !result.passed() {
                warn!(endpoint = %endpoint, share = %share, result = %result, "Share access check failed");
            }
            results.push(result);
        }

        AccessReport {
            endpoint,
            share,
            results,
        }
    }
}

/// Outcome of one scenario run
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    /// Every failure in the order it happened
    pub failures: Vec<ScenarioError>,
    pub access: Vec<AccessReport>,
    pub tally: Option<EventTally>,
    /// Collected before teardown when the scenario failed
    pub diagnostics: Option<Diagnostics>,
    pub elapsed: Duration,
}

impl ScenarioReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failures: Vec::new(),
            access: Vec::new(),
            tally: None,
            diagnostics: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.passed() { "✓" } else { "✗" };
        writeln!(f, "{} {} ({:.1?})", mark, self.name, self.elapsed)?;

        for access in &self.access {
            writeln!(f, "    {} {}", access.endpoint, access.share)?;
            for result in &access.results {
                let mark = if result.passed() { "✓" } else { "✗" };
                writeln!(f, "      {} {}", mark, result)?;
            }
        }
        if let Some(tally) = &self.tally {
            writeln!(f, "    events {}", tally)?;
        }
        for failure in &self.failures {
            writeln!(f, "    - {}", failure)?;
        }
        Ok(())
    }
}

/// Reports for every scenario in a run
#[derive(Debug, Default)]
pub struct SuiteReport {
    pub reports: Vec<ScenarioReport>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.reports.iter().all(ScenarioReport::passed)
    }

    /// Names of the failed scenarios
    pub fn failed(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| !r.passed())
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioReport> {
        self.reports.iter().find(|r| r.name == name)
    }

    /// Panic with the full report unless every scenario passed
    #[track_caller]
    pub fn assert_passed(&self) {
        assert!(self.passed(), "{}", self);
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.reports {
            write!(f, "{}", report)?;
        }
        let failed = self.failed().len();
        writeln!(
            f,
            "{} scenarios: {} passed, {} failed",
            self.reports.len(),
            self.reports.len() - failed,
            failed
        )?;
        for report in &self.reports {
            if let Some(diag) = &report.diagnostics {
                write!(f, "{}", diag)?;
            }
        }
        Ok(())
    }
}

/// Runs scenarios against a cluster
pub struct ScenarioRunner<'a> {
    cluster: &'a dyn ClusterApi,
    probe: &'a dyn ShareAccess,
    config: &'a HarnessConfig,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(
        cluster: &'a dyn ClusterApi,
        probe: &'a dyn ShareAccess,
        config: &'a HarnessConfig,
    ) -> Self {
        Self {
            cluster,
            probe,
            config,
        }
    }

    /// Run every scenario in the table, one after another
    ///
    /// A failing scenario is torn down before the next one starts.
    pub async fn run_all(&self, table: &ScenarioTable) -> SuiteReport {
        let mut suite = SuiteReport::default();
        for scenario in table.iter() {
            suite.reports.push(self.run(scenario).await);
        }
        info!(
            scenarios = suite.reports.len(),
            failed = suite.failed().len(),
            "Scenario suite finished"
        );
        suite
    }

    /// Run one scenario from setup through teardown
    #[instrument(skip(self, scenario), fields(scenario = %scenario.name, namespace = %self.config.namespace))]
    pub async fn run(&self, scenario: &Scenario) -> ScenarioReport {
        let start = Instant::now();
        let mut report = ScenarioReport::new(&scenario.name);
        let mut fixtures = FixtureManager::new(self.cluster);

        match fixtures.ensure_all(&scenario.sources(self.config)).await {
            Ok(objects) => {
                let uid = share_uid(&objects, &scenario.resource_name);
                // A panic while checking access must not skip teardown.
                let verified = AssertUnwindSafe(self.verify(scenario, uid, &mut report))
                    .catch_unwind()
                    .await;
                match verified {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => report.failures.push(e),
                    Err(panic) => report
                        .failures
                        .push(ScenarioError::Panicked(panic_message(panic.as_ref()))),
                }
            }
            Err(e) => report.failures.push(ScenarioError::Setup(e)),
        }

        if !report.passed() {
            let involved = [InvolvedObject::new(SMBSHARE_KIND, &scenario.resource_name)];
            let diag = Diagnostics::collect(
                self.cluster,
                &self.config.namespace,
                &scenario.selector(),
                &involved,
            )
            .await;
            report.diagnostics = Some(diag.for_scenario(&scenario.name));
        }

        self.teardown(&mut fixtures, &mut report).await;
        report.elapsed = start.elapsed();

        if report.passed() {
            info!(elapsed = ?report.elapsed, "Scenario passed");
        } else {
            warn!(elapsed = ?report.elapsed, failures = report.failures.len(), "Scenario failed");
        }
        report
    }

    /// Waits, then the three independent checks
    ///
    /// Wait and resolution errors end the scenario early and are returned;
    /// access and event failures are recorded and the other checks still run.
    async fn verify(
        &self,
        scenario: &Scenario,
        share_uid: Option<String>,
        report: &mut ScenarioReport,
    ) -> Result<(), ScenarioError> {
        let namespace = self.config.namespace.as_str();
        let locator = Locator::new(self.cluster, namespace).interval(self.config.poll_interval);
        let selector = scenario.selector();

        locator
            .wait_for_pod_exists(&selector, self.config.exist_timeout)
            .await
            .map_err(|source| ScenarioError::Wait {
                phase: WaitPhase::Exists,
                source,
            })?;
        locator
            .wait_for_pod_ready(&selector, self.config.ready_timeout)
            .await
            .map_err(|e| match e {
                LocateError::Wait(source) => ScenarioError::Wait {
                    phase: WaitPhase::Ready,
                    source,
                },
                other => ScenarioError::Locate(other),
            })?;

        let address = locator.pod_address(&selector).await?;
        let check = ShareAccessCheck::for_scenario(scenario);
        let endpoints = [
            (Endpoint::PodAddress, Host::from(address)),
            (
                Endpoint::ServiceName,
                Host::from(service_dns_name(&scenario.resource_name, namespace)),
            ),
        ];
        for (endpoint, host) in endpoints {
            let access = check.run(self.probe, endpoint, host).await;
            if !access.passed() {
                report.failures.push(ScenarioError::Access {
                    endpoint,
                    failures: access.failures(),
                });
            }
            report.access.push(access);
        }

        let mut involved = InvolvedObject::new(SMBSHARE_KIND, &scenario.resource_name);
        if let Some(uid) = share_uid {
            involved = involved.with_uid(uid);
        }
        match EventVerifier::new(self.cluster, namespace)
            .verify(&involved, &scenario.events)
            .await
        {
            Ok(tally) => report.tally = Some(tally),
            Err(e) => {
                if let EventError::Mismatch { observed, .. } = &e {
                    report.tally = Some(observed.clone());
                }
                report.failures.push(ScenarioError::Events(e));
            }
        }

        Ok(())
    }

    async fn teardown(&self, fixtures: &mut FixtureManager<'_>, report: &mut ScenarioReport) {
        match fixtures.teardown().await {
            Ok(removed) => {
                if let Err(e) = fixtures
                    .wait_removed(&removed, self.config.removal_timeout, self.config.poll_interval)
                    .await
                {
                    report.failures.push(ScenarioError::NotRemoved(e));
                }
            }
            Err(e) => report.failures.push(ScenarioError::Teardown(e)),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// UID of the scenario's share among the ensured fixture objects
fn share_uid(objects: &[DynamicObject], resource_name: &str) -> Option<String> {
    objects
        .iter()
        .find(|o| {
            o.types.as_ref().is_some_and(|t| t.kind == SMBSHARE_KIND)
                && o.metadata.name.as_deref() == Some(resource_name)
        })
        .and_then(|o| o.metadata.uid.clone())
}
