//! Sharecheck - acceptance harness for the samba-operator
//!
//! Drives a live cluster through share scenarios: apply fixtures, wait for
//! the controller's pod to converge, locate it by label, prove share access
//! over SMB and check that the controller emitted each creation event once.
//!
//! # Example
//!
//! ```ignore
//! use sharecheck::{catalog, HarnessConfig, ScenarioRunner, SmbClientPod, TestClient};
//!
//! #[sharecheck::test]
//! #[ignore] // Requires real cluster
//! async fn smbshare_suite(tc: &TestClient, config: HarnessConfig) {
//!     let probe = SmbClientPod::new(tc, &config.namespace, &config.smbclient_pod);
//!     ScenarioRunner::new(tc, &probe, &config)
//!         .run_all(&catalog::smbshare_scenarios())
//!         .await
//!         .assert_passed();
//! }
//! ```
//!
//! # Configuration
//!
//! ```bash
//! SMBOP_TEST_NAMESPACE=smbtest \
//! SMBOP_TEST_FILES_DIR=../samba-operator/tests/files \
//! cargo test -- --ignored
//! ```

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod diagnostics;
pub mod events;
pub mod eventually;
pub mod fixtures;
pub mod locator;
pub mod readiness;
pub mod scenario;
pub mod share;
pub mod telemetry;
pub mod wait;

// Re-export commonly used types
pub use cluster::{ClusterApi, ClusterError, ExecOutput, ObjectRef, TestClient};
pub use config::{ConfigError, HarnessConfig};
pub use diagnostics::Diagnostics;
pub use events::{EventError, EventExpectations, EventTally, EventVerifier, InvolvedObject};
pub use eventually::{eventually, ConditionError, Probe};
pub use fixtures::{FixtureError, FixtureManager, FixtureSource};
pub use locator::{service_dns_name, LabelSelector, LocateError, Locator};
pub use readiness::{Readiness, ReadyState};
pub use scenario::{Scenario, ScenarioError, ScenarioReport, ScenarioRunner, ScenarioTable, SuiteReport};
pub use share::{AccessError, Auth, Host, Share, ShareAccess, SmbClientPod};
pub use wait::WaitError;

// Re-export the test macro
pub use sharecheck_macros::test;

#[doc(hidden)]
pub mod __private {
    pub use futures::FutureExt;
}
