//! Built-in share scenarios
//!
//! Fixture file names refer to the operator's test files directory
//! (`SMBOP_TEST_FILES_DIR`).

use crate::scenario::{Scenario, ScenarioTable};
use crate::share::Auth;

/// Local users from a security config secret
pub fn users1() -> Scenario {
    Scenario::new("users1")
        .fixture("smbsecurityconfig1.yaml")
        .fixture("smbshare1.yaml")
        .resource("tshare1")
        .share("My Share")
        .auth(Auth::new("sambauser", "1nsecurely"))
        .denied(Auth::new("sambauser", "not-the-password"))
}

/// Share joined to an Active Directory domain
pub fn domain_member1() -> Scenario {
    Scenario::new("domainMember1")
        .fixture("smbsecurityconfig2.yaml")
        .fixture("smbshare2.yaml")
        .resource("tshare2")
        .share("My Kingdom")
        .auth(Auth::new("DOMAIN1\\bwayne", "1115Rose."))
        .denied(Auth::new("DOMAIN1\\bwayne", "not-the-password"))
}

/// Every built-in scenario, keyed by name
pub fn smbshare_scenarios() -> ScenarioTable {
    [users1(), domain_member1()].into_iter().collect()
}
