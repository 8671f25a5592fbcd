use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How test branches are shared between tests and parallel workers.
///
/// The policy decides who creates branches, whether migrations are coordinated across worker
/// processes and whether the branch is reset between tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SharingPolicy {
    /// One branch for the whole session, shared by every worker. Tests see each other's writes.
    #[default]
    Session,
    /// One migrated branch shared by every worker, each worker forks its own test branch from it
    /// and resets that branch to the migrated state after every read-write test.
    ResetPerTest,
    /// Every worker creates and owns an independent branch, no cross-worker coordination.
    PerWorker,
}

impl SharingPolicy {
    /// Returns the configuration name of the policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            SharingPolicy::Session => "session",
            SharingPolicy::ResetPerTest => "reset_per_test",
            SharingPolicy::PerWorker => "per_worker",
        }
    }

    /// Returns `true` when workers must agree on a single creator for the shared branch.
    pub fn is_coordinated(&self) -> bool {
        !matches!(self, SharingPolicy::PerWorker)
    }
}

impl fmt::Display for SharingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SharingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "session" => Ok(SharingPolicy::Session),
            "reset_per_test" => Ok(SharingPolicy::ResetPerTest),
            "per_worker" => Ok(SharingPolicy::PerWorker),
            other => Err(format!(
                "{other} is not a supported sharing policy. Use one of `session`, `reset_per_test` or `per_worker`."
            )),
        }
    }
}
