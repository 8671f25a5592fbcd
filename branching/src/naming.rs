//! Generation of branch names.
//!
//! Names look like `cargotest-[prefix-][git-]{hex4}{suffix}` so that branches left behind can be
//! traced back to the project and the git branch that created them.

use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// First token of every generated branch name.
pub const BRANCH_NAME_ROOT: &str = "cargotest";

/// Maximum length of the prefix and git branch tokens.
pub const MAX_TOKEN_LEN: usize = 15;

/// How long `git` may take to report the current branch.
const GIT_TIMEOUT: Duration = Duration::from_secs(5);

/// What a branch is used for, reflected in the name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPurpose {
    /// Branch on which tests run.
    Test,
    /// Branch holding the migrated schema, parent of per-worker test branches.
    Migrated,
    /// Branch shared by every worker.
    Shared,
}

impl BranchPurpose {
    pub fn suffix(&self) -> &'static str {
        match self {
            BranchPurpose::Test => "-test",
            BranchPurpose::Migrated => "-migrated",
            BranchPurpose::Shared => "-shared",
        }
    }
}

/// Replaces characters outside `[A-Za-z0-9_-]` with `-`, collapses runs of `-` and trims them
/// from both ends.
pub fn sanitize_token(token: &str) -> String {
    let mut sanitized = String::with_capacity(token.len());

    for c in token.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            c
        } else {
            '-'
        };

        if c == '-' && sanitized.ends_with('-') {
            continue;
        }
        sanitized.push(c);
    }

    sanitized.trim_matches('-').to_string()
}

/// Sanitizes `token` and truncates it to [`MAX_TOKEN_LEN`] characters.
///
/// Returns `None` when nothing is left.
fn name_token(token: &str) -> Option<String> {
    let sanitized = sanitize_token(token);
    // Sanitized tokens are ASCII so byte and char lengths agree.
    let truncated = &sanitized[..sanitized.len().min(MAX_TOKEN_LEN)];
    let token = truncated.trim_matches('-');

    (!token.is_empty()).then(|| token.to_string())
}

/// Builds a branch name from its parts.
pub fn branch_name(
    prefix: Option<&str>,
    git_branch: Option<&str>,
    random: &str,
    purpose: BranchPurpose,
) -> String {
    let mut parts = vec![BRANCH_NAME_ROOT.to_string()];
    parts.extend(prefix.and_then(name_token));
    parts.extend(git_branch.and_then(name_token));
    parts.push(format!("{random}{}", purpose.suffix()));

    parts.join("-")
}

/// Returns four random lowercase hex characters.
pub fn random_suffix() -> String {
    format!("{:04x}", rand::random::<u16>())
}

/// Generates a unique branch name, including the current git branch when available.
pub async fn generate_branch_name(prefix: Option<&str>, purpose: BranchPurpose) -> String {
    let git_branch = current_git_branch().await;

    branch_name(prefix, git_branch.as_deref(), &random_suffix(), purpose)
}

/// Returns the current git branch, or `None` outside of a repository or when `git` is not
/// available within a few seconds.
pub async fn current_git_branch() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(GIT_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(_)) => return None,
        Ok(Err(err)) => {
            debug!(error = %err, "could not run git");
            return None;
        }
        Err(_) => {
            debug!("timed out reading the current git branch");
            return None;
        }
    };

    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!branch.is_empty()).then_some(branch)
}
