//! Baseline: repo-wide gate commands run once per unit after its tasks.
//!
//! Each named check goes through the backpressure runner; failures are
//! collected into one combined report so a single fix prompt can carry
//! everything.

use crate::backpressure::{self, BackpressureError};
use choo_core::config::BaselineCheck;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub type Result<T> = std::result::Result<T, BackpressureError>;

/// Outcome of a full baseline pass.
#[derive(Debug, Clone)]
pub struct BaselineResult {
    pub all_passed: bool,
    /// `=== <name> ===` blocks for every failed check, in order.
    pub failure_output: String,
    pub failed_checks: Vec<String>,
}

/// Run every check in order; an empty list passes.
pub async fn run(
    cancel: &CancellationToken,
    checks: &[BaselineCheck],
    workdir: &Path,
    timeout: Duration,
) -> Result<BaselineResult> {
    let mut failure_output = String::new();
    let mut failed_checks = Vec::new();

    for check in checks {
        let result = backpressure::run(cancel, &check.command, workdir, timeout).await?;
        if !result.ok {
            info!(check = %check.name, exit_code = ?result.exit_code, "baseline check failed");
            failure_output.push_str(&format!("=== {} ===\n{}\n", check.name, result.combined_output));
            failed_checks.push(check.name.clone());
        }
    }

    Ok(BaselineResult {
        all_passed: failed_checks.is_empty(),
        failure_output,
        failed_checks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn check(name: &str, command: &str) -> BaselineCheck {
        BaselineCheck {
            name: name.to_string(),
            command: command.to_string(),
        }
    }

    #[tokio::test]
    async fn empty_check_list_passes() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let result = run(&cancel, &[], dir.path(), TIMEOUT).await.unwrap();
        assert!(result.all_passed);
        assert!(result.failure_output.is_empty());
    }

    #[tokio::test]
    async fn all_passing_checks_pass() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let checks = vec![check("fmt", "exit 0"), check("lint", "true")];
        let result = run(&cancel, &checks, dir.path(), TIMEOUT).await.unwrap();
        assert!(result.all_passed);
        assert!(result.failed_checks.is_empty());
    }

    #[tokio::test]
    async fn failure_produces_named_block() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let checks = vec![check("fmt", "echo bad fmt; exit 1")];
        let result = run(&cancel, &checks, dir.path(), TIMEOUT).await.unwrap();
        assert!(!result.all_passed);
        assert_eq!(result.failed_checks, vec!["fmt".to_string()]);
        assert_eq!(result.failure_output, "=== fmt ===\nbad fmt\n\n");
    }

    #[tokio::test]
    async fn later_checks_still_run_after_failure() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let checks = vec![
            check("first", "echo one; exit 1"),
            check("second", "exit 0"),
            check("third", "echo three; exit 1"),
        ];
        let result = run(&cancel, &checks, dir.path(), TIMEOUT).await.unwrap();
        assert_eq!(
            result.failed_checks,
            vec!["first".to_string(), "third".to_string()]
        );
        assert!(result.failure_output.contains("=== first ==="));
        assert!(result.failure_output.contains("=== third ==="));
        assert!(!result.failure_output.contains("=== second ==="));
    }
}
