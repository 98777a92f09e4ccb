//! Caller-facing outcome of one program
//!
//! Every path through the dispatcher ends in exactly one `ProgramResult`.
//! Optional fields are only present when they carry information.

use serde::{Deserialize, Serialize};

use crate::execution::{ExecutionReport, StartError, Termination};
use crate::program::Problems;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramResult {
    /// Ran to completion and exited with status 0
    pub success: bool,
    /// The runtime accepted the program text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled: Option<bool>,
    /// The wall-clock deadline was exceeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Present (and true) only when captured output was cut at the byte cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl ProgramResult {
    /// Map a finished execution
    pub fn from_report(report: &ExecutionReport) -> Self {
        let mut result = Self {
            success: false,
            compiled: None,
            timeout: Some(false),
            exit_code: None,
            error: None,
            stdout: non_empty(&report.stdout),
            stderr: non_empty(&report.stderr),
            truncated: report.truncated.then_some(true),
        };

        match &report.termination {
            Termination::Exited(code) => {
                result.success = *code == 0;
                result.compiled = Some(true);
                result.exit_code = Some(*code);
            }
            Termination::Signaled(signal) => {
                result.error = Some(format!("terminated by signal {}", signal));
            }
            Termination::DeadlineExceeded => {
                result.timeout = Some(true);
                result.error = Some("deadline exceeded".to_string());
            }
            Termination::Canceled => {
                result.error = Some("execution canceled".to_string());
            }
            Termination::WaitFailed(msg) => {
                result.compiled = Some(true);
                result.error = Some(msg.clone());
            }
            Termination::Abandoned => {
                result.error = Some("execution ended without a result".to_string());
            }
        }

        result
    }

    /// The program failed admission; nothing was started
    pub fn rejected(problems: &Problems) -> Self {
        Self {
            error: Some(problems.to_string()),
            ..Self::default()
        }
    }

    /// The process could not be started
    pub fn start_failed(err: &StartError) -> Self {
        Self {
            timeout: Some(false),
            error: Some(err.to_string()),
            ..Self::default()
        }
    }

    /// The batch was canceled while this program waited for a slot
    pub fn canceled_before_start() -> Self {
        Self::start_failed(&StartError::Canceled)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn report(termination: Termination, stdout: &str, stderr: &str) -> ExecutionReport {
        ExecutionReport::new(
            termination,
            stdout.to_string(),
            stderr.to_string(),
            Duration::from_millis(10),
            false,
        )
    }

    #[test]
    fn test_clean_exit() {
        let result = ProgramResult::from_report(&report(Termination::Exited(0), "hi\n", ""));

        assert!(result.success);
        assert_eq!(result.compiled, Some(true));
        assert_eq!(result.timeout, Some(false));
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.error, None);
        assert_eq!(result.stdout.as_deref(), Some("hi\n"));
        assert_eq!(result.stderr, None);
    }

    #[test]
    fn test_nonzero_exit_keeps_code() {
        let result = ProgramResult::from_report(&report(
            Termination::Exited(1),
            "",
            "Traceback (most recent call last):\n",
        ));

        assert!(!result.success);
        assert_eq!(result.compiled, Some(true));
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.error, None);
        assert!(result.stderr.unwrap().starts_with("Traceback"));
    }

    #[test]
    fn test_deadline_sets_timeout_flag() {
        let result =
            ProgramResult::from_report(&report(Termination::DeadlineExceeded, "partial\n", ""));

        assert!(!result.success);
        assert_eq!(result.timeout, Some(true));
        assert_eq!(result.compiled, None);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.error.as_deref(), Some("deadline exceeded"));
        assert_eq!(result.stdout.as_deref(), Some("partial\n"));
    }

    #[test]
    fn test_signal_and_cancel_have_no_exit_code() {
        for termination in [Termination::Signaled(9), Termination::Canceled] {
            let result = ProgramResult::from_report(&report(termination, "", ""));
            assert!(!result.success);
            assert_eq!(result.timeout, Some(false));
            assert_eq!(result.exit_code, None);
            assert!(result.error.is_some());
        }
    }

    #[test]
    fn test_rejection_shape() {
        let mut problems = Problems::new();
        problems.add("runtime", "unsupported runtime \"ruby\"");

        let value = serde_json::to_value(ProgramResult::rejected(&problems)).unwrap();
        assert_eq!(
            value,
            json!({"success": false, "error": "runtime: unsupported runtime \"ruby\""})
        );
    }

    #[test]
    fn test_start_failure_shape() {
        let err = StartError::Spawn {
            program: "python3".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let value = serde_json::to_value(ProgramResult::start_failed(&err)).unwrap();

        assert_eq!(value["success"], json!(false));
        assert_eq!(value["timeout"], json!(false));
        assert!(value.get("exitCode").is_none());
        assert!(value.get("compiled").is_none());
        assert!(value["error"].as_str().unwrap().contains("python3"));
    }

    #[test]
    fn test_camel_case_and_omission() {
        let mut report = report(Termination::Exited(2), "", "");
        report.truncated = true;
        let value = serde_json::to_value(ProgramResult::from_report(&report)).unwrap();

        assert_eq!(
            value,
            json!({
                "success": false,
                "compiled": true,
                "timeout": false,
                "exitCode": 2,
                "truncated": true
            })
        );
    }
}
