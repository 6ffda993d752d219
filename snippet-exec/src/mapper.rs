use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::types::{ExecutionResult, ExitReason};

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";
pub const TIMEOUT_MESSAGE: &str = "Execution timed out";
pub const INTERNAL_ERROR_MESSAGE: &str = "Execution failed due to an internal error";

/// Response contract of `POST /run`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    pub success: bool,
    pub output: String,
}

impl RunResponse {
    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Turn an execution outcome into the caller-facing response.
///
/// stdout wins when non-empty, stderr otherwise. Timeouts and resource
/// exhaustion get fixed messages.
pub fn to_response(result: &ExecutionResult) -> RunResponse {
    let output = match result.exit_reason {
        ExitReason::Timeout => TIMEOUT_MESSAGE.to_string(),
        ExitReason::InternalError => match result.limit_exceeded {
            Some(limit) => format!("Resource limit exceeded: {}", limit),
            None => INTERNAL_ERROR_MESSAGE.to_string(),
        },
        ExitReason::Completed | ExitReason::NonZeroExit => {
            let (text, truncated) = if result.stdout.is_empty() {
                (&result.stderr, result.stderr_truncated)
            } else {
                (&result.stdout, result.stdout_truncated)
            };
            let mut output = scrub_paths(text);
            if truncated {
                output.push_str(TRUNCATION_MARKER);
            }
            output
        }
    };

    RunResponse {
        success: result.success,
        output,
    }
}

/// Hide interpreter and library locations in traceback frames
fn scrub_paths(text: &str) -> String {
    static FRAME_PATH: OnceLock<Regex> = OnceLock::new();
    let re = FRAME_PATH.get_or_init(|| {
        Regex::new(r#"File "/[^"]*""#).expect("traceback frame pattern is valid")
    });
    re.replace_all(text, r#"File "<internal>""#).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CapturedOutput, LimitExceeded};
    use std::time::Duration;

    fn result(reason: ExitReason, code: Option<i32>, stdout: &str, stderr: &str) -> ExecutionResult {
        ExecutionResult::new(
            reason,
            code,
            CapturedOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                ..Default::default()
            },
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_stdout_preferred() {
        let response = to_response(&result(ExitReason::Completed, Some(0), "hello\n", "warn"));
        assert_eq!(response, RunResponse { success: true, output: "hello\n".to_string() });
    }

    #[test]
    fn test_stderr_fallback() {
        let response = to_response(&result(
            ExitReason::NonZeroExit,
            Some(1),
            "",
            "ZeroDivisionError: division by zero\n",
        ));
        assert!(!response.success);
        assert_eq!(response.output, "ZeroDivisionError: division by zero\n");
    }

    #[test]
    fn test_timeout_message() {
        let response = to_response(&result(ExitReason::Timeout, None, "partial", ""));
        assert!(!response.success);
        assert_eq!(response.output, TIMEOUT_MESSAGE);
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let response = to_response(&result(
            ExitReason::InternalError,
            Some(1),
            "",
            "Traceback at /srv/secret/path.py",
        ));
        assert_eq!(response.output, INTERNAL_ERROR_MESSAGE);

        let exhausted = ExecutionResult::resource_exhausted(
            LimitExceeded::Memory,
            Some(1),
            CapturedOutput::default(),
            Duration::ZERO,
        );
        assert_eq!(
            to_response(&exhausted).output,
            "Resource limit exceeded: memory"
        );
    }

    #[test]
    fn test_frame_paths_scrubbed() {
        let stderr = "Traceback (most recent call last):\n  File \"main.py\", line 2, in <module>\n  File \"/usr/lib/python3.11/json/__init__.py\", line 346, in loads\njson.decoder.JSONDecodeError: Expecting value\n";
        let response = to_response(&result(ExitReason::NonZeroExit, Some(1), "", stderr));
        assert!(response.output.contains("File \"main.py\""));
        assert!(response.output.contains("File \"<internal>\""));
        assert!(!response.output.contains("/usr/lib"));
    }

    #[test]
    fn test_truncation_marker() {
        let mut truncated = result(ExitReason::Completed, Some(0), "xxxx", "");
        truncated.stdout_truncated = true;
        assert_eq!(to_response(&truncated).output, format!("xxxx{}", TRUNCATION_MARKER));
    }
}
