use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::types::RequestLimits;

/// Language accepted when a request names one explicitly
pub const SUPPORTED_LANGUAGE: &str = "python";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No code provided")]
    MissingCode,

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Language {0} not supported")]
    UnsupportedLanguage(String),
}

/// Validated code execution request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Source code to execute, never blank
    pub code: String,
    /// Text fed to the program's stdin, consumed line by line
    pub stdin: String,
    /// Wall-clock budget
    pub timeout: Duration,
}

/// Wire shape of `POST /run`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "stdin")]
    input: Option<String>,
    #[serde(default, alias = "timeout_ms")]
    timeout_ms: Option<u64>,
    #[serde(default)]
    language: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            stdin: String::new(),
            timeout: RequestLimits::default().default_timeout,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parses and validates a raw JSON body.
    pub fn validate(raw: &[u8], limits: &RequestLimits) -> Result<Self, ValidationError> {
        let raw: RawRequest = serde_json::from_slice(raw)
            .map_err(|e| ValidationError::MalformedRequest(e.to_string()))?;

        if let Some(language) = raw.language {
            if !language.eq_ignore_ascii_case(SUPPORTED_LANGUAGE) {
                return Err(ValidationError::UnsupportedLanguage(language));
            }
        }

        let code = match raw.code {
            Some(code) if !code.trim().is_empty() => code,
            _ => return Err(ValidationError::MissingCode),
        };

        let timeout = match raw.timeout_ms {
            None | Some(0) => limits.default_timeout,
            Some(ms) => Duration::from_millis(ms).min(limits.max_timeout),
        };

        Ok(Self {
            code,
            stdin: raw.input.unwrap_or_default(),
            timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(body: &str) -> Result<ExecutionRequest, ValidationError> {
        ExecutionRequest::validate(body.as_bytes(), &RequestLimits::default())
    }

    #[test]
    fn test_valid_request_uses_defaults() {
        let request = validate(r#"{"code": "print(1)"}"#).unwrap();
        assert_eq!(request.code, "print(1)");
        assert_eq!(request.stdin, "");
        assert_eq!(request.timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_input_and_stdin_alias() {
        let request = validate(r#"{"code": "x", "input": "a\nb"}"#).unwrap();
        assert_eq!(request.stdin, "a\nb");

        let request = validate(r#"{"code": "x", "stdin": "c"}"#).unwrap();
        assert_eq!(request.stdin, "c");
    }

    #[test]
    fn test_missing_or_blank_code() {
        assert_eq!(validate(r#"{}"#), Err(ValidationError::MissingCode));
        assert_eq!(validate(r#"{"code": null}"#), Err(ValidationError::MissingCode));
        assert_eq!(validate(r#"{"code": ""}"#), Err(ValidationError::MissingCode));
        assert_eq!(
            validate(r#"{"code": "  \n\t "}"#),
            Err(ValidationError::MissingCode)
        );
    }

    #[test]
    fn test_malformed_payloads() {
        for body in ["", "not json", "[1, 2]", r#""code""#, r#"{"code": 42}"#] {
            assert!(
                matches!(validate(body), Err(ValidationError::MalformedRequest(_))),
                "expected malformed for {body:?}"
            );
        }
    }

    #[test]
    fn test_timeout_is_clamped() {
        let request = validate(r#"{"code": "x", "timeoutMs": 600000}"#).unwrap();
        assert_eq!(request.timeout, Duration::from_millis(30_000));

        let request = validate(r#"{"code": "x", "timeout_ms": 250}"#).unwrap();
        assert_eq!(request.timeout, Duration::from_millis(250));

        let request = validate(r#"{"code": "x", "timeoutMs": 0}"#).unwrap();
        assert_eq!(request.timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_language_must_be_python() {
        assert!(validate(r#"{"code": "x", "language": "Python"}"#).is_ok());
        assert_eq!(
            validate(r#"{"code": "x", "language": "ruby"}"#),
            Err(ValidationError::UnsupportedLanguage("ruby".to_string()))
        );
    }
}
