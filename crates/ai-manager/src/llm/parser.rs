use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sanitizer::sanitize_response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    Json,
    Yaml,
    Unknown,
}

impl ResponseFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Unknown => "unknown",
        }
    }
}

/// One validation problem. `path` is a JSON pointer; empty means the document
/// root or no specific location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ValidationIssue {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            path: String::new(),
            message: message.into(),
            value: None,
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub format: ResponseFormat,
    pub data: Option<Value>,
    pub errors: Vec<ValidationIssue>,
    pub sanitized_text: String,
}

impl ValidationResult {
    pub fn parsed(format: ResponseFormat, data: Value, sanitized_text: String) -> Self {
        Self {
            valid: true,
            format,
            data: Some(data),
            errors: Vec::new(),
            sanitized_text,
        }
    }

    pub fn failed(errors: Vec<ValidationIssue>, sanitized_text: String) -> Self {
        Self {
            valid: false,
            format: ResponseFormat::Unknown,
            data: None,
            errors,
            sanitized_text,
        }
    }

    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Sanitizes `raw` and parses the remainder as JSON or YAML.
pub fn validate_structured_response(raw: &str) -> ValidationResult {
    parse_structured(&sanitize_response(raw))
}

/// Parses already-sanitized text, JSON first, then YAML.
///
/// A YAML document that is empty, null, or a bare scalar counts as a failure:
/// plain prose parses as a YAML string and must not be accepted as data.
pub fn parse_structured(sanitized: &str) -> ValidationResult {
    if sanitized.trim().is_empty() {
        return ValidationResult::failed(
            vec![ValidationIssue::message("Empty response after sanitization")],
            sanitized.to_string(),
        );
    }

    let json_error = match serde_json::from_str::<Value>(sanitized) {
        Ok(data) => {
            return ValidationResult::parsed(ResponseFormat::Json, data, sanitized.to_string());
        }
        Err(err) => err,
    };

    let yaml_error = match serde_yaml::from_str::<Value>(sanitized) {
        Ok(data @ (Value::Object(_) | Value::Array(_))) => {
            return ValidationResult::parsed(ResponseFormat::Yaml, data, sanitized.to_string());
        }
        Ok(Value::Null) => "document is empty".to_string(),
        Ok(_) => "document is a scalar, not a mapping or sequence".to_string(),
        Err(err) => err.to_string(),
    };

    ValidationResult::failed(
        vec![
            ValidationIssue::message(format!("JSON error: {json_error}")),
            ValidationIssue::message(format!("YAML error: {yaml_error}")),
        ],
        sanitized.to_string(),
    )
}
