use super::LiveEvent;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Validation errors for live events
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    MissingRoute,
    EmptyBody,
    InvalidJson(String),
    PayloadNotObject,
    MissingField(String),
    InvalidField { field: String, expected: &'static str },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingRoute => write!(f, "route is required"),
            ValidationError::EmptyBody => write!(f, "request body is empty"),
            ValidationError::InvalidJson(e) => write!(f, "body is not valid JSON: {}", e),
            ValidationError::PayloadNotObject => write!(f, "payload must be a JSON object"),
            ValidationError::MissingField(field) => write!(f, "'{}' is required", field),
            ValidationError::InvalidField { field, expected } => {
                write!(f, "'{}' must be {}", field, expected)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates an inbound request and wraps it as a LiveEvent.
///
/// Validation rules:
/// - Route: non-empty
/// - Body: non-empty, valid JSON, and a JSON object
pub(super) fn build_event(
    route: &str,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
) -> Result<LiveEvent, ValidationError> {
    if route.trim().is_empty() {
        return Err(ValidationError::MissingRoute);
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ValidationError::EmptyBody);
    }

    let payload: Value =
        serde_json::from_slice(&body).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
    if !payload.is_object() {
        return Err(ValidationError::PayloadNotObject);
    }

    Ok(LiveEvent {
        id: Uuid::now_v7(),
        route: route.to_string(),
        headers,
        body,
        payload,
        received_at: Utc::now(),
    })
}

/// Look up a dotted path (`repository.full_name`), failing when it is
/// absent or null.
pub fn require_field<'a>(payload: &'a Value, path: &str) -> Result<&'a Value, ValidationError> {
    let mut current = payload;
    for segment in path.split('.') {
        current = match current.get(segment) {
            Some(value) if !value.is_null() => value,
            _ => return Err(ValidationError::MissingField(path.to_string())),
        };
    }
    Ok(current)
}

/// Like [`require_field`], for non-empty strings.
pub fn require_str<'a>(payload: &'a Value, path: &str) -> Result<&'a str, ValidationError> {
    match require_field(payload, path)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        _ => Err(ValidationError::InvalidField {
            field: path.to_string(),
            expected: "a non-empty string",
        }),
    }
}
