use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

mod validation;

pub use validation::{require_field, require_str, ValidationError};

/// LiveEvent is one inbound webhook call, as queued for processing.
///
/// Events carry the raw body (signatures are computed over it), the parsed
/// JSON payload and the request headers. Ids are UUIDv7, so they sort by
/// arrival time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveEvent {
    pub id: Uuid,

    /// Ingress route the event arrived on (e.g. "github")
    pub route: String,

    /// Request headers, names lowercased
    pub headers: BTreeMap<String, String>,

    /// Raw request body
    #[serde(skip)]
    pub body: Vec<u8>,

    /// Parsed body; always a JSON object
    pub payload: Value,

    pub received_at: DateTime<Utc>,
}

impl LiveEvent {
    /// Build an event from an inbound request.
    ///
    /// Rejects empty routes, empty bodies and bodies that are not a JSON
    /// object. Header names are lowercased.
    pub fn from_request<I, K, V>(
        route: &str,
        headers: I,
        body: Vec<u8>,
    ) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();
        validation::build_event(route, headers, body)
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Processing state of a live event.
///
/// QUEUED → AUTHENTICATING → VALIDATING → FETCHING → MAPPING → APPLYING,
/// ending in COMPLETED, FAILED or DISCARDED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Queued,
    Authenticating,
    Validating,
    Fetching,
    Mapping,
    Applying,
    Completed,
    Failed,
    Discarded,
}

impl EventState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventState::Completed | EventState::Failed | EventState::Discarded
        )
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventState::Queued => "queued",
            EventState::Authenticating => "authenticating",
            EventState::Validating => "validating",
            EventState::Fetching => "fetching",
            EventState::Mapping => "mapping",
            EventState::Applying => "applying",
            EventState::Completed => "completed",
            EventState::Failed => "failed",
            EventState::Discarded => "discarded",
        };
        f.write_str(name)
    }
}
