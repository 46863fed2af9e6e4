// Job payloads received from the event source and the response document
// sent back to CloudFormation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Key normalisation
// ---------------------------------------------------------------------------

/// Convert a CamelCase / PascalCase key to snake_case.
///
/// Acronym runs stay together: `ResponseURL` becomes `response_url` and
/// `HTTPServer` becomes `http_server`. Keys that are already snake_case are
/// returned unchanged.
pub fn snake(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let mut out = String::with_capacity(key.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => next.is_some_and(|n| n.is_ascii_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' || c == ' ' {
            out.push('_');
        } else {
            out.push(c);
        }
    }

    out
}

/// Recursively snake_case every object key in `value`.
pub fn rekey(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (snake(k), rekey(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(rekey).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Inbound job payload
// ---------------------------------------------------------------------------

/// A job message as delivered by the event source.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub data: Value,
}

impl Payload {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Job identifier rendered as a string (numbers and strings both allowed).
    pub fn job_id(&self) -> Option<String> {
        match &self.id {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }

    /// Walk `data` by key path.
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.data, |v, key| v.get(key))
    }

    /// The rekeyed `data.cfn_resource` section, if present.
    pub fn cfn_resource(&self) -> Option<Value> {
        self.get(&["cfn_resource"]).map(rekey)
    }

    /// The rekeyed `data.cfn_event` section, if present.
    pub fn cfn_event(&self) -> Option<Value> {
        self.get(&["cfn_event"]).map(rekey)
    }
}

// ---------------------------------------------------------------------------
// CloudFormation custom resource request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestType {
    Create,
    Update,
    Delete,
    Unknown(String),
}

impl RequestType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "create" => RequestType::Create,
            "update" => RequestType::Update,
            "delete" => RequestType::Delete,
            _ => RequestType::Unknown(raw.to_string()),
        }
    }
}

/// A custom resource request after key normalisation.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceRequest {
    pub request_type: String,
    pub response_url: String,
    #[serde(default)]
    pub stack_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub logical_resource_id: String,
    #[serde(default)]
    pub physical_resource_id: Option<String>,
    #[serde(default)]
    pub resource_properties: Value,
}

impl ResourceRequest {
    /// Deserialize from an already rekeyed `cfn_resource` value.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn request_type(&self) -> RequestType {
        RequestType::parse(&self.request_type)
    }

    /// `ResourceProperties.Parameters`, or `Null` when absent.
    pub fn parameters(&self) -> &Value {
        self.resource_properties
            .get("parameters")
            .unwrap_or(&Value::Null)
    }
}

// ---------------------------------------------------------------------------
// CloudFormation response document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// Body PUT to the stack's presigned response URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnResponse {
    pub logical_resource_id: String,
    pub physical_resource_id: String,
    pub stack_id: String,
    pub request_id: String,
    pub status: ResponseStatus,
    pub reason: Option<String>,
    pub data: Map<String, Value>,
}

impl CfnResponse {
    /// Start a SUCCESS response echoing the request identifiers. The physical
    /// id falls back to the request id when the resource has none yet.
    pub fn for_request(request: &ResourceRequest) -> Self {
        let physical_resource_id = request
            .physical_resource_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| request.request_id.clone());
        Self {
            logical_resource_id: request.logical_resource_id.clone(),
            physical_resource_id,
            stack_id: request.stack_id.clone(),
            request_id: request.request_id.clone(),
            status: ResponseStatus::Success,
            reason: None,
            data: Map::new(),
        }
    }

    /// Mark successful, recording the human-readable note under `Data.Reason`.
    pub fn succeed(&mut self, note: impl Into<String>) {
        self.status = ResponseStatus::Success;
        self.data
            .insert("Reason".to_string(), Value::String(note.into()));
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ResponseStatus::Failed;
        self.reason = Some(reason.into());
    }
}

// ---------------------------------------------------------------------------
// Job outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Failed { reason: String },
}

/// Result of one handler processing one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: Option<String>,
    pub handler: &'static str,
    pub status: JobStatus,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn completed(job_id: Option<String>, handler: &'static str) -> Self {
        Self {
            job_id,
            handler,
            status: JobStatus::Completed,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(job_id: Option<String>, handler: &'static str, reason: String) -> Self {
        Self {
            job_id,
            handler,
            status: JobStatus::Failed { reason },
            finished_at: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}
