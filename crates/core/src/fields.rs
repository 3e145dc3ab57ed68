//! Flat key/value field codec used on the wire.
//!
//! Stream entries carry an alternating `key value key value ...` sequence of
//! strings; there are no nested structures. Absent values are written as the
//! empty string, so on decode an empty string, a missing key, `0` and `false`
//! are indistinguishable for a producer that relied on falsy values. Typed
//! fields are therefore decoded strictly: empty means "not provided".

use thiserror::Error;

use crate::{EventKind, ProjectEvent, ProjectEventKind, StatusEvent, StreamEvent};

pub type Fields = Vec<(String, String)>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("missing field: {0}")]
    Missing(&'static str),
    #[error("invalid value for {field}: {value:?}")]
    Invalid { field: &'static str, value: String },
}

/// A type that travels as flat string fields.
pub trait WireEvent: Sized {
    fn to_fields(&self) -> Fields;
    fn from_fields(fields: &[(String, String)]) -> Result<Self, FieldError>;
}

/// Value for `key`, or "" when absent. The last occurrence wins.
pub fn get<'a>(fields: &'a [(String, String)], key: &str) -> &'a str {
    fields.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str()).unwrap_or("")
}

fn required<'a>(fields: &'a [(String, String)], key: &'static str) -> Result<&'a str, FieldError> {
    match get(fields, key) {
        "" => Err(FieldError::Missing(key)),
        v => Ok(v),
    }
}

fn pair(k: &str, v: &str) -> (String, String) { (k.to_string(), v.to_string()) }

/// Flatten into the alternating sequence handed to the broker.
pub fn flatten(fields: &[(String, String)]) -> Vec<String> {
    let mut out = Vec::with_capacity(fields.len() * 2);
    for (k, v) in fields {
        out.push(k.clone());
        out.push(v.clone());
    }
    out
}

/// Inverse of [`flatten`]. A trailing key without value decodes to "".
pub fn pairs(flat: &[String]) -> Fields {
    flat.chunks(2)
        .map(|c| (c[0].clone(), c.get(1).cloned().unwrap_or_default()))
        .collect()
}

impl WireEvent for StreamEvent {
    fn to_fields(&self) -> Fields {
        vec![
            pair("kind", self.kind.as_str()),
            pair("projectId", &self.project_id),
            pair("deploymentId", &self.deployment_id),
            pair("commitHash", &self.commit_hash),
            pair("projectType", self.project_type.map(|p| p.as_str()).unwrap_or("")),
            pair("requestId", &self.request_id),
        ]
    }

    fn from_fields(fields: &[(String, String)]) -> Result<Self, FieldError> {
        let kind = EventKind::parse(required(fields, "kind")?);
        let project_id = required(fields, "projectId")?.to_string();
        let project_type = match get(fields, "projectType") {
            "" => None,
            v => Some(v.parse()?),
        };
        Ok(Self {
            kind,
            project_id,
            deployment_id: get(fields, "deploymentId").to_string(),
            commit_hash: get(fields, "commitHash").to_string(),
            project_type,
            request_id: get(fields, "requestId").to_string(),
        })
    }
}

impl WireEvent for StatusEvent {
    fn to_fields(&self) -> Fields {
        vec![
            pair("kind", self.kind.as_str()),
            pair("projectId", &self.project_id),
            pair("deploymentId", &self.deployment_id),
            pair("requestId", &self.request_id),
            pair("reason", self.reason.as_deref().unwrap_or("")),
            pair("timestamp", &self.timestamp),
        ]
    }

    fn from_fields(fields: &[(String, String)]) -> Result<Self, FieldError> {
        Ok(Self {
            kind: required(fields, "kind")?.parse()?,
            project_id: required(fields, "projectId")?.to_string(),
            deployment_id: get(fields, "deploymentId").to_string(),
            request_id: get(fields, "requestId").to_string(),
            reason: Some(get(fields, "reason")).filter(|r| !r.is_empty()).map(str::to_string),
            timestamp: get(fields, "timestamp").to_string(),
        })
    }
}

impl WireEvent for ProjectEvent {
    fn to_fields(&self) -> Fields {
        let kind = match &self.kind {
            ProjectEventKind::Created => "CREATED",
            ProjectEventKind::Deleted => "DELETED",
            ProjectEventKind::Other(s) => s.as_str(),
        };
        vec![pair("kind", kind), pair("projectId", &self.project_id)]
    }

    fn from_fields(fields: &[(String, String)]) -> Result<Self, FieldError> {
        let kind = match required(fields, "kind")? {
            "CREATED" => ProjectEventKind::Created,
            "DELETED" => ProjectEventKind::Deleted,
            other => ProjectEventKind::Other(other.to_string()),
        };
        Ok(Self { kind, project_id: required(fields, "projectId")?.to_string() })
    }
}
