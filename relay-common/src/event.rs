use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event as submitted to `POST /events`. `messages` is required at this
/// boundary; everything else besides `request_id` is carried through to the
/// inference call untouched.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub messages: Vec<Value>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum RawRequest {
    /// Batch of events
    Batch(Vec<RawEvent>),
    /// Single event
    One(RawEvent),
}

impl RawRequest {
    /// Callers post either one event or an array of them, so decoding always
    /// yields a Vec.
    pub fn from_bytes(bytes: &[u8]) -> Result<Vec<RawEvent>, serde_json::Error> {
        tracing::debug!(len = bytes.len(), "decoding new event request");
        serde_json::from_slice::<RawRequest>(bytes).map(RawRequest::events)
    }

    pub fn events(self) -> Vec<RawEvent> {
        match self {
            RawRequest::Batch(events) => events,
            RawRequest::One(event) => vec![event],
        }
    }
}

/// An event with its `request_id` assigned, ready to be produced to the
/// broker. The broker message key is the request id, so redeliveries of the
/// same submission land on the same partition.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ProcessedEvent {
    pub request_id: String,
    pub data: String,
}

impl ProcessedEvent {
    pub fn key(&self) -> String {
        self.request_id.clone()
    }
}

/// One unit of work as read back from the broker. Unlike `RawEvent`, nothing
/// is required here: the pipeline decides what to do with records missing
/// `messages` or `request_id`, it never fails to decode over them.
#[derive(Debug, Default, Deserialize)]
pub struct EventRecord {
    pub request_id: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl EventRecord {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The JSON object sent downstream: `messages` plus every passed-through
    /// top-level key. `request_id` is ours, it does not travel downstream.
    pub fn inference_payload(&self) -> Value {
        let mut body = serde_json::Map::new();
        body.insert(
            "messages".to_string(),
            Value::Array(self.messages.clone().unwrap_or_default()),
        );
        for (key, value) in &self.extra {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }
}
