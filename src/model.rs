use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies which extraction logic the remote service runs against a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorId(String);

impl ConnectorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryInput {
    #[serde(rename = "webpage/url")]
    pub url: String,
}

/// A request descriptor: what to extract and with which connector.
/// Serializes to `{"input": {"webpage/url": ..}, "connectorGuids": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub input: QueryInput,
    #[serde(rename = "connectorGuids")]
    pub connectors: Vec<ConnectorId>,
}

impl Query {
    pub fn new(url: impl Into<String>, connector: ConnectorId) -> Self {
        Self {
            input: QueryInput { url: url.into() },
            connectors: vec![connector],
        }
    }

    pub fn url(&self) -> &str {
        &self.input.url
    }
}

/// Sequence number of a query within its phase. Ascending ids follow dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Returned by dispatch. Clones share the `finished` flag with the service side.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    id: QueryId,
    finished: Arc<AtomicBool>,
}

impl QueryHandle {
    pub fn new(id: QueryId) -> Self {
        Self {
            id,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Must be called before the last message for this query is delivered.
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

/// One extracted item as a field-to-value mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Field rendered as text. Strings come back as-is, numbers and booleans are formatted,
    /// anything else is `None`.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFailure {
    pub error_type: String,
    pub detail: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Results(Vec<Record>),
    Error(RemoteFailure),
}

impl Payload {
    /// Reads a raw service payload: anything carrying `errorType` is an error,
    /// otherwise `results` (missing means no records).
    pub fn from_json(value: Value) -> serde_json::Result<Self> {
        if let Some(error_type) = value.get("errorType") {
            let error_type = match error_type {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(Payload::Error(RemoteFailure {
                error_type,
                detail: value,
            }));
        }

        let results = match value.get("results") {
            Some(results) => serde_json::from_value(results.clone())?,
            None => Vec::new(),
        };
        Ok(Payload::Results(results))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Data(Payload),
    Disconnect(Value),
}

impl Message {
    pub fn results(records: Vec<Record>) -> Self {
        Message::Data(Payload::Results(records))
    }

    pub fn error(error_type: impl Into<String>, detail: Value) -> Self {
        Message::Data(Payload::Error(RemoteFailure {
            error_type: error_type.into(),
            detail,
        }))
    }
}

/// What travels from the service back to the phase collector.
#[derive(Debug, Clone)]
pub struct Completion {
    pub handle: QueryHandle,
    pub message: Message,
    /// Set when the message was sent as the query's final one. The handle's flag may
    /// already be up for earlier messages still sitting in the channel.
    pub last: bool,
}
