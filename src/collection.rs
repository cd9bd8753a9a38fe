//! Collection schema overlay: typed change events applied in log order to
//! produce materialized, key-addressed collections.
//!
//! Each collection is keyed by a primary-key field of the value; the
//! event's `type` field discriminates which collection it belongs to.
//! Order of appearance in the log defines effect order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::debug;

use crate::error::{RouterBuildError, RpcError};
use crate::router::CollectionDef;

/// Collection mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Upsert,
}

/// Per-event metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeHeaders {
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub txid: Option<String>,
}

/// One change to a collection, as stored on the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Which collection this event belongs to.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Primary key of the affected row.
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub old_value: Option<Value>,
    pub headers: ChangeHeaders,
}

/// JSON type expected for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        }
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    kind: FieldKind,
    required: bool,
}

/// Declarative shape check for collection values.
///
/// The default schema accepts any object; declared fields constrain the
/// value further. Values are checked on event construction, before
/// anything reaches the log.
#[derive(Debug, Clone, Default)]
pub struct ValueSchema {
    fields: Vec<FieldSpec>,
}

impl ValueSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a field of the given type.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Allow a field of the given type without requiring it.
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Check a value: it must be an object, required fields must be
    /// present, and every declared field must have the declared type.
    pub fn validate(&self, value: &Value) -> Result<(), RpcError> {
        let Some(object) = value.as_object() else {
            return Err(RpcError::SchemaViolation(
                "value is not an object".to_string(),
            ));
        };
        for spec in &self.fields {
            match object.get(&spec.name) {
                None if spec.required => {
                    return Err(RpcError::SchemaViolation(format!(
                        "missing field {:?}",
                        spec.name
                    )));
                }
                None => {}
                Some(v) if spec.kind.matches(v) => {}
                Some(_) => {
                    return Err(RpcError::SchemaViolation(format!(
                        "field {:?} is not a {}",
                        spec.name,
                        spec.kind.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builds validated change events for one collection.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    def: CollectionDef,
}

impl EventBuilder {
    pub fn new(def: CollectionDef) -> Self {
        Self { def }
    }

    pub fn def(&self) -> &CollectionDef {
        &self.def
    }

    /// Extract the key from a value's primary-key field. Empty and missing
    /// keys are refused.
    pub fn key_of(&self, value: &Value) -> Result<String, RpcError> {
        let key = match value.get(&self.def.primary_key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        };
        if key.is_empty() {
            return Err(RpcError::InvalidEvent(format!(
                "value has no usable primary key {:?}",
                self.def.primary_key
            )));
        }
        Ok(key)
    }

    pub fn insert(&self, value: Value) -> Result<ChangeEvent, RpcError> {
        self.event(Operation::Insert, Some(value), None, None)
    }

    pub fn update(&self, value: Value, old_value: Option<Value>) -> Result<ChangeEvent, RpcError> {
        self.event(Operation::Update, Some(value), old_value, None)
    }

    pub fn upsert(&self, value: Value) -> Result<ChangeEvent, RpcError> {
        self.event(Operation::Upsert, Some(value), None, None)
    }

    /// Delete by key; `old_value` is optional context for consumers.
    pub fn delete(&self, key: &str, old_value: Option<Value>) -> Result<ChangeEvent, RpcError> {
        if key.is_empty() {
            return Err(RpcError::InvalidEvent("empty key".to_string()));
        }
        if let Some(old) = &old_value {
            self.def.schema.validate(old)?;
        }
        Ok(ChangeEvent {
            event_type: self.def.event_type.clone(),
            key: key.to_string(),
            value: None,
            old_value,
            headers: ChangeHeaders {
                operation: Operation::Delete,
                txid: None,
            },
        })
    }

    fn event(
        &self,
        operation: Operation,
        value: Option<Value>,
        old_value: Option<Value>,
        txid: Option<String>,
    ) -> Result<ChangeEvent, RpcError> {
        let value = value.ok_or_else(|| RpcError::InvalidEvent("missing value".to_string()))?;
        if !value.is_object() {
            return Err(RpcError::InvalidEvent(
                "collection values must be objects".to_string(),
            ));
        }
        self.def.schema.validate(&value)?;
        if let Some(old) = &old_value {
            self.def.schema.validate(old)?;
        }
        let key = self.key_of(&value)?;
        Ok(ChangeEvent {
            event_type: self.def.event_type.clone(),
            key,
            value: Some(value),
            old_value,
            headers: ChangeHeaders { operation, txid },
        })
    }
}

/// Attach a txid to an event for write/read synchronization.
pub fn with_txid(mut event: ChangeEvent, txid: impl Into<String>) -> ChangeEvent {
    event.headers.txid = Some(txid.into());
    event
}

/// The control record that resets all collections.
pub fn reset_control() -> Value {
    serde_json::json!({ "control": "reset" })
}

struct CollectionState {
    collections: HashMap<String, BTreeMap<String, Value>>,
    txids: HashSet<String>,
}

/// Materialized state for the collections of one stream.
///
/// `mark_ready` is deferred until the feeding loop observes its first
/// up-to-date batch; txids recorded on commit unblock `await_txid`.
pub struct CollectionSet {
    state: Mutex<CollectionState>,
    ready: watch::Sender<bool>,
    txid_notify: Notify,
}

impl CollectionSet {
    /// Build the empty state for a set of collection definitions. Two
    /// collections declaring the same event type are rejected.
    pub fn new(defs: &[CollectionDef]) -> Result<Arc<Self>, RouterBuildError> {
        let mut collections = HashMap::new();
        for def in defs {
            if collections
                .insert(def.event_type.clone(), BTreeMap::new())
                .is_some()
            {
                return Err(RouterBuildError::DuplicateCollectionType {
                    stream: String::new(),
                    event_type: def.event_type.clone(),
                });
            }
        }
        let (ready, _) = watch::channel(false);
        Ok(Arc::new(Self {
            state: Mutex::new(CollectionState {
                collections,
                txids: HashSet::new(),
            }),
            ready,
            txid_notify: Notify::new(),
        }))
    }

    /// Apply one log item: a `{"control": ...}` record or a change event.
    pub fn apply_value(&self, item: &Value) -> Result<(), RpcError> {
        if let Some(control) = item.get("control").and_then(|c| c.as_str()) {
            if control == "reset" {
                self.truncate();
            }
            return Ok(());
        }
        let event: ChangeEvent = serde_json::from_value(item.clone())
            .map_err(|e| RpcError::InvalidEvent(e.to_string()))?;
        self.apply(&event);
        Ok(())
    }

    /// Apply a change event. Events for undeclared types are skipped.
    pub fn apply(&self, event: &ChangeEvent) {
        let mut state = self.state.lock();
        let Some(rows) = state.collections.get_mut(&event.event_type) else {
            debug!(event_type = %event.event_type, "event for undeclared collection");
            return;
        };

        // Upsert is resolved here, against the current key set.
        let operation = match event.headers.operation {
            Operation::Upsert => {
                if rows.contains_key(&event.key) {
                    Operation::Update
                } else {
                    Operation::Insert
                }
            }
            op => op,
        };

        match operation {
            Operation::Insert | Operation::Update => {
                if let Some(value) = &event.value {
                    rows.insert(event.key.clone(), value.clone());
                }
            }
            Operation::Delete => {
                rows.remove(&event.key);
            }
            Operation::Upsert => unreachable!("resolved above"),
        }

        if let Some(txid) = &event.headers.txid {
            state.txids.insert(txid.clone());
            drop(state);
            self.txid_notify.notify_waiters();
        }
    }

    /// Reset every collection to empty.
    pub fn truncate(&self) {
        let mut state = self.state.lock();
        for rows in state.collections.values_mut() {
            rows.clear();
        }
    }

    /// Mark the materialized state as caught up with the stream tail.
    pub fn mark_ready(&self) {
        let _ = self.ready.send(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the first up-to-date batch has been applied.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn get(&self, event_type: &str, key: &str) -> Option<Value> {
        self.state
            .lock()
            .collections
            .get(event_type)
            .and_then(|rows| rows.get(key).cloned())
    }

    /// All rows of a collection, in key order.
    pub fn snapshot(&self, event_type: &str) -> Vec<(String, Value)> {
        self.state
            .lock()
            .collections
            .get(event_type)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, event_type: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(event_type)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, event_type: &str) -> bool {
        self.len(event_type) == 0
    }

    /// Block until an event carrying `txid` has been committed, or time out.
    pub async fn await_txid(&self, txid: &str, timeout: Duration) -> Result<(), RpcError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.txid_notify.notified();
            if self.state.lock().txids.contains(txid) {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(RpcError::TxidTimeout(txid.to_string()));
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }
}
