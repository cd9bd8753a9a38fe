//! Typed client-side RPC dispatcher.
//!
//! An explicit router-definition traversal stands in for dynamic property
//! dispatch: a name resolves to either a procedure invoker or a set of
//! collection handles. Stream state is cached per resolved path in a
//! ref-counted manager; the last release tears the feed down, deferred
//! until the feed has settled so a not-yet-connected stream is never torn
//! down mid-handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::Client;
use crate::collection::{reset_control, ChangeEvent, CollectionSet, EventBuilder};
use crate::error::{RpcError, StreamError};
use crate::router::{RouterDef, StreamDef};
use crate::stream::CreateOptions;
use crate::types::LiveMode;

/// Client over a router definition: procedures and collection streams.
#[derive(Clone)]
pub struct RpcClient {
    client: Client,
    base_url: String,
    def: Arc<RouterDef>,
    manager: Arc<StreamManager>,
}

impl RpcClient {
    pub fn new(client: Client, base_url: impl Into<String>, def: RouterDef) -> Self {
        Self {
            manager: Arc::new(StreamManager {
                client: client.clone(),
                entries: Mutex::new(HashMap::new()),
            }),
            client,
            base_url: base_url.into(),
            def: Arc::new(def),
        }
    }

    pub fn def(&self) -> &RouterDef {
        &self.def
    }

    /// Invoke a named procedure.
    ///
    /// GET and DELETE procedures carry `input` as a query string; other
    /// verbs send it as a JSON body. A 204 response is `None`.
    pub async fn call(
        &self,
        name: &str,
        params: &HashMap<String, String>,
        input: Option<Value>,
    ) -> Result<Option<Value>, RpcError> {
        let def = self
            .def
            .procedure(name)
            .ok_or_else(|| match self.def.get(name) {
                Some(_) => RpcError::NotAProcedure(name.to_string()),
                None => RpcError::RouteNotFound(name.to_string()),
            })?;

        let mut url = format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            def.template.resolve(params)?
        );

        let query_input = def.method == Method::GET || def.method == Method::DELETE;
        if query_input {
            if let Some(input) = &input {
                let query = encode_query(input)?;
                if !query.is_empty() {
                    url.push('?');
                    url.push_str(&query);
                }
            }
        }

        let mut req = self.client.inner.request(def.method.clone(), &url);
        for (key, value) in self.client.get_headers().iter() {
            req = req.header(key.clone(), value.clone());
        }
        if !query_input {
            if let Some(input) = &input {
                req = req
                    .header("content-type", "application/json")
                    .body(input.to_string());
            }
        }

        debug!(procedure = %name, url = %url, "calling procedure");
        let resp = req.send().await.map_err(StreamError::from)?;
        let status = resp.status().as_u16();

        match status {
            204 => Ok(None),
            200 => {
                let body = resp.bytes().await.map_err(StreamError::from)?;
                Ok(Some(serde_json::from_slice(&body)?))
            }
            _ => {
                let message = resp.text().await.unwrap_or_default();
                Err(RpcError::Status { status, message })
            }
        }
    }

    /// Get a handle to one collection of a named stream route.
    pub fn collection(
        &self,
        stream_name: &str,
        collection_name: &str,
        params: &HashMap<String, String>,
    ) -> Result<CollectionHandle, RpcError> {
        let def = self
            .def
            .stream(stream_name)
            .ok_or_else(|| match self.def.get(stream_name) {
                Some(_) => RpcError::NotAStream(stream_name.to_string()),
                None => RpcError::RouteNotFound(stream_name.to_string()),
            })?;
        let collection = def
            .collection(collection_name)
            .ok_or_else(|| RpcError::CollectionNotFound {
                stream: stream_name.to_string(),
                collection: collection_name.to_string(),
            })?;

        let path = def.template.resolve(params)?;
        Ok(CollectionHandle {
            client: self.client.clone(),
            manager: self.manager.clone(),
            stream_def: Arc::new(def.clone()),
            url: format!("{}{}", self.base_url.trim_end_matches('/'), path),
            path,
            events: EventBuilder::new(collection.clone()),
        })
    }

    /// Delete a stream incarnation: evicts the cached feed immediately
    /// (regardless of refs) and deletes the stream server-side. Surviving
    /// subscribers reconnect to the next incarnation.
    pub async fn delete_stream(
        &self,
        stream_name: &str,
        params: &HashMap<String, String>,
    ) -> Result<(), RpcError> {
        let def = self
            .def
            .stream(stream_name)
            .ok_or_else(|| RpcError::RouteNotFound(stream_name.to_string()))?;
        let path = def.template.resolve(params)?;
        self.manager.evict(&path);

        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        self.client
            .stream(&url)
            .delete()
            .await
            .map_err(RpcError::Stream)
    }
}

fn encode_query(input: &Value) -> Result<String, RpcError> {
    let Value::Object(map) = input else {
        return Err(RpcError::InvalidEvent(
            "query input must be an object".to_string(),
        ));
    };
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in map {
        match value {
            Value::String(s) => serializer.append_pair(key, s),
            other => serializer.append_pair(key, &other.to_string()),
        };
    }
    Ok(serializer.finish())
}

/// Mutation and subscription surface for one collection.
#[derive(Clone)]
pub struct CollectionHandle {
    client: Client,
    manager: Arc<StreamManager>,
    stream_def: Arc<StreamDef>,
    path: String,
    url: String,
    events: EventBuilder,
}

impl std::fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("path", &self.path)
            .field("url", &self.url)
            .finish()
    }
}

impl CollectionHandle {
    /// Resolved stream path this collection lives on.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn insert(&self, value: Value) -> Result<(), RpcError> {
        self.append_event(self.events.insert(value)?).await
    }

    pub async fn update(&self, value: Value) -> Result<(), RpcError> {
        self.append_event(self.events.update(value, None)?).await
    }

    pub async fn upsert(&self, value: Value) -> Result<(), RpcError> {
        self.append_event(self.events.upsert(value)?).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), RpcError> {
        self.append_event(self.events.delete(key, None)?).await
    }

    /// Append a pre-built event (e.g. one carrying a txid).
    pub async fn append_event(&self, event: ChangeEvent) -> Result<(), RpcError> {
        self.append_value(serde_json::to_value(&event)?).await
    }

    /// Reset every collection on the stream.
    pub async fn clear(&self) -> Result<(), RpcError> {
        self.append_value(reset_control()).await
    }

    async fn append_value(&self, value: Value) -> Result<(), RpcError> {
        let mut handle = self.client.stream(&self.url);
        handle.set_content_type("application/json");
        let body = value.to_string();

        match handle.append(body.clone()).await {
            Ok(_) => Ok(()),
            // Streams are created implicitly by the RPC layer on first use.
            Err(StreamError::NotFound { .. }) => {
                handle
                    .create_with(CreateOptions::new().content_type("application/json"))
                    .await
                    .map_err(RpcError::Stream)?;
                handle.append(body).await.map(|_| ()).map_err(RpcError::Stream)
            }
            Err(e) => Err(RpcError::Stream(e)),
        }
    }

    /// Subscribe to the stream's materialized state. Ref-counted: the
    /// returned subscription releases its ref on drop.
    pub async fn subscribe(&self) -> Result<CollectionSubscription, RpcError> {
        self.manager
            .subscribe(&self.path, &self.url, &self.stream_def)
    }

    /// One value by key, after the materialized state is ready.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, RpcError> {
        let sub = self.subscribe().await?;
        sub.ready().await;
        Ok(sub.db().get(&self.events.def().event_type, key))
    }

    /// Snapshot of all rows, after the materialized state is ready.
    pub async fn snapshot(&self) -> Result<Vec<(String, Value)>, RpcError> {
        let sub = self.subscribe().await?;
        sub.ready().await;
        Ok(sub.db().snapshot(&self.events.def().event_type))
    }

    /// Synchronize with a write: wait until an event carrying `txid` has
    /// been observed.
    pub async fn await_txid(&self, txid: &str, timeout: Duration) -> Result<(), RpcError> {
        let sub = self.subscribe().await?;
        sub.db().await_txid(txid, timeout).await
    }

    pub fn event_builder(&self) -> &EventBuilder {
        &self.events
    }
}

struct ManagedEntry {
    db: Arc<CollectionSet>,
    refs: usize,
    task: tokio::task::JoinHandle<()>,
    pending_close: bool,
}

/// Per-path cache of materialized stream state.
pub struct StreamManager {
    client: Client,
    entries: Mutex<HashMap<String, ManagedEntry>>,
}

impl StreamManager {
    fn subscribe(
        self: &Arc<Self>,
        path: &str,
        url: &str,
        def: &StreamDef,
    ) -> Result<CollectionSubscription, RpcError> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(path) {
            entry.refs += 1;
            entry.pending_close = false;
            return Ok(CollectionSubscription {
                manager: self.clone(),
                path: path.to_string(),
                db: entry.db.clone(),
                released: false,
            });
        }

        let db = CollectionSet::new(&def.collections)
            .map_err(|e| RpcError::InvalidEvent(e.to_string()))?;
        let task = spawn_feed(
            self.clone(),
            self.client.clone(),
            path.to_string(),
            url.to_string(),
            db.clone(),
        );
        entries.insert(
            path.to_string(),
            ManagedEntry {
                db: db.clone(),
                refs: 1,
                task,
                pending_close: false,
            },
        );

        Ok(CollectionSubscription {
            manager: self.clone(),
            path: path.to_string(),
            db,
            released: false,
        })
    }

    fn release(&self, path: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(path) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        if entry.db.is_ready() {
            if let Some(entry) = entries.remove(path) {
                entry.task.abort();
            }
        } else {
            // The feed hasn't settled; defer teardown so a concurrent
            // subscriber doesn't observe a half-connected stream.
            entry.pending_close = true;
        }
    }

    /// Complete a deferred teardown once the feed has settled.
    fn settle(&self, path: &str) {
        let mut entries = self.entries.lock();
        let deferred = entries
            .get(path)
            .map(|e| e.pending_close && e.refs == 0)
            .unwrap_or(false);
        if deferred {
            if let Some(entry) = entries.remove(path) {
                entry.task.abort();
            }
        }
    }

    /// Drop the cached feed immediately, regardless of refs.
    fn evict(&self, path: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.remove(path) {
            entry.task.abort();
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

/// The feed loop: create the stream if absent, then long-poll events into
/// the materialized state. A deleted-and-recreated stream surfaces as
/// closure or a foreign-generation offset; the loop restarts from the
/// beginning against the new incarnation.
fn spawn_feed(
    manager: Arc<StreamManager>,
    client: Client,
    path: String,
    url: String,
    db: Arc<CollectionSet>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut handle = client.stream(&url);
        handle.set_content_type("application/json");

        let mut restarts: u32 = 0;
        'incarnation: loop {
            if let Err(e) = handle
                .create_with(CreateOptions::new().content_type("application/json"))
                .await
            {
                warn!(path = %path, error = %e, "stream create failed");
                if restarts >= 5 {
                    db.mark_ready();
                    return;
                }
                restarts += 1;
                tokio::time::sleep(Duration::from_millis(200 * restarts as u64)).await;
                continue;
            }

            let mut iter = handle.read().live(LiveMode::LongPoll).build();
            loop {
                match iter.next_chunk().await {
                    Ok(Some(chunk)) => {
                        restarts = 0;
                        if !chunk.data.is_empty() {
                            match serde_json::from_slice::<Value>(&chunk.data) {
                                Ok(Value::Array(items)) => {
                                    for item in &items {
                                        if let Err(e) = db.apply_value(item) {
                                            warn!(path = %path, error = %e, "bad change event");
                                        }
                                    }
                                }
                                Ok(single) => {
                                    if let Err(e) = db.apply_value(&single) {
                                        warn!(path = %path, error = %e, "bad change event");
                                    }
                                }
                                Err(e) => {
                                    warn!(path = %path, error = %e, "unparseable batch");
                                }
                            }
                        }
                        if chunk.up_to_date {
                            db.mark_ready();
                            manager.settle(&path);
                        }
                        if chunk.stream_closed {
                            // Closure is terminal; deletion means a new
                            // incarnation may appear under this path.
                            match handle.head().await {
                                Ok(head) if head.closed => {
                                    db.mark_ready();
                                    manager.settle(&path);
                                    return;
                                }
                                _ => {
                                    db.truncate();
                                    tokio::time::sleep(Duration::from_millis(100)).await;
                                    continue 'incarnation;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        db.mark_ready();
                        manager.settle(&path);
                        return;
                    }
                    Err(e) => {
                        warn!(path = %path, error = %e, "feed error");
                        if restarts >= 5 {
                            db.mark_ready();
                            manager.settle(&path);
                            return;
                        }
                        restarts += 1;
                        tokio::time::sleep(Duration::from_millis(200 * restarts as u64)).await;
                        db.truncate();
                        continue 'incarnation;
                    }
                }
            }
        }
    })
}

/// A ref on a managed stream feed. Dropping releases the ref; the last
/// release closes and evicts the feed (deferred until it has settled).
pub struct CollectionSubscription {
    manager: Arc<StreamManager>,
    path: String,
    db: Arc<CollectionSet>,
    released: bool,
}

impl CollectionSubscription {
    pub fn db(&self) -> &Arc<CollectionSet> {
        &self.db
    }

    /// Wait until the feed has applied its first up-to-date batch.
    pub async fn ready(&self) {
        self.db.wait_ready().await
    }

    /// Explicitly release the ref.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.release(&self.path);
        }
    }
}

impl Drop for CollectionSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
