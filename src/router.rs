//! Route definitions and the server-side procedure dispatcher.
//!
//! A router definition maps names to stream or procedure routes. Path
//! templates use `:name` placeholders; the names `value`, `key`, and
//! `input` are reserved for mutation payload destructuring and are rejected
//! at build time. Templates compile to anchored regexes with URL-decoded
//! captures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use futures::future::BoxFuture;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::collection::ValueSchema;
use crate::error::{ProcedureError, RouterBuildError, RpcError};

/// Parameter names that collide with mutation payload fields.
pub const RESERVED_PARAMS: &[&str] = &["value", "key", "input"];

/// Characters escaped when substituting a parameter into a path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// A compiled `/literal/:param` path template.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    regex: Regex,
    params: Vec<String>,
}

impl PathTemplate {
    /// Parse and validate a template.
    pub fn parse(template: &str) -> Result<Self, RouterBuildError> {
        if !template.starts_with('/') {
            return Err(RouterBuildError::InvalidTemplate(format!(
                "{} must start with '/'",
                template
            )));
        }

        let name_re = Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex");
        let mut pattern = String::from("^");
        let mut params = Vec::new();

        for segment in template.split('/').skip(1) {
            pattern.push('/');
            if let Some(name) = segment.strip_prefix(':') {
                if !name_re.is_match(name) {
                    return Err(RouterBuildError::InvalidTemplate(format!(
                        "bad parameter name {:?} in {}",
                        name, template
                    )));
                }
                if RESERVED_PARAMS.contains(&name) {
                    return Err(RouterBuildError::ReservedParam(name.to_string()));
                }
                params.push(name.to_string());
                pattern.push_str("([^/]+)");
            } else if segment.is_empty() && template != "/" {
                return Err(RouterBuildError::InvalidTemplate(format!(
                    "empty segment in {}",
                    template
                )));
            } else {
                pattern.push_str(&regex::escape(segment));
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern)
            .map_err(|e| RouterBuildError::InvalidTemplate(e.to_string()))?;
        Ok(Self {
            raw: template.to_string(),
            regex,
            params,
        })
    }

    /// The template as written.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Parameter names, in template order.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Match a request path, URL-decoding each captured parameter.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let captures = self.regex.captures(path)?;
        let mut params = HashMap::new();
        for (i, name) in self.params.iter().enumerate() {
            let raw = captures.get(i + 1)?.as_str();
            let decoded = percent_decode_str(raw).decode_utf8().ok()?;
            params.insert(name.clone(), decoded.into_owned());
        }
        Some(params)
    }

    /// Substitute parameters into the template, percent-encoding values.
    pub fn resolve(&self, params: &HashMap<String, String>) -> Result<String, RpcError> {
        let mut path = String::new();
        for segment in self.raw.split('/').skip(1) {
            path.push('/');
            if let Some(name) = segment.strip_prefix(':') {
                let value = params
                    .get(name)
                    .ok_or_else(|| RpcError::MissingParam(name.to_string()))?;
                path.push_str(&utf8_percent_encode(value, PATH_SEGMENT).to_string());
            } else {
                path.push_str(segment);
            }
        }
        Ok(path)
    }
}

/// One materialized collection inside a stream route.
#[derive(Debug, Clone)]
pub struct CollectionDef {
    /// Name used by callers to address the collection.
    pub name: String,
    /// Change-event discriminator; unique within the stream.
    pub event_type: String,
    /// Field of the value used as the collection key.
    pub primary_key: String,
    /// Shape values must conform to; checked on event construction.
    pub schema: ValueSchema,
}

impl CollectionDef {
    pub fn new(
        name: impl Into<String>,
        event_type: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
            primary_key: primary_key.into(),
            schema: ValueSchema::default(),
        }
    }

    /// Constrain values to a declared shape.
    pub fn schema(mut self, schema: ValueSchema) -> Self {
        self.schema = schema;
        self
    }
}

/// A stream route: a path template plus its collections.
#[derive(Debug, Clone)]
pub struct StreamDef {
    pub name: String,
    pub template: PathTemplate,
    pub collections: Vec<CollectionDef>,
}

impl StreamDef {
    pub fn collection(&self, name: &str) -> Option<&CollectionDef> {
        self.collections.iter().find(|c| c.name == name)
    }
}

/// A request/response route.
#[derive(Debug, Clone)]
pub struct ProcedureDef {
    pub name: String,
    pub template: PathTemplate,
    pub method: Method,
}

/// A named route: stream or procedure.
#[derive(Debug, Clone)]
pub enum RouteDef {
    Stream(StreamDef),
    Procedure(ProcedureDef),
}

impl RouteDef {
    pub fn name(&self) -> &str {
        match self {
            RouteDef::Stream(s) => &s.name,
            RouteDef::Procedure(p) => &p.name,
        }
    }
}

/// A validated set of routes.
#[derive(Debug, Clone, Default)]
pub struct RouterDef {
    routes: Vec<RouteDef>,
}

impl RouterDef {
    pub fn builder() -> RouterDefBuilder {
        RouterDefBuilder::default()
    }

    pub fn routes(&self) -> &[RouteDef] {
        &self.routes
    }

    pub fn get(&self, name: &str) -> Option<&RouteDef> {
        self.routes.iter().find(|r| r.name() == name)
    }

    pub fn stream(&self, name: &str) -> Option<&StreamDef> {
        match self.get(name) {
            Some(RouteDef::Stream(def)) => Some(def),
            _ => None,
        }
    }

    pub fn procedure(&self, name: &str) -> Option<&ProcedureDef> {
        match self.get(name) {
            Some(RouteDef::Procedure(def)) => Some(def),
            _ => None,
        }
    }
}

/// Accumulates raw route declarations; `build` validates the whole set.
#[derive(Default)]
pub struct RouterDefBuilder {
    streams: Vec<(String, String, Vec<CollectionDef>)>,
    procedures: Vec<(String, Method, String)>,
}

impl RouterDefBuilder {
    /// Declare a stream route with its collections.
    pub fn stream(
        mut self,
        name: impl Into<String>,
        template: impl Into<String>,
        collections: Vec<CollectionDef>,
    ) -> Self {
        self.streams.push((name.into(), template.into(), collections));
        self
    }

    /// Declare a procedure route.
    pub fn procedure(
        mut self,
        name: impl Into<String>,
        method: Method,
        template: impl Into<String>,
    ) -> Self {
        self.procedures.push((name.into(), method, template.into()));
        self
    }

    /// Validate templates, reserved parameters, duplicate route names, and
    /// duplicate collection event types.
    pub fn build(self) -> Result<RouterDef, RouterBuildError> {
        let mut names = HashSet::new();
        let mut routes = Vec::new();

        for (name, template, collections) in self.streams {
            if !names.insert(name.clone()) {
                return Err(RouterBuildError::DuplicateRoute(name));
            }
            let mut event_types = HashSet::new();
            for collection in &collections {
                if !event_types.insert(collection.event_type.clone()) {
                    return Err(RouterBuildError::DuplicateCollectionType {
                        stream: name,
                        event_type: collection.event_type.clone(),
                    });
                }
            }
            routes.push(RouteDef::Stream(StreamDef {
                name,
                template: PathTemplate::parse(&template)?,
                collections,
            }));
        }

        for (name, method, template) in self.procedures {
            if !names.insert(name.clone()) {
                return Err(RouterBuildError::DuplicateRoute(name));
            }
            routes.push(RouteDef::Procedure(ProcedureDef {
                name,
                template: PathTemplate::parse(&template)?,
                method,
            }));
        }

        Ok(RouterDef { routes })
    }
}

/// Decoded parameters and parsed input handed to a procedure handler.
#[derive(Debug, Clone)]
pub struct ProcedureRequest {
    pub params: HashMap<String, String>,
    pub input: Option<Value>,
}

type HandlerFn =
    dyn Fn(ProcedureRequest) -> BoxFuture<'static, Result<Option<Value>, ProcedureError>>
        + Send
        + Sync;

/// Server-side procedure dispatcher over a router definition.
///
/// Stream routes are skipped here; when no procedure matches, `dispatch`
/// returns `None` so the caller can fall back to the stream handler.
pub struct RpcRouter {
    def: Arc<RouterDef>,
    handlers: HashMap<String, Arc<HandlerFn>>,
}

impl RpcRouter {
    pub fn new(def: RouterDef) -> Self {
        Self {
            def: Arc::new(def),
            handlers: HashMap::new(),
        }
    }

    pub fn def(&self) -> &Arc<RouterDef> {
        &self.def
    }

    /// Register the handler for a named procedure.
    pub fn handle<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ProcedureRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<Value>, ProcedureError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.handlers.insert(
            name.into(),
            Arc::new(move |req| {
                let f = f.clone();
                Box::pin(async move { f(req).await })
            }),
        );
        self
    }

    /// Try to dispatch a request to a procedure.
    ///
    /// Input is built from the query string for GET and DELETE (absent when
    /// there is no query) and parsed from the JSON body otherwise (absent
    /// when the body is empty). Returns `None` when no procedure matches.
    pub async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        body: &[u8],
    ) -> Option<Response> {
        for route in self.def.routes() {
            let RouteDef::Procedure(def) = route else {
                continue;
            };
            if def.method != *method {
                continue;
            }
            let Some(params) = def.template.matches(path) else {
                continue;
            };

            debug!(procedure = %def.name, path = %path, "dispatching procedure");

            let input = if *method == Method::GET || *method == Method::DELETE {
                query_input(query)
            } else if body.is_empty() {
                None
            } else {
                match serde_json::from_slice::<Value>(body) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        return Some(status_response(
                            StatusCode::BAD_REQUEST,
                            &format!("malformed JSON input: {}", e),
                        ));
                    }
                }
            };

            let Some(handler) = self.handlers.get(&def.name) else {
                warn!(procedure = %def.name, "no handler registered");
                return Some(status_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "no handler registered",
                ));
            };

            return Some(match handler(ProcedureRequest { params, input }).await {
                Ok(Some(value)) => json_response(&value),
                Ok(None) => Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .body(Body::empty())
                    .unwrap(),
                Err(ProcedureError::NotFound(msg)) => {
                    status_response(StatusCode::NOT_FOUND, &msg)
                }
                Err(ProcedureError::Invalid(msg)) => {
                    status_response(StatusCode::BAD_REQUEST, &msg)
                }
                Err(ProcedureError::Internal(msg)) => {
                    warn!(procedure = %def.name, error = %msg, "procedure failed");
                    status_response(StatusCode::INTERNAL_SERVER_ERROR, &msg)
                }
            });
        }
        None
    }
}

fn query_input(query: Option<&str>) -> Option<Value> {
    let query = query?;
    if query.is_empty() {
        return None;
    }
    let mut map = serde_json::Map::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        map.insert(key.into_owned(), Value::String(value.into_owned()));
    }
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

fn json_response(value: &Value) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}

fn status_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_router() -> RouterDef {
        RouterDef::builder()
            .procedure("recall", Method::POST, "/banks/:bankId/recall")
            .procedure("listBanks", Method::GET, "/banks")
            .stream(
                "bank",
                "/banks/:bankId/stream",
                vec![CollectionDef::new("memories", "memory", "id")],
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_template_matching_decodes_params() {
        let template = PathTemplate::parse("/chat/:chatId/messages").unwrap();
        let params = template.matches("/chat/a%20b/messages").unwrap();
        assert_eq!(params["chatId"], "a b");
        assert!(template.matches("/chat/a/b/messages").is_none());
        assert!(template.matches("/chat//messages").is_none());
    }

    #[test]
    fn test_template_resolve_encodes_params() {
        let template = PathTemplate::parse("/chat/:chatId").unwrap();
        let mut params = HashMap::new();
        params.insert("chatId".to_string(), "a/b c".to_string());
        assert_eq!(template.resolve(&params).unwrap(), "/chat/a%2Fb%20c");

        let missing = template.resolve(&HashMap::new());
        assert!(matches!(missing, Err(RpcError::MissingParam(_))));
    }

    #[test]
    fn test_reserved_params_rejected() {
        for name in RESERVED_PARAMS {
            let result = PathTemplate::parse(&format!("/banks/:{}/x", name));
            assert!(
                matches!(result, Err(RouterBuildError::ReservedParam(_))),
                "expected rejection for {}",
                name
            );
        }
    }

    #[test]
    fn test_bad_param_grammar_rejected() {
        assert!(PathTemplate::parse("/x/:1bad").is_err());
        assert!(PathTemplate::parse("/x/:with-dash").is_err());
        assert!(PathTemplate::parse("no-slash").is_err());
    }

    #[test]
    fn test_duplicate_route_names_rejected() {
        let result = RouterDef::builder()
            .procedure("a", Method::GET, "/a")
            .procedure("a", Method::POST, "/b")
            .build();
        assert!(matches!(result, Err(RouterBuildError::DuplicateRoute(_))));
    }

    #[test]
    fn test_duplicate_collection_types_rejected() {
        let result = RouterDef::builder()
            .stream(
                "s",
                "/s",
                vec![
                    CollectionDef::new("a", "item", "id"),
                    CollectionDef::new("b", "item", "id"),
                ],
            )
            .build();
        assert!(matches!(
            result,
            Err(RouterBuildError::DuplicateCollectionType { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_post_with_body() {
        let router = RpcRouter::new(sample_router()).handle("recall", |req| async move {
            assert_eq!(req.params["bankId"], "b1");
            assert_eq!(req.input.unwrap()["query"], "hi");
            Ok(Some(serde_json::json!({"ok": true})))
        });

        let resp = router
            .dispatch(&Method::POST, "/banks/b1/recall", None, b"{\"query\":\"hi\"}")
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dispatch_get_builds_input_from_query() {
        let router = RpcRouter::new(sample_router()).handle("listBanks", |req| async move {
            assert!(req.params.is_empty());
            assert!(req.input.is_none());
            Ok(None)
        });

        let resp = router
            .dispatch(&Method::GET, "/banks", None, b"")
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_dispatch_get_query_becomes_object() {
        let router = RpcRouter::new(
            RouterDef::builder()
                .procedure("find", Method::GET, "/find")
                .build()
                .unwrap(),
        )
        .handle("find", |req| async move {
            assert_eq!(req.input.unwrap()["q"], "x");
            Ok(None)
        });

        let resp = router
            .dispatch(&Method::GET, "/find", Some("q=x"), b"")
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_dispatch_no_match_returns_none() {
        let router = RpcRouter::new(sample_router());
        assert!(router
            .dispatch(&Method::PATCH, "/banks", None, b"")
            .await
            .is_none());
        // Stream routes never match procedure dispatch.
        assert!(router
            .dispatch(&Method::GET, "/banks/b1/stream", None, b"")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_dispatch_error_mapping() {
        let router = RpcRouter::new(sample_router())
            .handle("recall", |_| async move {
                Err(ProcedureError::NotFound("bank".into()))
            });

        let resp = router
            .dispatch(&Method::POST, "/banks/b1/recall", None, b"")
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = router
            .dispatch(&Method::POST, "/banks/b1/recall", None, b"{not json")
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
