//! Route registration for plugins
//!
//! Plugins describe their endpoints on a [`RouterGroup`]. The host mounts the
//! group under the plugin's namespace (`/plugins/<name>`), so paths here are
//! relative to that prefix. Path parameters use `:name` segments and a
//! trailing `*rest` wildcard.

use crate::error::{PluginError, Result};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Route handler
pub type Handler = Arc<dyn Fn(PluginRequest) -> PluginResponse + Send + Sync>;

/// Request handed to a plugin handler
#[derive(Debug, Clone)]
pub struct PluginRequest {
    /// HTTP method
    pub method: Method,

    /// Path relative to the plugin namespace
    pub path: String,

    /// Path parameters
    pub params: HashMap<String, String>,

    /// Query string parameters
    pub query: HashMap<String, String>,

    /// Request headers
    pub headers: HeaderMap,

    /// Raw request body
    pub body: Bytes,
}

impl PluginRequest {
    /// Create an empty request
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: HashMap::new(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Path parameter by name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Query parameter by name
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Header value as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Deserialize the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Response produced by a plugin handler
#[derive(Debug, Clone)]
pub struct PluginResponse {
    /// Status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Bytes,
}

impl PluginResponse {
    /// Create a response with the given status and no body
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// `200 OK` with a plain text body
    pub fn text(body: impl Into<String>) -> Self {
        let mut response = Self::new(StatusCode::OK);
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.body = Bytes::from(body.into());
        response
    }

    /// `200 OK` with a JSON body
    ///
    /// A value that fails to serialize yields `500` with an error message.
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => {
                let mut response = Self::new(StatusCode::OK);
                response.headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                response.body = Bytes::from(body);
                response
            }
            Err(e) => Self::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    /// JSON error body `{"error": message}`
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        let body = serde_json::json!({ "error": message.into() });
        let mut response = Self::new(status);
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response.body = Bytes::from(body.to_string());
        response
    }

    /// `404 Not Found`
    pub fn not_found() -> Self {
        Self::error(StatusCode::NOT_FOUND, "not found")
    }

    /// Override the status code
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Add a header, ignoring values that are not valid header text
    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }
}

impl Default for PluginResponse {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

/// A registered endpoint
#[derive(Clone)]
pub struct Route {
    /// HTTP method
    pub method: Method,

    /// Path relative to the plugin namespace, always starting with `/`
    pub path: String,

    /// Handler
    pub handler: Handler,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Collects a plugin's routes
#[derive(Debug, Default)]
pub struct RouterGroup {
    prefix: String,
    routes: Vec<Route>,
}

impl RouterGroup {
    /// Create an empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method and path
    pub fn route<F>(&mut self, method: Method, path: &str, handler: F) -> &mut Self
    where
        F: Fn(PluginRequest) -> PluginResponse + Send + Sync + 'static,
    {
        let path = join_paths(&self.prefix, path);
        self.routes.push(Route {
            method,
            path,
            handler: Arc::new(handler),
        });
        self
    }

    /// Register a `GET` handler
    pub fn get<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(PluginRequest) -> PluginResponse + Send + Sync + 'static,
    {
        self.route(Method::GET, path, handler)
    }

    /// Register a `POST` handler
    pub fn post<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(PluginRequest) -> PluginResponse + Send + Sync + 'static,
    {
        self.route(Method::POST, path, handler)
    }

    /// Register a `PUT` handler
    pub fn put<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(PluginRequest) -> PluginResponse + Send + Sync + 'static,
    {
        self.route(Method::PUT, path, handler)
    }

    /// Register a `DELETE` handler
    pub fn delete<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(PluginRequest) -> PluginResponse + Send + Sync + 'static,
    {
        self.route(Method::DELETE, path, handler)
    }

    /// Register a `PATCH` handler
    pub fn patch<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(PluginRequest) -> PluginResponse + Send + Sync + 'static,
    {
        self.route(Method::PATCH, path, handler)
    }

    /// Register routes under a sub-prefix
    pub fn nest(&mut self, prefix: &str, build: impl FnOnce(&mut RouterGroup)) -> &mut Self {
        let mut group = RouterGroup {
            prefix: join_paths(&self.prefix, prefix),
            routes: Vec::new(),
        };
        build(&mut group);
        self.routes.extend(group.routes);
        self
    }

    /// Registered routes
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Consume the group, returning its routes
    pub fn into_routes(self) -> Vec<Route> {
        self.routes
    }

    /// Whether no routes were registered
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Find the handler for an exact method and path
    pub fn find(&self, method: &Method, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.method == *method && r.path == path)
    }

    /// Invoke the handler for an exact method and path
    pub fn call(&self, request: PluginRequest) -> Result<PluginResponse> {
        let route = self.find(&request.method, &request.path).ok_or_else(|| {
            PluginError::runtime(format!("no route for {} {}", request.method, request.path))
        })?;
        Ok((route.handler)(request))
    }
}

fn join_paths(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    let joined = format!("{prefix}/{path}");

    if joined.len() > 1 {
        joined.trim_end_matches('/').to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_normalized() {
        assert_eq!(join_paths("", ""), "/");
        assert_eq!(join_paths("", "hello"), "/hello");
        assert_eq!(join_paths("/api/", "/items/"), "/api/items");
    }

    #[test]
    fn test_nested_routes() {
        let mut group = RouterGroup::new();
        group.get("/", |_| PluginResponse::text("root"));
        group.nest("/api", |api| {
            api.get("/items/:id", |req| {
                PluginResponse::text(req.param("id").unwrap_or_default().to_string())
            });
            api.post("items", |_| PluginResponse::new(StatusCode::CREATED));
        });

        let paths: Vec<_> = group.routes().iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/api/items/:id", "/api/items"]);
    }

    #[test]
    fn test_call_dispatches_to_handler() {
        let mut group = RouterGroup::new();
        group.get("/hello", |req| {
            let name = req.query_param("name").unwrap_or("world").to_string();
            PluginResponse::text(format!("Hello, {name}!"))
        });

        let mut request = PluginRequest::new(Method::GET, "/hello");
        request.query.insert("name".into(), "kiln".into());

        let response = group.call(request).unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"Hello, kiln!");

        assert!(group
            .call(PluginRequest::new(Method::POST, "/hello"))
            .is_err());
    }

    #[test]
    fn test_json_response_and_request() {
        let response = PluginResponse::json(&serde_json::json!({"ok": true}));
        assert_eq!(
            response.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let mut request = PluginRequest::new(Method::POST, "/");
        request.body = Bytes::from_static(br#"{"count": 3}"#);
        let value: serde_json::Value = request.json().unwrap();
        assert_eq!(value["count"], 3);

        request.body = Bytes::from_static(b"not json");
        assert!(request.json::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_not_found_body() {
        let response = PluginResponse::not_found();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(&response.body[..], br#"{"error":"not found"}"#);
    }
}
