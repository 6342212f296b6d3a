//! Mounting plugin routes on the host HTTP server
//!
//! Every plugin gets an axum [`Router`] built from its [`RouterGroup`]. The
//! host serves a single dispatcher under `/plugins` that looks the plugin up
//! in the live [`RouteTable`] on each request, so unloading a plugin takes
//! its namespace offline immediately.

use crate::error::{PluginRuntimeError, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{Extensions, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, on, MethodFilter, MethodRouter};
use axum::{Json, Router};
use kiln_plugin_api::{Handler, Plugin, PluginRequest, PluginResponse, RouterGroup};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tower::ServiceExt;
use tracing::{debug, error, warn};

/// Prefix every plugin namespace lives under
pub const PLUGIN_PREFIX: &str = "/plugins";

/// Build the router for a plugin's routes
///
/// Duplicate method and path pairs keep the first registration. Methods axum
/// cannot route are skipped. A plugin that panics while registering, or
/// whose paths conflict, fails with [`PluginRuntimeError::RouteRegistration`].
pub fn build_router(plugin: &dyn Plugin, name: &str) -> Result<Router> {
    let group = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut group = RouterGroup::new();
        plugin.register_routes(&mut group);
        group
    }))
    .map_err(|_| PluginRuntimeError::route_registration(name, "register_routes panicked"))?;

    panic::catch_unwind(AssertUnwindSafe(|| router_from_group(group, name)))
        .map_err(|_| PluginRuntimeError::route_registration(name, "conflicting route paths"))
}

fn router_from_group(group: RouterGroup, name: &str) -> Router {
    let mut seen = HashSet::new();
    let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();

    for route in group.into_routes() {
        if !seen.insert((route.method.clone(), route.path.clone())) {
            warn!(plugin = %name, method = %route.method, path = %route.path, "Duplicate route ignored");
            continue;
        }

        let Ok(filter) = MethodFilter::try_from(route.method.clone()) else {
            warn!(plugin = %name, method = %route.method, path = %route.path, "Unsupported method ignored");
            continue;
        };

        let endpoint = endpoint(route.handler, name.to_string());
        let method_router = match by_path.remove(&route.path) {
            Some(existing) => existing.on(filter, endpoint),
            None => on(filter, endpoint),
        };
        by_path.insert(route.path, method_router);
    }

    by_path
        .into_iter()
        .fold(Router::new(), |router, (path, method_router)| {
            debug!(plugin = %name, path = %path, "Route mounted");
            router.route(&path, method_router)
        })
}

fn endpoint(
    handler: Handler,
    plugin: String,
) -> impl Fn(
    Method,
    Uri,
    Option<Path<HashMap<String, String>>>,
    Option<Query<HashMap<String, String>>>,
    HeaderMap,
    Bytes,
) -> std::future::Ready<Response>
       + Clone
       + Send
       + Sync
       + 'static {
    move |method, uri, params, query, headers, body| {
        let request = PluginRequest {
            method,
            path: uri.path().to_string(),
            params: params.map(|Path(p)| p).unwrap_or_default(),
            query: query.map(|Query(q)| q).unwrap_or_default(),
            headers,
            body,
        };

        let response = match panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
            Ok(response) => into_response(response),
            Err(_) => {
                error!(plugin = %plugin, path = %uri.path(), "Plugin handler panicked");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "plugin handler panicked")
            }
        };
        std::future::ready(response)
    }
}

fn into_response(response: PluginResponse) -> Response {
    (response.status, response.headers, response.body).into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Live routers keyed by lowercased plugin name
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    inner: Arc<RwLock<HashMap<String, Router>>>,
}

impl RouteTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a router under `/plugins/<name>`, replacing any previous one
    pub fn mount(&self, name: &str, router: Router) {
        self.inner.write().insert(name.to_lowercase(), router);
    }

    /// Take a namespace offline
    pub fn unmount(&self, name: &str) -> bool {
        self.inner.write().remove(&name.to_lowercase()).is_some()
    }

    /// Whether a namespace is mounted
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(&name.to_lowercase())
    }

    /// Mounted namespaces in order
    pub fn mounted(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatcher serving every mounted plugin under [`PLUGIN_PREFIX`]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/plugins/:plugin", any(dispatch))
            .route("/plugins/:plugin/*rest", any(dispatch))
            .with_state(self.clone())
    }

    fn get(&self, name: &str) -> Option<Router> {
        self.inner.read().get(name).cloned()
    }
}

/// Split `/plugins/<name>/<rest>` into the lowercased name and `/<rest>`
fn split_plugin_path(path: &str) -> Option<(String, String)> {
    let tail = path.strip_prefix(PLUGIN_PREFIX)?.strip_prefix('/')?;
    let (name, rest) = match tail.split_once('/') {
        Some((name, rest)) => (name, format!("/{rest}")),
        None => (tail, "/".to_string()),
    };

    if name.is_empty() {
        return None;
    }
    Some((name.to_lowercase(), rest))
}

async fn dispatch(State(table): State<RouteTable>, request: Request) -> Response {
    let Some((name, rest)) = split_plugin_path(request.uri().path()) else {
        return error_response(StatusCode::NOT_FOUND, "not found");
    };

    let Some(router) = table.get(&name) else {
        return error_response(StatusCode::NOT_FOUND, format!("plugin {name} is not loaded"));
    };

    let (mut parts, body) = request.into_parts();
    let target = match parts.uri.query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest,
    };
    parts.uri = match target.parse() {
        Ok(uri) => uri,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid request path"),
    };
    // Matched-path data from the outer router must not leak into the plugin's
    parts.extensions = Extensions::new();

    match router.oneshot(Request::from_parts(parts, body)).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use kiln_plugin_api::testing::MockPlugin;
    use kiln_plugin_api::{PluginDependencies, PluginInfo};

    #[derive(Debug)]
    struct RoutesOnly(fn(&mut RouterGroup));

    impl Plugin for RoutesOnly {
        fn info(&self) -> PluginInfo {
            PluginInfo::new("routes-only", "1.0.0")
        }

        fn initialize(&mut self, _deps: &PluginDependencies) -> kiln_plugin_api::error::Result<()> {
            Ok(())
        }

        fn register_routes(&self, router: &mut RouterGroup) {
            (self.0)(router)
        }
    }

    async fn call(router: Router, method: Method, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_split_plugin_path() {
        assert_eq!(
            split_plugin_path("/plugins/Hello/items/1"),
            Some(("hello".to_string(), "/items/1".to_string()))
        );
        assert_eq!(
            split_plugin_path("/plugins/hello"),
            Some(("hello".to_string(), "/".to_string()))
        );
        assert_eq!(split_plugin_path("/plugins/"), None);
        assert_eq!(split_plugin_path("/other/hello"), None);
    }

    #[tokio::test]
    async fn test_dispatch_to_mounted_plugin() {
        let table = RouteTable::new();
        let plugin = MockPlugin::new("mock");
        table.mount("mock", build_router(&plugin, "mock").unwrap());

        let (status, body) = call(table.router(), Method::GET, "/plugins/mock/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "pong");

        let (status, body) = call(table.router(), Method::GET, "/plugins/MOCK/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "pong");

        let (status, _) = call(table.router(), Method::POST, "/plugins/mock/ping").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_unmounted_plugin_is_not_found() {
        let table = RouteTable::new();
        table.mount("mock", build_router(&MockPlugin::new("mock"), "mock").unwrap());
        assert!(table.unmount("Mock"));
        assert!(!table.contains("mock"));

        let (status, body) = call(table.router(), Method::GET, "/plugins/mock/ping").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("not loaded"));
    }

    #[tokio::test]
    async fn test_params_and_query_reach_handler() {
        let plugin = RoutesOnly(|router| {
            router.get("/items/:id", |req| {
                PluginResponse::text(format!(
                    "{} {} {}",
                    req.param("id").unwrap_or("-"),
                    req.query_param("sort").unwrap_or("-"),
                    req.path
                ))
            });
            router.get("/", |_| PluginResponse::text("index"));
        });

        let table = RouteTable::new();
        table.mount("routes-only", build_router(&plugin, "routes-only").unwrap());

        let (status, body) = call(
            table.router(),
            Method::GET,
            "/plugins/routes-only/items/42?sort=asc",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "42 asc /items/42");

        let (_, body) = call(table.router(), Method::GET, "/plugins/routes-only").await;
        assert_eq!(body, "index");
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_500() {
        let plugin = RoutesOnly(|router| {
            router.get("/boom", |_| panic!("handler exploded"));
        });
        let router = build_router(&plugin, "boom").unwrap();

        let (status, body) = call(router, Method::GET, "/boom").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("panicked"));
    }

    #[tokio::test]
    async fn test_duplicate_routes_keep_first() {
        let plugin = RoutesOnly(|router| {
            router.get("/a", |_| PluginResponse::text("first"));
            router.get("/a", |_| PluginResponse::text("second"));
            router.post("/a", |_| PluginResponse::text("post"));
        });
        let router = build_router(&plugin, "dup").unwrap();

        let (_, body) = call(router.clone(), Method::GET, "/a").await;
        assert_eq!(body, "first");
        let (_, body) = call(router, Method::POST, "/a").await;
        assert_eq!(body, "post");
    }

    #[test]
    fn test_conflicting_paths_fail_registration() {
        let plugin = RoutesOnly(|router| {
            router.get("/:a", |_| PluginResponse::text("a"));
            router.get("/:b", |_| PluginResponse::text("b"));
        });

        let err = build_router(&plugin, "conflict").unwrap_err();
        assert!(matches!(err, PluginRuntimeError::RouteRegistration { .. }));
    }
}
