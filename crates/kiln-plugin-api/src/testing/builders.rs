//! Builder for constructing test requests

use crate::routes::PluginRequest;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method};
use serde::Serialize;

/// Builder for [`PluginRequest`] values
#[derive(Debug)]
pub struct RequestBuilder {
    request: PluginRequest,
}

impl RequestBuilder {
    /// Start a request with the given method and path
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            request: PluginRequest::new(method, path),
        }
    }

    /// `GET` request
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST` request
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// `PUT` request
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// `DELETE` request
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a path parameter
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.params.insert(name.into(), value.into());
        self
    }

    /// Add a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.query.insert(name.into(), value.into());
        self
    }

    /// Add a header; invalid names or values are skipped
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.request.headers.insert(name, value);
        }
        self
    }

    /// Set the raw body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = body.into();
        self
    }

    /// Set a JSON body and content type
    pub fn json<T: Serialize>(self, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        self.header("content-type", "application/json").body(body)
    }

    /// Finish the request
    pub fn build(self) -> PluginRequest {
        self.request
    }
}
