//! Identity extraction from HTTP requests.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::{header, Request};

use crate::ratelimit::IdentitySource;

/// Request properties available as identity keys:
///
/// - `ip`: peer address, when the server was started with connect info
/// - `method`, `path`, `uri`
/// - `host`: from the URI authority or the `Host` header
impl<B> IdentitySource for Request<B> {
    fn property(&self, name: &str) -> Option<String> {
        match name {
            "ip" => self
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string()),
            "method" => Some(self.method().to_string()),
            "path" => Some(self.uri().path().to_string()),
            "uri" => Some(self.uri().to_string()),
            "host" => self
                .uri()
                .host()
                .map(str::to_string)
                .or_else(|| self.header(header::HOST.as_str())),
            _ => None,
        }
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }
}
