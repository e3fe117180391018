//! HTTP server implementation.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::RateLimitLayer;
use crate::error::Result;

/// HTTP server exposing a rate limited endpoint.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limit layer applied to every route
    layer: RateLimitLayer,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, layer: RateLimitLayer) -> Self {
        Self { addr, layer }
    }

    /// Build the router with the rate limit layer applied.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(|| async { "OK" }))
            .layer(self.layer.clone())
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves. The
    /// engine's decay task is stopped afterwards.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting HTTP server");

        let result = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        self.layer.engine().shutdown().await;

        result.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}
