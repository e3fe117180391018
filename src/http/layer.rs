//! Rate limiting middleware.
//!
//! Tower layer applying an `AdmissionEngine` to axum routes.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, error};

use super::response;
use crate::config::LimiterConfig;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{AdmissionEngine, CallbackStore, Decision};
use crate::registry::Registry;

/// Handles a rejected request in place of the default 429 response.
///
/// Receives the request and the continuation; whatever it returns is sent
/// to the client unchanged.
pub type RejectionHandler =
    Arc<dyn Fn(Request<Body>, Next) -> BoxFuture<'static, Response> + Send + Sync>;

/// Wrap an async closure as a [`RejectionHandler`].
pub fn rejection_handler<F, Fut>(f: F) -> RejectionHandler
where
    F: Fn(Request<Body>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |request, next| Box::pin(f(request, next)))
}

/// The rest of the service stack, as handed to a rejection handler.
pub struct Next {
    inner: BoxCloneService<Request<Body>, Response, Infallible>,
}

impl Next {
    /// Let the request through anyway.
    pub async fn run(self, request: Request<Body>) -> Response {
        match self.inner.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// Rate limit middleware layer
#[derive(Clone)]
pub struct RateLimitLayer {
    engine: Arc<AdmissionEngine>,
    handler: Option<RejectionHandler>,
}

impl RateLimitLayer {
    /// Create a new layer around an engine.
    pub fn new(engine: Arc<AdmissionEngine>) -> Self {
        Self {
            engine,
            handler: None,
        }
    }

    /// Use `handler` instead of the default rejection response.
    pub fn with_rejection_handler(mut self, handler: RejectionHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Validate limiter options, build the engine and start its decay task.
    ///
    /// Handler and store names are resolved against `registry`.
    pub fn from_config(config: &LimiterConfig, registry: &Registry) -> Result<Self> {
        let rate_limit = config.rate_limit_value()?;

        let mut builder = AdmissionEngine::builder()
            .rate_limit(rate_limit)
            .prune_settled(config.prune_settled);
        if let Some(property) = &config.identity_property {
            builder = builder.identity_property(property);
        }
        if let Some(header) = &config.identity_header {
            builder = builder.identity_header(header);
        }

        let handler = config
            .rejection_handler
            .as_deref()
            .map(|name| {
                registry.handler(name).ok_or_else(|| {
                    TurnstileError::InvalidConfiguration(format!(
                        "rejection_handler `{}` is not a registered function",
                        name
                    ))
                })
            })
            .transpose()?;

        match (
            config.store_accessor.as_deref(),
            config.store_mutator.as_deref(),
        ) {
            (Some(accessor), Some(mutator)) => {
                let accessor = registry.accessor(accessor).ok_or_else(|| {
                    TurnstileError::InvalidConfiguration(format!(
                        "store_accessor `{}` is not a registered function",
                        accessor
                    ))
                })?;
                let mutator = registry.mutator(mutator).ok_or_else(|| {
                    TurnstileError::InvalidConfiguration(format!(
                        "store_mutator `{}` is not a registered function",
                        mutator
                    ))
                })?;
                builder = builder.store(CallbackStore::new(accessor, mutator));
            }
            (None, None) => {}
            _ => {
                return Err(TurnstileError::InvalidConfiguration(
                    "store_accessor and store_mutator must be set together".to_string(),
                ))
            }
        }

        let engine = Arc::new(builder.build()?);
        engine.start()?;

        Ok(Self { engine, handler })
    }

    /// The engine behind this layer.
    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }
}

impl fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("engine", &self.engine)
            .field("custom_handler", &self.handler.is_some())
            .finish()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            engine: self.engine.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Rate limit middleware service
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    engine: Arc<AdmissionEngine>,
    handler: Option<RejectionHandler>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, std::result::Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let engine = self.engine.clone();
        let handler = self.handler.clone();
        // Take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let key = engine.identify(&req);

            match engine.check(&key).await {
                Ok(Decision::Admit) => inner.oneshot(req).await,
                Ok(Decision::Reject) => match handler {
                    Some(handler) => {
                        debug!(key = %key, "Delegating rejection to custom handler");
                        let next = Next {
                            inner: BoxCloneService::new(inner),
                        };
                        Ok(handler(req, next).await)
                    }
                    None => Ok(response::too_many_requests()),
                },
                Err(e) => {
                    error!(key = %key, error = %e, "Admission check failed");
                    Ok(response::store_unavailable())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ErrorBody;
    use crate::ratelimit::{store_accessor, store_mutator};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;

    fn app(layer: RateLimitLayer) -> Router {
        Router::new()
            .route("/", get(|| async { "OK" }))
            .layer(layer)
    }

    fn layer(config: LimiterConfig) -> RateLimitLayer {
        RateLimitLayer::from_config(&config, &Registry::new()).unwrap()
    }

    async fn send(app: &Router, token: Option<&str>) -> (StatusCode, String) {
        let mut request = Request::get("/");
        if let Some(token) = token {
            request = request.header("token", token);
        }
        let response = app
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn test_handler() -> RejectionHandler {
        rejection_handler(|_req, _next| async {
            (StatusCode::from_u16(512).unwrap(), "test message").into_response()
        })
    }

    #[test]
    fn test_from_config_requires_rate_limit() {
        let result = RateLimitLayer::from_config(&LimiterConfig::default(), &Registry::new());
        assert!(matches!(result, Err(TurnstileError::InvalidRateLimit(_))));
    }

    #[test]
    fn test_from_config_outside_runtime_returns_error() {
        let result = RateLimitLayer::from_config(&LimiterConfig::from(60.0), &Registry::new());
        assert!(matches!(result, Err(TurnstileError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_from_config_shorthand() {
        let layer = layer(LimiterConfig::from(60.0));
        assert_eq!(layer.engine().rate_limit(), 60.0);
        assert!(layer.engine().is_running());
        layer.engine().shutdown().await;
    }

    #[test]
    fn test_from_config_rejects_both_identity_rules() {
        let config = LimiterConfig {
            identity_property: Some("property".to_string()),
            identity_header: Some("header".to_string()),
            ..LimiterConfig::from(50.0)
        };
        let result = RateLimitLayer::from_config(&config, &Registry::new());
        assert!(matches!(result, Err(TurnstileError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_from_config_rejects_unregistered_handler() {
        let config = LimiterConfig {
            rejection_handler: Some("handler".to_string()),
            ..LimiterConfig::from(50.0)
        };
        let result = RateLimitLayer::from_config(&config, &Registry::new());
        assert!(matches!(result, Err(TurnstileError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_from_config_rejects_unpaired_store() {
        let registry =
            Registry::new().with_accessor("redis", store_accessor(|_key| async { Ok(None) }));
        let config = LimiterConfig {
            store_accessor: Some("redis".to_string()),
            ..LimiterConfig::from(50.0)
        };
        let result = RateLimitLayer::from_config(&config, &registry);
        assert!(matches!(result, Err(TurnstileError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_rejects_too_many_requests() {
        let app = app(layer(LimiterConfig::from(3.0)));

        for _ in 0..3 {
            assert_eq!(send(&app, None).await, (StatusCode::OK, "OK".to_string()));
        }

        let (status, body) = send(&app, None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let body: ErrorBody = serde_json::from_str(&body).unwrap();
        assert_eq!(
            body,
            ErrorBody::new(StatusCode::TOO_MANY_REQUESTS, "too many requests")
        );
    }

    #[tokio::test]
    async fn test_calls_custom_handler() {
        let registry = Registry::new().with_handler("custom", test_handler());
        let config = LimiterConfig {
            rejection_handler: Some("custom".to_string()),
            ..LimiterConfig::from(3.0)
        };
        let app = app(RateLimitLayer::from_config(&config, &registry).unwrap());

        for _ in 0..3 {
            assert_eq!(send(&app, None).await, (StatusCode::OK, "OK".to_string()));
        }

        let (status, body) = send(&app, None).await;
        assert_eq!(status.as_u16(), 512);
        assert_eq!(body, "test message");
    }

    #[tokio::test]
    async fn test_handler_can_continue() {
        let engine = Arc::new(AdmissionEngine::builder().rate_limit(1.0).build().unwrap());
        let handler = rejection_handler(|req, next: Next| async move { next.run(req).await });
        let app = app(RateLimitLayer::new(engine).with_rejection_handler(handler));

        assert_eq!(send(&app, None).await, (StatusCode::OK, "OK".to_string()));
        assert_eq!(send(&app, None).await, (StatusCode::OK, "OK".to_string()));
    }

    #[tokio::test]
    async fn test_checks_the_configured_header() {
        let config = LimiterConfig {
            identity_header: Some("token".to_string()),
            ..LimiterConfig::from(3.0)
        };
        let app = app(layer(config));

        for _ in 0..3 {
            assert_eq!(send(&app, Some("first")).await.0, StatusCode::OK);
        }

        let (status, body) = send(&app, Some("first")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let body: ErrorBody = serde_json::from_str(&body).unwrap();
        assert_eq!(body.error.code, 429);

        assert_eq!(
            send(&app, Some("second")).await,
            (StatusCode::OK, "OK".to_string())
        );
    }

    #[tokio::test]
    async fn test_registered_store_callbacks() {
        let data: Arc<parking_lot::Mutex<HashMap<String, f64>>> = Arc::default();
        let reader = data.clone();
        let writer = data.clone();

        let registry = Registry::new()
            .with_accessor(
                "memory",
                store_accessor(move |key| {
                    let value = reader.lock().get(&key).copied();
                    async move { Ok(value) }
                }),
            )
            .with_mutator(
                "memory",
                store_mutator(move |key, value| {
                    writer.lock().insert(key, value);
                    async { Ok(()) }
                }),
            );
        let config = LimiterConfig {
            identity_header: Some("token".to_string()),
            store_accessor: Some("memory".to_string()),
            store_mutator: Some("memory".to_string()),
            ..LimiterConfig::from(2.0)
        };
        let app = app(RateLimitLayer::from_config(&config, &registry).unwrap());

        assert_eq!(send(&app, Some("first")).await.0, StatusCode::OK);
        assert_eq!(send(&app, Some("first")).await.0, StatusCode::OK);
        assert_eq!(
            send(&app, Some("first")).await.0,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(data.lock().get("first"), Some(&2.0));
    }

    #[tokio::test]
    async fn test_store_failure_returns_server_error() {
        let registry = Registry::new()
            .with_accessor(
                "broken",
                store_accessor(|_key| async {
                    Err(TurnstileError::Store("connection refused".to_string()))
                }),
            )
            .with_mutator("broken", store_mutator(|_key, _value| async { Ok(()) }));
        let config = LimiterConfig {
            store_accessor: Some("broken".to_string()),
            store_mutator: Some("broken".to_string()),
            ..LimiterConfig::from(3.0)
        };
        let app = app(RateLimitLayer::from_config(&config, &registry).unwrap());

        let (status, body) = send(&app, None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = serde_json::from_str(&body).unwrap();
        assert_eq!(body.error.code, 500);
    }
}
