//! HTTP adapter: tower middleware and a small axum server.

mod identity;
mod layer;
mod response;
mod server;

pub use layer::{rejection_handler, Next, RateLimitLayer, RateLimitService, RejectionHandler};
pub use response::{store_unavailable, too_many_requests, ErrorBody, ErrorDetail};
pub use server::HttpServer;
