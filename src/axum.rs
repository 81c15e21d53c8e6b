//! Axum integration: middleware and a catch-all federation handler
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use fedify::axum::{federation_handler, FederationMiddleware};
//! # use fedify::config::FederationConfig;
//! # use fedify::federation::FederationBuilder;
//! # use fedify::kv::MemoryKvStore;
//! # async fn demo() -> Result<(), fedify::error::Error> {
//! let config = FederationConfig::builder()
//!     .app_data(())
//!     .kv(Arc::new(MemoryKvStore::new()))
//!     .build()?;
//! let federation = FederationBuilder::<()>::new().build(config)?;
//! let app: axum::Router = axum::Router::new()
//!     .fallback(federation_handler::<()>)
//!     .layer(FederationMiddleware::new(federation));
//! # Ok(()) }
//! ```

use crate::federation::Federation;
use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use http::request::Parts;
use http::{Request, StatusCode};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Inbound bodies above this size are rejected before processing.
const BODY_LIMIT: usize = 1024 * 1024;

/// Passes the [Federation] to HTTP handlers via request extensions.
#[derive(Clone)]
pub struct FederationMiddleware<T: Clone>(Federation<T>);

impl<T: Clone> FederationMiddleware<T> {
    /// Construct a new middleware instance
    pub fn new(federation: Federation<T>) -> Self {
        FederationMiddleware(federation)
    }
}

impl<S, T: Clone> Layer<S> for FederationMiddleware<T> {
    type Service = FederationService<S, T>;

    fn layer(&self, inner: S) -> Self::Service {
        FederationService {
            inner,
            federation: self.0.clone(),
        }
    }
}

/// Service which stores the federation in request extensions
#[doc(hidden)]
#[derive(Clone)]
pub struct FederationService<S, T: Clone> {
    inner: S,
    federation: Federation<T>,
}

impl<S, T> Service<Request<Body>> for FederationService<S, T>
where
    S: Service<Request<Body>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        request.extensions_mut().insert(self.federation.clone());
        self.inner.call(request)
    }
}

impl<S, T> FromRequestParts<S> for Federation<T>
where
    S: Send + Sync,
    T: Clone + Send + Sync + 'static,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<Federation<T>>() {
            Some(federation) => Ok(federation.clone()),
            None => Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Missing extension, did you register FederationMiddleware?",
            )),
        }
    }
}

/// Catch-all handler feeding requests into the federation pipeline.
///
/// Mount as the router's fallback; requests no federation route claims
/// come back as plain 404s, so application routes registered on the same
/// router keep working.
pub async fn federation_handler<T: Clone + Send + Sync + 'static>(
    federation: Federation<T>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };
    let request = Request::from_parts(parts, bytes);
    match federation.handle(request).await {
        Some(response) => response.map(Body::from),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
