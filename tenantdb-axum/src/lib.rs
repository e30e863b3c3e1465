//! Axum integration for tenantdb.
//!
//! [`TenantLayer`] runs a [`TenantMiddleware`] in front of every request:
//! the tenant is resolved, its connection is fetched and a
//! [`TenantContext`] is stored in the request extensions. Handlers pull it
//! out with the [`Tenant`] extractor. Requests whose tenant cannot be
//! resolved or connected never reach the handler; they are answered with a
//! JSON error (see [`TenantRejection`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use axum::{Router, routing::get};
//! use tenantdb::{DatabaseConfig, create_db};
//! use tenantdb::any::AnyClient;
//! use tenantdb_axum::{Tenant, TenantLayer};
//!
//! async fn whoami(Tenant(ctx): Tenant<AnyClient>) -> String {
//!     ctx.tenant_id.to_string()
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = create_db(DatabaseConfig::from_env()?)?;
//!
//!     let app = Router::new()
//!         .route("/whoami", get(whoami))
//!         .layer(TenantLayer::from_database(db));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

use std::convert::Infallible;
use std::ops::Deref;
use std::task::{Context, Poll};

use axum::Json;
use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::request::Parts;
use http::{Request, StatusCode};
use serde_json::json;
use tenantdb_core::{Adapter, ErrorKind, TenantDatabase, TenantError};
use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, warn};

pub use tenantdb_core::middleware::{
    HeaderExtractor, SubdomainExtractor, TenantContext, TenantExtractor, TenantMiddleware,
};

/// A tenant failure turned into an HTTP response.
///
/// | Error kind | Status |
/// |------------|--------|
/// | validation, tenant resolution | 400 |
/// | tenant not found | 404 |
/// | tenant already exists | 409 |
/// | connection | 503 |
/// | anything else | 500 |
#[derive(Error, Debug, Clone)]
#[error(transparent)]
pub struct TenantRejection(pub TenantError);

impl TenantRejection {
    /// The HTTP status this rejection answers with.
    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::Validation | ErrorKind::TenantResolution => StatusCode::BAD_REQUEST,
            ErrorKind::TenantNotFound => StatusCode::NOT_FOUND,
            ErrorKind::TenantAlreadyExists => StatusCode::CONFLICT,
            ErrorKind::Connection => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Configuration | ErrorKind::Database | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The underlying error.
    pub fn error(&self) -> &TenantError {
        &self.0
    }
}

impl From<TenantError> for TenantRejection {
    fn from(err: TenantError) -> Self {
        Self(err)
    }
}

impl IntoResponse for TenantRejection {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "Rejecting request");
        } else {
            debug!(status = status.as_u16(), error = %self.0, "Rejecting request");
        }

        let body = json!({
            "error": {
                "code": self.0.code.code(),
                "message": self.0.message,
                "tenant": self.0.context.tenant,
                "suggestions": self.0.context.suggestions,
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Tower layer attaching a [`TenantContext`] to every request.
pub struct TenantLayer<A: Adapter> {
    middleware: TenantMiddleware<A>,
}

impl<A: Adapter> TenantLayer<A> {
    /// Wrap a configured middleware.
    pub fn new(middleware: TenantMiddleware<A>) -> Self {
        Self { middleware }
    }

    /// Layer reading the tenant from the `X-Tenant-ID` header.
    pub fn from_database(database: TenantDatabase<A>) -> Self {
        Self::new(TenantMiddleware::new(database))
    }

    /// The middleware.
    pub fn middleware(&self) -> &TenantMiddleware<A> {
        &self.middleware
    }
}

impl<A: Adapter> Clone for TenantLayer<A> {
    fn clone(&self) -> Self {
        Self {
            middleware: self.middleware.clone(),
        }
    }
}

impl<S, A: Adapter> Layer<S> for TenantLayer<A> {
    type Service = TenantService<S, A>;

    fn layer(&self, inner: S) -> Self::Service {
        TenantService {
            inner,
            middleware: self.middleware.clone(),
        }
    }
}

/// Service produced by [`TenantLayer`].
pub struct TenantService<S, A: Adapter> {
    inner: S,
    middleware: TenantMiddleware<A>,
}

impl<S: Clone, A: Adapter> Clone for TenantService<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            middleware: self.middleware.clone(),
        }
    }
}

impl<S, A, B> Service<Request<B>> for TenantService<S, A>
where
    S: Service<Request<B>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
    A: Adapter,
    B: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        // The clone may not be ready; keep the instance that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let middleware = self.middleware.clone();

        Box::pin(async move {
            let (mut parts, body) = request.into_parts();
            match middleware.attach_parts(&mut parts).await {
                Ok(_) => inner.call(Request::from_parts(parts, body)).await,
                Err(err) => Ok(TenantRejection(err).into_response()),
            }
        })
    }
}

/// Extractor for the request's [`TenantContext`].
///
/// Requires [`TenantLayer`]; without it the extractor answers 500.
///
/// ```rust,ignore
/// async fn handler(Tenant(ctx): Tenant<PgClient>) -> String {
///     format!("hello {}", ctx.tenant_id)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Tenant<C>(pub TenantContext<C>);

impl<C> Deref for Tenant<C> {
    type Target = TenantContext<C>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S, C> FromRequestParts<S> for Tenant<C>
where
    S: Send + Sync,
    C: Clone + Send + Sync + 'static,
{
    type Rejection = TenantRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        TenantContext::<C>::from_extensions(&parts.extensions)
            .cloned()
            .map(Tenant)
            .ok_or_else(|| {
                TenantRejection(
                    TenantError::internal("No tenant context on the request")
                        .with_help("Add TenantLayer to the router"),
                )
            })
    }
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{Tenant, TenantLayer, TenantRejection, TenantService};
    pub use tenantdb_core::middleware::{TenantContext, TenantMiddleware};
}
