//! Request-scoped tenant resolution.
//!
//! [`TenantMiddleware`] pulls a tenant identifier out of an inbound request,
//! fetches the tenant's connection from a [`TenantDatabase`] and stores a
//! [`TenantContext`] in the request's [`Extensions`]. The context lives as
//! long as the request; dropping it releases the connection lease.
//!
//! Extractors are tried in the order they were added and the first non-empty
//! value wins:
//!
//! ```rust
//! use http::{HeaderMap, Uri};
//! use tenantdb_core::middleware::{HeaderExtractor, SubdomainExtractor, TenantExtractor};
//!
//! let mut headers = HeaderMap::new();
//! headers.insert("x-tenant-id", "acme".parse().unwrap());
//! let uri: Uri = "/orders".parse().unwrap();
//!
//! assert_eq!(HeaderExtractor::default().extract(&headers, &uri).as_deref(), Some("acme"));
//! assert_eq!(SubdomainExtractor::new().extract(&headers, &uri), None);
//! ```

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use http::header::HOST;
use http::request::Parts;
use http::{Extensions, HeaderMap, HeaderName, Request, Uri};
use tracing::{debug, warn};

use crate::adapter::Adapter;
use crate::cache::Connection;
use crate::client::TenantDatabase;
use crate::error::{TenantError, TenantResult};
use crate::tenant::TenantId;

/// Default header carrying the tenant.
pub const DEFAULT_TENANT_HEADER: &str = "x-tenant-id";

/// Pulls a raw tenant identifier out of a request.
pub trait TenantExtractor: Send + Sync {
    /// Return the tenant, or `None` when this source has nothing.
    fn extract(&self, headers: &HeaderMap, uri: &Uri) -> Option<String>;
}

/// Reads the tenant from a request header.
#[derive(Debug, Clone)]
pub struct HeaderExtractor {
    header: HeaderName,
}

impl HeaderExtractor {
    /// Read from `header`.
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Default for HeaderExtractor {
    fn default() -> Self {
        Self::new(HeaderName::from_static(DEFAULT_TENANT_HEADER))
    }
}

impl TenantExtractor for HeaderExtractor {
    fn extract(&self, headers: &HeaderMap, _uri: &Uri) -> Option<String> {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }
}

/// Reads the tenant from the leftmost label of the host.
///
/// `acme.example.com` yields `acme`. With a base domain set, only hosts
/// directly below it match. `www` is never a tenant.
#[derive(Debug, Clone, Default)]
pub struct SubdomainExtractor {
    base_domain: Option<String>,
}

impl SubdomainExtractor {
    /// Match any host with at least three labels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only match hosts of the form `<tenant>.<base_domain>`.
    pub fn with_base_domain(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: Some(base_domain.into().trim_matches('.').to_ascii_lowercase()),
        }
    }

    fn subdomain(&self, host: &str) -> Option<String> {
        let host = host.split(':').next()?.trim_end_matches('.').to_ascii_lowercase();
        if host.parse::<IpAddr>().is_ok() {
            return None;
        }
        let label = match &self.base_domain {
            Some(base) => {
                let rest = host.strip_suffix(base.as_str())?.strip_suffix('.')?;
                (!rest.contains('.')).then_some(rest)?
            }
            None => {
                let mut labels = host.split('.');
                let first = labels.next()?;
                (labels.count() >= 2).then_some(first)?
            }
        };

        (!label.is_empty() && label != "www").then(|| label.to_string())
    }
}

impl TenantExtractor for SubdomainExtractor {
    fn extract(&self, headers: &HeaderMap, uri: &Uri) -> Option<String> {
        let host = headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| uri.host())?;
        self.subdomain(host)
    }
}

/// Extractor backed by a closure.
pub struct FnExtractor<F> {
    f: F,
}

impl<F> FnExtractor<F>
where
    F: Fn(&HeaderMap, &Uri) -> Option<String> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> TenantExtractor for FnExtractor<F>
where
    F: Fn(&HeaderMap, &Uri) -> Option<String> + Send + Sync,
{
    fn extract(&self, headers: &HeaderMap, uri: &Uri) -> Option<String> {
        (self.f)(headers, uri)
    }
}

impl<F> fmt::Debug for FnExtractor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnExtractor").finish()
    }
}

/// Tries extractors in order; the first non-empty value wins.
#[derive(Clone, Default)]
pub struct CompositeExtractor {
    extractors: Vec<Arc<dyn TenantExtractor>>,
}

impl CompositeExtractor {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an extractor.
    pub fn push(&mut self, extractor: impl TenantExtractor + 'static) {
        self.extractors.push(Arc::new(extractor));
    }

    /// Append an extractor, builder style.
    pub fn with(mut self, extractor: impl TenantExtractor + 'static) -> Self {
        self.push(extractor);
        self
    }

    /// Number of extractors.
    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    /// Check if the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

impl TenantExtractor for CompositeExtractor {
    fn extract(&self, headers: &HeaderMap, uri: &Uri) -> Option<String> {
        self.extractors.iter().find_map(|extractor| {
            extractor
                .extract(headers, uri)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
    }
}

impl fmt::Debug for CompositeExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeExtractor")
            .field("extractors", &self.extractors.len())
            .finish()
    }
}

/// The tenant and its connection, attached to one request.
pub struct TenantContext<C> {
    /// The resolved tenant.
    pub tenant_id: TenantId,
    /// The tenant's connection lease.
    pub connection: Connection<C>,
}

impl<C: Clone + Send + Sync + 'static> TenantContext<C> {
    /// Borrow the context from request extensions.
    pub fn from_extensions(extensions: &Extensions) -> Option<&Self> {
        extensions.get::<Self>()
    }
}

impl<C: Clone> Clone for TenantContext<C> {
    fn clone(&self) -> Self {
        Self {
            tenant_id: self.tenant_id.clone(),
            connection: self.connection.clone(),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for TenantContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantContext")
            .field("tenant_id", &self.tenant_id)
            .field("connection", &self.connection)
            .finish()
    }
}

/// Resolves the tenant of a request and attaches its connection.
pub struct TenantMiddleware<A: Adapter> {
    database: TenantDatabase<A>,
    extractor: CompositeExtractor,
    default_tenant: Option<TenantId>,
}

impl<A: Adapter> Clone for TenantMiddleware<A> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            extractor: self.extractor.clone(),
            default_tenant: self.default_tenant.clone(),
        }
    }
}

impl<A: Adapter> TenantMiddleware<A> {
    /// Start building a middleware for `database`.
    pub fn builder(database: TenantDatabase<A>) -> TenantMiddlewareBuilder<A> {
        TenantMiddlewareBuilder {
            database,
            extractor: CompositeExtractor::new(),
            default_tenant: None,
        }
    }

    /// Middleware reading the default `X-Tenant-ID` header.
    pub fn new(database: TenantDatabase<A>) -> Self {
        Self {
            database,
            extractor: CompositeExtractor::new().with(HeaderExtractor::default()),
            default_tenant: None,
        }
    }

    /// The database connections come from.
    pub fn database(&self) -> &TenantDatabase<A> {
        &self.database
    }

    /// Resolve the tenant of a request without touching the database.
    pub fn resolve(&self, headers: &HeaderMap, uri: &Uri) -> TenantResult<TenantId> {
        match self.extractor.extract(headers, uri) {
            Some(raw) => TenantId::new(raw),
            None => self.default_tenant.clone().ok_or_else(TenantError::tenant_required),
        }
    }

    /// Resolve the tenant, fetch its connection and attach the context.
    ///
    /// Nothing is attached when any step fails.
    pub async fn attach(&self, headers: &HeaderMap, uri: &Uri, extensions: &mut Extensions) -> TenantResult<TenantId> {
        let tenant = self.resolve(headers, uri).inspect_err(|err| {
            debug!(path = %uri.path(), error = %err, "Tenant resolution failed");
        })?;

        let connection = self.database.connect_tenant(&tenant).await.inspect_err(|err| {
            warn!(tenant = %tenant, error = %err, "Tenant connection failed");
        })?;

        debug!(tenant = %tenant, path = %uri.path(), "Attached tenant context");
        extensions.insert(TenantContext {
            tenant_id: tenant.clone(),
            connection,
        });
        Ok(tenant)
    }

    /// [`attach`](Self::attach) for split request parts.
    pub async fn attach_parts(&self, parts: &mut Parts) -> TenantResult<TenantId> {
        self.attach(&parts.headers, &parts.uri, &mut parts.extensions).await
    }

    /// [`attach`](Self::attach) for a whole request.
    pub async fn attach_request<B>(&self, request: &mut Request<B>) -> TenantResult<TenantId> {
        let headers = request.headers().clone();
        let uri = request.uri().clone();
        self.attach(&headers, &uri, request.extensions_mut()).await
    }
}

impl<A: Adapter> fmt::Debug for TenantMiddleware<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantMiddleware")
            .field("extractor", &self.extractor)
            .field("default_tenant", &self.default_tenant)
            .finish()
    }
}

/// Builder for [`TenantMiddleware`].
pub struct TenantMiddlewareBuilder<A: Adapter> {
    database: TenantDatabase<A>,
    extractor: CompositeExtractor,
    default_tenant: Option<TenantId>,
}

impl<A: Adapter> TenantMiddlewareBuilder<A> {
    /// Read the tenant from a header.
    pub fn header(mut self, header: HeaderName) -> Self {
        self.extractor.push(HeaderExtractor::new(header));
        self
    }

    /// Read the tenant from the host's subdomain.
    pub fn subdomain(mut self, extractor: SubdomainExtractor) -> Self {
        self.extractor.push(extractor);
        self
    }

    /// Resolve the tenant with a closure.
    pub fn resolver<F>(mut self, f: F) -> Self
    where
        F: Fn(&HeaderMap, &Uri) -> Option<String> + Send + Sync + 'static,
    {
        self.extractor.push(FnExtractor::new(f));
        self
    }

    /// Add any extractor.
    pub fn extractor(mut self, extractor: impl TenantExtractor + 'static) -> Self {
        self.extractor.push(extractor);
        self
    }

    /// Use `tenant` when no extractor finds one.
    pub fn default_tenant(mut self, tenant: impl AsRef<str>) -> TenantResult<Self> {
        self.default_tenant = Some(TenantId::new(tenant.as_ref())?);
        Ok(self)
    }

    /// Finish. With no extractor configured, the default header is used.
    pub fn build(self) -> TenantMiddleware<A> {
        let extractor = if self.extractor.is_empty() {
            CompositeExtractor::new().with(HeaderExtractor::default())
        } else {
            self.extractor
        };
        TenantMiddleware {
            database: self.database,
            extractor,
            default_tenant: self.default_tenant,
        }
    }
}
