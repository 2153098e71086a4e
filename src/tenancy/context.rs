//! # Tenant Context
//!
//! Request-scoped tenant identity. The identity is resolved once per request
//! from headers (falling back to the configured default tenant) and carried
//! through task-local storage, so every layer below the handler can ask "whose
//! data am I touching" without threading it through call signatures.
//!
//! Child tasks receive a snapshot of the identity at spawn time. Mutations in
//! a child scope never leak back into the parent request.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tokio::task_local;

use crate::error::ApiError;
use crate::server::AppState;
use crate::tenancy::{NO_TENANT, PARENT_TENANT_HEADER, TENANT_HEADER};

/// The tenant a request acts on behalf of.
///
/// `parent_tenant_id` is [`NO_TENANT`] for standalone tenants. When it names a
/// real tenant, the request belongs to a hierarchical child tenant whose rows
/// live inside the parent's schema under row-level security.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantIdentity {
    pub tenant_id: String,
    pub parent_tenant_id: String,
}

impl TenantIdentity {
    pub fn new(tenant_id: impl Into<String>, parent_tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            parent_tenant_id: parent_tenant_id.into(),
        }
    }

    /// Identity for a standalone tenant with no parent.
    pub fn standalone(tenant_id: impl Into<String>) -> Self {
        Self::new(tenant_id, NO_TENANT)
    }

    /// Identity representing "no tenant selected".
    pub fn unresolved() -> Self {
        Self::new(NO_TENANT, NO_TENANT)
    }

    /// Whether this identity is a child tenant inside a parent's schema.
    pub fn is_hierarchical(&self) -> bool {
        self.parent_tenant_id != NO_TENANT
    }

    /// Whether any tenant has been selected at all.
    pub fn is_resolved(&self) -> bool {
        self.tenant_id != NO_TENANT
    }

    /// The tenant whose registry entry decides the physical connection.
    ///
    /// Hierarchical children share their parent's storage, so routing targets
    /// the parent; the child id only shows up in session state.
    pub fn routing_tenant(&self) -> &str {
        if self.is_hierarchical() {
            &self.parent_tenant_id
        } else {
            &self.tenant_id
        }
    }
}

task_local! {
    static ACTIVE_TENANT: TenantIdentity;
}

/// Execute `future` with the given identity as the active tenant context.
///
/// The identity is cloned into any task spawned inside the scope via
/// [`current_identity`], so concurrent requests never observe each other's
/// tenant.
pub async fn with_tenant<Fut, R>(identity: TenantIdentity, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_TENANT.scope(identity, future).await
}

/// Execute `future` with no tenant selected, shadowing any enclosing scope.
///
/// Sub-tasks forked before the clear keep the identity they snapshotted.
pub async fn clear_tenant<Fut, R>(future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    with_tenant(TenantIdentity::unresolved(), future).await
}

/// Snapshot of the active tenant identity, if one is set for the running task.
pub fn current_identity() -> Option<TenantIdentity> {
    ACTIVE_TENANT.try_with(|identity| identity.clone()).ok()
}

/// Resolve a tenant identity from request headers.
///
/// A missing or empty tenant header falls back to the configured default
/// tenant when one is set, otherwise to the [`NO_TENANT`] sentinel. The parent
/// header defaults to [`NO_TENANT`].
pub fn resolve_identity(
    tenant_header: Option<&str>,
    parent_header: Option<&str>,
    default_tenant: Option<&str>,
) -> TenantIdentity {
    let tenant_id = match tenant_header.filter(|value| !value.trim().is_empty()) {
        Some(value) => value.trim().to_string(),
        None => default_tenant
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(NO_TENANT)
            .to_string(),
    };

    let parent_tenant_id = parent_header
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| NO_TENANT.to_string());

    TenantIdentity {
        tenant_id,
        parent_tenant_id,
    }
}

/// Axum extractor resolving the tenant identity for the current request.
#[derive(Debug, Clone)]
pub struct TenantScope(pub TenantIdentity);

impl FromRequestParts<AppState> for TenantScope {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let tenant_header = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|value| value.to_str().ok());
        let parent_header = parts
            .headers
            .get(PARENT_TENANT_HEADER)
            .and_then(|value| value.to_str().ok());

        let identity = resolve_identity(
            tenant_header,
            parent_header,
            state.config.default_tenant.as_deref(),
        );

        tracing::debug!(
            tenant_id = %identity.tenant_id,
            parent_tenant_id = %identity.parent_tenant_id,
            "resolved tenant scope"
        );

        Ok(TenantScope(identity))
    }
}
