//! # Customer Handlers
//!
//! Tenant-scoped data access. The listing endpoint is the proof of the whole
//! routing stack: the tenant scope comes from headers, the connection from
//! the tenant's own pool, and the rows from whichever isolation mechanism
//! backs the tenant (dedicated database, schema, discriminator column, or
//! row-level security).

use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, validation_error};
use crate::models::tenant::IsolationType;
use crate::server::AppState;
use crate::tenancy::TENANT_HEADER;
use crate::tenancy::context::{TenantScope, current_identity, with_tenant};

/// A customer row from the tenant's storage
#[derive(Debug, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct CustomerResponse {
    pub id: Uuid,
    #[schema(example = "CUST-0001")]
    pub customer_id: String,
    pub first_name: String,
    pub last_name: String,
    #[schema(example = "acme")]
    pub tenant_id: String,
}

/// List the customers visible to the current tenant
#[utoipa::path(
    get,
    path = "/api/v1/customers",
    params(
        ("X-TENANT-ID" = String, Header, description = "Logical tenant identifier"),
        ("X-PARENT-TENANT-ID" = Option<String>, Header, description = "Parent tenant for hierarchical children")
    ),
    responses(
        (status = 200, description = "Customers for the current tenant", body = [CustomerResponse]),
        (status = 400, description = "No tenant selected", body = ApiError),
        (status = 404, description = "Unknown tenant", body = ApiError),
        (status = 503, description = "Tenant database unavailable", body = ApiError)
    ),
    tag = "customers"
)]
pub async fn list_customers(
    State(state): State<AppState>,
    TenantScope(identity): TenantScope,
) -> Result<Json<Vec<CustomerResponse>>, ApiError> {
    if !identity.is_resolved() {
        return Err(validation_error(
            "No tenant selected",
            json!({ "header": TENANT_HEADER, "message": "Tenant header is required" }),
        ));
    }

    with_tenant(identity, fetch_customers(state)).await
}

async fn fetch_customers(state: AppState) -> Result<Json<Vec<CustomerResponse>>, ApiError> {
    let identity = current_identity().ok_or_else(|| {
        tracing::error!("tenant context missing inside tenant scope");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    })?;

    let mut conn = state.router.acquire(&identity).await?;

    // Discriminator tenants share tables and filter explicitly; the other
    // strategies isolate through the connection itself (dedicated database,
    // search_path, or row-security on the session variable).
    let query = if conn.isolation() == IsolationType::Discriminator {
        sqlx::query_as::<_, CustomerResponse>(
            "SELECT id, customer_id, first_name, last_name, tenant_id \
             FROM customers WHERE tenant_id = $1",
        )
        .bind(&identity.tenant_id)
    } else {
        sqlx::query_as::<_, CustomerResponse>(
            "SELECT id, customer_id, first_name, last_name, tenant_id FROM customers",
        )
    };

    let result = query.fetch_all(&mut *conn).await;

    match result {
        Ok(customers) => {
            conn.release().await?;
            Ok(Json(customers))
        }
        Err(err) => {
            tracing::error!(
                tenant_id = %identity.tenant_id,
                error = %err,
                "customer query failed"
            );
            if let Err(release_err) = conn.release().await {
                tracing::warn!(error = %release_err, "failed to release tenant connection");
            }
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
                "Failed to query customers",
            ))
        }
    }
}
