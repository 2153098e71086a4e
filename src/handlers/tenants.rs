//! # Tenant Admin Handlers
//!
//! Endpoints for onboarding tenants and inspecting the registry. Responses
//! never include the stored credential ciphertext.

use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, validation_error};
use crate::models::tenant::{IsolationType, Model as TenantModel};
use crate::server::AppState;
use crate::tenancy::admin::CreateTenantParams;
use crate::tenancy::is_valid_identifier;

/// Request payload for onboarding a tenant
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateTenantRequest {
    /// Logical tenant identifier (required, max 64 characters)
    #[schema(example = "acme")]
    pub tenant_id: String,
    /// Isolation strategy for the tenant's data
    pub isolation_type: IsolationType,
    /// Database or schema name to create, `[A-Za-z0-9_]*`
    #[schema(example = "acme")]
    pub db_or_schema: String,
    /// Login role the tenant's pool will authenticate as
    #[schema(example = "acme")]
    pub user_name: String,
    /// Database password for the tenant's roles
    pub password: String,
}

/// Registry view of a tenant, credential omitted
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantResponse {
    /// Unique identifier for the registry record (UUID)
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: Uuid,
    #[schema(example = "acme")]
    pub tenant_id: String,
    pub isolation_type: IsolationType,
    #[schema(example = "acme")]
    pub db_or_schema: String,
    #[schema(example = "postgres://localhost:5432/acme")]
    pub connection_url: String,
    #[schema(example = "acme")]
    pub username: String,
    /// Timestamp when the tenant was created (ISO 8601)
    #[schema(example = "2024-01-15T10:30:00Z")]
    pub created_on: String,
}

impl From<TenantModel> for TenantResponse {
    fn from(model: TenantModel) -> Self {
        Self {
            id: model.id,
            tenant_id: model.tenant_id,
            isolation_type: model.isolation_type,
            db_or_schema: model.db_or_schema,
            connection_url: model.connection_url,
            username: model.username,
            created_on: model.created_on.to_rfc3339(),
        }
    }
}

fn validate(request: &CreateTenantRequest) -> Result<(), ApiError> {
    if request.tenant_id.trim().is_empty() {
        return Err(validation_error(
            "Tenant id is required",
            json!({ "field": "tenant_id", "message": "Tenant id cannot be empty" }),
        ));
    }
    if request.tenant_id.len() > 64 {
        return Err(validation_error(
            "Tenant id exceeds maximum length",
            json!({ "field": "tenant_id", "max_length": 64 }),
        ));
    }
    if !is_valid_identifier(&request.db_or_schema) {
        return Err(validation_error(
            "Invalid database or schema name",
            json!({ "field": "db_or_schema", "message": "Only letters, digits and underscore are allowed" }),
        ));
    }
    if !is_valid_identifier(&request.user_name) || request.user_name.is_empty() {
        return Err(validation_error(
            "Invalid user name",
            json!({ "field": "user_name", "message": "Only letters, digits and underscore are allowed" }),
        ));
    }
    if request.password.is_empty() {
        return Err(validation_error(
            "Password is required",
            json!({ "field": "password", "message": "Password cannot be empty" }),
        ));
    }
    Ok(())
}

/// Onboard a new tenant
#[utoipa::path(
    post,
    path = "/api/v1/tenants",
    request_body = CreateTenantRequest,
    responses(
        (status = 201, description = "Tenant created", body = TenantResponse),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 409, description = "Tenant already exists", body = ApiError),
        (status = 500, description = "Provisioning failed", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn create_tenant(
    State(state): State<AppState>,
    payload: Result<Json<CreateTenantRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TenantResponse>), ApiError> {
    let Json(request) = payload?;
    validate(&request)?;

    let record = state
        .admin
        .create_tenant(CreateTenantParams {
            tenant_id: request.tenant_id.trim().to_string(),
            isolation_type: request.isolation_type,
            db_or_schema: request.db_or_schema,
            username: request.user_name,
            password: request.password,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(record.into())))
}

/// Fetch a tenant's registry record
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}",
    params(
        ("tenant_id" = String, Path, description = "Logical tenant identifier")
    ),
    responses(
        (status = 200, description = "Tenant found", body = TenantResponse),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<TenantResponse>, ApiError> {
    let record = state.admin.get_tenant(&tenant_id).await?;
    Ok(Json(record.into()))
}

/// List all registered tenants
#[utoipa::path(
    get,
    path = "/api/v1/tenants",
    responses(
        (status = 200, description = "Registered tenants", body = [TenantResponse])
    ),
    tag = "tenants"
)]
pub async fn list_tenants(
    State(state): State<AppState>,
) -> Result<Json<Vec<TenantResponse>>, ApiError> {
    let records = state.admin.list_tenants().await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tenant_id: &str, db_or_schema: &str, user_name: &str) -> CreateTenantRequest {
        CreateTenantRequest {
            tenant_id: tenant_id.to_string(),
            isolation_type: IsolationType::Schema,
            db_or_schema: db_or_schema.to_string(),
            user_name: user_name.to_string(),
            password: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(validate(&request("acme", "acme", "acme")).is_ok());
    }

    #[test]
    fn test_empty_tenant_id_rejected() {
        let err = validate(&request("  ", "acme", "acme")).expect_err("rejected");
        assert_eq!(err.code, Box::from("VALIDATION_FAILED"));
    }

    #[test]
    fn test_injection_in_db_or_schema_rejected() {
        let err =
            validate(&request("acme", "acme; DROP TABLE tenants", "acme")).expect_err("rejected");
        assert_eq!(err.code, Box::from("VALIDATION_FAILED"));
    }

    #[test]
    fn test_empty_password_rejected() {
        let mut req = request("acme", "acme", "acme");
        req.password = String::new();
        assert!(validate(&req).is_err());
    }

    #[test]
    fn test_response_omits_credential() {
        let json = serde_json::to_string(&TenantResponse {
            id: Uuid::nil(),
            tenant_id: "acme".to_string(),
            isolation_type: IsolationType::Schema,
            db_or_schema: "acme".to_string(),
            connection_url: "postgres://localhost:5432/stratum".to_string(),
            username: "acme".to_string(),
            created_on: "2024-01-15T10:30:00Z".to_string(),
        })
        .expect("serializes");

        assert!(!json.contains("password"));
        assert!(!json.contains("ciphertext"));
    }
}
