//! Tenant registry entity model.
//!
//! One row per provisioned tenant, holding the isolation strategy, the
//! database or schema backing it, and the encrypted credential used when a
//! connection pool is constructed for it. Rows are written once by the admin
//! flow and only ever read by the routing path.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Strategy separating one tenant's data from all others.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationType {
    /// Dedicated database per tenant.
    #[sea_orm(string_value = "DATABASE")]
    Database,
    /// Dedicated schema per tenant within the shared database.
    #[sea_orm(string_value = "SCHEMA")]
    Schema,
    /// Shared tables, rows tagged with a tenant discriminator column.
    #[sea_orm(string_value = "DISCRIMINATOR")]
    Discriminator,
    /// Dedicated schema plus row-level security for child tenants.
    #[sea_orm(string_value = "SCHEMA_DISCRIMINATOR")]
    SchemaDiscriminator,
}

/// Tenant registry record.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    /// Surrogate primary key
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Logical tenant identifier, unique and immutable after creation
    #[sea_orm(unique)]
    pub tenant_id: String,

    /// Isolation strategy, fixed at creation time
    pub isolation_type: IsolationType,

    /// Database or schema name backing the tenant, validated against
    /// `[A-Za-z0-9_]*` before any DDL is issued
    pub db_or_schema: String,

    /// Connection URL the tenant's pool targets
    pub connection_url: String,

    /// Login role the tenant's pool authenticates as
    pub username: String,

    /// AES-256-GCM encrypted database password (AAD = tenant_id)
    pub password_ciphertext: Vec<u8>,

    /// Optimistic-locking version
    pub version: i64,

    pub created_on: DateTimeWithTimeZone,
    pub created_by: Option<String>,
    pub modified_on: DateTimeWithTimeZone,
    pub modified_by: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
