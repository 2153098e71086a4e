//! # Tenant Registry Repository
//!
//! Persistence for [`crate::models::tenant`] records. The routing path only
//! ever reads (`find_by_tenant_id` on every pool-cache miss); the admin flow
//! inserts exactly once, after provisioning has fully succeeded.

use crate::models::tenant::{
    ActiveModel as TenantActiveModel, Column as TenantColumn, Entity as Tenant,
    IsolationType, Model as TenantModel,
};
use crate::repositories::RepositoryError;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use uuid::Uuid;

/// Data for a fully provisioned tenant, ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewTenantRecord {
    pub tenant_id: String,
    pub isolation_type: IsolationType,
    pub db_or_schema: String,
    pub connection_url: String,
    pub username: String,
    pub password_ciphertext: Vec<u8>,
}

/// Repository for tenant registry operations.
pub struct TenantRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> TenantRepository<'a> {
    /// Create a new TenantRepository with the given database connection
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Persist a newly provisioned tenant.
    pub async fn insert_tenant(
        &self,
        record: NewTenantRecord,
    ) -> Result<TenantModel, RepositoryError> {
        Self::validate_tenant_id(&record.tenant_id)?;

        let now = Utc::now();
        let tenant = TenantActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(record.tenant_id),
            isolation_type: Set(record.isolation_type),
            db_or_schema: Set(record.db_or_schema),
            connection_url: Set(record.connection_url),
            username: Set(record.username),
            password_ciphertext: Set(record.password_ciphertext),
            version: Set(0),
            created_on: Set(now.into()),
            created_by: Set(None),
            modified_on: Set(now.into()),
            modified_by: Set(None),
        };

        let result = tenant
            .insert(self.db)
            .await
            .map_err(RepositoryError::database_error)?;

        Ok(result)
    }

    /// Look up a tenant by its logical identifier.
    pub async fn find_by_tenant_id(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantModel>, RepositoryError> {
        let tenant = Tenant::find()
            .filter(TenantColumn::TenantId.eq(tenant_id))
            .one(self.db)
            .await
            .map_err(RepositoryError::database_error)?;

        Ok(tenant)
    }

    /// Check whether a tenant with the given identifier exists.
    pub async fn tenant_exists(&self, tenant_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.find_by_tenant_id(tenant_id).await?.is_some())
    }

    /// List all registered tenants.
    pub async fn list_tenants(&self) -> Result<Vec<TenantModel>, RepositoryError> {
        let tenants = Tenant::find()
            .all(self.db)
            .await
            .map_err(RepositoryError::database_error)?;

        Ok(tenants)
    }

    /// Validate a logical tenant identifier.
    fn validate_tenant_id(tenant_id: &str) -> Result<(), RepositoryError> {
        if tenant_id.trim().is_empty() {
            return Err(RepositoryError::validation_error(
                "Tenant id cannot be empty",
            ));
        }

        if tenant_id.len() > 64 {
            return Err(RepositoryError::validation_error(
                "Tenant id cannot exceed 64 characters",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::MigratorTrait;
    use sea_orm::Database;

    async fn setup_test_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("sqlite memory db connects");
        migration::Migrator::up(&db, None)
            .await
            .expect("registry migrations apply");
        db
    }

    fn sample_record(tenant_id: &str) -> NewTenantRecord {
        NewTenantRecord {
            tenant_id: tenant_id.to_string(),
            isolation_type: IsolationType::Schema,
            db_or_schema: "acme".to_string(),
            connection_url: "postgres://localhost:5432/stratum".to_string(),
            username: "acme".to_string(),
            password_ciphertext: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_by_tenant_id() {
        let db = setup_test_db().await;
        let repo = TenantRepository::new(&db);

        let created = repo
            .insert_tenant(sample_record("acme"))
            .await
            .expect("tenant inserts");
        assert_eq!(created.tenant_id, "acme");
        assert_eq!(created.isolation_type, IsolationType::Schema);
        assert_eq!(created.version, 0);

        let found = repo
            .find_by_tenant_id("acme")
            .await
            .expect("lookup succeeds")
            .expect("tenant found");
        assert_eq!(found.id, created.id);
        assert_eq!(found.connection_url, "postgres://localhost:5432/stratum");

        let missing = repo
            .find_by_tenant_id("nobody")
            .await
            .expect("lookup succeeds");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_tenant_id_conflicts() {
        let db = setup_test_db().await;
        let repo = TenantRepository::new(&db);

        repo.insert_tenant(sample_record("acme"))
            .await
            .expect("first insert succeeds");

        let result = repo.insert_tenant(sample_record("acme")).await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_tenant_id_validation() {
        let db = setup_test_db().await;
        let repo = TenantRepository::new(&db);

        let result = repo.insert_tenant(sample_record("")).await;
        assert!(matches!(result, Err(RepositoryError::Validation(_))));

        let result = repo.insert_tenant(sample_record(&"a".repeat(65))).await;
        assert!(matches!(result, Err(RepositoryError::Validation(_))));
    }

    #[tokio::test]
    async fn test_tenant_exists_and_list() {
        let db = setup_test_db().await;
        let repo = TenantRepository::new(&db);

        assert!(!repo.tenant_exists("acme").await.expect("exists check"));

        repo.insert_tenant(sample_record("acme"))
            .await
            .expect("insert succeeds");
        repo.insert_tenant(NewTenantRecord {
            tenant_id: "globex".to_string(),
            db_or_schema: "globex".to_string(),
            username: "globex".to_string(),
            ..sample_record("globex")
        })
        .await
        .expect("insert succeeds");

        assert!(repo.tenant_exists("acme").await.expect("exists check"));
        let all = repo.list_tenants().await.expect("list succeeds");
        assert_eq!(all.len(), 2);
    }
}
