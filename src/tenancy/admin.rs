//! # Tenant Administration
//!
//! Orchestrates tenant onboarding: validate, encrypt the credential,
//! provision storage, then persist the registry record. The record is written
//! last so a provisioning failure never leaves a registered tenant without
//! storage; the reverse (storage without a record) is possible and accepted,
//! since provisioning has no rollback.

use sea_orm::DatabaseConnection;
use thiserror::Error;

use crate::crypto::{CryptoError, CryptoKey, encrypt_password};
use crate::models::tenant::{IsolationType, Model as TenantModel};
use crate::repositories::{NewTenantRecord, RepositoryError, TenantRepository};
use crate::tenancy::provisioner::{ProvisionError, TenantProvisioner};

/// Errors from tenant onboarding.
#[derive(Debug, Error)]
pub enum TenantAdminError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("failed to encrypt tenant credential: {0}")]
    Encrypt(#[from] CryptoError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Everything needed to onboard a tenant.
#[derive(Debug, Clone)]
pub struct CreateTenantParams {
    pub tenant_id: String,
    pub isolation_type: IsolationType,
    pub db_or_schema: String,
    pub username: String,
    pub password: String,
}

/// Tenant onboarding service.
pub struct TenantAdminService {
    db: DatabaseConnection,
    provisioner: TenantProvisioner,
    crypto_key: CryptoKey,
}

impl TenantAdminService {
    pub fn new(
        db: DatabaseConnection,
        provisioner: TenantProvisioner,
        crypto_key: CryptoKey,
    ) -> Self {
        Self {
            db,
            provisioner,
            crypto_key,
        }
    }

    /// Onboard a tenant: encrypt the credential, provision storage, persist
    /// the registry record.
    pub async fn create_tenant(
        &self,
        params: CreateTenantParams,
    ) -> Result<TenantModel, TenantAdminError> {
        let password_ciphertext =
            encrypt_password(&self.crypto_key, &params.tenant_id, &params.password)?;

        let provisioned = self
            .provisioner
            .provision(params.isolation_type, &params.db_or_schema, &params.password)
            .await?;

        let repo = TenantRepository::new(&self.db);
        let record = repo
            .insert_tenant(NewTenantRecord {
                tenant_id: params.tenant_id,
                isolation_type: params.isolation_type,
                db_or_schema: params.db_or_schema,
                connection_url: provisioned.connection_url,
                username: params.username,
                password_ciphertext,
            })
            .await?;

        tracing::info!(
            tenant_id = %record.tenant_id,
            isolation = ?record.isolation_type,
            "tenant created"
        );

        Ok(record)
    }

    /// Fetch a tenant's registry record.
    pub async fn get_tenant(&self, tenant_id: &str) -> Result<TenantModel, TenantAdminError> {
        let repo = TenantRepository::new(&self.db);
        repo.find_by_tenant_id(tenant_id)
            .await?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!("tenant not found: {}", tenant_id)).into()
            })
    }

    /// List all registered tenants.
    pub async fn list_tenants(&self) -> Result<Vec<TenantModel>, TenantAdminError> {
        let repo = TenantRepository::new(&self.db);
        Ok(repo.list_tenants().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::decrypt_password;
    use migration::MigratorTrait;
    use sea_orm::Database;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![7u8; 32]).expect("valid test key")
    }

    fn service_for(db: DatabaseConnection) -> TenantAdminService {
        let provisioner = TenantProvisioner::new(
            db.clone(),
            "stratum".to_string(),
            "postgres://localhost:5432/".to_string(),
            "postgres://localhost:5432/stratum".to_string(),
        );
        TenantAdminService::new(db, provisioner, test_key())
    }

    async fn registry_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("sqlite memory db connects");
        migration::Migrator::up(&db, None)
            .await
            .expect("registry migrations apply");
        db
    }

    fn params(tenant_id: &str, isolation: IsolationType) -> CreateTenantParams {
        CreateTenantParams {
            tenant_id: tenant_id.to_string(),
            isolation_type: isolation,
            db_or_schema: "shared".to_string(),
            username: "acme".to_string(),
            password: "s3cret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_invalid_name_fails_before_persistence() {
        let service = service_for(DatabaseConnection::Disconnected);

        let result = service
            .create_tenant(CreateTenantParams {
                db_or_schema: "acme; DROP TABLE tenants".to_string(),
                ..params("acme", IsolationType::Schema)
            })
            .await;

        assert!(matches!(
            result,
            Err(TenantAdminError::Provision(
                ProvisionError::InvalidIdentifier { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_provisioning_failure_skips_persistence() {
        // Disconnected backend: the DDL step fails, so no record is written.
        let service = service_for(DatabaseConnection::Disconnected);

        let result = service.create_tenant(params("acme", IsolationType::Schema)).await;
        assert!(matches!(
            result,
            Err(TenantAdminError::Provision(ProvisionError::Ddl { .. }))
        ));
    }

    #[tokio::test]
    async fn test_create_discriminator_tenant_end_to_end() {
        // Discriminator tenants need no DDL, only shared-table migrations,
        // so the whole flow runs against an in-memory database.
        let db = registry_db().await;
        let service = service_for(db);

        let record = service
            .create_tenant(params("acme", IsolationType::Discriminator))
            .await
            .expect("tenant created");

        assert_eq!(record.tenant_id, "acme");
        assert_eq!(record.isolation_type, IsolationType::Discriminator);
        assert_eq!(record.connection_url, "postgres://localhost:5432/stratum");

        // The stored credential decrypts back under the tenant's own id.
        let password = decrypt_password(&test_key(), "acme", &record.password_ciphertext)
            .expect("credential decrypts");
        assert_eq!(password, "s3cret");

        let fetched = service.get_tenant("acme").await.expect("tenant found");
        assert_eq!(fetched.id, record.id);
    }

    #[tokio::test]
    async fn test_duplicate_tenant_conflicts() {
        let db = registry_db().await;
        let service = service_for(db);

        service
            .create_tenant(params("acme", IsolationType::Discriminator))
            .await
            .expect("first create succeeds");

        let result = service
            .create_tenant(params("acme", IsolationType::Discriminator))
            .await;
        assert!(matches!(
            result,
            Err(TenantAdminError::Repository(RepositoryError::Conflict(_)))
        ));
    }

    #[tokio::test]
    async fn test_get_missing_tenant_is_not_found() {
        let db = registry_db().await;
        let service = service_for(db);

        let result = service.get_tenant("ghost").await;
        assert!(matches!(
            result,
            Err(TenantAdminError::Repository(RepositoryError::NotFound(_)))
        ));
    }
}
