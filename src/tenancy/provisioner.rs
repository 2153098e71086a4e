//! # Tenant Provisioning
//!
//! Creates the physical storage behind a new tenant: databases, schemas,
//! owner and row-access roles, and the tenant's table set via migrations.
//!
//! Names are interpolated into DDL (Postgres cannot parameterize DDL), so
//! every database or schema name is validated against `[A-Za-z0-9_]*` before
//! any statement is built. Provisioning is not transactional: DDL like
//! `CREATE DATABASE` cannot run inside a transaction, so a failure partway
//! leaves earlier steps in place and reports the step that failed.

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use sea_orm::SqlxPostgresConnector;
use sea_orm_migration::MigratorTrait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use thiserror::Error;

use crate::models::tenant::IsolationType;
use crate::tenancy::{ROW_ACCESS_ROLE_SUFFIX, is_valid_identifier};
use migration::tenant::{BaseMigrator, HierarchyMigrator};

/// Errors from tenant storage provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid database or schema name: {value}")]
    InvalidIdentifier { value: String },
    #[error("failed to execute provisioning DDL for {target}: {source}")]
    Ddl {
        target: String,
        #[source]
        source: sea_orm::DbErr,
    },
    #[error("failed to run tenant migrations for {target}: {source}")]
    Migration {
        target: String,
        #[source]
        source: sea_orm::DbErr,
    },
    #[error("invalid connection URL for {target}: {source}")]
    Url {
        target: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Outcome of provisioning: where the tenant's pool should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedTenant {
    pub connection_url: String,
}

/// Provisions tenant storage on the master database server.
pub struct TenantProvisioner {
    /// Master connection; DDL runs here and discriminator tenants share it.
    db: DatabaseConnection,
    /// Name of the shared database schema tenants live in.
    database_name: String,
    /// Prefix database names are appended to, e.g. `postgres://host:5432/`.
    url_prefix: String,
    /// Full URL of the shared database, used for schema-scoped migrations.
    shared_url: String,
}

impl TenantProvisioner {
    pub fn new(
        db: DatabaseConnection,
        database_name: String,
        url_prefix: String,
        shared_url: String,
    ) -> Self {
        Self {
            db,
            database_name,
            url_prefix,
            shared_url,
        }
    }

    /// Create the storage for a tenant and return its connection URL.
    ///
    /// There is no rollback: a failure partway through leaves the completed
    /// steps in place.
    pub async fn provision(
        &self,
        isolation: IsolationType,
        db_or_schema: &str,
        password: &str,
    ) -> Result<ProvisionedTenant, ProvisionError> {
        if !is_valid_identifier(db_or_schema) {
            return Err(ProvisionError::InvalidIdentifier {
                value: db_or_schema.to_string(),
            });
        }

        let connection_url = match isolation {
            IsolationType::Database => {
                self.execute_ddl(db_or_schema, &database_ddl(db_or_schema, password))
                    .await?;
                let url = format!("{}{}", self.url_prefix, db_or_schema);
                self.migrate_database(db_or_schema, &url, password).await?;
                url
            }
            IsolationType::Schema => {
                self.execute_ddl(
                    db_or_schema,
                    &schema_ddl(db_or_schema, &self.database_name, password),
                )
                .await?;
                self.migrate_schema(db_or_schema, false).await?;
                format!("{}{}", self.url_prefix, self.database_name)
            }
            IsolationType::Discriminator => {
                // Shared tables in the shared database; no DDL beyond the
                // migrations themselves.
                BaseMigrator::up(&self.db, None)
                    .await
                    .map_err(|source| ProvisionError::Migration {
                        target: self.database_name.clone(),
                        source,
                    })?;
                format!("{}{}", self.url_prefix, self.database_name)
            }
            IsolationType::SchemaDiscriminator => {
                self.execute_ddl(
                    db_or_schema,
                    &schema_ddl(db_or_schema, &self.database_name, password),
                )
                .await?;
                self.execute_ddl(
                    db_or_schema,
                    &row_access_role_ddl(db_or_schema, &self.database_name, password),
                )
                .await?;
                self.migrate_schema(db_or_schema, true).await?;
                format!("{}{}", self.url_prefix, self.database_name)
            }
        };

        tracing::info!(
            db_or_schema = %db_or_schema,
            isolation = ?isolation,
            "provisioned tenant storage"
        );

        Ok(ProvisionedTenant { connection_url })
    }

    async fn execute_ddl(&self, target: &str, statements: &[String]) -> Result<(), ProvisionError> {
        for statement in statements {
            self.db
                .execute_unprepared(statement)
                .await
                .map_err(|source| ProvisionError::Ddl {
                    target: target.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Run the base migrations inside a freshly created tenant database,
    /// authenticated as the tenant's owner role.
    async fn migrate_database(
        &self,
        db: &str,
        url: &str,
        password: &str,
    ) -> Result<(), ProvisionError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|source| ProvisionError::Url {
                target: db.to_string(),
                source,
            })?
            .username(db)
            .password(password);

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(options);
        let conn = SqlxPostgresConnector::from_sqlx_postgres_pool(pool.clone());

        let result = BaseMigrator::up(&conn, None)
            .await
            .map_err(|source| ProvisionError::Migration {
                target: db.to_string(),
                source,
            });
        pool.close().await;
        result
    }

    /// Run migrations scoped to a tenant schema in the shared database.
    async fn migrate_schema(&self, schema: &str, hierarchy: bool) -> Result<(), ProvisionError> {
        let mut options = ConnectOptions::new(&self.shared_url);
        options
            .max_connections(1)
            .set_schema_search_path(schema.to_string());

        let conn =
            Database::connect(options)
                .await
                .map_err(|source| ProvisionError::Migration {
                    target: schema.to_string(),
                    source,
                })?;

        // HierarchyMigrator is a superset of BaseMigrator, so hierarchical
        // schemas run it alone.
        let result = if hierarchy {
            HierarchyMigrator::up(&conn, None).await
        } else {
            BaseMigrator::up(&conn, None).await
        };

        if let Err(err) = conn.close().await {
            tracing::warn!(schema = %schema, error = %err, "failed to close migration connection");
        }

        result.map_err(|source| ProvisionError::Migration {
            target: schema.to_string(),
            source,
        })
    }
}

/// DDL creating a dedicated database and its owner role.
fn database_ddl(db: &str, password: &str) -> Vec<String> {
    vec![
        format!("CREATE DATABASE {}", db),
        format!(
            "CREATE USER {} WITH ENCRYPTED PASSWORD '{}'",
            db,
            quote_literal(password)
        ),
        format!("GRANT ALL PRIVILEGES ON DATABASE {} TO {}", db, db),
    ]
}

/// DDL creating a tenant schema owned by a dedicated role in the shared
/// database.
fn schema_ddl(schema: &str, database_name: &str, password: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE USER {} WITH ENCRYPTED PASSWORD '{}'",
            schema,
            quote_literal(password)
        ),
        format!("GRANT CONNECT ON DATABASE {} TO {}", database_name, schema),
        format!("CREATE SCHEMA {} AUTHORIZATION {}", schema, schema),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT ALL PRIVILEGES ON TABLES TO {}",
            schema, schema
        ),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT USAGE ON SEQUENCES TO {}",
            schema, schema
        ),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT EXECUTE ON FUNCTIONS TO {}",
            schema, schema
        ),
    ]
}

/// DDL creating the restricted row-access role for hierarchical tenants.
///
/// Row-security policies do not apply to a table's owner, so child tenants
/// connect through this role instead. It gets data-access privileges only,
/// never ownership.
fn row_access_role_ddl(schema: &str, database_name: &str, password: &str) -> Vec<String> {
    let role = format!("{}{}", schema, ROW_ACCESS_ROLE_SUFFIX);
    vec![
        format!(
            "CREATE USER {} WITH ENCRYPTED PASSWORD '{}'",
            role,
            quote_literal(password)
        ),
        format!("GRANT CONNECT ON DATABASE {} TO {}", database_name, role),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT SELECT, INSERT, UPDATE, DELETE, REFERENCES ON TABLES TO {}",
            schema, role
        ),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT USAGE ON SEQUENCES TO {}",
            schema, role
        ),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT EXECUTE ON FUNCTIONS TO {}",
            schema, role
        ),
    ]
}

/// Escape a string for embedding as a single-quoted SQL literal.
fn quote_literal(value: &str) -> String {
    value.replace('\'', "''")
}
