//! Changelogs applied to tenant storage targets during provisioning.
//!
//! `BaseMigrator` creates the tenant table set and runs for non-hierarchical
//! tenants. `HierarchyMigrator` is a superset that additionally enables
//! row-level security and runs for hierarchical (schema+discriminator)
//! tenants. Both record progress in a `tenant_migrations` table, kept apart
//! from the registry changelog so discriminator tenants can share the master
//! database with it.

pub use sea_orm_migration::prelude::*;

mod m2024_06_01_000101_create_customers;
mod m2024_06_01_000102_enable_row_security;

const TENANT_MIGRATION_TABLE: &str = "tenant_migrations";

pub struct BaseMigrator;

#[async_trait::async_trait]
impl MigratorTrait for BaseMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m2024_06_01_000101_create_customers::Migration)]
    }

    fn migration_table_name() -> sea_orm::DynIden {
        Alias::new(TENANT_MIGRATION_TABLE).into_iden()
    }
}

pub struct HierarchyMigrator;

#[async_trait::async_trait]
impl MigratorTrait for HierarchyMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2024_06_01_000101_create_customers::Migration),
            Box::new(m2024_06_01_000102_enable_row_security::Migration),
        ]
    }

    fn migration_table_name() -> sea_orm::DynIden {
        Alias::new(TENANT_MIGRATION_TABLE).into_iden()
    }
}
