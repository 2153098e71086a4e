//! Database changelogs for the Stratum tenancy service.
//!
//! `Migrator` holds the registry changelog applied to the master database at
//! startup. The [`tenant`] module holds the changelogs the provisioner applies
//! to each tenant's own database or schema.

pub use sea_orm_migration::prelude::*;

pub mod tenant;

mod m2024_06_01_000001_create_tenants;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m2024_06_01_000001_create_tenants::Migration)]
    }
}
