//! Migration enabling row-level security for hierarchical tenants.
//!
//! Restricts visible rows to those whose `tenant_id` matches the session
//! variable `app.tenantid`, which the connection router sets on checkout.
//! The policy does not apply to the table owner; queries must run as the
//! restricted row-access role created during provisioning.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let conn = manager.get_connection();
        conn.execute_unprepared("ALTER TABLE customers ENABLE ROW LEVEL SECURITY")
            .await?;
        conn.execute_unprepared(
            "CREATE POLICY customers_tenant_isolation ON customers \
             USING (tenant_id = current_setting('app.tenantid'))",
        )
        .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let conn = manager.get_connection();
        conn.execute_unprepared("DROP POLICY IF EXISTS customers_tenant_isolation ON customers")
            .await?;
        conn.execute_unprepared("ALTER TABLE customers DISABLE ROW LEVEL SECURITY")
            .await?;
        Ok(())
    }
}
