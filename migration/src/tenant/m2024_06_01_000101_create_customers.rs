//! Migration to create the tenant-side customers table.
//!
//! The `tenant_id` column doubles as the discriminator for shared-table
//! isolation and as the attribute row-security policies compare against.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Customers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Customers::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Customers::CustomerId).string_len(64).null())
                    .col(ColumnDef::new(Customers::FirstName).text().null())
                    .col(ColumnDef::new(Customers::LastName).text().null())
                    .col(ColumnDef::new(Customers::TenantId).string_len(64).null())
                    .col(
                        ColumnDef::new(Customers::Version)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Customers::CreatedOn)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Customers::CreatedBy).text().null())
                    .col(
                        ColumnDef::new(Customers::ModifiedOn)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Customers::ModifiedBy).text().null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Customers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Customers {
    Table,
    Id,
    CustomerId,
    FirstName,
    LastName,
    TenantId,
    Version,
    CreatedOn,
    CreatedBy,
    ModifiedOn,
    ModifiedBy,
}
