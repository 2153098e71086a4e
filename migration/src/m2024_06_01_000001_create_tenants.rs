//! Migration to create the tenant registry table.
//!
//! The registry stores one row per provisioned tenant: its isolation
//! strategy, the database or schema name backing it, and the encrypted
//! credential used to build its connection pool.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Tenants::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Tenants::Id).uuid().not_null().primary_key())
                    .col(
                        ColumnDef::new(Tenants::TenantId)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Tenants::IsolationType)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Tenants::DbOrSchema).string_len(64).not_null())
                    .col(ColumnDef::new(Tenants::ConnectionUrl).text().not_null())
                    .col(ColumnDef::new(Tenants::Username).string_len(64).not_null())
                    .col(
                        ColumnDef::new(Tenants::PasswordCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Tenants::Version)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tenants::CreatedOn)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Tenants::CreatedBy).text().null())
                    .col(
                        ColumnDef::new(Tenants::ModifiedOn)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Tenants::ModifiedBy).text().null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tenants::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
    TenantId,
    IsolationType,
    DbOrSchema,
    ConnectionUrl,
    Username,
    PasswordCiphertext,
    Version,
    CreatedOn,
    CreatedBy,
    ModifiedOn,
    ModifiedBy,
}
