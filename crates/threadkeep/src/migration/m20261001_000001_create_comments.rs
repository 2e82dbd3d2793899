//! Initial migration creating the comments table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Comments::Table)
                    .if_not_exists()
                    // Internal
                    .col(ColumnDef::new(Comments::Id).uuid().not_null().primary_key())
                    // Identity
                    .col(ColumnDef::new(Comments::PartitionId).string().not_null())
                    .col(ColumnDef::new(Comments::ItemId).string().not_null())
                    .col(ColumnDef::new(Comments::ParentId).string().null())
                    .col(
                        ColumnDef::new(Comments::Level)
                            .small_integer()
                            .not_null()
                            .default(0),
                    )
                    // Thread
                    .col(
                        ColumnDef::new(Comments::ReplyCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Comments::ReplyToken).text().null())
                    // Content
                    .col(ColumnDef::new(Comments::Author).string().null())
                    .col(ColumnDef::new(Comments::Text).text().null())
                    .col(ColumnDef::new(Comments::LikeCount).big_integer().null())
                    .col(
                        ColumnDef::new(Comments::PublishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Comments::Payload)
                            .json()
                            .not_null()
                            .default(Expr::cust("'{}'")),
                    )
                    // Tracking
                    .col(
                        ColumnDef::new(Comments::SyncedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Natural key: exactly one row per upstream item within a partition.
        manager
            .create_index(
                Index::create()
                    .name("idx_comments_partition_item")
                    .table(Comments::Table)
                    .col(Comments::PartitionId)
                    .col(Comments::ItemId)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        // Reply scheduling scans threads by engagement.
        manager
            .create_index(
                Index::create()
                    .name("idx_comments_partition_reply_count")
                    .table(Comments::Table)
                    .col(Comments::PartitionId)
                    .col(Comments::ReplyCount)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_comments_partition_parent")
                    .table(Comments::Table)
                    .col(Comments::PartitionId)
                    .col(Comments::ParentId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Comments::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
#[sea_orm(iden = "comments")]
enum Comments {
    Table,
    Id,
    PartitionId,
    ItemId,
    ParentId,
    Level,
    ReplyCount,
    ReplyToken,
    Author,
    Text,
    LikeCount,
    PublishedAt,
    Payload,
    SyncedAt,
}
