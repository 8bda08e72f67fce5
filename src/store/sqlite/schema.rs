//! SQLite schema using sea-query.

use sea_query::{ColumnDef, Iden, Index, SqliteQueryBuilder, Table};

/// Appended events. `stream_id` is the rowid.
#[derive(Iden)]
pub enum Events {
    Table,
    #[iden = "stream_id"]
    StreamId,
    #[iden = "event_id"]
    EventId,
    #[iden = "event_type"]
    EventType,
    #[iden = "event_data"]
    EventData,
    #[iden = "timestamp"]
    Timestamp,
    #[iden = "source"]
    Source,
    #[iden = "version"]
    Version,
}

/// Cursor per (group, event type).
#[derive(Iden)]
pub enum ConsumerPositions {
    Table,
    #[iden = "group_name"]
    GroupName,
    #[iden = "event_type"]
    EventType,
    #[iden = "last_stream_id"]
    LastStreamId,
}

/// Outstanding claims.
#[derive(Iden)]
pub enum PendingEvents {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "stream_id"]
    StreamId,
    #[iden = "consumer_group"]
    ConsumerGroup,
    #[iden = "consumer_name"]
    ConsumerName,
    #[iden = "claimed_at"]
    ClaimedAt,
    #[iden = "timeout_at"]
    TimeoutAt,
    #[iden = "delivery_count"]
    DeliveryCount,
    #[iden = "last_error"]
    LastError,
    #[iden = "last_attempt"]
    LastAttempt,
}

/// Dead letters. `event_data` is the flat envelope payload.
#[derive(Iden)]
pub enum DlqEvents {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "original_stream_id"]
    OriginalStreamId,
    #[iden = "event_data"]
    EventData,
    #[iden = "failure_reason"]
    FailureReason,
    #[iden = "failure_time"]
    FailureTime,
    #[iden = "delivery_count"]
    DeliveryCount,
    #[iden = "consumer_group"]
    ConsumerGroup,
    #[iden = "replayed"]
    Replayed,
}

/// DDL in dependency order. Every statement is `IF NOT EXISTS`.
pub fn create_statements() -> Vec<String> {
    vec![
        Table::create()
            .table(Events::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(Events::StreamId)
                    .integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(Events::EventId).text().not_null())
            .col(ColumnDef::new(Events::EventType).text().not_null())
            .col(ColumnDef::new(Events::EventData).text().not_null())
            .col(ColumnDef::new(Events::Timestamp).text().not_null())
            .col(ColumnDef::new(Events::Source).text().not_null().default(""))
            .col(ColumnDef::new(Events::Version).integer().not_null().default(1))
            .to_string(SqliteQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_events_type_stream")
            .table(Events::Table)
            .col(Events::EventType)
            .col(Events::StreamId)
            .to_string(SqliteQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_events_timestamp")
            .table(Events::Table)
            .col(Events::Timestamp)
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(ConsumerPositions::Table)
            .if_not_exists()
            .col(ColumnDef::new(ConsumerPositions::GroupName).text().not_null())
            .col(ColumnDef::new(ConsumerPositions::EventType).text().not_null())
            .col(
                ColumnDef::new(ConsumerPositions::LastStreamId)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .primary_key(
                Index::create()
                    .col(ConsumerPositions::GroupName)
                    .col(ConsumerPositions::EventType),
            )
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(PendingEvents::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(PendingEvents::Id)
                    .integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(PendingEvents::StreamId).integer().not_null())
            .col(ColumnDef::new(PendingEvents::ConsumerGroup).text().not_null())
            .col(ColumnDef::new(PendingEvents::ConsumerName).text().not_null())
            .col(ColumnDef::new(PendingEvents::ClaimedAt).text().not_null())
            .col(ColumnDef::new(PendingEvents::TimeoutAt).text().not_null())
            .col(
                ColumnDef::new(PendingEvents::DeliveryCount)
                    .integer()
                    .not_null()
                    .default(1),
            )
            .col(ColumnDef::new(PendingEvents::LastError).text().null())
            .col(ColumnDef::new(PendingEvents::LastAttempt).text().null())
            .to_string(SqliteQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_pending_stream_group")
            .table(PendingEvents::Table)
            .col(PendingEvents::StreamId)
            .col(PendingEvents::ConsumerGroup)
            .unique()
            .to_string(SqliteQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_pending_group_timeout")
            .table(PendingEvents::Table)
            .col(PendingEvents::ConsumerGroup)
            .col(PendingEvents::TimeoutAt)
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(DlqEvents::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(DlqEvents::Id)
                    .integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(DlqEvents::OriginalStreamId).integer().not_null())
            .col(ColumnDef::new(DlqEvents::EventData).text().not_null())
            .col(ColumnDef::new(DlqEvents::FailureReason).text().not_null())
            .col(ColumnDef::new(DlqEvents::FailureTime).text().not_null())
            .col(ColumnDef::new(DlqEvents::DeliveryCount).integer().not_null())
            .col(ColumnDef::new(DlqEvents::ConsumerGroup).text().not_null())
            .col(
                ColumnDef::new(DlqEvents::Replayed)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .to_string(SqliteQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_dlq_group_replayed")
            .table(DlqEvents::Table)
            .col(DlqEvents::ConsumerGroup)
            .col(DlqEvents::Replayed)
            .to_string(SqliteQueryBuilder),
    ]
}
