//! PostgreSQL schema using sea-query.

use sea_query::{ColumnDef, Iden, Index, PostgresQueryBuilder, Table};

#[derive(Iden)]
pub enum Events {
    Table,
    #[iden = "id"]
    Id,
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
    #[iden = "metadata"]
    Metadata,
}

/// Per-consumer progress, updated on ack.
#[derive(Iden)]
pub enum EventConsumerGroups {
    Table,
    #[iden = "group_name"]
    GroupName,
    #[iden = "consumer_name"]
    ConsumerName,
    #[iden = "last_event_id"]
    LastEventId,
    #[iden = "last_processed_at"]
    LastProcessedAt,
}

/// Claim cursor per (group, event type).
#[derive(Iden)]
pub enum EventConsumerPositions {
    Table,
    #[iden = "group_name"]
    GroupName,
    #[iden = "event_type"]
    EventType,
    #[iden = "last_stream_id"]
    LastStreamId,
}

#[derive(Iden)]
pub enum EventPending {
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

#[derive(Iden)]
pub enum EventDlq {
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
                ColumnDef::new(Events::Id)
                    .big_integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(Events::EventId).text().not_null().unique_key())
            .col(ColumnDef::new(Events::EventType).text().not_null())
            .col(ColumnDef::new(Events::EventData).json_binary().not_null())
            .col(ColumnDef::new(Events::Timestamp).timestamp_with_time_zone().not_null())
            .col(ColumnDef::new(Events::Source).text().not_null().default(""))
            .col(ColumnDef::new(Events::Version).integer().not_null().default(1))
            .col(ColumnDef::new(Events::Metadata).json_binary().null())
            .to_string(PostgresQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_events_type_id")
            .table(Events::Table)
            .col(Events::EventType)
            .col(Events::Id)
            .to_string(PostgresQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_events_timestamp")
            .table(Events::Table)
            .col(Events::Timestamp)
            .to_string(PostgresQueryBuilder),
        Table::create()
            .table(EventConsumerGroups::Table)
            .if_not_exists()
            .col(ColumnDef::new(EventConsumerGroups::GroupName).text().not_null())
            .col(ColumnDef::new(EventConsumerGroups::ConsumerName).text().not_null())
            .col(
                ColumnDef::new(EventConsumerGroups::LastEventId)
                    .big_integer()
                    .not_null()
                    .default(0),
            )
            .col(
                ColumnDef::new(EventConsumerGroups::LastProcessedAt)
                    .timestamp_with_time_zone()
                    .null(),
            )
            .primary_key(
                Index::create()
                    .col(EventConsumerGroups::GroupName)
                    .col(EventConsumerGroups::ConsumerName),
            )
            .to_string(PostgresQueryBuilder),
        Table::create()
            .table(EventConsumerPositions::Table)
            .if_not_exists()
            .col(ColumnDef::new(EventConsumerPositions::GroupName).text().not_null())
            .col(ColumnDef::new(EventConsumerPositions::EventType).text().not_null())
            .col(
                ColumnDef::new(EventConsumerPositions::LastStreamId)
                    .big_integer()
                    .not_null()
                    .default(0),
            )
            .primary_key(
                Index::create()
                    .col(EventConsumerPositions::GroupName)
                    .col(EventConsumerPositions::EventType),
            )
            .to_string(PostgresQueryBuilder),
        Table::create()
            .table(EventPending::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(EventPending::Id)
                    .big_integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(EventPending::StreamId).big_integer().not_null())
            .col(ColumnDef::new(EventPending::ConsumerGroup).text().not_null())
            .col(ColumnDef::new(EventPending::ConsumerName).text().not_null())
            .col(ColumnDef::new(EventPending::ClaimedAt).timestamp_with_time_zone().not_null())
            .col(ColumnDef::new(EventPending::TimeoutAt).timestamp_with_time_zone().not_null())
            .col(
                ColumnDef::new(EventPending::DeliveryCount)
                    .integer()
                    .not_null()
                    .default(1),
            )
            .col(ColumnDef::new(EventPending::LastError).text().null())
            .col(ColumnDef::new(EventPending::LastAttempt).timestamp_with_time_zone().null())
            .to_string(PostgresQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_event_pending_stream_group")
            .table(EventPending::Table)
            .col(EventPending::StreamId)
            .col(EventPending::ConsumerGroup)
            .unique()
            .to_string(PostgresQueryBuilder),
        Table::create()
            .table(EventDlq::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(EventDlq::Id)
                    .big_integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(EventDlq::OriginalStreamId).big_integer().not_null())
            .col(ColumnDef::new(EventDlq::EventData).json_binary().not_null())
            .col(ColumnDef::new(EventDlq::FailureReason).text().not_null())
            .col(ColumnDef::new(EventDlq::FailureTime).timestamp_with_time_zone().not_null())
            .col(ColumnDef::new(EventDlq::DeliveryCount).integer().not_null())
            .col(ColumnDef::new(EventDlq::ConsumerGroup).text().not_null())
            .col(ColumnDef::new(EventDlq::Replayed).boolean().not_null().default(false))
            .to_string(PostgresQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_event_dlq_group_replayed")
            .table(EventDlq::Table)
            .col(EventDlq::ConsumerGroup)
            .col(EventDlq::Replayed)
            .to_string(PostgresQueryBuilder),
    ]
}
