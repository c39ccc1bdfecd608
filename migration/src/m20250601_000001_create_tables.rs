use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RoadSegments::Table)
                    .if_not_exists()
                    .col(big_integer(RoadSegments::Id).primary_key())
                    .col(string_null(RoadSegments::Name))
                    .col(string_len(RoadSegments::RoadType, 50))
                    .col(json(RoadSegments::Geometry))
                    .col(double(RoadSegments::LengthMeters))
                    .col(integer_null(RoadSegments::TrafficImportance))
                    .col(boolean(RoadSegments::IsOneway))
                    .col(double_null(RoadSegments::AccessibilityScore))
                    .col(timestamp_with_time_zone_null(
                        RoadSegments::LastMaintenanceAt,
                    ))
                    .col(timestamp_with_time_zone(RoadSegments::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MatchResults::Table)
                    .if_not_exists()
                    .col(pk_uuid(MatchResults::ObservationId))
                    .col(big_integer_null(MatchResults::SegmentId))
                    .col(string_len(MatchResults::Status, 16))
                    .col(double_null(MatchResults::Latitude))
                    .col(double_null(MatchResults::Longitude))
                    .col(double_null(MatchResults::Heading))
                    .col(string_len(MatchResults::DefectType, 50))
                    .col(double(MatchResults::SeverityScore))
                    .col(timestamp_with_time_zone(MatchResults::ObservedAt))
                    .col(double_null(MatchResults::MatchedLatitude))
                    .col(double_null(MatchResults::MatchedLongitude))
                    .col(double_null(MatchResults::DistanceToSegment))
                    .col(double_null(MatchResults::HeadingDiff))
                    .col(double(MatchResults::Confidence))
                    .col(boolean(MatchResults::IsMatched))
                    .col(boolean(MatchResults::NeedsReview))
                    .col(timestamp_with_time_zone(MatchResults::CreatedAt))
                    .col(timestamp_with_time_zone(MatchResults::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_match_results_segment")
                    .table(MatchResults::Table)
                    .col(MatchResults::SegmentId)
                    .to_owned(),
            )
            .await?;

        // Radius queries prefilter on this box before the exact distance check
        manager
            .create_index(
                Index::create()
                    .name("idx_match_results_location")
                    .table(MatchResults::Table)
                    .col(MatchResults::Latitude)
                    .col(MatchResults::Longitude)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_match_results_review")
                    .table(MatchResults::Table)
                    .col(MatchResults::NeedsReview)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SegmentObservations::Table)
                    .if_not_exists()
                    .col(pk_uuid(SegmentObservations::ObservationId))
                    .col(big_integer(SegmentObservations::SegmentId))
                    .col(big_integer(SegmentObservations::Seq))
                    .col(double(SegmentObservations::SeverityScore))
                    .col(timestamp_with_time_zone(SegmentObservations::AppliedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_segment_observations_seq")
                    .table(SegmentObservations::Table)
                    .col(SegmentObservations::SegmentId)
                    .col(SegmentObservations::Seq)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SegmentAggregates::Table)
                    .if_not_exists()
                    .col(big_integer(SegmentAggregates::SegmentId).primary_key())
                    .col(integer(SegmentAggregates::DefectCount))
                    .col(double(SegmentAggregates::AvgSeverity))
                    .col(double(SegmentAggregates::MaxSeverity))
                    .col(big_integer(SegmentAggregates::LastSeq))
                    .col(timestamp_with_time_zone(SegmentAggregates::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PriorityScores::Table)
                    .if_not_exists()
                    .col(big_integer(PriorityScores::SegmentId).primary_key())
                    .col(double(PriorityScores::SeverityScore))
                    .col(double(PriorityScores::TrafficScore))
                    .col(double(PriorityScores::DensityScore))
                    .col(double(PriorityScores::AgeScore))
                    .col(double(PriorityScores::AccessibilityScore))
                    .col(double(PriorityScores::TotalScore))
                    .col(string_len(PriorityScores::PriorityLevel, 16))
                    .col(integer(PriorityScores::DefectCount))
                    .col(double(PriorityScores::AvgSeverity))
                    .col(double(PriorityScores::MaxSeverity))
                    .col(double(PriorityScores::EstimatedCost))
                    .col(integer(PriorityScores::EstimatedDurationDays))
                    .col(big_integer(PriorityScores::Version))
                    .col(timestamp_with_time_zone(PriorityScores::CalculatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_priority_scores_total")
                    .table(PriorityScores::Table)
                    .col(PriorityScores::TotalScore)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MaintenanceTasks::Table)
                    .if_not_exists()
                    .col(pk_uuid(MaintenanceTasks::Id))
                    .col(big_integer(MaintenanceTasks::SegmentId))
                    .col(string_len(MaintenanceTasks::TaskType, 16))
                    .col(string_len(MaintenanceTasks::Status, 16))
                    .col(double(MaintenanceTasks::PriorityScore))
                    .col(double_null(MaintenanceTasks::EstimatedCost))
                    .col(text_null(MaintenanceTasks::Notes))
                    .col(timestamp_with_time_zone_null(MaintenanceTasks::ScheduledAt))
                    .col(timestamp_with_time_zone_null(MaintenanceTasks::CompletedAt))
                    .col(timestamp_with_time_zone(MaintenanceTasks::CreatedAt))
                    .col(timestamp_with_time_zone(MaintenanceTasks::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_maintenance_tasks_segment_status")
                    .table(MaintenanceTasks::Table)
                    .col(MaintenanceTasks::SegmentId)
                    .col(MaintenanceTasks::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MaintenanceTasks::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(PriorityScores::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SegmentAggregates::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SegmentObservations::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(MatchResults::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(RoadSegments::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RoadSegments {
    Table,
    Id,
    Name,
    RoadType,
    Geometry,
    LengthMeters,
    TrafficImportance,
    IsOneway,
    AccessibilityScore,
    LastMaintenanceAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum MatchResults {
    Table,
    ObservationId,
    SegmentId,
    Status,
    Latitude,
    Longitude,
    Heading,
    DefectType,
    SeverityScore,
    ObservedAt,
    MatchedLatitude,
    MatchedLongitude,
    DistanceToSegment,
    HeadingDiff,
    Confidence,
    IsMatched,
    NeedsReview,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SegmentObservations {
    Table,
    ObservationId,
    SegmentId,
    Seq,
    SeverityScore,
    AppliedAt,
}

#[derive(DeriveIden)]
enum SegmentAggregates {
    Table,
    SegmentId,
    DefectCount,
    AvgSeverity,
    MaxSeverity,
    LastSeq,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum PriorityScores {
    Table,
    SegmentId,
    SeverityScore,
    TrafficScore,
    DensityScore,
    AgeScore,
    AccessibilityScore,
    TotalScore,
    PriorityLevel,
    DefectCount,
    AvgSeverity,
    MaxSeverity,
    EstimatedCost,
    EstimatedDurationDays,
    Version,
    CalculatedAt,
}

#[derive(DeriveIden)]
enum MaintenanceTasks {
    Table,
    Id,
    SegmentId,
    TaskType,
    Status,
    PriorityScore,
    EstimatedCost,
    Notes,
    ScheduledAt,
    CompletedAt,
    CreatedAt,
    UpdatedAt,
}
