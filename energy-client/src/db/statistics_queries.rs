use anyhow::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{StatisticId, StatisticMetadata, StatisticPoint, SumState};

/// Tables are WAL tables with `DEDUP UPSERT KEYS`, so re-inserting a point
/// for an existing (ts, statistic_id) replaces it instead of duplicating it.
const CREATE_STATISTICS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS energy_statistics (
        ts TIMESTAMP,
        statistic_id SYMBOL,
        state DOUBLE,
        sum DOUBLE
    ) TIMESTAMP(ts) PARTITION BY MONTH WAL
    DEDUP UPSERT KEYS(ts, statistic_id)
"#;

const CREATE_METADATA_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS statistic_metadata (
        updated_at TIMESTAMP,
        statistic_id SYMBOL,
        name STRING,
        source SYMBOL,
        unit_of_measurement SYMBOL,
        has_sum BOOLEAN,
        has_mean BOOLEAN
    ) TIMESTAMP(updated_at) PARTITION BY YEAR WAL
    DEDUP UPSERT KEYS(updated_at, statistic_id)
"#;

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_STATISTICS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_METADATA_TABLE).execute(pool).await?;
    Ok(())
}

/// Newest point of a series, if the series exists.
pub async fn last_statistic(pool: &PgPool, statistic_id: &StatisticId) -> Result<Option<SumState>> {
    let row = sqlx::query_as::<_, SumState>(
        r#"
        SELECT ts, sum
        FROM energy_statistics
        WHERE statistic_id = $1
        ORDER BY ts DESC
        LIMIT 1
        "#,
    )
    .bind(statistic_id.as_str())
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Newest point strictly before `before`.
pub async fn last_statistic_before(
    pool: &PgPool,
    statistic_id: &StatisticId,
    before: OffsetDateTime,
) -> Result<Option<SumState>> {
    let row = sqlx::query_as::<_, SumState>(
        r#"
        SELECT ts, sum
        FROM energy_statistics
        WHERE statistic_id = $1
          AND ts < $2
        ORDER BY ts DESC
        LIMIT 1
        "#,
    )
    .bind(statistic_id.as_str())
    .bind(before)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Time-ordered points of a series within `[start, end)`.
pub async fn statistic_series(
    pool: &PgPool,
    statistic_id: &StatisticId,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<StatisticPoint>> {
    let rows = sqlx::query_as::<_, StatisticPoint>(
        r#"
        SELECT ts, state, sum
        FROM energy_statistics
        WHERE statistic_id = $1
          AND ts >= $2
          AND ts <  $3
        ORDER BY ts
        "#,
    )
    .bind(statistic_id.as_str())
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn upsert_metadata(pool: &PgPool, metadata: &StatisticMetadata) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO statistic_metadata
            (updated_at, statistic_id, name, source, unit_of_measurement, has_sum, has_mean)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(OffsetDateTime::UNIX_EPOCH)
    .bind(metadata.statistic_id.as_str())
    .bind(&metadata.name)
    .bind(&metadata.source)
    .bind(&metadata.unit_of_measurement)
    .bind(metadata.has_sum)
    .bind(metadata.has_mean)
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert points, replacing any already stored at the same timestamp.
pub async fn upsert_points(
    pool: &PgPool,
    statistic_id: &StatisticId,
    points: &[StatisticPoint],
) -> Result<u64> {
    if points.is_empty() {
        return Ok(0);
    }

    let mut builder =
        QueryBuilder::<Postgres>::new("INSERT INTO energy_statistics (ts, statistic_id, state, sum) ");
    builder.push_values(points, |mut b, p| {
        b.push_bind(p.start)
            .push_bind(statistic_id.as_str())
            .push_bind(p.state)
            .push_bind(p.sum);
    });

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}
