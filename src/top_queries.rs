//! Version-normalized access to `pg_stat_statements`.
//!
//! The view's column names drifted across PostgreSQL releases; callers get
//! one stable projection with nulls where a column does not exist on the
//! connected server. Also produces the resource-blend report: queries that
//! account for a meaningful fraction of execution time, buffer traffic, or
//! WAL volume.

use serde_json::json;

use crate::db::{Driver, SqlRow};
use crate::error::{DbaError, Result};
use crate::models::WorkloadQuery;
use crate::version::VersionProbe;

pub const PG_STAT_STATEMENTS: &str = "pg_stat_statements";
pub const MAX_TOP_QUERIES: i64 = 200;
pub const DEFAULT_RESOURCE_FRACTION: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopQueryOrder {
    TotalTime,
    MeanTime,
    IoTime,
    Calls,
}

impl TopQueryOrder {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "total_time" => Ok(Self::TotalTime),
            "mean_time" => Ok(Self::MeanTime),
            "io_time" => Ok(Self::IoTime),
            "calls" => Ok(Self::Calls),
            other => Err(DbaError::InvalidArguments {
                message: format!(
                    "unknown sort criteria '{other}'; use total_time, mean_time, io_time, or calls"
                ),
            }),
        }
    }

    fn order_column(&self) -> &'static str {
        match self {
            Self::TotalTime => "total_time",
            Self::MeanTime => "mean_time",
            Self::IoTime => "io_time",
            Self::Calls => "calls",
        }
    }
}

/// The per-major projection map. One row of this table per logical field;
/// missing columns project as typed nulls so the output shape never
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatColumns {
    total_time: &'static str,
    mean_time: &'static str,
    io_read_time: &'static str,
    stats_since: Option<&'static str>,
    parallel_workers_launched: Option<&'static str>,
}

fn columns_for(major: i32) -> StatColumns {
    if major >= 17 {
        StatColumns {
            total_time: "total_exec_time",
            mean_time: "mean_exec_time",
            io_read_time: "shared_blk_read_time",
            stats_since: Some("stats_since"),
            parallel_workers_launched: Some("parallel_workers_launched"),
        }
    } else if major >= 13 {
        StatColumns {
            total_time: "total_exec_time",
            mean_time: "mean_exec_time",
            io_read_time: "blk_read_time",
            stats_since: None,
            parallel_workers_launched: None,
        }
    } else {
        StatColumns {
            total_time: "total_time",
            mean_time: "mean_time",
            io_read_time: "blk_read_time",
            stats_since: None,
            parallel_workers_launched: None,
        }
    }
}

/// Top queries in the normalized projection, ordered and limited.
pub async fn top_queries(
    driver: &Driver,
    probe: &VersionProbe,
    order: TopQueryOrder,
    limit: i64,
) -> Result<Vec<SqlRow>> {
    probe
        .require_extension(driver.base(), PG_STAT_STATEMENTS)
        .await?;
    let info = probe.server_info(driver.base()).await?;
    let cols = columns_for(info.major);
    let limit = limit.clamp(1, MAX_TOP_QUERIES);

    let query = format!(
        r#"
        SELECT
            queryid,
            query,
            calls,
            rows,
            {total} AS total_time,
            {mean} AS mean_time,
            {io} AS io_time,
            {stats_since} AS stats_since,
            {workers} AS parallel_workers_launched
        FROM pg_stat_statements
        ORDER BY {order} DESC
        LIMIT $1
        "#,
        total = cols.total_time,
        mean = cols.mean_time,
        io = cols.io_read_time,
        stats_since = cols.stats_since.unwrap_or("NULL::timestamptz"),
        workers = cols.parallel_workers_launched.unwrap_or("NULL::bigint"),
        order = order.order_column(),
    );

    driver.base().execute(&query, &[json!(limit)]).await
}

/// Queries consuming more than `frac_threshold` of any tracked resource:
/// execution time, shared buffers accessed/read/dirtied, or WAL bytes.
pub async fn resource_queries(
    driver: &Driver,
    probe: &VersionProbe,
    frac_threshold: f64,
) -> Result<Vec<SqlRow>> {
    probe
        .require_extension(driver.base(), PG_STAT_STATEMENTS)
        .await?;
    let info = probe.server_info(driver.base()).await?;
    let cols = columns_for(info.major);
    let has_wal_bytes = statements_column_exists(driver, "wal_bytes").await?;

    let wal_bytes_select = if has_wal_bytes {
        "wal_bytes"
    } else {
        "0::numeric AS wal_bytes"
    };
    let wal_frac_select = if has_wal_bytes {
        "wal_bytes / NULLIF(SUM(wal_bytes) OVER (), 0) AS wal_bytes_frac"
    } else {
        "0::double precision AS wal_bytes_frac"
    };

    let query = format!(
        r#"
        WITH resource_fractions AS (
            SELECT
                queryid,
                query,
                calls,
                rows,
                {total} AS total_time,
                {mean} AS mean_time,
                shared_blks_hit,
                shared_blks_read,
                shared_blks_dirtied,
                {wal_bytes_select},
                {total} / NULLIF(SUM({total}) OVER (), 0)
                    AS total_time_frac,
                (shared_blks_hit + shared_blks_read)
                    / NULLIF(SUM(shared_blks_hit + shared_blks_read) OVER (), 0)
                    AS shared_blks_accessed_frac,
                shared_blks_read / NULLIF(SUM(shared_blks_read) OVER (), 0)
                    AS shared_blks_read_frac,
                shared_blks_dirtied / NULLIF(SUM(shared_blks_dirtied) OVER (), 0)
                    AS shared_blks_dirtied_frac,
                {wal_frac_select}
            FROM pg_stat_statements
        )
        SELECT *
        FROM resource_fractions
        WHERE total_time_frac > $1
           OR shared_blks_accessed_frac > $1
           OR shared_blks_read_frac > $1
           OR shared_blks_dirtied_frac > $1
           OR wal_bytes_frac > $1
        ORDER BY total_time DESC
        "#,
        total = cols.total_time,
        mean = cols.mean_time,
    );

    driver.base().execute(&query, &[json!(frac_threshold)]).await
}

/// The advisor's workload source: top statements of the current database
/// by total execution time.
pub async fn workload_from_statements(
    driver: &Driver,
    probe: &VersionProbe,
    limit: i64,
) -> Result<Vec<WorkloadQuery>> {
    probe
        .require_extension(driver.base(), PG_STAT_STATEMENTS)
        .await?;
    let info = probe.server_info(driver.base()).await?;
    let cols = columns_for(info.major);
    let limit = limit.clamp(1, MAX_TOP_QUERIES);

    let query = format!(
        r#"
        SELECT
            queryid,
            query,
            calls,
            {mean} AS mean_time
        FROM pg_stat_statements
        WHERE dbid = (SELECT oid FROM pg_database WHERE datname = current_database())
          AND calls > 0
        ORDER BY {total} DESC
        LIMIT $1
        "#,
        mean = cols.mean_time,
        total = cols.total_time,
    );

    let rows = driver.base().execute(&query, &[json!(limit)]).await?;
    Ok(rows
        .iter()
        .filter_map(|row| {
            Some(WorkloadQuery {
                query_text: row.as_str("query")?.to_string(),
                calls: row.as_i64("calls").unwrap_or(1),
                mean_exec_ms: row.as_f64("mean_time").unwrap_or(0.0),
                queryid: row.as_i64("queryid"),
            })
        })
        .collect())
}

async fn statements_column_exists(driver: &Driver, column: &str) -> Result<bool> {
    // The extension's view may live in any schema; look it up by relation
    // name like the capability probe would, excluding toast.
    let rows = driver
        .base()
        .execute(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_catalog.pg_attribute a
                JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relname = 'pg_stat_statements'
                  AND n.nspname NOT IN ('pg_toast')
                  AND a.attname = $1
                  AND NOT a.attisdropped
            ) AS has_column
            "#,
            &[json!(column)],
        )
        .await?;
    Ok(rows
        .first()
        .and_then(|row| row.as_bool("has_column"))
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(12, "total_time", "mean_time", "blk_read_time")]
    #[case(13, "total_exec_time", "mean_exec_time", "blk_read_time")]
    #[case(16, "total_exec_time", "mean_exec_time", "blk_read_time")]
    #[case(17, "total_exec_time", "mean_exec_time", "shared_blk_read_time")]
    fn projection_map_tracks_server_major(
        #[case] major: i32,
        #[case] total: &str,
        #[case] mean: &str,
        #[case] io: &str,
    ) {
        let cols = columns_for(major);
        assert_eq!(cols.total_time, total);
        assert_eq!(cols.mean_time, mean);
        assert_eq!(cols.io_read_time, io);
    }

    #[test]
    fn pg17_only_fields_project_as_nulls_before_17() {
        let old = columns_for(15);
        assert_eq!(old.stats_since, None);
        assert_eq!(old.parallel_workers_launched, None);

        let new = columns_for(17);
        assert_eq!(new.stats_since, Some("stats_since"));
        assert_eq!(new.parallel_workers_launched, Some("parallel_workers_launched"));
    }

    #[test]
    fn order_parse_accepts_the_four_criteria() {
        assert_eq!(
            TopQueryOrder::parse("total_time").unwrap(),
            TopQueryOrder::TotalTime
        );
        assert_eq!(TopQueryOrder::parse("calls").unwrap(), TopQueryOrder::Calls);
        assert!(TopQueryOrder::parse("wal").is_err());
    }
}
