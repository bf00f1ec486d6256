//! Postgres implementation of [`EntityStore`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ratesync_core::{EntityRecord, Mode, ModeRating, RawEvent, Snapshot};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sha2::{Digest, Sha256};
use sqlx::Row;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::{EntityStore, StagedEvents, StoreError};

pub const ENTITY_TABLE: &str = "entities";
pub const STAGING_TABLE: &str = "rating_events_staging";

const COPY_CHUNK_BYTES: usize = 64 * 1024;

const SELECT_ENTITIES: &str = r#"
    SELECT identifier,
           fast_rating, fast_rd, fast_last_played,
           medium_rating, medium_rd, medium_last_played,
           slow_rating, slow_rd, slow_last_played,
           last_sync_time
      FROM entities
"#;

// Same coalesce rule as `merge_record`, so replaying a batch or upserting a
// record merged from a stale read cannot regress a stored field.
const UPSERT_ENTITIES: &str = r#"
    INSERT INTO entities (
        identifier,
        fast_rating, fast_rd, fast_last_played,
        medium_rating, medium_rd, medium_last_played,
        slow_rating, slow_rd, slow_last_played,
        last_sync_time
    )
    SELECT * FROM UNNEST(
        $1::text[],
        $2::int4[], $3::int4[], $4::date[],
        $5::int4[], $6::int4[], $7::date[],
        $8::int4[], $9::int4[], $10::date[],
        $11::timestamptz[]
    )
    ON CONFLICT (identifier) DO UPDATE SET
        fast_rating        = COALESCE(EXCLUDED.fast_rating, entities.fast_rating),
        fast_rd            = COALESCE(EXCLUDED.fast_rd, entities.fast_rd),
        fast_last_played   = COALESCE(EXCLUDED.fast_last_played, entities.fast_last_played),
        medium_rating      = COALESCE(EXCLUDED.medium_rating, entities.medium_rating),
        medium_rd          = COALESCE(EXCLUDED.medium_rd, entities.medium_rd),
        medium_last_played = COALESCE(EXCLUDED.medium_last_played, entities.medium_last_played),
        slow_rating        = COALESCE(EXCLUDED.slow_rating, entities.slow_rating),
        slow_rd            = COALESCE(EXCLUDED.slow_rd, entities.slow_rd),
        slow_last_played   = COALESCE(EXCLUDED.slow_last_played, entities.slow_last_played),
        last_sync_time     = GREATEST(EXCLUDED.last_sync_time, entities.last_sync_time)
"#;

const CREATE_STAGING: &str = r#"
    CREATE TEMPORARY TABLE rating_events_staging (
        line_no    BIGSERIAL,
        identifier TEXT NOT NULL,
        mode_code  INT NOT NULL,
        rating     INT,
        sequence   BIGINT NOT NULL
    ) ON COMMIT DROP
"#;

const COPY_STAGING: &str = "COPY rating_events_staging (identifier, mode_code, rating, sequence) \
     FROM STDIN WITH (FORMAT csv, HEADER true)";

const SELECT_STAGED: &str = r#"
    SELECT line_no, identifier, mode_code, rating, sequence
      FROM rating_events_staging
     ORDER BY line_no
"#;

/// Column name and SQL type for every non-key column of the entity table.
fn entity_columns() -> Vec<(String, &'static str)> {
    let mut columns = Vec::new();
    for mode in Mode::ALL {
        let prefix = mode.as_str();
        columns.push((format!("{prefix}_rating"), "INTEGER"));
        columns.push((format!("{prefix}_rd"), "INTEGER"));
        columns.push((format!("{prefix}_last_played"), "DATE"));
    }
    columns.push(("last_sync_time".to_string(), "TIMESTAMPTZ"));
    columns
}

#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(StoreError::Fatal)?;
        Ok(Self { pool })
    }

    /// Create the entity table if needed and add any missing columns.
    /// Returns the names of the columns that were added.
    pub async fn ensure_schema(&self) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_query)?;

        sqlx::query("CREATE TABLE IF NOT EXISTS entities (identifier TEXT PRIMARY KEY)")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_query)?;

        let existing: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text
              FROM information_schema.columns
             WHERE table_name = 'entities'
               AND table_schema = current_schema()
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::from_query)?;

        let mut added = Vec::new();
        for (column, sql_type) in entity_columns() {
            if existing.iter().any(|c| c == &column) {
                continue;
            }
            info!(column = %column, "adding column to {ENTITY_TABLE}");
            let sql = format!("ALTER TABLE entities ADD COLUMN IF NOT EXISTS {column} {sql_type}");
            sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_query)?;
            added.push(column);
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS entities_last_sync_time_idx \
             ON entities (last_sync_time ASC NULLS FIRST)",
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_query)?;

        tx.commit().await.map_err(StoreError::from_query)?;
        Ok(added)
    }
}

fn record_from_row(row: &PgRow) -> Result<EntityRecord, sqlx::Error> {
    let mut ratings = Snapshot::default();
    for mode in Mode::ALL {
        let prefix = mode.as_str();
        *ratings.mode_mut(mode) = ModeRating {
            rating: row.try_get(format!("{prefix}_rating").as_str())?,
            deviation: row.try_get(format!("{prefix}_rd").as_str())?,
            last_played: row.try_get(format!("{prefix}_last_played").as_str())?,
        };
    }
    Ok(EntityRecord {
        identifier: row.try_get("identifier")?,
        ratings,
        last_sync_time: row.try_get("last_sync_time")?,
    })
}

/// Column-major view of a batch, one array per bound parameter.
#[derive(Debug, Default)]
struct BatchColumns {
    identifiers: Vec<String>,
    ratings: [Vec<Option<i32>>; 3],
    deviations: [Vec<Option<i32>>; 3],
    last_played: [Vec<Option<NaiveDate>>; 3],
    last_sync_times: Vec<Option<DateTime<Utc>>>,
}

impl BatchColumns {
    fn from_records(rows: &[EntityRecord]) -> Self {
        let mut out = Self::default();
        for row in rows {
            out.identifiers.push(row.identifier.clone());
            for (i, mode) in Mode::ALL.iter().enumerate() {
                let triple = row.ratings.mode(*mode);
                out.ratings[i].push(triple.rating);
                out.deviations[i].push(triple.deviation);
                out.last_played[i].push(triple.last_played);
            }
            out.last_sync_times.push(row.last_sync_time);
        }
        out
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn snapshot_records(&self) -> Result<Vec<EntityRecord>, StoreError> {
        let sql = format!("{SELECT_ENTITIES} ORDER BY last_sync_time ASC NULLS FIRST, identifier");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_query)?;
        rows.iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_query)
    }

    async fn load_records(&self, identifiers: &[String]) -> Result<Vec<EntityRecord>, StoreError> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("{SELECT_ENTITIES} WHERE identifier = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(identifiers)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_query)?;
        rows.iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_query)
    }

    async fn upsert_batch(&self, rows: &[EntityRecord]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let n = rows.len();
        let cols = BatchColumns::from_records(rows);

        // Dropping `tx` on any error path rolls the whole batch back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_batch(e, n))?;
        let result = sqlx::query(UPSERT_ENTITIES)
            .bind(&cols.identifiers)
            .bind(&cols.ratings[0])
            .bind(&cols.deviations[0])
            .bind(&cols.last_played[0])
            .bind(&cols.ratings[1])
            .bind(&cols.deviations[1])
            .bind(&cols.last_played[1])
            .bind(&cols.ratings[2])
            .bind(&cols.deviations[2])
            .bind(&cols.last_played[2])
            .bind(&cols.last_sync_times)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_batch(e, n))?;
        tx.commit().await.map_err(|e| StoreError::from_batch(e, n))?;

        debug!(rows = n, affected = result.rows_affected(), "batch committed");
        Ok(result.rows_affected())
    }

    async fn stage_event_file(&self, path: &Path) -> Result<StagedEvents, StoreError> {
        let event_file_error = |source| StoreError::EventFile {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).await.map_err(event_file_error)?;

        let mut tx = self.pool.begin().await.map_err(StoreError::from_query)?;
        sqlx::query(CREATE_STAGING)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_query)?;

        let mut copy = tx
            .copy_in_raw(COPY_STAGING)
            .await
            .map_err(StoreError::from_query)?;
        // Hash and copy in one read of the file.
        let mut hasher = Sha256::new();
        let mut source_bytes = 0usize;
        let mut buf = vec![0u8; COPY_CHUNK_BYTES];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(source) => {
                    copy.abort(format!("reading {}: {source}", path.display()))
                        .await
                        .map_err(StoreError::from_query)?;
                    return Err(event_file_error(source));
                }
            };
            hasher.update(&buf[..n]);
            source_bytes += n;
            copy.send(&buf[..n]).await.map_err(StoreError::from_query)?;
        }
        let source_sha256 = hex::encode(hasher.finalize());
        let loaded = copy.finish().await.map_err(StoreError::from_query)?;
        info!(rows = loaded, path = %path.display(), "event file copied into {STAGING_TABLE}");

        let rows = sqlx::query(SELECT_STAGED)
            .fetch_all(&mut *tx)
            .await
            .map_err(StoreError::from_query)?;
        let events = rows
            .iter()
            .map(|row| -> Result<RawEvent, sqlx::Error> {
                let line_no: i64 = row.try_get("line_no")?;
                Ok(RawEvent {
                    identifier: row.try_get("identifier")?,
                    mode_code: row.try_get("mode_code")?,
                    rating: row.try_get("rating")?,
                    sequence: row.try_get("sequence")?,
                    ordinal: u64::try_from(line_no).unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from_query)?;

        // Commit drops the temporary staging table.
        tx.commit().await.map_err(StoreError::from_query)?;

        Ok(StagedEvents {
            events,
            source_sha256,
            source_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn entity_columns_cover_every_mode_triple() {
        let names: Vec<String> = entity_columns().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names.len(), 10);
        for mode in Mode::ALL {
            let prefix = mode.as_str();
            assert!(names.contains(&format!("{prefix}_rating")));
            assert!(names.contains(&format!("{prefix}_rd")));
            assert!(names.contains(&format!("{prefix}_last_played")));
        }
        assert_eq!(names.last().map(String::as_str), Some("last_sync_time"));
    }

    #[test]
    fn batch_columns_are_parallel_and_mode_ordered() {
        let mut a = EntityRecord::new("a");
        a.ratings.medium.rating = Some(1600);
        a.ratings.slow.last_played = NaiveDate::from_ymd_opt(2024, 3, 1);
        let mut b = EntityRecord::new("b");
        b.ratings.fast.deviation = Some(45);
        b.last_sync_time = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).single();

        let cols = BatchColumns::from_records(&[a, b]);
        assert_eq!(cols.identifiers, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cols.ratings[1], vec![Some(1600), None]);
        assert_eq!(cols.deviations[0], vec![None, Some(45)]);
        assert_eq!(cols.last_played[2][0], NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(cols.last_sync_times[0], None);
        assert!(cols.last_sync_times[1].is_some());
        for i in 0..3 {
            assert_eq!(cols.ratings[i].len(), 2);
            assert_eq!(cols.deviations[i].len(), 2);
            assert_eq!(cols.last_played[i].len(), 2);
        }
    }
}
