/// Uniform Bernoulli sample builder
use crate::error::{AqeError, AqeResult};
use crate::sample::{uniform_sample_table_name, RANDOM_UNIFORM};
use crate::storage::db::{Db, SAMPLE_BUILD_DEADLINE};
use crate::storage::meta;

/// Materialize a uniform sample of `table` with the given fraction.
///
/// The build is idempotent: an existing table with the target name is
/// dropped first. On success the sample descriptor is recorded and the
/// base table's cached row count refreshed. Returns the sample-table name
/// and its materialized row count.
pub async fn create_uniform_sample(
    db: &Db,
    table: &str,
    fraction: f64,
) -> AqeResult<(String, i64)> {
    if !(0.0..1.0).contains(&fraction) || fraction == 0.0 {
        return Err(AqeError::bad_request(format!(
            "sample fraction must be in (0, 1), got {fraction}"
        )));
    }

    let sample_table = uniform_sample_table_name(table, fraction);
    let base = table.to_string();
    let name = sample_table.clone();

    let rows = db
        .call(SAMPLE_BUILD_DEADLINE, "uniform sample build", move |conn| {
            conn.execute(&format!("DROP TABLE IF EXISTS {name}"), [])?;
            conn.execute(
                &format!(
                    "CREATE TABLE {name} AS SELECT * FROM {base} WHERE {RANDOM_UNIFORM} < {fraction}"
                ),
                [],
            )?;

            let sample_rows: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |row| row.get(0))?;
            let base_rows: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {base}"), [], |row| row.get(0))?;

            meta::upsert_table_row_count(conn, &base, base_rows)?;
            meta::insert_sample_meta(conn, &base, &name, fraction, None)?;
            Ok(sample_rows)
        })
        .await?;

    tracing::info!(
        table,
        sample_table = %sample_table,
        fraction,
        rows,
        "materialized uniform sample"
    );
    Ok((sample_table, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_db(rows: i64) -> Db {
        let db = Db::open_in_memory().unwrap();
        db.call(SAMPLE_BUILD_DEADLINE, "seed", move |conn| {
            meta::ensure_meta_tables(conn)?;
            conn.execute("CREATE TABLE events (id INTEGER, amount REAL)", [])?;
            conn.execute(
                &format!(
                    "WITH RECURSIVE seq(x) AS (
                         SELECT 1 UNION ALL SELECT x + 1 FROM seq WHERE x < {rows}
                     )
                     INSERT INTO events SELECT x, (x % 50) * 1.0 FROM seq"
                ),
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_fraction() {
        let db = Db::open_in_memory().unwrap();
        assert!(create_uniform_sample(&db, "events", 0.0).await.is_err());
        assert!(create_uniform_sample(&db, "events", 1.0).await.is_err());
        assert!(create_uniform_sample(&db, "events", -0.1).await.is_err());
    }

    #[tokio::test]
    async fn test_sample_size_near_expectation() {
        let db = seeded_db(20_000).await;
        let (name, rows) = create_uniform_sample(&db, "events", 0.05).await.unwrap();
        assert_eq!(name, "events__sample_0_05");

        // N*f = 1000; allow 5 sigma of binomial spread.
        let expected = 20_000.0 * 0.05;
        let sigma = (20_000.0f64 * 0.05 * 0.95).sqrt();
        assert!(
            (rows as f64 - expected).abs() <= 5.0 * sigma,
            "sample rows {rows}"
        );

        // Descriptor and refreshed base statistics are recorded.
        let (fraction, base_count) = db
            .call(SAMPLE_BUILD_DEADLINE, "check", |conn| {
                let fraction = meta::best_sample_fraction(conn, "events")?.unwrap_or(0.0);
                let count = meta::table_row_count(conn, "events")?.unwrap_or(0);
                Ok((fraction, count))
            })
            .await
            .unwrap();
        assert!((fraction - 0.05).abs() < 1e-9);
        assert_eq!(base_count, 20_000);
    }

    #[tokio::test]
    async fn test_rebuild_drops_previous_sample() {
        let db = seeded_db(1_000).await;
        create_uniform_sample(&db, "events", 0.1).await.unwrap();
        // A second build with the same fraction must not fail on the
        // existing table.
        create_uniform_sample(&db, "events", 0.1).await.unwrap();
    }
}
