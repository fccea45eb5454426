/// Stratified sample builder with Neyman-optimal allocation
///
/// Two passes: analyze the strata (population sizes and, when a variance
/// column is supplied, within-stratum variance), then materialize the
/// UNION ALL of per-stratum Bernoulli selections. Achieved sizes are
/// measured after the build and recorded; they differ from the planned
/// allocation by random variation, which is expected.
use rusqlite::Connection;
use serde::Serialize;

use crate::error::{AqeError, AqeResult};
use crate::sample::{stratified_sample_table_name, RANDOM_UNIFORM};
use crate::storage::db::{Db, STRATIFIED_BUILD_DEADLINE};
use crate::storage::meta;

/// Planned and achieved allocation for one stratum.
#[derive(Clone, Debug, Serialize)]
pub struct StratumAllocation {
    pub strata_key: String,
    pub strata_value: String,
    pub pop_size: i64,
    pub sample_size: i64,
    pub fraction: f64,
    pub weight: f64,
    pub variance: f64,
}

/// Materialize a stratified sample of `table` over `strata_column`.
///
/// Supplying `variance_column` switches the allocation from proportional
/// to Neyman-optimal (`n_h` proportional to `N_h * sigma_h`). Returns the
/// sample-table name and the per-stratum allocations with achieved sizes.
pub async fn create_stratified_sample(
    db: &Db,
    table: &str,
    strata_column: &str,
    total_fraction: f64,
    variance_column: Option<&str>,
) -> AqeResult<(String, Vec<StratumAllocation>)> {
    if total_fraction <= 0.0 || total_fraction >= 1.0 {
        return Err(AqeError::bad_request(format!(
            "total fraction must be in (0, 1), got {total_fraction}"
        )));
    }

    let sample_table = stratified_sample_table_name(table, strata_column, total_fraction);
    let base = table.to_string();
    let strata_col = strata_column.to_string();
    let variance_col = variance_column.map(str::to_string);
    let name = sample_table.clone();

    let strata = db
        .call(
            STRATIFIED_BUILD_DEADLINE,
            "stratified sample build",
            move |conn| {
                let mut strata =
                    analyze_strata(conn, &base, &strata_col, variance_col.as_deref())?;

                if variance_col.is_some() {
                    allocate_neyman(&mut strata, total_fraction);
                } else {
                    allocate_proportional(&mut strata, total_fraction);
                }

                conn.execute(&format!("DROP TABLE IF EXISTS {name}"), [])?;
                conn.execute(&build_sample_query(&base, &name, &strata_col, &strata), [])?;

                measure_achieved_sizes(conn, &name, &strata_col, &mut strata)?;

                meta::insert_sample_meta(conn, &base, &name, total_fraction, Some(&strata_col))?;
                for stratum in &strata {
                    conn.execute(
                        "INSERT INTO aqe_strata_info
                             (sample_table, strata_key, strata_value, pop_size,
                              sample_size, fraction, weight, variance)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        rusqlite::params![
                            name,
                            stratum.strata_key,
                            stratum.strata_value,
                            stratum.pop_size,
                            stratum.sample_size,
                            stratum.fraction,
                            stratum.weight,
                            stratum.variance,
                        ],
                    )?;
                }
                Ok(strata)
            },
        )
        .await?;

    tracing::info!(
        table,
        sample_table = %sample_table,
        strata = strata.len(),
        total_fraction,
        "materialized stratified sample"
    );
    Ok((sample_table, strata))
}

/// Discover the strata of `strata_column`: one row per distinct non-NULL
/// value with its population size and, when requested, the within-stratum
/// variance of `variance_column` computed via a correlated mean subquery.
fn analyze_strata(
    conn: &Connection,
    table: &str,
    strata_column: &str,
    variance_column: Option<&str>,
) -> rusqlite::Result<Vec<StratumAllocation>> {
    let query = match variance_column {
        Some(var_col) => format!(
            "SELECT {strata_column} AS strata_value,
                    COUNT(*) AS pop_size,
                    CASE WHEN COUNT(*) > 1 THEN
                        SUM(({var_col} - (SELECT AVG({var_col}) FROM {table}
                                          WHERE {strata_column} = t.{strata_column}))
                          * ({var_col} - (SELECT AVG({var_col}) FROM {table}
                                          WHERE {strata_column} = t.{strata_column})))
                        / (COUNT(*) - 1)
                    ELSE 0 END AS variance
             FROM {table} t
             WHERE {strata_column} IS NOT NULL AND {var_col} IS NOT NULL
             GROUP BY {strata_column}
             ORDER BY pop_size DESC"
        ),
        None => format!(
            "SELECT {strata_column} AS strata_value, COUNT(*) AS pop_size, 0.0 AS variance
             FROM {table}
             WHERE {strata_column} IS NOT NULL
             GROUP BY {strata_column}
             ORDER BY pop_size DESC"
        ),
    };

    let mut stmt = conn.prepare(&query)?;
    let key = strata_column.to_string();
    let rows = stmt.query_map([], move |row| {
        let value = stratum_value_text(row.get_ref(0)?);
        Ok(StratumAllocation {
            strata_key: key.clone(),
            strata_value: value,
            pop_size: row.get(1)?,
            sample_size: 0,
            fraction: 0.0,
            weight: 0.0,
            variance: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Neyman allocation: `n_h = n * (N_h * sigma_h) / sum(N_i * sigma_i)`.
/// Falls back to proportional allocation when the total weight is zero.
pub(crate) fn allocate_neyman(strata: &mut [StratumAllocation], total_fraction: f64) {
    let mut total_pop = 0i64;
    let mut total_weight = 0.0;
    for stratum in strata.iter_mut() {
        total_pop += stratum.pop_size;
        stratum.weight = stratum.pop_size as f64 * stratum.variance.sqrt();
        total_weight += stratum.weight;
    }

    if total_weight <= 0.0 {
        allocate_proportional(strata, total_fraction);
        return;
    }

    let total_sample = total_pop as f64 * total_fraction;
    for stratum in strata.iter_mut() {
        stratum.sample_size = (total_sample * stratum.weight / total_weight) as i64;
        stratum.fraction = if stratum.pop_size > 0 {
            stratum.sample_size as f64 / stratum.pop_size as f64
        } else {
            0.0
        };
        clamp_to_population(stratum);
    }
}

/// Proportional allocation: the same fraction in every stratum.
pub(crate) fn allocate_proportional(strata: &mut [StratumAllocation], total_fraction: f64) {
    for stratum in strata.iter_mut() {
        stratum.fraction = total_fraction;
        stratum.sample_size = (stratum.pop_size as f64 * total_fraction) as i64;
        stratum.weight = stratum.pop_size as f64;
        clamp_to_population(stratum);
    }
}

fn clamp_to_population(stratum: &mut StratumAllocation) {
    if stratum.fraction > 1.0 {
        stratum.fraction = 1.0;
        stratum.sample_size = stratum.pop_size;
    }
}

/// Text form of a stratum key as it comes back from the store.
fn stratum_value_text(value: rusqlite::types::ValueRef<'_>) -> String {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

/// UNION ALL of per-stratum Bernoulli selections. An empty allocation
/// still produces the sample table, with no rows.
fn build_sample_query(
    table: &str,
    sample_table: &str,
    strata_column: &str,
    strata: &[StratumAllocation],
) -> String {
    let parts: Vec<String> = strata
        .iter()
        .filter(|stratum| stratum.sample_size > 0)
        .map(|stratum| {
            format!(
                "SELECT * FROM {table} WHERE {strata_column} = '{}' AND {RANDOM_UNIFORM} < {}",
                stratum.strata_value.replace('\'', "''"),
                stratum.fraction
            )
        })
        .collect();

    if parts.is_empty() {
        format!("CREATE TABLE {sample_table} AS SELECT * FROM {table} WHERE 1 = 0")
    } else {
        format!("CREATE TABLE {sample_table} AS {}", parts.join(" UNION ALL "))
    }
}

/// Replace the planned sizes with the sizes the build actually achieved.
fn measure_achieved_sizes(
    conn: &Connection,
    sample_table: &str,
    strata_column: &str,
    strata: &mut [StratumAllocation],
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {strata_column}, COUNT(*) FROM {sample_table} GROUP BY {strata_column}"
    ))?;
    let counts: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((stratum_value_text(row.get_ref(0)?), row.get(1)?)))?
        .collect::<Result<_, _>>()?;

    for stratum in strata.iter_mut() {
        if let Some((_, achieved)) = counts.iter().find(|(v, _)| *v == stratum.strata_value) {
            stratum.sample_size = *achieved;
            if stratum.pop_size > 0 {
                stratum.fraction = *achieved as f64 / stratum.pop_size as f64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stratum(value: &str, pop: i64, variance: f64) -> StratumAllocation {
        StratumAllocation {
            strata_key: "country".to_string(),
            strata_value: value.to_string(),
            pop_size: pop,
            sample_size: 0,
            fraction: 0.0,
            weight: 0.0,
            variance,
        }
    }

    #[test]
    fn test_neyman_allocation_tracks_weight() {
        let mut strata = vec![
            stratum("US", 10_000, 400.0),
            stratum("DE", 10_000, 100.0),
            stratum("FR", 5_000, 100.0),
        ];
        allocate_neyman(&mut strata, 0.1);

        // Weights N_h * sigma_h: 200k, 100k, 50k -> allocations 4:2:1.
        let total: i64 = strata.iter().map(|s| s.sample_size).sum();
        assert!((total - 2_500).abs() <= 3, "total allocation {total}");
        assert!(strata[0].sample_size > strata[1].sample_size);
        assert!(strata[1].sample_size > strata[2].sample_size);
        let ratio = strata[0].sample_size as f64 / strata[1].sample_size as f64;
        assert!((ratio - 2.0).abs() < 0.05, "ratio {ratio}");
    }

    #[test]
    fn test_neyman_zero_variance_falls_back_to_proportional() {
        let mut strata = vec![stratum("US", 1_000, 0.0), stratum("DE", 500, 0.0)];
        allocate_neyman(&mut strata, 0.2);
        assert_eq!(strata[0].sample_size, 200);
        assert_eq!(strata[1].sample_size, 100);
        assert!((strata[0].fraction - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_fraction_clamped_to_population() {
        // One stratum dominates the weight so heavily its allocation
        // exceeds its own population.
        let mut strata = vec![stratum("US", 100, 1_000_000.0), stratum("DE", 10_000, 0.01)];
        allocate_neyman(&mut strata, 0.5);
        assert!(strata[0].fraction <= 1.0);
        assert!(strata[0].sample_size <= strata[0].pop_size);
    }

    #[test]
    fn test_build_query_quotes_values() {
        let strata = vec![StratumAllocation {
            sample_size: 10,
            fraction: 0.1,
            ..stratum("O'Brien", 100, 0.0)
        }];
        let query = build_sample_query("people", "people__strat_sample_name_0_1", "name", &strata);
        assert!(query.contains("'O''Brien'"));
    }

    #[test]
    fn test_empty_allocation_builds_empty_shell() {
        let query = build_sample_query("people", "s", "name", &[]);
        assert!(query.contains("WHERE 1 = 0"));
    }

    #[tokio::test]
    async fn test_stratified_sample_invariants() {
        let db = Db::open_in_memory().unwrap();
        db.call(STRATIFIED_BUILD_DEADLINE, "seed", |conn| {
            meta::ensure_meta_tables(conn)?;
            conn.execute(
                "CREATE TABLE purchases (id INTEGER, country TEXT, amount REAL)",
                [],
            )?;
            conn.execute(
                "WITH RECURSIVE seq(x) AS (
                     SELECT 1 UNION ALL SELECT x + 1 FROM seq WHERE x < 20000
                 )
                 INSERT INTO purchases
                 SELECT x, 'c' || (x % 10), (x % 10 + 1) * ((x * 7919) % 97) * 1.0 FROM seq",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let (name, strata) =
            create_stratified_sample(&db, "purchases", "country", 0.05, Some("amount"))
                .await
                .unwrap();
        assert_eq!(strata.len(), 10);

        let (sample_rows, recorded) = db
            .call(STRATIFIED_BUILD_DEADLINE, "check", move |conn| {
                let rows: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |r| r.get(0))?;
                let recorded: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM aqe_strata_info",
                    [],
                    |r| r.get(0),
                )?;
                Ok((rows, recorded))
            })
            .await
            .unwrap();

        // Achieved sizes sum to the materialized row count and never
        // exceed their population.
        let total: i64 = strata.iter().map(|s| s.sample_size).sum();
        assert_eq!(total, sample_rows);
        for stratum in &strata {
            assert!(stratum.sample_size <= stratum.pop_size);
        }
        assert_eq!(recorded, 10);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_fraction() {
        let db = Db::open_in_memory().unwrap();
        assert!(
            create_stratified_sample(&db, "purchases", "country", 0.0, None)
                .await
                .is_err()
        );
        assert!(
            create_stratified_sample(&db, "purchases", "country", 1.0, None)
                .await
                .is_err()
        );
    }
}
