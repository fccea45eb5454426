/// Request handlers for the HTTP surface
use std::collections::HashMap;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AqeError;
use crate::estimator::{self, StatisticalBounds};
use crate::executor::{self, Row};
use crate::learning;
use crate::query::plan::{Plan, QueryOptimization, Strategy};
use crate::query::{Planner, QueryFeatures};
use crate::sample;
use crate::sketch::{self, SketchKind};
use crate::storage::db::HISTORY_LOOKUP_DEADLINE;
use crate::storage::meta;
use crate::web::server::AppState;

type ApiResponse = (StatusCode, Json<Value>);

fn bad_request(message: impl Into<String>) -> ApiResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
}

fn error_response(err: AqeError) -> ApiResponse {
    let status = match err {
        AqeError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

/// Table and column names arrive as free text and get spliced into SQL;
/// anything beyond a plain identifier is rejected up front.
fn valid_ident(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn list_tables(State(state): State<AppState>) -> ApiResponse {
    match state
        .db
        .call(HISTORY_LOOKUP_DEADLINE, "list tables", meta::list_user_tables)
        .await
    {
        Ok(tables) => (StatusCode::OK, Json(json!({ "tables": tables }))),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub sql: String,
    #[serde(default)]
    pub max_rel_error: f64,
    #[serde(default)]
    pub prefer_exact: bool,
    #[serde(default)]
    pub use_ml_optimization: bool,
    #[serde(default)]
    pub explain: bool,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_optimization: Option<QueryOptimization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistical_bounds: Option<StatisticalBounds>,
}

pub async fn post_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> ApiResponse {
    let sql = request.sql.trim().to_string();
    if sql.is_empty() {
        return bad_request("sql required");
    }

    let mut optimization: Option<QueryOptimization> = None;
    let mut features: Option<QueryFeatures> = None;
    let mut final_sql = sql.clone();

    if request.use_ml_optimization && !request.prefer_exact {
        let (opt, extracted) = learning::optimize_with_learning(
            &state.db,
            &state.history,
            &sql,
            request.max_rel_error,
        )
        .await;
        final_sql = opt.modified_sql.clone();
        optimization = Some(opt);
        features = Some(extracted);
    }

    let planner = Planner::new();
    let plan = match planner
        .plan(&state.db, &final_sql, request.max_rel_error, request.prefer_exact)
        .await
    {
        Ok(plan) => plan,
        Err(err) => return bad_request(err.to_string()),
    };

    if request.explain {
        let body = QueryResponse {
            status: "ok".to_string(),
            plan: Some(plan),
            result: None,
            meta: None,
            error: None,
            ml_optimization: optimization,
            statistical_bounds: None,
        };
        return (StatusCode::OK, Json(to_json(body)));
    }

    let started = Instant::now();
    let executed = executor::execute(&state.db, &plan).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let (mut rows, meta) = match executed {
        Ok(result) => result,
        Err(err) => {
            let body = QueryResponse {
                status: "error".to_string(),
                plan: Some(plan),
                result: None,
                meta: None,
                error: Some(err.to_string()),
                ml_optimization: optimization,
                statistical_bounds: None,
            };
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(to_json(body)));
        }
    };

    // Sampled rewrites from the learned path come back unscaled: the
    // planner sees only the rewritten subquery, so scaling and analytic
    // bounds are applied here.
    let mut statistical_bounds = None;
    if let Some(opt) = &optimization {
        if opt.strategy == Strategy::Sample {
            if let Some(fraction) = opt.sample_fraction {
                executor::scale_sample_results(&mut rows, fraction);
                statistical_bounds = attach_analytic_bounds(
                    &mut rows,
                    fraction,
                    features.as_ref().map(|f| f.table_size).unwrap_or(0),
                );
            }
        }
    }

    // Detached learning append. Queries over the history table itself are
    // never recorded, or the learner would study its own bookkeeping.
    let references_history = sql.to_ascii_lowercase().contains("aqe_query_history");
    if let (Some(opt), Some(extracted)) = (optimization.clone(), features.clone()) {
        if !references_history {
            let history = state.history.clone();
            let actual_error = observed_relative_error(&rows).unwrap_or(0.02);
            let baseline_ms = elapsed_ms * opt.estimated_speedup.max(0.1);
            tokio::spawn(async move {
                match history
                    .record(&opt, &extracted, elapsed_ms, actual_error, baseline_ms)
                    .await
                {
                    Ok(recorded) => {
                        if recorded {
                            tracing::debug!(pattern = %opt.original_sql, "recorded execution outcome");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "learning append failed"),
                }
            });
        }
    }

    if let Some(opt) = optimization.as_mut() {
        opt.sanitize();
    }

    let body = QueryResponse {
        status: "ok".to_string(),
        plan: Some(plan),
        result: Some(rows),
        meta: Some(meta),
        error: None,
        ml_optimization: optimization,
        statistical_bounds,
    };
    (StatusCode::OK, Json(to_json(body)))
}

fn to_json<T: Serialize>(body: T) -> Value {
    serde_json::to_value(body).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "response serialization failed");
        json!({ "status": "error", "error": "response serialization failed" })
    })
}

/// Mean of any `_rel_error` fields already attached to the first row.
fn observed_relative_error(rows: &[Row]) -> Option<f64> {
    let first = rows.first()?;
    let mut total = 0.0;
    let mut count = 0usize;
    for (column, value) in first {
        if column.ends_with("_rel_error") {
            if let Some(number) = value.as_f64() {
                total += number;
                count += 1;
            }
        }
    }
    if count > 0 {
        Some(total / count as f64)
    } else {
        None
    }
}

fn aggregation_kind(column: &str) -> &'static str {
    let upper = column.to_ascii_uppercase();
    if upper.contains("COUNT") {
        "COUNT"
    } else if upper.contains("SUM") || upper.contains("TOTAL") || upper.contains("REVENUE") {
        "SUM"
    } else if upper.contains("AVG") || upper.contains("MEAN") {
        "AVG"
    } else if upper.contains("DISTINCT") {
        "DISTINCT"
    } else {
        "COUNT"
    }
}

/// Attach analytic interval columns to aggregate results from the learned
/// sampling path, where no raw sample vectors exist for the bootstrap.
fn attach_analytic_bounds(
    rows: &mut [Row],
    fraction: f64,
    population_size: i64,
) -> Option<StatisticalBounds> {
    if rows.is_empty() || fraction <= 0.0 {
        return None;
    }

    let aggregate_columns: Vec<String> = rows[0]
        .keys()
        .filter(|column| {
            let upper = column.to_ascii_uppercase();
            ["COUNT", "SUM", "AVG", "TOTAL", "REVENUE", "ORDERS"]
                .iter()
                .any(|marker| upper.contains(marker))
                && !column.ends_with("_ci_low")
                && !column.ends_with("_ci_high")
                && !column.ends_with("_rel_error")
        })
        .cloned()
        .collect();

    let sample_size = ((population_size as f64) * fraction) as i64;
    let mut first_bounds = None;

    for column in &aggregate_columns {
        for index in 0..rows.len() {
            let value = match rows[index].get(column).and_then(Value::as_f64) {
                Some(value) => value,
                None => continue,
            };
            let bounds = estimator::estimate_error_bounds(
                value,
                sample_size,
                population_size,
                fraction,
                aggregation_kind(column),
                0.95,
            );
            let row = &mut rows[index];
            row.insert(
                format!("{column}_ci_low"),
                Value::from(bounds.confidence_interval.ci_low),
            );
            row.insert(
                format!("{column}_ci_high"),
                Value::from(bounds.confidence_interval.ci_high),
            );
            row.insert(
                format!("{column}_rel_error"),
                Value::from(bounds.relative_error),
            );
            if first_bounds.is_none() {
                first_bounds = Some(bounds);
            }
        }
    }

    first_bounds
}

#[derive(Debug, Deserialize)]
pub struct CreateSampleRequest {
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub sample_fraction: f64,
}

pub async fn post_create_sample(
    State(state): State<AppState>,
    Json(request): Json<CreateSampleRequest>,
) -> ApiResponse {
    if !valid_ident(&request.table) {
        return bad_request("table must be a plain identifier");
    }
    if request.sample_fraction <= 0.0 || request.sample_fraction >= 1.0 {
        return bad_request("table and 0 < sample_fraction < 1 required");
    }

    match sample::create_uniform_sample(&state.db, &request.table, request.sample_fraction).await {
        Ok((sample_table, rows)) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "sample_table": sample_table, "rows": rows })),
        ),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateStratifiedSampleRequest {
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub strata_column: String,
    #[serde(default)]
    pub total_fraction: f64,
    #[serde(default)]
    pub variance_column: Option<String>,
}

pub async fn post_create_stratified_sample(
    State(state): State<AppState>,
    Json(request): Json<CreateStratifiedSampleRequest>,
) -> ApiResponse {
    if !valid_ident(&request.table) || !valid_ident(&request.strata_column) {
        return bad_request("table and strata_column must be plain identifiers");
    }
    if let Some(variance_column) = &request.variance_column {
        if !valid_ident(variance_column) {
            return bad_request("variance_column must be a plain identifier");
        }
    }
    if request.total_fraction <= 0.0 || request.total_fraction >= 1.0 {
        return bad_request("table, strata_column and 0 < total_fraction < 1 required");
    }

    let allocation_type = if request.variance_column.is_some() {
        "neyman"
    } else {
        "proportional"
    };

    match sample::create_stratified_sample(
        &state.db,
        &request.table,
        &request.strata_column,
        request.total_fraction,
        request.variance_column.as_deref(),
    )
    .await
    {
        Ok((sample_table, strata)) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "sample_table": sample_table,
                "strata": strata,
                "allocation_type": allocation_type,
            })),
        ),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSketchRequest {
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub column: String,
    #[serde(default)]
    pub sketch_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

pub async fn post_create_sketch(
    State(state): State<AppState>,
    Json(request): Json<CreateSketchRequest>,
) -> ApiResponse {
    if !valid_ident(&request.table) || !valid_ident(&request.column) {
        return bad_request("table and column must be plain identifiers");
    }
    let kind = match SketchKind::parse(&request.sketch_type) {
        Some(kind) => kind,
        None => return bad_request("unsupported sketch type"),
    };

    let (blob, parameters_json) = match kind {
        SketchKind::HyperLogLog => {
            let b = request
                .parameters
                .get("b")
                .and_then(Value::as_u64)
                .unwrap_or(sketch::hyperloglog::DEFAULT_B as u64) as u8;
            let blob =
                match sketch::build_hll_from_table(&state.db, &request.table, &request.column, b)
                    .await
                {
                    Ok(blob) => blob,
                    Err(err) => return error_response(err),
                };
            (blob, json!({ "b": b }))
        }
        SketchKind::CountMin => {
            let epsilon = request
                .parameters
                .get("epsilon")
                .and_then(Value::as_f64)
                .unwrap_or(0.01);
            let delta = request
                .parameters
                .get("delta")
                .and_then(Value::as_f64)
                .unwrap_or(0.01);
            let blob = match sketch::build_cm_from_table(
                &state.db,
                &request.table,
                &request.column,
                epsilon,
                delta,
            )
            .await
            {
                Ok(blob) => blob,
                Err(err) => return error_response(err),
            };
            (blob, json!({ "epsilon": epsilon, "delta": delta }))
        }
    };

    let table = request.table.clone();
    let column = request.column.clone();
    let kind_str = kind.as_str().to_string();
    let parameters = parameters_json.to_string();
    let size_bytes = blob.len();
    let stored = state
        .db
        .call(HISTORY_LOOKUP_DEADLINE, "sketch upsert", move |conn| {
            meta::upsert_sketch(conn, &table, &column, &kind_str, &blob, &parameters)
        })
        .await;

    match stored {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "sketch_type": kind.as_str(),
                "size_bytes": size_bytes,
            })),
        ),
        Err(err) => error_response(err),
    }
}

pub async fn get_sketches(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResponse {
    let table = match params.get("table") {
        Some(table) if valid_ident(table) => table.clone(),
        _ => return bad_request("table parameter required"),
    };

    match state
        .db
        .call(HISTORY_LOOKUP_DEADLINE, "list sketches", move |conn| {
            meta::list_sketches(conn, &table)
        })
        .await
    {
        Ok(sketches) => (StatusCode::OK, Json(json!({ "sketches": sketches }))),
        Err(err) => error_response(err),
    }
}

pub async fn get_learning_stats(State(state): State<AppState>) -> ApiResponse {
    match state.history.learning_stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "learning_stats": stats })),
        ),
        Err(err) => error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ident() {
        assert!(valid_ident("purchases"));
        assert!(valid_ident("table_2"));
        assert!(!valid_ident(""));
        assert!(!valid_ident("2fast"));
        assert!(!valid_ident("users; DROP TABLE x"));
        assert!(!valid_ident("a.b"));
    }

    #[test]
    fn test_aggregation_kind() {
        assert_eq!(aggregation_kind("COUNT(*)"), "COUNT");
        assert_eq!(aggregation_kind("sum_amount"), "SUM");
        assert_eq!(aggregation_kind("total_revenue"), "SUM");
        assert_eq!(aggregation_kind("avg_price"), "AVG");
        assert_eq!(aggregation_kind("whatever"), "COUNT");
    }

    #[test]
    fn test_observed_relative_error_averages_fields() {
        let mut row = Row::new();
        row.insert("sum_amount".to_string(), Value::from(10.0));
        row.insert("sum_amount_rel_error".to_string(), Value::from(0.04));
        row.insert("n_rel_error".to_string(), Value::from(0.02));
        assert_eq!(observed_relative_error(&[row]), Some(0.03));

        let mut bare = Row::new();
        bare.insert("n".to_string(), Value::from(1));
        assert_eq!(observed_relative_error(&[bare]), None);
    }
}
