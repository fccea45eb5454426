/// Router wiring and shared application state
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::learning::HistoryStore;
use crate::storage::Db;
use crate::web::handlers;

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub history: HistoryStore,
}

impl AppState {
    pub fn new(db: Db) -> Self {
        let history = HistoryStore::new(db.clone());
        Self { db, history }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/tables", get(handlers::list_tables))
        .route("/query", post(handlers::post_query))
        .route("/samples/create", post(handlers::post_create_sample))
        .route("/samples/stratified", post(handlers::post_create_stratified_sample))
        .route("/sketches/create", post(handlers::post_create_sketch))
        .route("/sketches", get(handlers::get_sketches))
        .route("/ml/stats", get(handlers::get_learning_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn start_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("aqe server listening on http://localhost:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}
