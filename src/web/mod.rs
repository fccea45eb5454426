/// HTTP surface: axum router and request handlers
pub mod handlers;
pub mod server;

pub use server::{router, start_server, AppState};
