/// Environment-driven server configuration
use std::env;

/// Runtime configuration for the AQE server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Path to the backing SQLite database file
    pub db_path: String,

    /// HTTP listen port
    pub port: u16,
}

impl ServerConfig {
    /// Read configuration from the environment.
    ///
    /// `AQE_DB_PATH` selects the backing database (default `aqe.sqlite`),
    /// `AQE_PORT` the listen port (default 8080).
    pub fn from_env() -> Self {
        let db_path = env::var("AQE_DB_PATH").unwrap_or_else(|_| "aqe.sqlite".to_string());
        let port = env::var("AQE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        Self { db_path, port }
    }
}
