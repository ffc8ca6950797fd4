use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `None` keeps the tree in memory only.
    pub db_path: Option<PathBuf>,
    pub heartbeat: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("PARLOR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = std::env::var("PARLOR_PORT")
            .unwrap_or_else(|_| "3300".into())
            .parse()?;
        let db_path = std::env::var("PARLOR_DB_PATH").unwrap_or_else(|_| "parlor.db".into());
        let heartbeat_secs: u64 = std::env::var("PARLOR_HEARTBEAT_SECS")
            .unwrap_or_else(|_| "15".into())
            .parse()?;

        Ok(Self {
            host,
            port,
            db_path: (!db_path.is_empty()).then(|| PathBuf::from(db_path)),
            heartbeat: Duration::from_secs(heartbeat_secs),
        })
    }
}
