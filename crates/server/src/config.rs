// collabd configuration.
//
// Every setting comes from a `STUDIO_COLLAB_*` environment variable with a
// default suitable for local development. Unparseable numbers fall back to
// the default rather than failing startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use studio_collab_engine::{CollabResult, RetentionPolicy};

const DEFAULT_PORT: u16 = 8090;
const DEFAULT_LIVENESS_SECS: u64 = 60;
const DEFAULT_INACTIVITY_SECS: u64 = 30 * 60;
const DEFAULT_EDIT_RETENTION_SECS: u64 = 2 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Shared session database. Every collabd instance serving the same
    /// documents must point at the same file.
    pub database_path: PathBuf,
    /// Root of the filesystem content store.
    pub content_dir: PathBuf,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `studio_collab_engine=debug`).
    pub log_filter: String,
    pub liveness_secs: u64,
    pub inactivity_secs: u64,
    pub edit_retention_secs: u64,
    pub sweep_interval: Duration,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `STUDIO_COLLAB_HOST` | `0.0.0.0` |
    /// | `STUDIO_COLLAB_PORT` | `8090` |
    /// | `STUDIO_COLLAB_DATABASE_PATH` | `./data/collab.db` |
    /// | `STUDIO_COLLAB_CONTENT_DIR` | `./data/content` |
    /// | `STUDIO_COLLAB_CORS_ORIGINS` | *(none; cors.rs uses dev defaults)* |
    /// | `STUDIO_COLLAB_LOG_FILTER` | `info` |
    /// | `STUDIO_COLLAB_LIVENESS_SECS` | `60` |
    /// | `STUDIO_COLLAB_INACTIVITY_SECS` | `1800` |
    /// | `STUDIO_COLLAB_EDIT_RETENTION_SECS` | `7200` |
    /// | `STUDIO_COLLAB_SWEEP_INTERVAL_SECS` | `30` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("STUDIO_COLLAB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "STUDIO_COLLAB_PORT", DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_path = env("STUDIO_COLLAB_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/collab.db"));
        let content_dir = env("STUDIO_COLLAB_CONTENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/content"));

        let cors_origins = env("STUDIO_COLLAB_CORS_ORIGINS").ok();
        let log_filter = env("STUDIO_COLLAB_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let sweep_interval_secs =
            parse_or(&env, "STUDIO_COLLAB_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS);

        Self {
            listen_addr,
            database_path,
            content_dir,
            cors_origins,
            log_filter,
            liveness_secs: parse_or(&env, "STUDIO_COLLAB_LIVENESS_SECS", DEFAULT_LIVENESS_SECS),
            inactivity_secs: parse_or(&env, "STUDIO_COLLAB_INACTIVITY_SECS", DEFAULT_INACTIVITY_SECS),
            edit_retention_secs: parse_or(
                &env,
                "STUDIO_COLLAB_EDIT_RETENTION_SECS",
                DEFAULT_EDIT_RETENTION_SECS,
            ),
            sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
        }
    }

    /// Janitor windows, validated.
    pub fn retention_policy(&self) -> CollabResult<RetentionPolicy> {
        RetentionPolicy::from_secs(self.liveness_secs, self.inactivity_secs, self.edit_retention_secs)
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}
