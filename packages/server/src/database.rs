use std::future::Future;
use std::path::Path;
use std::time::Duration;

use common::RetryPolicy;
use common::retry::retry_with_backoff;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr, SqlErr};

use crate::config::DatabaseConfig;

pub async fn init_db(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    if let Some(path) = sqlite_file(&config.url)
        && let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| DbErr::Custom(format!("cannot create {}: {e}", parent.display())))?;
    }

    let mut opt = ConnectOptions::new(config.url.to_owned());

    opt.max_connections(config.max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(300))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    db.get_schema_registry("memoryark::entity::*")
        .sync(&db)
        .await?;

    Ok(db)
}

/// File path of a `sqlite://` URL, without query parameters.
fn sqlite_file(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(path)
    }
}

/// The statement collided with a unique index, e.g. two live siblings sharing a name.
pub fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

/// Errors that may succeed when the same transaction is attempted again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for DbErr {
    fn is_transient(&self) -> bool {
        let msg = self.to_string().to_ascii_lowercase();
        msg.contains("database is locked")
            || msg.contains("database table is locked")
            || msg.contains("could not serialize access")
            || msg.contains("serialization failure")
            || msg.contains("deadlock")
    }
}

/// Re-run a metadata transaction that failed on a lock or serialization conflict.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    retry_with_backoff(policy, |e: &E| e.is_transient(), op).await
}
