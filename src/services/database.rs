//! SQLite pool setup and schema scripts.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr};

/// Schema of the persistent transfer store.
pub const TRANSFER_SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Schema of the directory-backed object store's metadata.
pub const LOCAL_STORE_SCHEMA: &str = include_str!("../../migrations/local_store.sql");

/// Open (creating if needed) the SQLite database behind `url`.
///
/// Accepts `sqlite://path`, `sqlite:path` and bare paths. The parent
/// directory is created when missing.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let db_path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    tracing::debug!(url, db_path, "opening sqlite database");

    if db_path != ":memory:" {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Open a database file directly.
pub async fn connect_file(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Run every statement of an idempotent schema script.
pub async fn run_migrations(db: &SqlitePool, script: &str) -> Result<(), sqlx::Error> {
    let statements = script
        .split(';')
        .map(strip_comments)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::debug!("Running {} migration statements", statements.len());

    for stmt in statements {
        tracing::trace!("Executing migration SQL: {}", stmt);
        sqlx::query(&stmt).execute(db).await?;
    }

    Ok(())
}

fn strip_comments(stmt: &str) -> String {
    stmt.lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_only_chunks_are_dropped() {
        assert_eq!(strip_comments("-- header\n\n"), "");
        assert_eq!(
            strip_comments("-- table\nCREATE TABLE t (id INTEGER)"),
            "CREATE TABLE t (id INTEGER)"
        );
    }

    #[tokio::test]
    async fn transfer_schema_applies_twice() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = connect_file(&dir.path().join("t.db")).await.unwrap();
        run_migrations(&pool, TRANSFER_SCHEMA).await.unwrap();
        run_migrations(&pool, TRANSFER_SCHEMA).await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert!(tables.contains(&"transfers".to_string()));
        assert!(tables.contains(&"transfer_parts".to_string()));
    }
}
