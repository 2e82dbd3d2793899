//! Database connection utilities.

use sea_orm::{Database, DatabaseConnection, DbErr};

/// Configure SQLite-specific pragmas for concurrent readers and writers.
///
/// This sets:
/// - `journal_mode=WAL` - readers keep seeing flushed pages while a batch is written
/// - `busy_timeout=5000` - wait up to 5 seconds for locks instead of failing immediately
/// - `synchronous=NORMAL` - safe with WAL and faster than FULL
async fn configure_sqlite(db: &DatabaseConnection) -> Result<(), DbErr> {
    use sea_orm::{ConnectionTrait, Statement};

    for pragma in [
        "PRAGMA journal_mode=WAL",
        "PRAGMA busy_timeout=5000",
        "PRAGMA synchronous=NORMAL",
    ] {
        db.execute(Statement::from_string(
            db.get_database_backend(),
            pragma.to_string(),
        ))
        .await?;
    }

    Ok(())
}

/// Establish a connection to the database.
///
/// SQLite databases are configured with WAL journaling, a 5 second busy
/// timeout and NORMAL synchronous mode.
///
/// # Arguments
/// * `database_url` - Database connection string (e.g., `sqlite:///path/to/db` or `postgres:///threadkeep`)
///
/// # Errors
/// Returns `DbErr` if the connection cannot be established.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(database_url).await?;

    if is_sqlite_url(database_url) {
        configure_sqlite(&db).await?;
    }

    Ok(db)
}

/// Establish a connection to the database and run all pending migrations.
///
/// # Errors
/// Returns `DbErr` if the connection cannot be established or migrations fail.
///
/// # Example
/// ```ignore
/// let db = threadkeep::connect_and_migrate("sqlite::memory:").await?;
/// ```
#[cfg(feature = "migrate")]
pub async fn connect_and_migrate(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    use sea_orm_migration::MigratorTrait;

    let db = connect(database_url).await?;
    crate::migration::Migrator::up(&db, None).await?;
    Ok(db)
}

fn is_sqlite_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    #[tokio::test]
    async fn configure_sqlite_runs_all_pragmas() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_exec_results([
                MockExecResult {
                    rows_affected: 0,
                    last_insert_id: 0,
                },
                MockExecResult {
                    rows_affected: 0,
                    last_insert_id: 0,
                },
                MockExecResult {
                    rows_affected: 0,
                    last_insert_id: 0,
                },
            ])
            .into_connection();

        configure_sqlite(&db)
            .await
            .expect("mock sqlite pragma execs should succeed");

        let log = db.into_transaction_log();
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn sqlite_urls_are_detected() {
        assert!(is_sqlite_url("sqlite:///tmp/threadkeep.db?mode=rwc"));
        assert!(!is_sqlite_url("sqlite::memory:"));
        assert!(!is_sqlite_url("postgres:///threadkeep"));
    }

    #[tokio::test]
    async fn connect_returns_error_for_invalid_database_url() {
        let err = connect("this-is-not-a-db-url")
            .await
            .expect_err("invalid URL should error");
        let msg = err.to_string().to_ascii_lowercase();
        assert!(
            msg.contains("error") || msg.contains("invalid"),
            "unexpected error message: {err}"
        );
    }
}
