use abt_core::errors::{AbtError, ErrorInfo};
use rusqlite::{params, Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 2;

pub(crate) fn store_error(code: &str, err: impl ToString) -> AbtError {
    AbtError::Storage(ErrorInfo::new(code, err.to_string()))
}

/// Creates the tables if needed and checks the stored schema version.
pub fn init_schema(conn: &Connection) -> Result<(), AbtError> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
        BEGIN;
        CREATE TABLE IF NOT EXISTS meta(version INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS experiments(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            page_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            hypothesis TEXT NOT NULL,
            goal_event TEXT NOT NULL,
            goal_page_id INTEGER,
            treatment_revision INTEGER,
            sample_size INTEGER NOT NULL,
            status TEXT NOT NULL,
            outcome TEXT,
            created_at TEXT NOT NULL,
            first_started_at TEXT,
            last_started_at TEXT,
            finished_at TEXT,
            winning_variant TEXT
        );
        CREATE INDEX IF NOT EXISTS experiments_page_status ON experiments(page_id, status);
        CREATE TABLE IF NOT EXISTS hourly_logs(
            experiment_id INTEGER NOT NULL,
            variant TEXT NOT NULL,
            date TEXT NOT NULL,
            hour INTEGER NOT NULL CHECK (hour BETWEEN 0 AND 23),
            participants INTEGER NOT NULL DEFAULT 0,
            conversions INTEGER NOT NULL DEFAULT 0,
            UNIQUE(experiment_id, variant, date, hour),
            FOREIGN KEY(experiment_id) REFERENCES experiments(id) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS assignments(
            experiment_id INTEGER NOT NULL,
            visitor_key TEXT NOT NULL,
            variant TEXT NOT NULL,
            counted INTEGER NOT NULL DEFAULT 0,
            converted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(experiment_id, visitor_key),
            FOREIGN KEY(experiment_id) REFERENCES experiments(id) ON DELETE CASCADE
        );
        COMMIT;",
    )
    .map_err(|err| store_error("store-schema", err))?;
    set_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

fn set_version(conn: &Connection, version: i64) -> Result<(), AbtError> {
    let existing: Option<i64> = conn
        .query_row("SELECT version FROM meta LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(|err| store_error("store-schema", err))?;
    match existing {
        Some(current) if current == version => Ok(()),
        Some(current) => Err(AbtError::Storage(
            ErrorInfo::new(
                "store-schema-version",
                format!("store schema {current} incompatible with expected {version}"),
            )
            .with_hint("migrate or recreate the database"),
        )),
        None => {
            conn.execute("INSERT INTO meta(version) VALUES (?)", params![version])
                .map_err(|err| store_error("store-schema", err))?;
            Ok(())
        }
    }
}
