//! Schema creation and additive migrations for the relational store.
//!
//! Tables are first created in their original shape, then every column added
//! by a later version is applied if the table lacks it. Columns are never
//! dropped or renamed, so databases written by older versions open unchanged
//! and readers must ignore columns they do not know.

#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

/// Value stored in `PRAGMA user_version` once all migrations are applied
pub const SCHEMA_VERSION: i64 = 3;

const BASE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS files (
        file_id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        media_type TEXT NOT NULL DEFAULT 'text/plain',
        content_hash TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        chunk_id TEXT PRIMARY KEY NOT NULL,
        file_id TEXT NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
        chunk_index INTEGER NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_structs (
        index_id TEXT PRIMARY KEY NOT NULL,
        kind TEXT NOT NULL,
        data TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

#[derive(Debug, Clone, Copy)]
struct ColumnMigration {
    version: i64,
    table: &'static str,
    column: &'static str,
    definition: &'static str,
}

const COLUMN_MIGRATIONS: &[ColumnMigration] = &[
    ColumnMigration {
        version: 2,
        table: "files",
        column: "status",
        // rows from before this column existed were fully indexed
        definition: "TEXT NOT NULL DEFAULT 'indexed'",
    },
    ColumnMigration {
        version: 2,
        table: "chunks",
        column: "content_hash",
        definition: "TEXT",
    },
    ColumnMigration {
        version: 3,
        table: "files",
        column: "path",
        definition: "TEXT",
    },
    ColumnMigration {
        version: 3,
        table: "index_structs",
        column: "summary",
        definition: "TEXT",
    },
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_chunks_file_position ON chunks(file_id, chunk_index)",
    "CREATE INDEX IF NOT EXISTS idx_files_status_updated ON files(status, updated_at)",
];

/// Create missing tables, add missing columns and indexes, record the version.
/// Safe to run on every start.
#[inline]
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let found_version = user_version(pool).await?;
    info!(
        "Initialising schema (found version {}, current {})",
        found_version, SCHEMA_VERSION
    );

    for statement in BASE_TABLES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("Failed to create base table")?;
    }

    let mut added = 0;
    for migration in COLUMN_MIGRATIONS {
        let columns = table_columns(pool, migration.table).await?;
        if columns.iter().any(|c| c == migration.column) {
            continue;
        }

        debug!(
            "Adding column {}.{} (schema version {})",
            migration.table, migration.column, migration.version
        );
        let statement = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            migration.table, migration.column, migration.definition
        );
        sqlx::query(&statement)
            .execute(pool)
            .await
            .with_context(|| {
                format!(
                    "Failed to add column {}.{}",
                    migration.table, migration.column
                )
            })?;
        added += 1;
    }

    for statement in INDEXES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("Failed to create index")?;
    }

    if found_version > SCHEMA_VERSION {
        warn!(
            "Database schema version {} is newer than {}; unknown columns are ignored",
            found_version, SCHEMA_VERSION
        );
    } else if found_version < SCHEMA_VERSION {
        // PRAGMA does not accept bound parameters
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(pool)
            .await
            .context("Failed to record schema version")?;
    }

    debug!("Schema ready, {} column(s) added", added);
    Ok(())
}

#[inline]
pub async fn user_version(pool: &SqlitePool) -> Result<i64> {
    let row = sqlx::query("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .context("Failed to read schema version")?;
    row.try_get::<i64, _>(0)
        .context("Failed to decode schema version")
}

#[inline]
pub async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT name FROM pragma_table_info(?)")
        .bind(table)
        .fetch_all(pool)
        .await
        .with_context(|| format!("Failed to inspect table {table}"))?;

    rows.iter()
        .map(|row| {
            row.try_get::<String, _>("name")
                .context("Failed to decode column name")
        })
        .collect()
}
