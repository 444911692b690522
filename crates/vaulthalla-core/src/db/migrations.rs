//! Schema migrations.
//!
//! Versioned SQL files are embedded in the crate and applied in
//! filename-sorted order inside one transaction. `schema_migrations`
//! records `(filename, sha256, applied_at)`; a file is skipped when its
//! recorded hash matches and re-executed when the content changed, so
//! every file must stay idempotent.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::crypto::hash::sha256_hex;
use crate::error::Result;

/// Embedded migration files, filename-sorted.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_schema.sql", include_str!("sql/0001_schema.sql")),
    ("0002_indexes.sql", include_str!("sql/0002_indexes.sql")),
];

/// Apply all pending migrations on `conn`.
pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            filename    TEXT PRIMARY KEY,
            sha256      TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )?;

    for (filename, sql) in MIGRATIONS {
        let hash = sha256_hex(sql.as_bytes());
        if is_applied(conn, filename, &hash)? {
            continue;
        }
        info!(filename, "applying migration");
        conn.execute_batch(sql)?;
        mark_applied(conn, filename, &hash)?;
    }

    debug!("schema migrations up to date");
    Ok(())
}

fn is_applied(conn: &Connection, filename: &str, hash: &str) -> Result<bool> {
    let row: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM schema_migrations WHERE filename = ?1 AND sha256 = ?2",
            params![filename, hash],
            |r| r.get(0),
        )
        .optional()?;
    Ok(row.is_some())
}

fn mark_applied(conn: &Connection, filename: &str, hash: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (filename, sha256, applied_at)
         VALUES (?1, ?2, strftime('%s', 'now'))
         ON CONFLICT (filename)
         DO UPDATE SET sha256 = excluded.sha256, applied_at = excluded.applied_at",
        params![filename, hash],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();

        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_changed_hash_reexecutes() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();

        // Simulate a content change by corrupting the recorded hash.
        conn.execute(
            "UPDATE schema_migrations SET sha256 = 'stale' WHERE filename = '0002_indexes.sql'",
            [],
        )
        .unwrap();
        apply(&conn).unwrap();

        let hash: String = conn
            .query_row(
                "SELECT sha256 FROM schema_migrations WHERE filename = '0002_indexes.sql'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_ne!(hash, "stale");
    }

    #[test]
    fn test_files_are_sorted() {
        let mut names: Vec<&str> = MIGRATIONS.iter().map(|(n, _)| *n).collect();
        let original = names.clone();
        names.sort_unstable();
        assert_eq!(names, original, "migration files must be filename-sorted");
    }
}
