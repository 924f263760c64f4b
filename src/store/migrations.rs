//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "sequences_and_enrollments",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                spec TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sequences_org ON sequences(organization_id);
            CREATE INDEX IF NOT EXISTS idx_sequences_status ON sequences(status);

            CREATE TABLE IF NOT EXISTS enrollments (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
                contact_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                state TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                next_action_at TEXT,
                enrolled_at TEXT NOT NULL,
                last_action_at TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                deferral TEXT,
                review_reason TEXT,
                status_reason TEXT,
                claim_token TEXT,
                claimed_until TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_enrollments_sequence ON enrollments(sequence_id);
            CREATE INDEX IF NOT EXISTS idx_enrollments_contact ON enrollments(contact_id);
            CREATE INDEX IF NOT EXISTS idx_enrollments_due ON enrollments(state, next_action_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_enrollments_live_contact
                ON enrollments(sequence_id, contact_id)
                WHERE state IN ('pending_entry', 'active', 'waiting', 'completed');

            CREATE TABLE IF NOT EXISTS applied_triggers (
                enrollment_id TEXT NOT NULL REFERENCES enrollments(id) ON DELETE CASCADE,
                trigger_kind TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (enrollment_id, trigger_kind)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "sender_quotas",
        sql: r#"
            CREATE TABLE IF NOT EXISTS rate_limits (
                sender_id TEXT PRIMARY KEY,
                config TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dispatches (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                enrollment_id TEXT NOT NULL,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dispatches_sender_time ON dispatches(sender_id, sent_at);
            CREATE INDEX IF NOT EXISTS idx_enrollments_sender_deferral
                ON enrollments(sender_id, deferral);
        "#,
    },
    Migration {
        version: 3,
        name: "trigger_outbox",
        sql: r#"
            CREATE TABLE IF NOT EXISTS trigger_outbox (
                enrollment_id TEXT NOT NULL REFERENCES enrollments(id) ON DELETE CASCADE,
                trigger_kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                claim_token TEXT,
                claimed_until TEXT,
                created_at TEXT NOT NULL,
                applied_at TEXT,
                PRIMARY KEY (enrollment_id, trigger_kind)
            );
            CREATE INDEX IF NOT EXISTS idx_trigger_outbox_status
                ON trigger_outbox(status, retry_count);

            INSERT OR IGNORE INTO trigger_outbox
                (enrollment_id, trigger_kind, status, created_at, applied_at)
                SELECT enrollment_id, trigger_kind, 'applied', applied_at, applied_at
                FROM applied_triggers;
            DROP TABLE IF EXISTS applied_triggers;

            -- Entering an outcome state queues its trigger in the same statement.
            CREATE TRIGGER IF NOT EXISTS enqueue_outcome_trigger
            AFTER UPDATE OF state ON enrollments
            WHEN NEW.state <> OLD.state
                AND NEW.state IN ('replied', 'replied_not_interested', 'no_response', 'bounced')
            BEGIN
                INSERT OR IGNORE INTO trigger_outbox (enrollment_id, trigger_kind, created_at)
                VALUES (
                    NEW.id,
                    CASE NEW.state
                        WHEN 'replied' THEN 'onReplied'
                        WHEN 'replied_not_interested' THEN 'onRepliedNotInterested'
                        WHEN 'no_response' THEN 'onNoResponse'
                        ELSE 'onBounced'
                    END,
                    NEW.updated_at
                );
            END;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "sequences",
            "enrollments",
            "trigger_outbox",
            "rate_limits",
            "dispatches",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "sequences_and_enrollments");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "sender_quotas");

        let row3 = rows.next().await.unwrap().unwrap();
        assert_eq!(row3.get::<i64>(0).unwrap(), 3);
        assert_eq!(row3.get::<String>(1).unwrap(), "trigger_outbox");

        assert!(rows.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_enrollment_index_is_partial() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO sequences (id, organization_id, sender_id, name, spec, created_at, updated_at)
             VALUES ('s1', 'o', 'u', 'n', '{}', 'x', 'x')",
            (),
        )
        .await
        .unwrap();

        let insert = "INSERT OR IGNORE INTO enrollments
            (id, sequence_id, contact_id, sender_id, state, enrolled_at, updated_at)
            VALUES (?1, 's1', 'c1', 'u', ?2, 'x', 'x')";
        assert_eq!(conn.execute(insert, libsql::params!["e1", "removed"]).await.unwrap(), 1);
        assert_eq!(conn.execute(insert, libsql::params!["e2", "active"]).await.unwrap(), 1);
        assert_eq!(conn.execute(insert, libsql::params!["e3", "waiting"]).await.unwrap(), 0);
    }
}
