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
        name: "automation_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS automation_configs (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                module TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                selected_gmail_accounts TEXT NOT NULL DEFAULT '[]',
                default_employees TEXT NOT NULL DEFAULT '[]',
                last_processed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (owner_id, module)
            );
            CREATE INDEX IF NOT EXISTS idx_automation_configs_enabled ON automation_configs(enabled);

            CREATE TABLE IF NOT EXISTS automation_rules (
                id TEXT PRIMARY KEY,
                config_id TEXT NOT NULL REFERENCES automation_configs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                is_enabled INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                conditions TEXT NOT NULL DEFAULT '[]',
                actions TEXT NOT NULL DEFAULT '[]',
                position INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_automation_rules_config ON automation_rules(config_id);

            CREATE TABLE IF NOT EXISTS inbound_messages (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                from_email TEXT NOT NULL,
                from_name TEXT,
                subject TEXT NOT NULL,
                body_text TEXT NOT NULL,
                received_at TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_messages_account ON inbound_messages(account_id);
            CREATE INDEX IF NOT EXISTS idx_inbound_messages_received ON inbound_messages(received_at);

            CREATE TABLE IF NOT EXISTS automation_logs (
                id TEXT PRIMARY KEY,
                config_id TEXT NOT NULL,
                rule_id TEXT,
                message_id TEXT,
                action_type TEXT,
                status TEXT NOT NULL,
                entity_type TEXT,
                entity_id TEXT,
                details TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_automation_logs_config ON automation_logs(config_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_automation_logs_message ON automation_logs(message_id);
        "#,
    },
    Migration {
        version: 2,
        name: "operations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                contact_email TEXT NOT NULL DEFAULT '',
                external_reference TEXT,
                source_message_id TEXT,
                config_id TEXT,
                project_category TEXT,
                operation_type TEXT,
                shipping_mode TEXT,
                insurance INTEGER NOT NULL DEFAULT 0,
                project_currency TEXT,
                assigned_employees TEXT NOT NULL DEFAULT '[]',
                created_automatically INTEGER NOT NULL DEFAULT 0,
                requires_review INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_operations_source_message
                ON operations(source_message_id);
            CREATE INDEX IF NOT EXISTS idx_operations_reference ON operations(external_reference);
        "#,
    },
    Migration {
        version: 3,
        name: "operations_per_config",
        sql: r#"
            DROP INDEX IF EXISTS idx_operations_source_message;
            DROP INDEX IF EXISTS idx_operations_reference;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_operations_config_source_message
                ON operations(config_id, source_message_id);
            CREATE INDEX IF NOT EXISTS idx_operations_config_reference
                ON operations(config_id, external_reference);
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

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );

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
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
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
