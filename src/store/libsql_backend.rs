//! libSQL backend: async `Database` and `OperationSink` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339 with fixed microsecond precision so they sort lexically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::automation::executor::OperationSink;
use crate::automation::model::{
    Action, AutomationConfig, AutomationLog, AutomationRule, Condition, ExecutionStatus,
    InboundMessage, LogSummary, NewOperation, OperationRecord,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// All operations, oldest first.
    pub async fn list_operations(&self) -> Result<Vec<OperationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {OPERATION_COLUMNS} FROM operations ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_operations: {e}")))?;

        let mut operations = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_operations").await? {
            operations.push(row_to_operation(&row)?);
        }
        Ok(operations)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp write format.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_err(context: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("{context} row parse: {e}"))
}

async fn next_row(
    rows: &mut libsql::Rows,
    context: &str,
) -> Result<Option<libsql::Row>, DatabaseError> {
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))
}

/// Map a libsql error to `Constraint` for uniqueness failures, `Query` otherwise.
fn write_err(context: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{context}: {msg}"))
    } else {
        DatabaseError::Query(format!("{context}: {msg}"))
    }
}

/// Map a libsql Row to an AutomationConfig.
///
/// Column order matches CONFIG_COLUMNS.
fn row_to_config(row: &libsql::Row) -> Result<AutomationConfig, DatabaseError> {
    let ctx = "config";
    let id: String = row.get(0).map_err(|e| row_err(ctx, e))?;
    let enabled: i64 = row.get(3).map_err(|e| row_err(ctx, e))?;
    let accounts: String = row.get(4).map_err(|e| row_err(ctx, e))?;
    let employees: String = row.get(5).map_err(|e| row_err(ctx, e))?;
    let last_processed: Option<String> = row.get(6).ok();
    let created: String = row.get(7).map_err(|e| row_err(ctx, e))?;
    let updated: String = row.get(8).map_err(|e| row_err(ctx, e))?;

    Ok(AutomationConfig {
        id: parse_uuid(&id)?,
        owner_id: row.get(1).map_err(|e| row_err(ctx, e))?,
        module: row.get(2).map_err(|e| row_err(ctx, e))?,
        enabled: enabled != 0,
        selected_gmail_accounts: serde_json::from_str(&accounts)?,
        default_employees: serde_json::from_str(&employees)?,
        last_processed_at: parse_optional_datetime(&last_processed),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a libsql Row to an AutomationRule.
///
/// Column order matches RULE_COLUMNS.
fn row_to_rule(row: &libsql::Row) -> Result<AutomationRule, DatabaseError> {
    let ctx = "rule";
    let id: String = row.get(0).map_err(|e| row_err(ctx, e))?;
    let config_id: String = row.get(1).map_err(|e| row_err(ctx, e))?;
    let is_enabled: i64 = row.get(4).map_err(|e| row_err(ctx, e))?;
    let priority: i64 = row.get(5).map_err(|e| row_err(ctx, e))?;
    let conditions: String = row.get(6).map_err(|e| row_err(ctx, e))?;
    let actions: String = row.get(7).map_err(|e| row_err(ctx, e))?;
    let created: String = row.get(8).map_err(|e| row_err(ctx, e))?;
    let updated: String = row.get(9).map_err(|e| row_err(ctx, e))?;

    let conditions: Vec<Condition> = serde_json::from_str(&conditions)?;
    let actions: Vec<Action> = serde_json::from_str(&actions)?;

    Ok(AutomationRule {
        id: parse_uuid(&id)?,
        config_id: parse_uuid(&config_id)?,
        name: row.get(2).map_err(|e| row_err(ctx, e))?,
        description: row.get(3).map_err(|e| row_err(ctx, e))?,
        is_enabled: is_enabled != 0,
        priority: i32::try_from(priority).map_err(|_| {
            DatabaseError::Serialization(format!("rule {id}: priority {priority} out of range"))
        })?,
        conditions,
        actions,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a libsql Row to an InboundMessage.
fn row_to_message(row: &libsql::Row) -> Result<InboundMessage, DatabaseError> {
    let ctx = "message";
    let received: String = row.get(6).map_err(|e| row_err(ctx, e))?;

    Ok(InboundMessage {
        id: row.get(0).map_err(|e| row_err(ctx, e))?,
        account_id: row.get(1).map_err(|e| row_err(ctx, e))?,
        from_email: row.get(2).map_err(|e| row_err(ctx, e))?,
        from_name: row.get(3).ok(),
        subject: row.get(4).map_err(|e| row_err(ctx, e))?,
        body_text: row.get(5).map_err(|e| row_err(ctx, e))?,
        received_at: parse_datetime(&received),
    })
}

/// Map a libsql Row to an AutomationLog.
fn row_to_log(row: &libsql::Row) -> Result<AutomationLog, DatabaseError> {
    let ctx = "log";
    let id: String = row.get(0).map_err(|e| row_err(ctx, e))?;
    let config_id: String = row.get(1).map_err(|e| row_err(ctx, e))?;
    let rule_id: Option<String> = row.get(2).ok();
    let status: String = row.get(5).map_err(|e| row_err(ctx, e))?;
    let details: String = row.get(8).map_err(|e| row_err(ctx, e))?;
    let created: String = row.get(10).map_err(|e| row_err(ctx, e))?;

    Ok(AutomationLog {
        id: parse_uuid(&id)?,
        config_id: parse_uuid(&config_id)?,
        rule_id: rule_id.as_deref().map(parse_uuid).transpose()?,
        message_id: row.get(3).ok(),
        action_type: row.get(4).ok(),
        status: status
            .parse::<ExecutionStatus>()
            .map_err(DatabaseError::Serialization)?,
        entity_type: row.get(6).ok(),
        entity_id: row.get(7).ok(),
        details: serde_json::from_str(&details)?,
        error_message: row.get(9).ok(),
        created_at: parse_datetime(&created),
    })
}

/// Map a libsql Row to an OperationRecord.
fn row_to_operation(row: &libsql::Row) -> Result<OperationRecord, DatabaseError> {
    let ctx = "operation";
    let id: String = row.get(0).map_err(|e| row_err(ctx, e))?;
    let config_id: Option<String> = row.get(5).ok();
    let insurance: i64 = row.get(9).map_err(|e| row_err(ctx, e))?;
    let employees: String = row.get(11).map_err(|e| row_err(ctx, e))?;
    let created_automatically: i64 = row.get(12).map_err(|e| row_err(ctx, e))?;
    let requires_review: i64 = row.get(13).map_err(|e| row_err(ctx, e))?;
    let created: String = row.get(14).map_err(|e| row_err(ctx, e))?;

    Ok(OperationRecord {
        id: parse_uuid(&id)?,
        operation: NewOperation {
            title: row.get(1).map_err(|e| row_err(ctx, e))?,
            contact_email: row.get(2).map_err(|e| row_err(ctx, e))?,
            external_reference: row.get(3).ok(),
            source_message_id: row.get::<String>(4).unwrap_or_default(),
            config_id: config_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .unwrap_or_else(Uuid::nil),
            project_category: row.get(6).ok(),
            operation_type: row.get(7).ok(),
            shipping_mode: row.get(8).ok(),
            insurance: insurance != 0,
            project_currency: row.get(10).ok(),
            assigned_employees: serde_json::from_str(&employees)?,
            created_automatically: created_automatically != 0,
            requires_review: requires_review != 0,
        },
        created_at: parse_datetime(&created),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const CONFIG_COLUMNS: &str = "id, owner_id, module, enabled, selected_gmail_accounts, default_employees, last_processed_at, created_at, updated_at";

const RULE_COLUMNS: &str =
    "id, config_id, name, description, is_enabled, priority, conditions, actions, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, account_id, from_email, from_name, subject, body_text, received_at";

const LOG_COLUMNS: &str = "id, config_id, rule_id, message_id, action_type, status, entity_type, entity_id, details, error_message, created_at";

const OPERATION_COLUMNS: &str = "id, title, contact_email, external_reference, source_message_id, config_id, project_category, operation_type, shipping_mode, insurance, project_currency, assigned_employees, created_automatically, requires_review, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Configs ─────────────────────────────────────────────────────

    async fn upsert_config(&self, config: &AutomationConfig) -> Result<(), DatabaseError> {
        let accounts = serde_json::to_string(&config.selected_gmail_accounts)?;
        let employees = serde_json::to_string(&config.default_employees)?;
        let last_processed = config.last_processed_at.as_ref().map(ts);

        self.conn()
            .execute(
                "INSERT INTO automation_configs (id, owner_id, module, enabled, selected_gmail_accounts, default_employees, last_processed_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    owner_id = excluded.owner_id,
                    module = excluded.module,
                    enabled = excluded.enabled,
                    selected_gmail_accounts = excluded.selected_gmail_accounts,
                    default_employees = excluded.default_employees,
                    last_processed_at = excluded.last_processed_at,
                    updated_at = excluded.updated_at",
                params![
                    config.id.to_string(),
                    config.owner_id.as_str(),
                    config.module.as_str(),
                    config.enabled as i64,
                    accounts,
                    employees,
                    opt_text(last_processed.as_deref()),
                    ts(&config.created_at),
                    ts(&config.updated_at),
                ],
            )
            .await
            .map_err(|e| write_err("upsert_config", e))?;

        debug!(config_id = %config.id, module = %config.module, "Config upserted");
        Ok(())
    }

    async fn get_config(&self, id: Uuid) -> Result<Option<AutomationConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONFIG_COLUMNS} FROM automation_configs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_config: {e}")))?;

        match next_row(&mut rows, "get_config").await? {
            Some(row) => Ok(Some(row_to_config(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_config_by_module(
        &self,
        owner_id: &str,
        module: &str,
    ) -> Result<Option<AutomationConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONFIG_COLUMNS} FROM automation_configs WHERE owner_id = ?1 AND module = ?2"
                ),
                params![owner_id, module],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_config_by_module: {e}")))?;

        match next_row(&mut rows, "get_config_by_module").await? {
            Some(row) => Ok(Some(row_to_config(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_enabled_configs(&self) -> Result<Vec<AutomationConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONFIG_COLUMNS} FROM automation_configs WHERE enabled = 1 ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_enabled_configs: {e}")))?;

        let mut configs = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_enabled_configs").await? {
            configs.push(row_to_config(&row)?);
        }
        Ok(configs)
    }

    async fn set_config_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE automation_configs SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_config_enabled: {e}")))?;

        debug!(config_id = %id, enabled, "Config toggled");
        Ok(changed > 0)
    }

    async fn set_config_selection(
        &self,
        id: Uuid,
        accounts: &[String],
        employees: &[String],
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE automation_configs SET selected_gmail_accounts = ?1, default_employees = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    serde_json::to_string(accounts)?,
                    serde_json::to_string(employees)?,
                    ts(&Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_config_selection: {e}")))?;
        Ok(changed > 0)
    }

    async fn delete_config(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM automation_rules WHERE config_id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_config rules: {e}")))?;

        let deleted = conn
            .execute(
                "DELETE FROM automation_configs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_config: {e}")))?;

        debug!(config_id = %id, "Config deleted");
        Ok(deleted > 0)
    }

    async fn touch_config_processed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        // Never move the stamp backwards when messages finish out of order
        self.conn()
            .execute(
                "UPDATE automation_configs
                 SET last_processed_at = CASE
                     WHEN last_processed_at IS NULL OR last_processed_at < ?1 THEN ?1
                     ELSE last_processed_at
                 END
                 WHERE id = ?2",
                params![ts(&at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_config_processed: {e}")))?;
        Ok(())
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn insert_rule(&self, rule: &AutomationRule) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO automation_rules (id, config_id, name, description, is_enabled, priority, conditions, actions, position, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                    (SELECT COALESCE(MAX(position), 0) + 1 FROM automation_rules WHERE config_id = ?2),
                    ?9, ?10)",
                params![
                    rule.id.to_string(),
                    rule.config_id.to_string(),
                    rule.name.as_str(),
                    rule.description.as_str(),
                    rule.is_enabled as i64,
                    rule.priority as i64,
                    serde_json::to_string(&rule.conditions)?,
                    serde_json::to_string(&rule.actions)?,
                    ts(&rule.created_at),
                    ts(&rule.updated_at),
                ],
            )
            .await
            .map_err(|e| write_err("insert_rule", e))?;

        debug!(rule_id = %rule.id, config_id = %rule.config_id, "Rule inserted");
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM automation_rules WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_rule: {e}")))?;

        match next_row(&mut rows, "get_rule").await? {
            Some(row) => Ok(Some(row_to_rule(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_rules(&self, config_id: Uuid) -> Result<Vec<AutomationRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM automation_rules WHERE config_id = ?1 ORDER BY position ASC"
                ),
                params![config_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_rules").await? {
            match row_to_rule(&row) {
                Ok(rule) => rules.push(rule),
                // A rule we cannot read can never match
                Err(e) => warn!(config_id = %config_id, "Skipping malformed rule row: {e}"),
            }
        }
        Ok(rules)
    }

    async fn update_rule(&self, rule: &AutomationRule) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE automation_rules
                 SET name = ?1, description = ?2, is_enabled = ?3, priority = ?4,
                     conditions = ?5, actions = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    rule.name.as_str(),
                    rule.description.as_str(),
                    rule.is_enabled as i64,
                    rule.priority as i64,
                    serde_json::to_string(&rule.conditions)?,
                    serde_json::to_string(&rule.actions)?,
                    ts(&Utc::now()),
                    rule.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_rule: {e}")))?;
        Ok(changed > 0)
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM automation_rules WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;
        Ok(deleted > 0)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &InboundMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO inbound_messages (id, account_id, from_email, from_name, subject, body_text, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id.as_str(),
                    message.account_id.as_str(),
                    message.from_email.as_str(),
                    opt_text(message.from_name.as_deref()),
                    message.subject.as_str(),
                    message.body_text.as_str(),
                    ts(&message.received_at),
                ],
            )
            .await
            .map_err(|e| write_err("insert_message", e))?;

        debug!(message_id = %message.id, account = %message.account_id, "Message stored");
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<InboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM inbound_messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match next_row(&mut rows, "get_message").await? {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_unprocessed_messages(
        &self,
        config_id: Uuid,
        accounts: &[String],
        limit: usize,
    ) -> Result<Vec<InboundMessage>, DatabaseError> {
        if accounts.is_empty() {
            return Ok(Vec::new());
        }

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM inbound_messages m
                     WHERE m.account_id IN (SELECT value FROM json_each(?2))
                       AND NOT EXISTS (
                           SELECT 1 FROM automation_logs l
                           WHERE l.config_id = ?1 AND l.message_id = m.id
                       )
                     ORDER BY m.received_at ASC, m.id ASC
                     LIMIT ?3"
                ),
                params![
                    config_id.to_string(),
                    serde_json::to_string(accounts)?,
                    limit as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unprocessed_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_unprocessed_messages").await? {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_log(&self, log: &AutomationLog) -> Result<(), DatabaseError> {
        let rule_id = log.rule_id.map(|id| id.to_string());
        self.conn()
            .execute(
                &format!("INSERT INTO automation_logs ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    log.id.to_string(),
                    log.config_id.to_string(),
                    opt_text(rule_id.as_deref()),
                    opt_text(log.message_id.as_deref()),
                    opt_text(log.action_type.as_deref()),
                    log.status.as_str(),
                    opt_text(log.entity_type.as_deref()),
                    opt_text(log.entity_id.as_deref()),
                    serde_json::to_string(&log.details)?,
                    opt_text(log.error_message.as_deref()),
                    ts(&log.created_at),
                ],
            )
            .await
            .map_err(|e| write_err("append_log", e))?;

        debug!(log_id = %log.id, config_id = %log.config_id, status = %log.status, "Log appended");
        Ok(())
    }

    async fn list_logs(
        &self,
        config_id: Uuid,
        limit: usize,
    ) -> Result<Vec<AutomationLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM automation_logs WHERE config_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![config_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_logs").await? {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }

    async fn log_summary(&self, config_id: Uuid) -> Result<LogSummary, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*), MAX(created_at) FROM automation_logs WHERE config_id = ?1 GROUP BY status",
                params![config_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("log_summary: {e}")))?;

        let mut summary = LogSummary::default();
        while let Some(row) = next_row(&mut rows, "log_summary").await? {
            let status: String = row.get(0).map_err(|e| row_err("log_summary", e))?;
            let count: i64 = row.get(1).map_err(|e| row_err("log_summary", e))?;
            let last: Option<String> = row.get(2).ok();

            match status.parse::<ExecutionStatus>() {
                Ok(ExecutionStatus::Success) => summary.success = count as u64,
                Ok(ExecutionStatus::Error) => summary.error = count as u64,
                Ok(ExecutionStatus::Skipped) => summary.skipped = count as u64,
                Err(e) => {
                    warn!("Ignoring log rows with {e}");
                    continue;
                }
            }
            let last = parse_optional_datetime(&last);
            if last > summary.last_activity {
                summary.last_activity = last;
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl OperationSink for LibSqlBackend {
    async fn find_automated_operation(
        &self,
        config_id: Uuid,
        message_id: &str,
        reference: Option<&str>,
    ) -> Result<Option<OperationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OPERATION_COLUMNS} FROM operations
                     WHERE created_automatically = 1
                       AND config_id = ?1
                       AND (source_message_id = ?2 OR (?3 IS NOT NULL AND external_reference = ?3))
                     ORDER BY created_at ASC
                     LIMIT 1"
                ),
                params![config_id.to_string(), message_id, opt_text(reference)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_automated_operation: {e}")))?;

        match next_row(&mut rows, "find_automated_operation").await? {
            Some(row) => Ok(Some(row_to_operation(&row)?)),
            None => Ok(None),
        }
    }

    async fn create_operation(
        &self,
        operation: &NewOperation,
    ) -> Result<OperationRecord, DatabaseError> {
        let record = OperationRecord {
            id: Uuid::new_v4(),
            operation: operation.clone(),
            created_at: Utc::now(),
        };

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO operations ({OPERATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    record.id.to_string(),
                    operation.title.as_str(),
                    operation.contact_email.as_str(),
                    opt_text(operation.external_reference.as_deref()),
                    operation.source_message_id.as_str(),
                    operation.config_id.to_string(),
                    opt_text(operation.project_category.as_deref()),
                    opt_text(operation.operation_type.as_deref()),
                    opt_text(operation.shipping_mode.as_deref()),
                    operation.insurance as i64,
                    opt_text(operation.project_currency.as_deref()),
                    serde_json::to_string(&operation.assigned_employees)?,
                    operation.created_automatically as i64,
                    operation.requires_review as i64,
                    ts(&record.created_at),
                ],
            )
            .await
            .map_err(|e| write_err("create_operation", e))?;

        debug!(operation_id = %record.id, source = %operation.source_message_id, "Operation inserted");
        Ok(record)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::automation::model::{ConditionField, ConditionOperator, CreateOperationParams};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn message(id: &str, account: &str, minutes_ago: i64) -> InboundMessage {
        InboundMessage {
            id: id.into(),
            account_id: account.into(),
            from_email: "agent@navicargo.com".into(),
            from_name: Some("Navi".into()),
            subject: format!("Shipment {id}"),
            body_text: "body".into(),
            received_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    fn new_operation(config_id: Uuid, message_id: &str, reference: Option<&str>) -> NewOperation {
        NewOperation {
            title: "Shipment".into(),
            contact_email: "agent@navicargo.com".into(),
            external_reference: reference.map(String::from),
            source_message_id: message_id.into(),
            config_id,
            project_category: Some("import".into()),
            operation_type: None,
            shipping_mode: Some("air".into()),
            insurance: false,
            project_currency: Some("USD".into()),
            assigned_employees: vec!["emp-9".into()],
            created_automatically: true,
            requires_review: true,
        }
    }

    #[tokio::test]
    async fn config_round_trip() {
        let db = test_db().await;
        let config = AutomationConfig::new("tenant-1", "operations-from-email")
            .with_accounts(["ops@fw.com", "sales@fw.com"])
            .with_employees(["emp-1"]);
        db.upsert_config(&config).await.unwrap();

        let loaded = db.get_config(config.id).await.unwrap().unwrap();
        assert_eq!(loaded.owner_id, "tenant-1");
        assert_eq!(loaded.selected_gmail_accounts, vec!["ops@fw.com", "sales@fw.com"]);
        assert_eq!(loaded.default_employees, vec!["emp-1"]);
        assert!(loaded.enabled);
        assert!(loaded.last_processed_at.is_none());

        let by_module = db
            .get_config_by_module("tenant-1", "operations-from-email")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_module.id, config.id);
        assert!(db.get_config_by_module("tenant-2", "operations-from-email").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn toggle_and_selection() {
        let db = test_db().await;
        let config = AutomationConfig::new("t", "operations-from-email");
        db.upsert_config(&config).await.unwrap();

        assert!(db.set_config_enabled(config.id, false).await.unwrap());
        assert!(db.list_enabled_configs().await.unwrap().is_empty());
        assert!(db.set_config_enabled(config.id, true).await.unwrap());
        assert_eq!(db.list_enabled_configs().await.unwrap().len(), 1);

        assert!(
            db.set_config_selection(config.id, &["a@fw.com".into()], &["e1".into(), "e2".into()])
                .await
                .unwrap()
        );
        let loaded = db.get_config(config.id).await.unwrap().unwrap();
        assert_eq!(loaded.selected_gmail_accounts, vec!["a@fw.com"]);
        assert_eq!(loaded.default_employees, vec!["e1", "e2"]);

        assert!(!db.set_config_enabled(Uuid::new_v4(), true).await.unwrap());
    }

    #[tokio::test]
    async fn touch_never_moves_backwards() {
        let db = test_db().await;
        let config = AutomationConfig::new("t", "m");
        db.upsert_config(&config).await.unwrap();

        let later = Utc::now();
        let earlier = later - Duration::minutes(5);
        db.touch_config_processed(config.id, later).await.unwrap();
        db.touch_config_processed(config.id, earlier).await.unwrap();

        let loaded = db.get_config(config.id).await.unwrap().unwrap();
        assert_eq!(ts(&loaded.last_processed_at.unwrap()), ts(&later));
    }

    #[tokio::test]
    async fn rules_keep_definition_order() {
        let db = test_db().await;
        let config = AutomationConfig::new("t", "m");
        db.upsert_config(&config).await.unwrap();

        for (name, priority) in [("first", 1), ("second", 10), ("third", 5)] {
            let rule = AutomationRule::new(config.id, name, priority)
                .with_condition(Condition::subject_contains("NAVI-"))
                .with_action(Action::create_operation(CreateOperationParams {
                    id_pattern: Some("NAVI-".into()),
                    ..Default::default()
                }));
            db.insert_rule(&rule).await.unwrap();
        }

        let rules = db.list_rules(config.id).await.unwrap();
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert_eq!(rules[1].priority, 10);
        assert_eq!(rules[0].conditions[0].field, ConditionField::Subject);
        assert_eq!(rules[0].conditions[0].operator, ConditionOperator::Contains);
        assert!(matches!(rules[0].actions[0], Action::CreateOperation(_)));
    }

    #[tokio::test]
    async fn update_and_delete_rule() {
        let db = test_db().await;
        let config = AutomationConfig::new("t", "m");
        db.upsert_config(&config).await.unwrap();
        let mut rule = AutomationRule::new(config.id, "r", 1);
        db.insert_rule(&rule).await.unwrap();

        rule.priority = 42;
        rule.is_enabled = false;
        rule.description = "edited".into();
        assert!(db.update_rule(&rule).await.unwrap());

        let loaded = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(loaded.priority, 42);
        assert!(!loaded.is_enabled);
        assert_eq!(loaded.description, "edited");

        assert!(db.delete_rule(rule.id).await.unwrap());
        assert!(db.get_rule(rule.id).await.unwrap().is_none());
        assert!(!db.delete_rule(rule.id).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_rule_rows_are_skipped() {
        let db = test_db().await;
        let config = AutomationConfig::new("t", "m");
        db.upsert_config(&config).await.unwrap();
        db.insert_rule(&AutomationRule::new(config.id, "good", 1)).await.unwrap();

        db.conn()
            .execute(
                "INSERT INTO automation_rules (id, config_id, name, conditions, actions, position, created_at, updated_at)
                 VALUES (?1, ?2, 'broken', '[{\"field\":\"subject\"}]', '[]', 99, '2026-01-01', '2026-01-01')",
                params![Uuid::new_v4().to_string(), config.id.to_string()],
            )
            .await
            .unwrap();

        let rules = db.list_rules(config.id).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "good");
    }

    #[tokio::test]
    async fn delete_config_removes_rules() {
        let db = test_db().await;
        let config = AutomationConfig::new("t", "m");
        db.upsert_config(&config).await.unwrap();
        db.insert_rule(&AutomationRule::new(config.id, "r", 1)).await.unwrap();

        assert!(db.delete_config(config.id).await.unwrap());
        assert!(db.get_config(config.id).await.unwrap().is_none());
        assert!(db.list_rules(config.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_message_is_idempotent() {
        let db = test_db().await;
        let msg = message("m1", "A", 0);
        db.insert_message(&msg).await.unwrap();
        db.insert_message(&msg).await.unwrap();

        let loaded = db.get_message("m1").await.unwrap().unwrap();
        assert_eq!(loaded.subject, "Shipment m1");
        assert_eq!(loaded.from_name.as_deref(), Some("Navi"));
        assert!(db.get_message("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unprocessed_messages_filtered_by_account_and_log() {
        let db = test_db().await;
        let config = AutomationConfig::new("t", "m").with_accounts(["A"]);
        db.upsert_config(&config).await.unwrap();

        db.insert_message(&message("old", "A", 30)).await.unwrap();
        db.insert_message(&message("new", "A", 1)).await.unwrap();
        db.insert_message(&message("other", "B", 10)).await.unwrap();
        db.insert_message(&message("done", "A", 20)).await.unwrap();

        let log = AutomationLog::new(config.id, Some("done".into()), ExecutionStatus::Skipped);
        db.append_log(&log).await.unwrap();

        let accounts = vec!["A".to_string()];
        let backlog = db
            .list_unprocessed_messages(config.id, &accounts, 10)
            .await
            .unwrap();
        let ids: Vec<_> = backlog.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["old", "new"]);

        let limited = db
            .list_unprocessed_messages(config.id, &accounts, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "old");

        assert!(db.list_unprocessed_messages(config.id, &[], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn logs_and_summary() {
        let db = test_db().await;
        let config_id = Uuid::new_v4();

        let mut success = AutomationLog::new(config_id, Some("m1".into()), ExecutionStatus::Success);
        success.rule_id = Some(Uuid::new_v4());
        success.action_type = Some("create_operation".into());
        success.entity_type = Some("operation".into());
        success.entity_id = Some("op-1".into());
        success.details = serde_json::json!({"reference": "NAVI-1"});
        db.append_log(&success).await.unwrap();

        let mut error = AutomationLog::new(config_id, Some("m2".into()), ExecutionStatus::Error);
        error.error_message = Some("Pattern 'NAVI-' not found in subject".into());
        error.created_at = success.created_at + Duration::seconds(1);
        db.append_log(&error).await.unwrap();

        let mut skipped = AutomationLog::new(config_id, None, ExecutionStatus::Skipped);
        skipped.created_at = success.created_at + Duration::seconds(2);
        db.append_log(&skipped).await.unwrap();

        let logs = db.list_logs(config_id, 10).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].status, ExecutionStatus::Skipped);
        assert!(logs[0].message_id.is_none());
        assert_eq!(logs[2].rule_id, success.rule_id);
        assert_eq!(logs[2].entity_id.as_deref(), Some("op-1"));
        assert_eq!(logs[2].details["reference"], "NAVI-1");
        assert_eq!(logs[1].error_message.as_deref(), Some("Pattern 'NAVI-' not found in subject"));

        let summary = db.log_summary(config_id).await.unwrap();
        assert_eq!(summary.success, 1);
        assert_eq!(summary.error, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total(), 3);
        assert_eq!(ts(&summary.last_activity.unwrap()), ts(&skipped.created_at));

        assert_eq!(db.log_summary(Uuid::new_v4()).await.unwrap(), LogSummary::default());
    }

    #[tokio::test]
    async fn create_and_find_operation() {
        let db = test_db().await;
        let config_id = Uuid::new_v4();
        let record = db
            .create_operation(&new_operation(config_id, "m1", Some("NAVI-1")))
            .await
            .unwrap();

        let by_message = db
            .find_automated_operation(config_id, "m1", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_message.id, record.id);
        assert!(by_message.operation.requires_review);
        assert_eq!(by_message.operation.assigned_employees, vec!["emp-9"]);

        let by_reference = db
            .find_automated_operation(config_id, "m2", Some("NAVI-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_reference.id, record.id);

        assert!(db.find_automated_operation(config_id, "m2", Some("NAVI-2")).await.unwrap().is_none());
        assert!(db.find_automated_operation(config_id, "m2", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_ignores_other_configs() {
        let db = test_db().await;
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        db.create_operation(&new_operation(owner, "m1", Some("NAVI-4821")))
            .await
            .unwrap();

        assert!(db.find_automated_operation(other, "m1", None).await.unwrap().is_none());
        assert!(
            db.find_automated_operation(other, "m9", Some("NAVI-4821"))
                .await
                .unwrap()
                .is_none()
        );

        // Same message and reference are free to use in another config
        db.create_operation(&new_operation(other, "m1", Some("NAVI-4821")))
            .await
            .unwrap();
        assert_eq!(db.list_operations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_operation_for_message_is_constraint_error() {
        let db = test_db().await;
        let config_id = Uuid::new_v4();
        db.create_operation(&new_operation(config_id, "m1", None)).await.unwrap();
        let err = db
            .create_operation(&new_operation(config_id, "m1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert_eq!(db.list_operations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_log_details_are_an_error() {
        let db = test_db().await;
        let config_id = Uuid::new_v4();
        db.conn()
            .execute(
                "INSERT INTO automation_logs (id, config_id, status, details, created_at)
                 VALUES (?1, ?2, 'success', '{not json', '2026-01-01T00:00:00Z')",
                params![Uuid::new_v4().to_string(), config_id.to_string()],
            )
            .await
            .unwrap();

        let err = db.list_logs(config_id, 10).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)));
    }

    #[tokio::test]
    async fn out_of_range_priority_is_an_error() {
        let db = test_db().await;
        let config = AutomationConfig::new("t", "m");
        db.upsert_config(&config).await.unwrap();
        let rule_id = Uuid::new_v4();
        db.conn()
            .execute(
                "INSERT INTO automation_rules (id, config_id, name, priority, position, created_at, updated_at)
                 VALUES (?1, ?2, 'huge', ?3, 1, '2026-01-01', '2026-01-01')",
                params![rule_id.to_string(), config.id.to_string(), i64::from(i32::MAX) + 1],
            )
            .await
            .unwrap();

        let err = db.get_rule(rule_id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)));
        // Listing skips it rather than truncating
        assert!(db.list_rules(config.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("automation.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(db);
    }
}
