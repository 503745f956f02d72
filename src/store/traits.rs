//! `Database` trait: async interface for automation persistence.
//!
//! Configs and rules are owned by the surrounding CRUD screens, messages by
//! the Gmail sync. The dispatcher reads them, appends logs and stamps
//! `last_processed_at`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::automation::model::{
    AutomationConfig, AutomationLog, AutomationRule, InboundMessage, LogSummary,
};
use crate::error::DatabaseError;

/// Backend-agnostic database trait covering configs, rules, messages and logs.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Configs ─────────────────────────────────────────────────────

    /// Insert or replace a module configuration.
    async fn upsert_config(&self, config: &AutomationConfig) -> Result<(), DatabaseError>;

    async fn get_config(&self, id: Uuid) -> Result<Option<AutomationConfig>, DatabaseError>;

    /// Look up the config of `module` for `owner_id`.
    async fn get_config_by_module(
        &self,
        owner_id: &str,
        module: &str,
    ) -> Result<Option<AutomationConfig>, DatabaseError>;

    async fn list_enabled_configs(&self) -> Result<Vec<AutomationConfig>, DatabaseError>;

    /// Toggle a module on or off. Returns false if the config does not exist.
    async fn set_config_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DatabaseError>;

    /// Replace monitored accounts and default employees.
    async fn set_config_selection(
        &self,
        id: Uuid,
        accounts: &[String],
        employees: &[String],
    ) -> Result<bool, DatabaseError>;

    /// Delete a config and its rules. Logs are kept for history.
    async fn delete_config(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Stamp the time of the latest dispatch.
    async fn touch_config_processed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn insert_rule(&self, rule: &AutomationRule) -> Result<(), DatabaseError>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, DatabaseError>;

    /// All rules of a config, enabled or not, in definition order.
    async fn list_rules(&self, config_id: Uuid) -> Result<Vec<AutomationRule>, DatabaseError>;

    async fn update_rule(&self, rule: &AutomationRule) -> Result<bool, DatabaseError>;

    async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Store a synced message. Re-inserting the same id is a no-op.
    async fn insert_message(&self, message: &InboundMessage) -> Result<(), DatabaseError>;

    async fn get_message(&self, id: &str) -> Result<Option<InboundMessage>, DatabaseError>;

    /// Messages from `accounts` with no log entry for `config_id`, oldest first.
    async fn list_unprocessed_messages(
        &self,
        config_id: Uuid,
        accounts: &[String],
        limit: usize,
    ) -> Result<Vec<InboundMessage>, DatabaseError>;

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_log(&self, log: &AutomationLog) -> Result<(), DatabaseError>;

    /// Most recent logs of a config, newest first.
    async fn list_logs(
        &self,
        config_id: Uuid,
        limit: usize,
    ) -> Result<Vec<AutomationLog>, DatabaseError>;

    async fn log_summary(&self, config_id: Uuid) -> Result<LogSummary, DatabaseError>;
}
