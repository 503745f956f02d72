//! Automation dispatcher: runs stored messages through a config's rules.
//!
//! One pass per (config, message):
//! 1. Drop messages from accounts the config does not monitor (no log)
//! 2. Select the applicable rule
//! 3. Execute its actions
//! 4. Append exactly one `AutomationLog` and stamp `last_processed_at`
//!
//! Action failures, including a panicking executor, end up on the log.
//! Store failures are returned to the caller, which retries the whole pass.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::{FutureExt, StreamExt, TryStreamExt, stream};
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::automation::executor::{ActionExecutor, OperationSink};
use crate::automation::matcher::select_rule;
use crate::automation::model::{
    ActionResult, AutomationConfig, AutomationLog, AutomationRule, ExecutionStatus,
    InboundMessage,
};
use crate::config::AutomationSettings;
use crate::error::DatabaseError;
use crate::store::Database;

/// What happened to one message.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Account not monitored. Nothing was evaluated or logged.
    FilteredOut,
    /// Evaluated; carries the log entry that was written.
    Logged(AutomationLog),
}

impl DispatchOutcome {
    pub fn status(&self) -> Option<ExecutionStatus> {
        match self {
            Self::FilteredOut => None,
            Self::Logged(log) => Some(log.status),
        }
    }

    pub fn log(&self) -> Option<&AutomationLog> {
        match self {
            Self::FilteredOut => None,
            Self::Logged(log) => Some(log),
        }
    }
}

/// Outcome counts for a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub success: usize,
    pub error: usize,
    pub skipped: usize,
    pub filtered_out: usize,
}

impl DispatchSummary {
    /// Messages that produced a log entry.
    pub fn logged(&self) -> usize {
        self.success + self.error + self.skipped
    }

    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome.status() {
            None => self.filtered_out += 1,
            Some(ExecutionStatus::Success) => self.success += 1,
            Some(ExecutionStatus::Error) => self.error += 1,
            Some(ExecutionStatus::Skipped) => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: DispatchSummary) {
        self.success += other.success;
        self.error += other.error;
        self.skipped += other.skipped;
        self.filtered_out += other.filtered_out;
    }
}

/// Matches, executes and logs stored messages for automation configs.
pub struct AutomationDispatcher {
    db: Arc<dyn Database>,
    executor: ActionExecutor,
    locks: MessageLocks,
    max_concurrent: usize,
    backlog_limit: usize,
}

impl AutomationDispatcher {
    pub fn new(db: Arc<dyn Database>, operations: Arc<dyn OperationSink>) -> Self {
        let defaults = AutomationSettings::default();
        Self {
            db,
            executor: ActionExecutor::new(operations),
            locks: MessageLocks::default(),
            max_concurrent: defaults.max_concurrent_messages,
            backlog_limit: defaults.backlog_limit,
        }
    }

    /// Build a dispatcher using the concurrency and backlog limits from `settings`.
    pub fn from_settings(
        db: Arc<dyn Database>,
        operations: Arc<dyn OperationSink>,
        settings: &AutomationSettings,
    ) -> Self {
        Self::new(db, operations).with_limits(settings.max_concurrent_messages, settings.backlog_limit)
    }

    pub fn with_limits(mut self, max_concurrent: usize, backlog_limit: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self.backlog_limit = backlog_limit.max(1);
        self
    }

    /// Dispatch a single message against `config` and its `rules`.
    ///
    /// Concurrent calls for the same message id are serialized so the
    /// duplicate check in the executor sees the earlier operation.
    pub async fn process_message(
        &self,
        config: &AutomationConfig,
        rules: &[AutomationRule],
        message: &InboundMessage,
    ) -> Result<DispatchOutcome, DatabaseError> {
        if !config.monitors(&message.account_id) {
            debug!(
                config_id = %config.id,
                message_id = %message.id,
                account = %message.account_id,
                "Account not monitored, ignoring message"
            );
            return Ok(DispatchOutcome::FilteredOut);
        }

        let _guard = self.locks.acquire(&message.id).await;

        let log = match select_rule(rules, message) {
            None => {
                let mut log =
                    AutomationLog::new(config.id, Some(message.id.clone()), ExecutionStatus::Skipped);
                log.details = json!({ "reason": "no rule matched" });
                log
            }
            Some(rule) => {
                let results = self.run_actions(rule, message, config).await;
                build_log(config.id, &message.id, rule, &results)
            }
        };

        self.db.append_log(&log).await?;
        self.db.touch_config_processed(config.id, Utc::now()).await?;

        info!(
            config_id = %config.id,
            message_id = %message.id,
            rule_id = ?log.rule_id,
            status = %log.status,
            "Message dispatched"
        );

        Ok(DispatchOutcome::Logged(log))
    }

    /// Run the unprocessed backlog of one config.
    ///
    /// Disabled configs and configs without monitored accounts are left alone.
    pub async fn process_config(&self, config_id: Uuid) -> Result<DispatchSummary, DatabaseError> {
        let config = self
            .db
            .get_config(config_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "automation_config".to_string(),
                id: config_id.to_string(),
            })?;

        if !config.enabled {
            debug!(config_id = %config.id, "Config disabled, not dispatching");
            return Ok(DispatchSummary::default());
        }
        if config.selected_gmail_accounts.is_empty() {
            debug!(config_id = %config.id, "Config monitors no accounts");
            return Ok(DispatchSummary::default());
        }

        let rules = self.db.list_rules(config.id).await?;
        let backlog = self
            .db
            .list_unprocessed_messages(config.id, &config.selected_gmail_accounts, self.backlog_limit)
            .await?;

        if backlog.is_empty() {
            return Ok(DispatchSummary::default());
        }

        info!(
            config_id = %config.id,
            module = %config.module,
            messages = backlog.len(),
            rules = rules.len(),
            "Dispatching backlog"
        );

        // Collected up front so the pass future stays `Send` inside `tokio::spawn`
        let passes: Vec<_> = backlog
            .iter()
            .map(|message| self.process_message(&config, &rules, message))
            .collect();

        let outcomes: Vec<DispatchOutcome> = stream::iter(passes)
            .buffer_unordered(self.max_concurrent)
            .try_collect()
            .await?;

        let mut summary = DispatchSummary::default();
        for outcome in &outcomes {
            summary.record(outcome);
        }
        Ok(summary)
    }

    /// Run every enabled config once.
    pub async fn process_all(&self) -> Result<DispatchSummary, DatabaseError> {
        let configs = self.db.list_enabled_configs().await?;
        let mut summary = DispatchSummary::default();
        for config in configs {
            summary.merge(self.process_config(config.id).await?);
        }
        Ok(summary)
    }

    /// Manually run one stored message through a config again.
    ///
    /// Ignores the config's enabled flag. Duplicate detection still applies,
    /// so an already automated message logs `skipped`.
    pub async fn reprocess_message(
        &self,
        config_id: Uuid,
        message_id: &str,
    ) -> Result<DispatchOutcome, DatabaseError> {
        let config = self
            .db
            .get_config(config_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "automation_config".to_string(),
                id: config_id.to_string(),
            })?;
        let message = self
            .db
            .get_message(message_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "inbound_message".to_string(),
                id: message_id.to_string(),
            })?;
        let rules = self.db.list_rules(config.id).await?;

        info!(config_id = %config.id, message_id = %message.id, "Reprocessing message");
        self.process_message(&config, &rules, &message).await
    }

    async fn run_actions(
        &self,
        rule: &AutomationRule,
        message: &InboundMessage,
        config: &AutomationConfig,
    ) -> Vec<ActionResult> {
        let run = self.executor.execute(&rule.actions, message, config);
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(results) => results,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(
                    config_id = %config.id,
                    message_id = %message.id,
                    rule_id = %rule.id,
                    "Action executor panicked: {reason}"
                );
                vec![ActionResult::failed(
                    joined_action_types(rule),
                    format!("action executor panicked: {reason}"),
                )]
            }
        }
    }
}

/// Fold per-action results into the single log entry for a matched rule.
///
/// Any error wins, then any success, else skipped. A rule with no actions
/// logs `skipped`.
pub fn build_log(
    config_id: Uuid,
    message_id: &str,
    rule: &AutomationRule,
    results: &[ActionResult],
) -> AutomationLog {
    let status = if results.iter().any(|r| r.status == ExecutionStatus::Error) {
        ExecutionStatus::Error
    } else if results.iter().any(|r| r.status == ExecutionStatus::Success) {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::Skipped
    };

    let mut log = AutomationLog::new(config_id, Some(message_id.to_string()), status);
    log.rule_id = Some(rule.id);

    if !results.is_empty() {
        let types: Vec<&str> = results.iter().map(|r| r.action_type.as_str()).collect();
        log.action_type = Some(types.join(","));
    }

    // A duplicate skip still names the operation that already exists
    let entity = results
        .iter()
        .find(|r| r.status == ExecutionStatus::Success && r.entity_id.is_some())
        .or_else(|| {
            results
                .iter()
                .find(|r| r.status == ExecutionStatus::Skipped && r.entity_id.is_some())
        });
    if let Some(created) = entity {
        log.entity_type = created.entity_type.clone();
        log.entity_id = created.entity_id.clone();
    }

    if status == ExecutionStatus::Error {
        let errors: Vec<&str> = results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Error)
            .filter_map(|r| r.error.as_deref())
            .collect();
        log.error_message = Some(errors.join("; "));
    }

    let reference = results.iter().find_map(|r| r.reference.as_deref());
    log.details = json!({
        "ruleName": rule.name,
        "reference": reference,
        "results": results,
    });
    if results.is_empty() {
        log.details["reason"] = json!("rule has no actions");
    }

    log
}

fn joined_action_types(rule: &AutomationRule) -> String {
    let types: Vec<&str> = rule.actions.iter().map(|a| a.type_tag()).collect();
    types.join(",")
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Per-message locks ───────────────────────────────────────────────

/// Keyed async mutexes; an entry lives only while someone holds or awaits it.
#[derive(Default)]
struct MessageLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl MessageLocks {
    async fn acquire(&self, key: &str) -> MessageGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        MessageGuard {
            locks: self,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct MessageGuard<'a> {
    locks: &'a MessageLocks,
    key: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for MessageGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Map entry plus ours: nobody else is waiting
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.key);
        }
    }
}

// ── Background loop ─────────────────────────────────────────────────

/// Stop signal for the background loop.
///
/// Triggering wakes an idle loop at once; a pass already running is allowed
/// to finish so no operation is left without its log entry.
#[derive(Debug, Default)]
pub struct DispatcherShutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl DispatcherShutdown {
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Spawn a background task that runs `process_all()` every `interval`.
///
/// The first pass runs immediately. A failed pass is logged and retried on
/// the next tick. Returns a `JoinHandle` and the shutdown signal; await the
/// handle after triggering instead of aborting it.
pub fn spawn_dispatcher(
    dispatcher: Arc<AutomationDispatcher>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<DispatcherShutdown>) {
    let shutdown = Arc::new(DispatcherShutdown::default());
    let shutdown_signal = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Automation dispatcher started");

        let mut tick = tokio::time::interval(interval);

        loop {
            if shutdown.is_triggered() {
                break;
            }

            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.notify.notified() => continue,
            }

            match dispatcher.process_all().await {
                Ok(summary) if summary.logged() > 0 => info!(
                    success = summary.success,
                    error = summary.error,
                    skipped = summary.skipped,
                    "Dispatch pass complete"
                ),
                Ok(_) => debug!("Dispatch pass found nothing to do"),
                Err(e) => error!("Dispatch pass failed, retrying next tick: {e}"),
            }
        }

        info!("Automation dispatcher shutting down");
    });

    (handle, shutdown_signal)
}
