//! Core types for the automation engine.
//!
//! Conditions and actions are persisted as JSON in the shape the authoring UI
//! writes. Each is parsed into a closed enum with an explicit fallback
//! variant so unknown names survive a round-trip and evaluate as no-ops.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity type recorded on logs for created operations.
pub const ENTITY_OPERATION: &str = "operation";

// ── Module configuration ────────────────────────────────────────────

/// One activated automation module for one owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    pub id: Uuid,
    /// Tenant/user that owns the module.
    pub owner_id: String,
    /// Module key, e.g. `operations-from-email`.
    pub module: String,
    pub enabled: bool,
    pub selected_gmail_accounts: Vec<String>,
    pub default_employees: Vec<String>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationConfig {
    pub fn new(owner_id: impl Into<String>, module: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            module: module.into(),
            enabled: true,
            selected_gmail_accounts: Vec::new(),
            default_employees: Vec::new(),
            last_processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_accounts<I, S>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected_gmail_accounts = accounts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_employees<I, S>(mut self, employees: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_employees = employees.into_iter().map(Into::into).collect();
        self
    }

    /// Whether messages from `account_id` are in scope for this module.
    pub fn monitors(&self, account_id: &str) -> bool {
        self.selected_gmail_accounts.iter().any(|a| a == account_id)
    }
}

// ── Rules ───────────────────────────────────────────────────────────

/// A user-authored rule: all conditions must match, then every action runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: Uuid,
    pub config_id: Uuid,
    pub name: String,
    pub description: String,
    pub is_enabled: bool,
    /// Higher runs first.
    pub priority: i32,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRule {
    pub fn new(config_id: Uuid, name: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            config_id,
            name: name.into(),
            description: String::new(),
            is_enabled: true,
            priority,
            conditions: Vec::new(),
            actions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }
}

/// A `{field, operator, value}` test against one message attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field: ConditionField,
    pub operator: ConditionOperator,
    pub value: String,
}

impl Condition {
    pub fn new(field: ConditionField, operator: ConditionOperator, value: impl Into<String>) -> Self {
        Self {
            field,
            operator,
            value: value.into(),
        }
    }

    /// Shorthand for the `subject contains <value>` condition.
    pub fn subject_contains(value: impl Into<String>) -> Self {
        Self::new(ConditionField::Subject, ConditionOperator::Contains, value)
    }
}

/// Message attribute a condition reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionField {
    Subject,
    FromEmail,
    FromName,
    BodyText,
    GmailAccount,
    /// Field name this engine does not know. Never matches.
    Unknown(String),
}

impl ConditionField {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Subject => "subject",
            Self::FromEmail => "fromEmail",
            Self::FromName => "fromName",
            Self::BodyText => "bodyText",
            Self::GmailAccount => "gmailAccount",
            Self::Unknown(name) => name,
        }
    }
}

impl From<String> for ConditionField {
    fn from(s: String) -> Self {
        match s.as_str() {
            "subject" => Self::Subject,
            "fromEmail" | "from_email" => Self::FromEmail,
            "fromName" | "from_name" => Self::FromName,
            "bodyText" | "body_text" => Self::BodyText,
            "gmailAccount" | "gmail_account" => Self::GmailAccount,
            _ => Self::Unknown(s),
        }
    }
}

impl From<ConditionField> for String {
    fn from(field: ConditionField) -> Self {
        match field {
            ConditionField::Unknown(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

/// Comparison a condition applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionOperator {
    Contains,
    NotContains,
    Equals,
    StartsWith,
    EndsWith,
    Regex,
    /// Operator name this engine cannot evaluate. Never matches.
    Unsupported(String),
}

impl ConditionOperator {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Contains => "contains",
            Self::NotContains => "notContains",
            Self::Equals => "equals",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Regex => "regex",
            Self::Unsupported(name) => name,
        }
    }
}

impl From<String> for ConditionOperator {
    fn from(s: String) -> Self {
        match s.as_str() {
            "contains" => Self::Contains,
            "notContains" | "not_contains" => Self::NotContains,
            "equals" => Self::Equals,
            "startsWith" | "starts_with" => Self::StartsWith,
            "endsWith" | "ends_with" => Self::EndsWith,
            "regex" => Self::Regex,
            _ => Self::Unsupported(s),
        }
    }
}

impl From<ConditionOperator> for String {
    fn from(op: ConditionOperator) -> Self {
        match op {
            ConditionOperator::Unsupported(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

// ── Actions ─────────────────────────────────────────────────────────

/// Action type tag for [`Action::CreateOperation`].
pub const ACTION_CREATE_OPERATION: &str = "create_operation";

/// What a matched rule does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawAction", into = "RawAction")]
pub enum Action {
    CreateOperation(CreateOperationParams),
    /// Known type whose params failed to parse.
    Invalid {
        action_type: String,
        params: serde_json::Value,
        reason: String,
    },
    /// Type this engine does not execute.
    Unsupported {
        action_type: String,
        params: serde_json::Value,
    },
}

impl Action {
    pub fn create_operation(params: CreateOperationParams) -> Self {
        Self::CreateOperation(params)
    }

    /// The `type` tag as stored.
    pub fn type_tag(&self) -> &str {
        match self {
            Self::CreateOperation(_) => ACTION_CREATE_OPERATION,
            Self::Invalid { action_type, .. } | Self::Unsupported { action_type, .. } => {
                action_type
            }
        }
    }
}

/// Stored `{type, params}` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawAction {
    #[serde(rename = "type")]
    action_type: String,
    #[serde(default)]
    params: serde_json::Value,
}

impl From<RawAction> for Action {
    fn from(raw: RawAction) -> Self {
        let params = if raw.params.is_null() {
            serde_json::json!({})
        } else {
            raw.params
        };
        match raw.action_type.as_str() {
            ACTION_CREATE_OPERATION => {
                match serde_json::from_value::<CreateOperationParams>(params.clone()) {
                    Ok(p) => Action::CreateOperation(p),
                    Err(e) => Action::Invalid {
                        action_type: raw.action_type,
                        params,
                        reason: e.to_string(),
                    },
                }
            }
            _ => Action::Unsupported {
                action_type: raw.action_type,
                params,
            },
        }
    }
}

impl From<Action> for RawAction {
    fn from(action: Action) -> Self {
        match action {
            Action::CreateOperation(p) => RawAction {
                action_type: ACTION_CREATE_OPERATION.to_string(),
                params: serde_json::to_value(p).unwrap_or_default(),
            },
            Action::Invalid {
                action_type,
                params,
                ..
            }
            | Action::Unsupported {
                action_type,
                params,
            } => RawAction {
                action_type,
                params,
            },
        }
    }
}

/// Defaults applied to an automatically created operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateOperationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_mode: Option<String>,
    pub insurance: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_currency: Option<String>,
    /// Prefix of the external reference token in the subject (e.g. `NAVI-`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_pattern: Option<String>,
}

// ── Inbound message ─────────────────────────────────────────────────

/// One persisted Gmail message, as stored by the sync subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    /// Gmail account the message was synced from.
    pub account_id: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub subject: String,
    pub body_text: String,
    pub received_at: DateTime<Utc>,
}

// ── Execution results ───────────────────────────────────────────────

/// Outcome of an action, and of a dispatch as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Result of one action against one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    #[serde(rename = "type")]
    pub action_type: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Error text for `error`, reason for `skipped`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn success(
        action_type: impl Into<String>,
        entity_type: &str,
        entity_id: impl Into<String>,
        reference: Option<String>,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            status: ExecutionStatus::Success,
            entity_type: Some(entity_type.to_string()),
            entity_id: Some(entity_id.into()),
            reference,
            error: None,
        }
    }

    pub fn skipped(action_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            status: ExecutionStatus::Skipped,
            entity_type: None,
            entity_id: None,
            reference: None,
            error: Some(reason.into()),
        }
    }

    pub fn failed(action_type: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            action_type: action_type.into(),
            status: ExecutionStatus::Error,
            entity_type: None,
            entity_id: None,
            reference: None,
            error: Some(error.to_string()),
        }
    }
}

// ── Audit log ───────────────────────────────────────────────────────

/// Append-only record of one dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationLog {
    pub id: Uuid,
    pub config_id: Uuid,
    /// None when no rule matched.
    pub rule_id: Option<Uuid>,
    /// None when the message has since been deleted.
    pub message_id: Option<String>,
    pub action_type: Option<String>,
    pub status: ExecutionStatus,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub details: serde_json::Value,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AutomationLog {
    pub fn new(config_id: Uuid, message_id: Option<String>, status: ExecutionStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            config_id,
            rule_id: None,
            message_id,
            action_type: None,
            status,
            entity_type: None,
            entity_id: None,
            details: serde_json::json!({}),
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

/// Per-status log counts for one config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSummary {
    pub success: u64,
    pub error: u64,
    pub skipped: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl LogSummary {
    pub fn total(&self) -> u64 {
        self.success + self.error + self.skipped
    }
}

// ── Operations ──────────────────────────────────────────────────────

/// Operation creation request sent to the operation collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    pub title: String,
    pub contact_email: String,
    pub external_reference: Option<String>,
    pub source_message_id: String,
    pub config_id: Uuid,
    pub project_category: Option<String>,
    pub operation_type: Option<String>,
    pub shipping_mode: Option<String>,
    pub insurance: bool,
    pub project_currency: Option<String>,
    pub assigned_employees: Vec<String>,
    pub created_automatically: bool,
    pub requires_review: bool,
}

/// A stored operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub operation: NewOperation,
    pub created_at: DateTime<Utc>,
}
