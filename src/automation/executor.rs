//! Action execution.
//!
//! Every action runs independently and reports its own [`ActionResult`]; a
//! failing action never stops its siblings. Operations are created through
//! the [`OperationSink`] collaborator, after checking that no automated
//! operation already exists for the same message or external reference.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::automation::model::{
    ACTION_CREATE_OPERATION, Action, ActionResult, AutomationConfig, CreateOperationParams,
    ENTITY_OPERATION, InboundMessage, NewOperation, OperationRecord,
};
use crate::error::{ActionError, DatabaseError};

/// Create API of the operation collection.
#[async_trait]
pub trait OperationSink: Send + Sync {
    /// Find an operation created automatically for `config_id` that is
    /// linked to `message_id` or carries `reference` as its external reference.
    /// Operations of other configs never count.
    async fn find_automated_operation(
        &self,
        config_id: Uuid,
        message_id: &str,
        reference: Option<&str>,
    ) -> Result<Option<OperationRecord>, DatabaseError>;

    /// Insert a new operation.
    async fn create_operation(
        &self,
        operation: &NewOperation,
    ) -> Result<OperationRecord, DatabaseError>;
}

/// Runs a matched rule's actions against a message.
pub struct ActionExecutor {
    operations: Arc<dyn OperationSink>,
}

impl ActionExecutor {
    pub fn new(operations: Arc<dyn OperationSink>) -> Self {
        Self { operations }
    }

    /// Execute `actions` in order, one result per action.
    pub async fn execute(
        &self,
        actions: &[Action],
        message: &InboundMessage,
        config: &AutomationConfig,
    ) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());

        for action in actions {
            let result = match action {
                Action::CreateOperation(params) => {
                    match self.create_operation(params, message, config).await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(
                                message_id = %message.id,
                                config_id = %config.id,
                                error = %e,
                                "create_operation failed"
                            );
                            ActionResult::failed(action.type_tag(), e)
                        }
                    }
                }
                Action::Invalid {
                    action_type,
                    reason,
                    ..
                } => ActionResult::failed(
                    action_type,
                    ActionError::InvalidParams {
                        action_type: action_type.clone(),
                        reason: reason.clone(),
                    },
                ),
                Action::Unsupported { action_type, .. } => {
                    debug!(action_type = %action_type, "Skipping unsupported action");
                    ActionResult::skipped(
                        action_type,
                        format!("unsupported action type '{action_type}'"),
                    )
                }
            };
            results.push(result);
        }

        results
    }

    async fn create_operation(
        &self,
        params: &CreateOperationParams,
        message: &InboundMessage,
        config: &AutomationConfig,
    ) -> Result<ActionResult, ActionError> {
        let reference = match params.id_pattern.as_deref() {
            Some(pattern) => Some(extract_reference(&message.subject, pattern)?),
            None => None,
        };

        let existing = self
            .operations
            .find_automated_operation(config.id, &message.id, reference.as_deref())
            .await
            .map_err(|e| ActionError::DuplicateCheck(e.to_string()))?;

        if let Some(existing) = existing {
            info!(
                message_id = %message.id,
                operation_id = %existing.id,
                reference = ?reference,
                "Operation already exists, skipping"
            );
            let mut result = ActionResult::skipped(
                ACTION_CREATE_OPERATION,
                format!("operation {} already exists for this message", existing.id),
            );
            result.entity_type = Some(ENTITY_OPERATION.to_string());
            result.entity_id = Some(existing.id.to_string());
            result.reference = reference;
            return Ok(result);
        }

        let operation = build_operation(params, message, config, reference.clone());
        let record = self
            .operations
            .create_operation(&operation)
            .await
            .map_err(|e| ActionError::CreateRejected(e.to_string()))?;

        info!(
            message_id = %message.id,
            operation_id = %record.id,
            reference = ?reference,
            "Operation created from email"
        );

        Ok(ActionResult::success(
            ACTION_CREATE_OPERATION,
            ENTITY_OPERATION,
            record.id.to_string(),
            reference,
        ))
    }
}

/// Extract the external reference token from `subject`.
///
/// The token is the first occurrence of `pattern` followed by at least one
/// ASCII alphanumeric character, e.g. `NAVI-4821` in `Shipment NAVI-4821 update`.
pub fn extract_reference(subject: &str, pattern: &str) -> Result<String, ActionError> {
    if pattern.is_empty() {
        return Err(ActionError::InvalidParams {
            action_type: ACTION_CREATE_OPERATION.to_string(),
            reason: "idPattern is empty".to_string(),
        });
    }

    for (start, _) in subject.match_indices(pattern) {
        let rest = &subject[start + pattern.len()..];
        let suffix_len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric())
            .count();
        if suffix_len > 0 {
            return Ok(subject[start..start + pattern.len() + suffix_len].to_string());
        }
    }

    Err(ActionError::NoPatternMatch {
        pattern: pattern.to_string(),
    })
}

fn build_operation(
    params: &CreateOperationParams,
    message: &InboundMessage,
    config: &AutomationConfig,
    reference: Option<String>,
) -> NewOperation {
    NewOperation {
        title: message.subject.clone(),
        contact_email: message.from_email.clone(),
        external_reference: reference,
        source_message_id: message.id.clone(),
        config_id: config.id,
        project_category: params.project_category.clone(),
        operation_type: params.operation_type.clone(),
        shipping_mode: params.shipping_mode.clone(),
        insurance: params.insurance,
        project_currency: params.project_currency.clone(),
        assigned_employees: config.default_employees.clone(),
        created_automatically: true,
        requires_review: true,
    }
}
