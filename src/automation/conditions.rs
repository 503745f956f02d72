//! Condition evaluation against a single message.
//!
//! Matching is case-sensitive. Unknown fields, unsupported operators and
//! invalid regex patterns all evaluate to `false`.

use regex::Regex;
use tracing::debug;

use crate::automation::model::{Condition, ConditionField, ConditionOperator, InboundMessage};

impl Condition {
    /// Test this condition against `message`.
    pub fn evaluate(&self, message: &InboundMessage) -> bool {
        let Some(field_value) = field_value(&self.field, message) else {
            debug!(
                message_id = %message.id,
                field = self.field.as_str(),
                "Condition references unknown field"
            );
            return false;
        };

        match &self.operator {
            ConditionOperator::Contains => field_value.contains(self.value.as_str()),
            ConditionOperator::NotContains => !field_value.contains(self.value.as_str()),
            ConditionOperator::Equals => field_value == self.value,
            ConditionOperator::StartsWith => field_value.starts_with(self.value.as_str()),
            ConditionOperator::EndsWith => field_value.ends_with(self.value.as_str()),
            ConditionOperator::Regex => match Regex::new(&self.value) {
                Ok(re) => re.is_match(field_value),
                Err(e) => {
                    debug!(pattern = %self.value, error = %e, "Invalid condition regex");
                    false
                }
            },
            ConditionOperator::Unsupported(name) => {
                debug!(
                    message_id = %message.id,
                    operator = %name,
                    "Condition uses unsupported operator"
                );
                false
            }
        }
    }
}

/// Evaluate `condition` against `message`.
pub fn evaluate(condition: &Condition, message: &InboundMessage) -> bool {
    condition.evaluate(message)
}

fn field_value<'a>(field: &ConditionField, message: &'a InboundMessage) -> Option<&'a str> {
    match field {
        ConditionField::Subject => Some(message.subject.as_str()),
        ConditionField::FromEmail => Some(message.from_email.as_str()),
        ConditionField::FromName => Some(message.from_name.as_deref().unwrap_or("")),
        ConditionField::BodyText => Some(message.body_text.as_str()),
        ConditionField::GmailAccount => Some(message.account_id.as_str()),
        ConditionField::Unknown(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_message(subject: &str) -> InboundMessage {
        InboundMessage {
            id: "msg-1".into(),
            account_id: "ops@forwarder.com".into(),
            from_email: "bookings@navicargo.com".into(),
            from_name: Some("Navi Cargo".into()),
            subject: subject.into(),
            body_text: "Container MSKU1234567 loaded at Valencia".into(),
            received_at: Utc::now(),
        }
    }

    fn cond(field: ConditionField, operator: ConditionOperator, value: &str) -> Condition {
        Condition::new(field, operator, value)
    }

    #[test]
    fn subject_contains() {
        let msg = make_message("Shipment NAVI-4821 update");
        assert!(Condition::subject_contains("NAVI-").evaluate(&msg));
        assert!(!Condition::subject_contains("MAERSK-").evaluate(&msg));
    }

    #[test]
    fn contains_is_case_sensitive() {
        let msg = make_message("Shipment NAVI-4821 update");
        assert!(!Condition::subject_contains("navi-").evaluate(&msg));
    }

    #[test]
    fn from_email_and_body() {
        let msg = make_message("anything");
        assert!(
            cond(ConditionField::FromEmail, ConditionOperator::EndsWith, "@navicargo.com")
                .evaluate(&msg)
        );
        assert!(cond(ConditionField::BodyText, ConditionOperator::Contains, "MSKU").evaluate(&msg));
        assert!(
            cond(ConditionField::FromName, ConditionOperator::Equals, "Navi Cargo").evaluate(&msg)
        );
    }

    #[test]
    fn missing_from_name_reads_as_empty() {
        let mut msg = make_message("x");
        msg.from_name = None;
        assert!(cond(ConditionField::FromName, ConditionOperator::Equals, "").evaluate(&msg));
    }

    #[test]
    fn starts_with_and_not_contains() {
        let msg = make_message("RE: Booking confirmation");
        assert!(cond(ConditionField::Subject, ConditionOperator::StartsWith, "RE:").evaluate(&msg));
        assert!(
            cond(ConditionField::Subject, ConditionOperator::NotContains, "Invoice").evaluate(&msg)
        );
    }

    #[test]
    fn regex_operator() {
        let msg = make_message("Shipment NAVI-4821 update");
        assert!(
            cond(ConditionField::Subject, ConditionOperator::Regex, r"NAVI-\d{4}\b").evaluate(&msg)
        );
        assert!(!cond(ConditionField::Subject, ConditionOperator::Regex, r"^NAVI").evaluate(&msg));
    }

    #[test]
    fn invalid_regex_fails_closed() {
        let msg = make_message("Shipment NAVI-4821 update");
        assert!(!cond(ConditionField::Subject, ConditionOperator::Regex, "(unclosed").evaluate(&msg));
    }

    #[test]
    fn unknown_field_never_matches() {
        let msg = make_message("Shipment NAVI-4821 update");
        for op in [
            ConditionOperator::Contains,
            ConditionOperator::NotContains,
            ConditionOperator::Equals,
        ] {
            let c = cond(ConditionField::Unknown("attachmentName".into()), op, "");
            assert!(!evaluate(&c, &msg));
        }
    }

    #[test]
    fn unsupported_operator_never_matches() {
        let msg = make_message("Shipment NAVI-4821 update");
        let c = cond(
            ConditionField::Subject,
            ConditionOperator::Unsupported("soundsLike".into()),
            "NAVI",
        );
        assert!(!evaluate(&c, &msg));
    }

    #[test]
    fn account_field() {
        let msg = make_message("x");
        assert!(
            cond(ConditionField::GmailAccount, ConditionOperator::Equals, "ops@forwarder.com")
                .evaluate(&msg)
        );
    }
}
