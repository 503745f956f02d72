//! Rule selection.
//!
//! Only enabled rules are considered. A rule matches when every condition
//! matches; a rule with no conditions matches everything. Among matching
//! rules the highest priority wins, ties going to the earliest rule in input
//! order.

use tracing::debug;

use crate::automation::model::{AutomationRule, InboundMessage};

impl AutomationRule {
    /// True if this rule is enabled and all of its conditions match.
    pub fn matches(&self, message: &InboundMessage) -> bool {
        self.is_enabled && self.conditions.iter().all(|c| c.evaluate(message))
    }
}

/// Pick the rule that applies to `message`, if any.
pub fn select_rule<'a>(
    rules: &'a [AutomationRule],
    message: &InboundMessage,
) -> Option<&'a AutomationRule> {
    let mut selected: Option<&AutomationRule> = None;

    for rule in rules {
        if !rule.matches(message) {
            continue;
        }
        match selected {
            // Strictly greater keeps the earlier rule on ties
            Some(best) if rule.priority <= best.priority => {}
            _ => selected = Some(rule),
        }
    }

    match selected {
        Some(rule) => debug!(
            message_id = %message.id,
            rule_id = %rule.id,
            rule = %rule.name,
            priority = rule.priority,
            "Rule selected"
        ),
        None => debug!(message_id = %message.id, "No rule matched"),
    }

    selected
}
