/// Trigger condition matching
///
/// A template subscribes to one or more trigger names; its `TriggerConfig` narrows
/// which firings actually start an instance (channel filters, keywords, status
/// targets, amount thresholds, and free-form AND/OR conditions over the trigger
/// variables).

use crate::workflow::types::TriggerType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-template filters evaluated against a fired trigger's variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerConfig {
    /// Allowed `channelType` values (case-insensitive); empty means any
    pub channel_types: Vec<String>,
    /// Required `websiteId`
    pub website_id: Option<String>,
    /// MESSAGE_WITH_KEYWORDS: any of these in `messageContent`
    pub keywords: Vec<String>,
    /// LEAD_STATUS_CHANGED: required `newStatus`
    pub to_status: Option<String>,
    /// DEAL_STAGE_CHANGED: required `newStageId`
    pub to_stage_id: Option<String>,
    /// Threshold triggers: compared against `amount` (or `total`)
    pub amount: Option<f64>,
    pub operator: Option<ThresholdOperator>,
    /// Extra conditions folded left to right
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOperator {
    GreaterThan,
    LessThan,
    Equals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

/// `{ field, operator, value, logic }`; `field` may be a dotted path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
    #[serde(default)]
    pub logic: ConditionLogic,
}

/// Decide whether a firing of `trigger` with `variables` should start a template configured with `config`
pub fn matches(trigger: TriggerType, config: &TriggerConfig, variables: &Map<String, Value>) -> bool {
    let data = Value::Object(variables.clone());

    if !config.channel_types.is_empty() {
        match lookup_str(&data, "channelType") {
            Some(channel) => {
                let allowed = config
                    .channel_types
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(&channel));
                if !allowed {
                    return false;
                }
            }
            // Message triggers need a channel to be filtered on
            None if trigger.is_message_trigger() => return false,
            None => {}
        }
    }

    if let Some(website_id) = &config.website_id {
        if lookup_str(&data, "websiteId").as_deref() != Some(website_id.as_str()) {
            return false;
        }
    }

    let base = match trigger {
        TriggerType::MessageWithKeywords => {
            check_keywords(lookup_str(&data, "messageContent").as_deref(), &config.keywords)
        }
        TriggerType::LeadStatusChanged => config
            .to_status
            .as_ref()
            .map_or(true, |s| lookup_str(&data, "newStatus").as_deref() == Some(s.as_str())),
        TriggerType::DealStageChanged => config
            .to_stage_id
            .as_ref()
            .map_or(true, |s| lookup_str(&data, "newStageId").as_deref() == Some(s.as_str())),
        t if t.is_threshold_trigger() => {
            let observed = lookup(&data, "amount")
                .or_else(|| lookup(&data, "total"))
                .and_then(|v| as_number(&v))
                .unwrap_or(0.0);
            check_threshold(observed, config.amount.unwrap_or(0.0), config.operator)
        }
        _ => true,
    };

    if !base {
        return false;
    }

    evaluate_conditions(&config.conditions, &data)
}

/// Whether `conditions` hold over `variables`; an empty list always holds
pub fn conditions_hold(conditions: &[Condition], variables: &Map<String, Value>) -> bool {
    if conditions.is_empty() {
        return true;
    }
    evaluate_conditions(conditions, &Value::Object(variables.clone()))
}

fn check_keywords(content: Option<&str>, keywords: &[String]) -> bool {
    let Some(content) = content else {
        return false;
    };
    if keywords.is_empty() {
        return false;
    }
    let content = content.to_lowercase();
    keywords.iter().any(|k| content.contains(&k.to_lowercase()))
}

fn check_threshold(amount: f64, threshold: f64, operator: Option<ThresholdOperator>) -> bool {
    match operator {
        Some(ThresholdOperator::GreaterThan) => amount > threshold,
        Some(ThresholdOperator::LessThan) => amount < threshold,
        Some(ThresholdOperator::Equals) => amount == threshold,
        None => amount >= threshold,
    }
}

fn evaluate_conditions(conditions: &[Condition], data: &Value) -> bool {
    let mut iter = conditions.iter();
    let Some(first) = iter.next() else {
        return true;
    };

    let mut result = evaluate_condition(first, data);
    for condition in iter {
        let current = evaluate_condition(condition, data);
        result = match condition.logic {
            ConditionLogic::And => result && current,
            ConditionLogic::Or => result || current,
        };
    }
    result
}

fn evaluate_condition(condition: &Condition, data: &Value) -> bool {
    let field = lookup(data, &condition.field);
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Equals => field.map_or(false, |v| loosely_equal(&v, expected)),
        ConditionOperator::NotEquals => !field.map_or(false, |v| loosely_equal(&v, expected)),
        ConditionOperator::GreaterThan => compare_numbers(field, expected, |a, b| a > b),
        ConditionOperator::LessThan => compare_numbers(field, expected, |a, b| a < b),
        ConditionOperator::Contains => field.map_or(false, |v| {
            as_text(&v).to_lowercase().contains(&as_text(expected).to_lowercase())
        }),
    }
}

fn compare_numbers(field: Option<Value>, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (field.as_ref().and_then(as_number), as_number(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Numbers compare numerically (so "5" equals 5); everything else by text
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => as_text(a) == as_text(b),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Top-level key first, then a JSONPath lookup for dotted fields
fn lookup(data: &Value, field: &str) -> Option<Value> {
    if let Some(v) = data.get(field) {
        return Some(v.clone());
    }
    if !field.contains('.') {
        return None;
    }
    let path = format!("$.{}", field);
    jsonpath_lib::select(data, &path)
        .ok()
        .and_then(|found| found.first().map(|v| (*v).clone()))
}

fn lookup_str(data: &Value, field: &str) -> Option<String> {
    lookup(data, field).map(|v| as_text(&v))
}
