//! Status condition bookkeeping

use serde_json::Value;

use crate::crd::{Condition, ConditionMapping};

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Insert or replace the condition of the same type.
/// The transition time is kept when the status did not change.
/// Returns whether anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            if *existing == condition {
                return false;
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

/// Mapped conditions carry a domain prefix, e.g. `example.com/Ready`
pub fn is_mapped_condition(condition: &Condition) -> bool {
    condition.type_.contains('/')
}

/// Copy current mapped conditions from `src` onto `dest`, stamped with `dest_generation`.
/// Returns whether `dest` changed.
pub fn map_conditions(
    src_generation: Option<i64>,
    src: &[Condition],
    dest_generation: Option<i64>,
    dest: &mut Vec<Condition>,
) -> bool {
    let mut changed = false;
    for condition in src {
        if condition.observed_generation != src_generation {
            // outdated
            continue;
        }
        if !is_mapped_condition(condition) {
            continue;
        }
        changed |= set_condition(
            dest,
            Condition {
                observed_generation: dest_generation,
                ..condition.clone()
            },
        );
    }
    changed
}

pub fn delete_mapped_conditions(conditions: &mut Vec<Condition>) -> bool {
    let before = conditions.len();
    conditions.retain(|c| !is_mapped_condition(c));
    conditions.len() != before
}

/// Build the destination condition for a mapping from a live object's
/// `.status.conditions[]`, if the source condition is present and current.
pub fn condition_from_object(
    live: &Value,
    mapping: &ConditionMapping,
    generation: Option<i64>,
) -> Option<Condition> {
    let object_generation = live.pointer("/metadata/generation").and_then(Value::as_i64);
    let source = live
        .pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(mapping.source_type.as_str()))?;

    if let Some(observed) = source.get("observedGeneration").and_then(Value::as_i64) {
        if Some(observed) != object_generation {
            return None;
        }
    }

    let field = |name: &str| {
        source
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some(Condition {
        type_: mapping.destination_type.clone(),
        status: field("status"),
        last_transition_time: chrono::Utc::now().to_rfc3339(),
        reason: field("reason"),
        message: field("message"),
        observed_generation: generation,
    })
}
