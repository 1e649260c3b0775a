//! Availability probes evaluated against live objects

use std::collections::BTreeMap;

use serde_json::Value;

use crate::crd::{ObjectSetProbe, Probe};
use crate::store::{selector, ObjectKind};

/// Resolve a dotted path such as `.status.replicas` or `.spec.containers.0.image`
pub fn field_at<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    path.trim_start_matches('.')
        .split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(obj, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Whether a probe binding covers the object
fn applies_to(binding: &ObjectSetProbe, obj: &Value) -> bool {
    let api_version = obj.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
    let kind = obj.get("kind").and_then(Value::as_str).unwrap_or_default();
    let object_kind = ObjectKind::from_api_version(api_version, kind);
    if !object_kind.is_group_kind(&binding.selector.kind.group, &binding.selector.kind.kind) {
        return false;
    }

    match &binding.selector.selector {
        Some(label_selector) => {
            let labels: BTreeMap<String, String> = obj
                .pointer("/metadata/labels")
                .cloned()
                .and_then(|l| serde_json::from_value(l).ok())
                .unwrap_or_default();
            selector::matches(label_selector, &labels)
        }
        None => true,
    }
}

fn check(probe: &Probe, obj: &Value) -> Result<(), String> {
    match probe {
        Probe::Condition { type_, status } => {
            let condition = obj
                .pointer("/status/conditions")
                .and_then(Value::as_array)
                .and_then(|conditions| {
                    conditions
                        .iter()
                        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_.as_str()))
                })
                .ok_or_else(|| format!("missing condition {}", type_))?;

            if let Some(observed) = condition.get("observedGeneration").and_then(Value::as_i64) {
                let generation = obj.pointer("/metadata/generation").and_then(Value::as_i64);
                if Some(observed) != generation {
                    return Err(format!("condition {} is outdated", type_));
                }
            }
            let actual = condition.get("status").and_then(Value::as_str).unwrap_or_default();
            if actual != status {
                return Err(format!("condition {} == {}, expected {}", type_, actual, status));
            }
            Ok(())
        }
        Probe::FieldsEqual { field_a, field_b } => {
            let a = field_at(obj, field_a).ok_or_else(|| format!("{} is missing", field_a))?;
            let b = field_at(obj, field_b).ok_or_else(|| format!("{} is missing", field_b))?;
            if a != b {
                return Err(format!("{} ({}) != {} ({})", field_a, a, field_b, b));
            }
            Ok(())
        }
        Probe::FieldValue { field_path, value } => {
            let actual = field_at(obj, field_path).ok_or_else(|| format!("{} is missing", field_path))?;
            if actual != value {
                return Err(format!("{} == {}, expected {}", field_path, actual, value));
            }
            Ok(())
        }
        Probe::Exists { field_path } => field_at(obj, field_path)
            .map(|_| ())
            .ok_or_else(|| format!("{} is missing", field_path)),
    }
}

/// Run every applicable probe against the live object.
/// Returns one message per failed probe, empty when the object is available.
pub fn evaluate(bindings: &[ObjectSetProbe], obj: &Value) -> Vec<String> {
    bindings
        .iter()
        .filter(|binding| applies_to(binding, obj))
        .flat_map(|binding| binding.probes.iter())
        .filter_map(|probe| check(probe, obj).err())
        .collect()
}
