use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::Document;

/// Marker a record can carry to accumulate a group as a list of objects
/// rather than merging the objects key by key.
pub const AS_LIST_OF_DICT: &str = "__aslistofdict__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Objects merge recursively, lists append, scalars: last writer wins.
    #[default]
    Overwrite,
    /// Objects merge recursively, lists union, conflicting scalars become lists.
    MergeStruct,
}

/// Per attribute group merge strategies of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePolicy {
    strategies: BTreeMap<String, MergeStrategy>,
}

impl MergePolicy {
    pub fn new(strategies: BTreeMap<String, MergeStrategy>) -> Self {
        Self { strategies }
    }

    pub fn strategy_for(&self, group: &str) -> MergeStrategy {
        self.strategies.get(group).copied().unwrap_or_default()
    }
}

/// Folds `incoming` attribute groups into `target`. Groups with distinct
/// names end up as siblings.
pub fn merge_document(target: &mut Document, mut incoming: Document, policy: &MergePolicy) {
    let list_groups = take_list_markers(&mut incoming);
    for (group, value) in incoming {
        if list_groups.contains(&group) {
            append_as_list(target, group, value);
            continue;
        }
        match target.get_mut(&group) {
            Some(existing) => match policy.strategy_for(&group) {
                MergeStrategy::Overwrite => deep_merge(existing, value),
                MergeStrategy::MergeStruct => merge_struct(existing, value),
            },
            None => {
                target.insert(group, value);
            }
        }
    }
}

fn take_list_markers(document: &mut Document) -> BTreeSet<String> {
    match document.remove(AS_LIST_OF_DICT) {
        Some(Value::String(group)) => BTreeSet::from([group]),
        Some(Value::Array(groups)) => groups
            .into_iter()
            .filter_map(|group| group.as_str().map(str::to_string))
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn append_as_list(target: &mut Document, group: String, value: Value) {
    let merged = match target.remove(&group) {
        None => value,
        Some(Value::Array(mut items)) => {
            match value {
                Value::Array(more) => items.extend(more),
                single => items.push(single),
            }
            Value::Array(items)
        }
        Some(existing) => match value {
            Value::Array(more) => {
                let mut items = vec![existing];
                items.extend(more);
                Value::Array(items)
            }
            single => Value::Array(vec![existing, single]),
        },
    };
    target.insert(group, merged);
}

fn deep_merge(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(more)) => {
            for (key, value) in more {
                match current.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        current.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(current), Value::Array(more)) => current.extend(more),
        (slot, value) => *slot = value,
    }
}

fn merge_struct(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(more)) => {
            for (key, value) in more {
                match current.get_mut(&key) {
                    Some(slot) => merge_struct(slot, value),
                    None => {
                        current.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(current), Value::Array(more)) => {
            for value in more {
                push_unique(current, value);
            }
        }
        (Value::Array(current), value) => push_unique(current, value),
        (slot, Value::Array(more)) => {
            let mut items = vec![slot.take()];
            for value in more {
                push_unique(&mut items, value);
            }
            *slot = Value::Array(items);
        }
        (slot, value) => {
            if *slot != value {
                *slot = Value::Array(vec![slot.take(), value]);
            }
        }
    }
}

fn push_unique(items: &mut Vec<Value>, value: Value) {
    if !items.contains(&value) {
        items.push(value);
    }
}
