//! Property differences and change set summaries

use crate::model::{ChangeSet, ProposedAction};
use crate::properties::Properties;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// A single differing property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDifference {
    pub key: String,
    /// Value on the recorded (or previous) side
    pub expected: Option<Value>,
    /// Value on the actual (or target) side
    pub actual: Option<Value>,
}

impl PropertyDifference {
    pub fn is_addition(&self) -> bool {
        self.expected.is_none() && self.actual.is_some()
    }

    pub fn is_removal(&self) -> bool {
        self.expected.is_some() && self.actual.is_none()
    }
}

/// Compare every key present on either side
pub fn compute_differences(expected: &Properties, actual: &Properties) -> Vec<PropertyDifference> {
    let keys: BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
    keys.into_iter()
        .filter(|key| expected.get(*key) != actual.get(*key))
        .map(|key| PropertyDifference {
            key: key.clone(),
            expected: expected.get(key).cloned(),
            actual: actual.get(key).cloned(),
        })
        .collect()
}

/// Compare only the keys of `expected`; extra keys on the actual side are ignored
pub fn compute_declared_differences(expected: &Properties, actual: &Properties) -> Vec<PropertyDifference> {
    expected
        .iter()
        .filter(|(key, value)| actual.get(*key) != Some(*value))
        .map(|(key, value)| PropertyDifference {
            key: key.clone(),
            expected: Some(value.clone()),
            actual: actual.get(key).cloned(),
        })
        .collect()
}

/// Change set summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub additions: usize,
    pub modifications: usize,
    pub replacements: usize,
    pub removals: usize,
}

impl DiffSummary {
    pub fn from_change_set(change_set: &ChangeSet) -> Self {
        let mut summary = Self::default();
        for op in &change_set.operations {
            match op.action {
                ProposedAction::Create => summary.additions += 1,
                ProposedAction::Update => summary.modifications += 1,
                ProposedAction::Replace => summary.replacements += 1,
                ProposedAction::Delete => summary.removals += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.additions + self.modifications + self.replacements + self.removals
    }

    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

/// Group proposed operations by resource type
pub fn group_by_type(change_set: &ChangeSet) -> HashMap<String, Vec<&str>> {
    let mut groups: HashMap<String, Vec<&str>> = HashMap::new();
    for op in &change_set.operations {
        groups
            .entry(op.resource_type.clone())
            .or_default()
            .push(&op.logical_id);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_differences_cover_both_sides() {
        let expected = props(json!({"a": 1, "b": 2}));
        let actual = props(json!({"b": 3, "c": 4}));
        let diffs = compute_differences(&expected, &actual);

        let keys: Vec<&str> = diffs.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert!(diffs[0].is_removal());
        assert!(diffs[2].is_addition());
    }

    #[test]
    fn test_declared_differences_ignore_extra_keys() {
        let expected = props(json!({"path": "/tmp/x", "mode": "644"}));
        let actual = props(json!({"path": "/tmp/x", "mode": "600", "size": 12}));
        let diffs = compute_declared_differences(&expected, &actual);

        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].key, "mode");
        assert_eq!(diffs[0].actual, Some(json!("600")));
    }
}
