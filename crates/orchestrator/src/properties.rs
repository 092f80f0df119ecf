//! Property bags, raw overrides and symbolic references
//!
//! A bag is a typed map plus a list of overrides addressing dotted paths.
//! Overrides are applied when the bag is resolved. References inside values
//! (`{"Ref": "X"}`, `{"Fn::GetAtt": ["X", "attr"]}`) are substituted just
//! before a resource is dispatched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Resolved property map handed to providers
pub type Properties = BTreeMap<String, Value>;

const REF_KEY: &str = "Ref";
const GET_ATT_KEY: &str = "Fn::GetAtt";

/// Escape-hatch edit applied on top of the declared properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PropertyOverride {
    /// Set the value at a dotted path, creating intermediate objects
    Set { path: String, value: Value },
    /// Remove the value at a dotted path if present
    Remove { path: String },
}

impl PropertyOverride {
    fn apply(&self, properties: &mut Properties) {
        match self {
            Self::Set { path, value } => set_path(properties, path, value.clone()),
            Self::Remove { path } => remove_path(properties, path),
        }
    }
}

/// Declared properties plus overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyBag {
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<PropertyOverride>,
}

impl PropertyBag {
    pub fn new(properties: Properties) -> Self {
        Self {
            properties,
            overrides: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_override(mut self, edit: PropertyOverride) -> Self {
        self.overrides.push(edit);
        self
    }

    /// Properties with every override applied in declaration order
    pub fn resolved(&self) -> Properties {
        let mut properties = self.properties.clone();
        for edit in &self.overrides {
            edit.apply(&mut properties);
        }
        properties
    }

    /// References appearing anywhere in the resolved properties
    pub fn references(&self) -> BTreeSet<Reference> {
        let mut refs = BTreeSet::new();
        for value in self.resolved().values() {
            collect_references(value, &mut refs);
        }
        refs
    }
}

fn set_path(properties: &mut Properties, path: &str, value: Value) {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return;
    };
    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() {
        properties.insert(first.to_string(), value);
        return;
    }

    let mut current = properties
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    for segment in rest.iter().take(rest.len() - 1) {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let (Value::Object(map), Some(leaf)) = (current, rest.last()) {
        map.insert((*leaf).to_string(), value);
    }
}

fn remove_path(properties: &mut Properties, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };
    let Some((first, inner)) = parents.split_first() else {
        properties.remove(*leaf);
        return;
    };

    let mut current = properties.get_mut(*first);
    for segment in inner {
        current = match current {
            Some(Value::Object(map)) => map.get_mut(*segment),
            _ => None,
        };
    }
    if let Some(Value::Object(map)) = current {
        map.remove(*leaf);
    }
}

/// A symbolic reference to another resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reference {
    /// The physical id of a resource
    Ref(String),
    /// An output attribute of a resource
    GetAtt { target: String, attribute: String },
}

impl Reference {
    /// Logical id this reference points at
    pub fn target(&self) -> &str {
        match self {
            Self::Ref(target) | Self::GetAtt { target, .. } => target,
        }
    }

    /// Recognise a reference object
    pub fn parse(value: &Value) -> Option<Self> {
        let Value::Object(map) = value else {
            return None;
        };
        if map.len() != 1 {
            return None;
        }
        if let Some(Value::String(target)) = map.get(REF_KEY) {
            return Some(Self::Ref(target.clone()));
        }
        match map.get(GET_ATT_KEY) {
            Some(Value::Array(parts)) => match parts.as_slice() {
                [Value::String(target), Value::String(attribute)] => Some(Self::GetAtt {
                    target: target.clone(),
                    attribute: attribute.clone(),
                }),
                _ => None,
            },
            Some(Value::String(dotted)) => {
                let (target, attribute) = dotted.split_once('.')?;
                Some(Self::GetAtt {
                    target: target.to_string(),
                    attribute: attribute.to_string(),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ref(target) => write!(f, "Ref({target})"),
            Self::GetAtt { target, attribute } => write!(f, "GetAtt({target}.{attribute})"),
        }
    }
}

/// Collect every reference found in a value tree
pub fn collect_references(value: &Value, out: &mut BTreeSet<Reference>) {
    if let Some(reference) = Reference::parse(value) {
        out.insert(reference);
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_references(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_references(item, out)),
        _ => {}
    }
}

/// Replace references in a value tree using `lookup`.
///
/// Returns the first reference `lookup` cannot satisfy.
pub fn substitute<F>(value: &Value, lookup: &F) -> Result<Value, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    if let Some(reference) = Reference::parse(value) {
        return lookup(&reference).ok_or(reference);
    }
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), substitute(item, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Substitute references in every property
pub fn substitute_properties<F>(properties: &Properties, lookup: &F) -> Result<Properties, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    properties
        .iter()
        .map(|(key, value)| Ok((key.clone(), substitute(value, lookup)?)))
        .collect()
}

/// Rebuild a value with object keys in sorted order
pub(crate) fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (key, item) in sorted {
                out.insert(key.clone(), item);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
