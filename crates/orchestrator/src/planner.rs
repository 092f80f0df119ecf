//! Change set planner - diffs a stack against a target template
//!
//! Planning is pure: it reads the current stack and the providers'
//! replacement rules and produces a [`ChangeSet`]. Nothing is journaled and
//! no provider is called.

use crate::error::{Result, TemplateError};
use crate::graph::{ResourceGraph, ResourceNode};
use crate::model::{ChangeSet, ProposedAction, ProposedOperation, ResourceRecord, Stack};
use crate::properties::{collect_references, Properties, Reference};
use crate::provider::ProviderRegistry;
use crate::resolver;
use crate::template::Template;
use crate::types::ProviderKind;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

/// Build the change set that takes `stack` (or nothing) to `template`
pub fn plan(
    stack_id: &str,
    stack: Option<&Stack>,
    template: &Template,
    providers: &ProviderRegistry,
) -> Result<ChangeSet> {
    let graph = ResourceGraph::build(template)?;
    let batches = graph.batches()?;

    for node in graph.nodes().values() {
        if node.provider == ProviderKind::Native && !providers.contains(&node.resource_type) {
            return Err(TemplateError::UnknownResourceType {
                logical_id: node.logical_id.clone(),
                resource_type: node.resource_type.clone(),
            }
            .into());
        }
    }

    let empty = BTreeMap::new();
    let current = stack.map_or(&empty, |s| &s.resources);

    let mut operations = Vec::new();
    let mut replaced: BTreeSet<String> = BTreeSet::new();

    for (batch, ids) in batches.iter().enumerate() {
        for id in ids {
            let Some(node) = graph.get(id) else {
                continue;
            };
            let proposed = match current.get(id) {
                None => Some((ProposedAction::Create, "new resource".to_string())),
                Some(record) => classify(record, node, providers, &replaced),
            };

            if let Some((action, reason)) = proposed {
                if action == ProposedAction::Replace {
                    replaced.insert(id.clone());
                }
                let record = current.get(id);
                operations.push(ProposedOperation {
                    action,
                    logical_id: id.clone(),
                    resource_type: node.resource_type.clone(),
                    previous: record.map(|r| r.properties.clone()),
                    target: Some(node.properties.clone()),
                    physical_id: record.and_then(|r| r.physical_id.clone()),
                    batch,
                    reason,
                });
            }
        }
    }

    let removed: Vec<&ResourceRecord> = current
        .values()
        .filter(|r| graph.get(&r.logical_id).is_none())
        .collect();
    if !removed.is_empty() {
        let deps: BTreeMap<String, BTreeSet<String>> = current
            .values()
            .map(|r| (r.logical_id.clone(), r.depends_on.clone()))
            .collect();
        let teardown = resolver::reverse(&resolver::resolve(&deps)?);
        let position: BTreeMap<&str, usize> = teardown
            .iter()
            .enumerate()
            .flat_map(|(i, batch)| batch.iter().map(move |id| (id.as_str(), i)))
            .collect();

        for record in removed {
            operations.push(ProposedOperation {
                action: ProposedAction::Delete,
                logical_id: record.logical_id.clone(),
                resource_type: record.resource_type.clone(),
                previous: Some(record.properties.clone()),
                target: None,
                physical_id: record.physical_id.clone(),
                batch: position.get(record.logical_id.as_str()).copied().unwrap_or(0),
                reason: "removed from template".to_string(),
            });
        }
    }

    let change_set = ChangeSet {
        id: uuid::Uuid::new_v4().to_string(),
        stack_id: stack_id.to_string(),
        created_at: Utc::now(),
        base_version: stack.map_or(0, |s| s.version),
        template_hash: graph.content_hash(),
        operations,
        template: template.clone(),
        batches,
    };
    log::info!(
        "planned change set {} for stack {stack_id}: {} operation(s)",
        change_set.id,
        change_set.operations.len()
    );
    Ok(change_set)
}

/// Decide what an existing resource needs, if anything
fn classify(
    record: &ResourceRecord,
    node: &ResourceNode,
    providers: &ProviderRegistry,
    replaced: &BTreeSet<String>,
) -> Option<(ProposedAction, String)> {
    if record.resource_type != node.resource_type {
        return Some((
            ProposedAction::Replace,
            format!("type changed from {} to {}", record.resource_type, node.resource_type),
        ));
    }
    if record.provider != node.provider {
        return Some((ProposedAction::Replace, "provider kind changed".to_string()));
    }
    if record.service_token != node.service_token {
        return Some((ProposedAction::Replace, "service token changed".to_string()));
    }

    let rewired: BTreeSet<String> = node
        .properties
        .references()
        .iter()
        .map(|r| r.target().to_string())
        .filter(|target| replaced.contains(target))
        .collect();

    if node.provider == ProviderKind::Native {
        if let Some(provider) = providers.get(&node.resource_type) {
            let new = node.properties.resolved();
            if record.properties != node.properties
                && provider.requires_replacement(&record.properties.resolved(), &new)
            {
                return Some((
                    ProposedAction::Replace,
                    "replacement property changed".to_string(),
                ));
            }
            // The physical id behind a replacement property is about to change
            if let Some((key, target)) = replacement_key_rewired(provider.replacement_properties(), &new, &rewired) {
                return Some((
                    ProposedAction::Replace,
                    format!("{key} refers to replacement of {target}"),
                ));
            }
        }
    }

    if record.properties != node.properties {
        return Some((ProposedAction::Update, "properties changed".to_string()));
    }

    // Unchanged, but a referenced resource gets a new physical id
    if rewired.is_empty() {
        None
    } else {
        Some((
            ProposedAction::Update,
            format!(
                "rewired to replacement of {}",
                rewired.into_iter().collect::<Vec<_>>().join(", ")
            ),
        ))
    }
}

/// First replacement property whose value refers to a replaced resource
fn replacement_key_rewired(
    keys: &[&str],
    properties: &Properties,
    rewired: &BTreeSet<String>,
) -> Option<(String, String)> {
    if rewired.is_empty() {
        return None;
    }
    keys.iter().find_map(|key| {
        let value = properties.get(*key)?;
        let mut references = BTreeSet::new();
        collect_references(value, &mut references);
        references
            .iter()
            .map(Reference::target)
            .find(|target| rewired.contains(*target))
            .map(|target| ((*key).to_string(), target.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::graph::ResourceGraph;
    use crate::model::ResourceRecord;
    use crate::template::ResourceDeclaration;
    use crate::testing::ScriptedProvider;
    use crate::types::{ResourceStatus, StackStatus};
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new().with(Arc::new(ScriptedProvider::new("Test::Thing").replacing(&["zone"])))
    }

    /// A stack as if `template` had been applied
    fn deployed(template: &Template) -> Stack {
        let graph = ResourceGraph::build(template).unwrap();
        let mut stack = Stack::new("prod");
        for node in graph.nodes().values() {
            let mut record = ResourceRecord::from_node(node);
            record.physical_id = Some(format!("phys-{}", node.logical_id));
            record.status = ResourceStatus::Complete;
            stack.resources.insert(node.logical_id.clone(), record);
        }
        stack.settle(StackStatus::CreateComplete, None);
        stack
    }

    fn thing(id: &str) -> ResourceDeclaration {
        ResourceDeclaration::new(id, "Test::Thing")
    }

    #[test]
    fn test_new_stack_creates_everything_in_batch_order() {
        let template = Template::new(vec![
            thing("C").depends_on("A"),
            thing("A"),
            thing("B").property("a", json!({"Ref": "A"})),
        ]);
        let cs = plan("prod", None, &template, &registry()).unwrap();

        let order: Vec<(&str, usize)> = cs
            .operations
            .iter()
            .map(|op| (op.logical_id.as_str(), op.batch))
            .collect();
        assert_eq!(order, vec![("A", 0), ("B", 1), ("C", 1)]);
        assert_eq!(cs.count(ProposedAction::Create), 3);
        assert_eq!(cs.base_version, 0);
    }

    #[test]
    fn test_unchanged_template_is_empty_plan() {
        let template = Template::new(vec![thing("A"), thing("B").depends_on("A")]);
        let stack = deployed(&template);
        let cs = plan("prod", Some(&stack), &template, &registry()).unwrap();
        assert!(cs.is_empty());
        assert_eq!(cs.base_version, 1);
    }

    #[test]
    fn test_update_vs_replace_follows_provider() {
        let before = Template::new(vec![
            thing("A").property("zone", json!("a")),
            thing("B").property("size", json!(1)),
        ]);
        let stack = deployed(&before);

        let after = Template::new(vec![
            thing("A").property("zone", json!("b")),
            thing("B").property("size", json!(2)),
        ]);
        let cs = plan("prod", Some(&stack), &after, &registry()).unwrap();

        assert_eq!(cs.get("A").unwrap().action, ProposedAction::Replace);
        assert_eq!(cs.get("A").unwrap().physical_id.as_deref(), Some("phys-A"));
        assert_eq!(cs.get("B").unwrap().action, ProposedAction::Update);
    }

    #[test]
    fn test_type_change_is_replacement() {
        let stack = deployed(&Template::new(vec![thing("A")]));
        let registry = registry().with(Arc::new(ScriptedProvider::new("Test::Other")));
        let after = Template::new(vec![ResourceDeclaration::new("A", "Test::Other")]);

        let cs = plan("prod", Some(&stack), &after, &registry).unwrap();
        let op = cs.get("A").unwrap();
        assert_eq!(op.action, ProposedAction::Replace);
        assert!(op.reason.contains("type changed"));
    }

    #[test]
    fn test_dependents_of_replacement_are_rewired() {
        let before = Template::new(vec![
            thing("A").property("zone", json!("a")),
            thing("B").property("parent", json!({"Ref": "A"})),
            thing("C").depends_on("A"),
        ]);
        let stack = deployed(&before);
        let after = Template::new(vec![
            thing("A").property("zone", json!("b")),
            thing("B").property("parent", json!({"Ref": "A"})),
            thing("C").depends_on("A"),
        ]);

        let cs = plan("prod", Some(&stack), &after, &registry()).unwrap();
        assert_eq!(cs.get("A").unwrap().action, ProposedAction::Replace);
        let b = cs.get("B").unwrap();
        assert_eq!(b.action, ProposedAction::Update);
        assert_eq!(b.reason, "rewired to replacement of A");
        // dependsOn alone does not consume the physical id
        assert!(cs.get("C").is_none());
    }

    #[test]
    fn test_reference_in_replacement_property_carries_replacement() {
        let registry = registry().with(Arc::new(ScriptedProvider::new("Test::Child").replacing(&["parent"])));
        let child = |id: &str, parent: &str| {
            ResourceDeclaration::new(id, "Test::Child").property("parent", json!({"Ref": parent}))
        };
        let template = |zone: &str| {
            Template::new(vec![
                thing("A").property("zone", json!(zone)),
                child("B", "A"),
                child("C", "B"),
                thing("D").property("label", json!({"Ref": "A"})),
            ])
        };
        let stack = deployed(&template("a"));

        let cs = plan("prod", Some(&stack), &template("b"), &registry).unwrap();
        assert_eq!(cs.get("A").unwrap().action, ProposedAction::Replace);
        let b = cs.get("B").unwrap();
        assert_eq!(b.action, ProposedAction::Replace);
        assert_eq!(b.reason, "parent refers to replacement of A");
        assert_eq!(b.physical_id.as_deref(), Some("phys-B"));
        assert_eq!(cs.get("C").unwrap().action, ProposedAction::Replace);
        // label is not a replacement property
        assert_eq!(cs.get("D").unwrap().action, ProposedAction::Update);
    }

    #[test]
    fn test_removed_resources_delete_dependents_first() {
        let before = Template::new(vec![
            thing("A"),
            thing("B").depends_on("A"),
            thing("Keep"),
        ]);
        let stack = deployed(&before);
        let cs = plan("prod", Some(&stack), &Template::new(vec![thing("Keep")]), &registry()).unwrap();

        let a = cs.get("A").unwrap();
        let b = cs.get("B").unwrap();
        assert_eq!(a.action, ProposedAction::Delete);
        assert!(b.batch < a.batch);
    }

    #[test]
    fn test_unknown_native_type_rejected() {
        let template = Template::new(vec![ResourceDeclaration::new("X", "Nope::Thing")]);
        let err = plan("prod", None, &template, &registry()).unwrap_err();
        assert!(matches!(
            err,
            Error::Template(TemplateError::UnknownResourceType { ref resource_type, .. }) if resource_type == "Nope::Thing"
        ));
    }

    #[test]
    fn test_duplicate_id_yields_no_change_set() {
        let template = Template::new(vec![thing("A"), thing("A")]);
        let err = plan("prod", None, &template, &registry()).unwrap_err();
        assert!(matches!(err, Error::Template(TemplateError::DuplicateLogicalId(ref id)) if id == "A"));
    }

    #[test]
    fn test_cycle_rejected() {
        let template = Template::new(vec![thing("A").depends_on("B"), thing("B").depends_on("A")]);
        let err = plan("prod", None, &template, &registry()).unwrap_err();
        assert_eq!(err.to_string(), "template error: cyclic dependency: A -> B -> A");
    }

    #[test]
    fn test_custom_resources_skip_registry() {
        let template = Template::new(vec![
            ResourceDeclaration::new("Hook", "Custom::Notify").service_token("http://hooks"),
        ]);
        let cs = plan("prod", None, &template, &ProviderRegistry::new()).unwrap();
        assert_eq!(cs.count(ProposedAction::Create), 1);
    }
}
