//! Resource graph construction
//!
//! Turns template declarations into nodes with explicit dependency sets.
//! Every `Ref`, `Fn::GetAtt` and `dependsOn` entry becomes an edge.

use crate::error::TemplateError;
use crate::properties::{collect_references, canonicalize, PropertyBag};
use crate::resolver;
use crate::template::Template;
use crate::types::ProviderKind;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A declared resource with its dependencies resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceNode {
    pub logical_id: String,
    pub resource_type: String,
    pub provider: ProviderKind,
    pub service_token: Option<String>,
    pub properties: PropertyBag,
    pub depends_on: BTreeSet<String>,
}

/// "`from` after `to`"
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
}

/// Validated resource graph
#[derive(Debug, Clone, Serialize)]
pub struct ResourceGraph {
    nodes: BTreeMap<String, ResourceNode>,
    outputs: BTreeMap<String, Value>,
}

impl ResourceGraph {
    /// Build and validate a graph from a template.
    ///
    /// Fails on duplicate logical ids, references to undeclared ids and
    /// custom resources without a service token. Cycles are reported by
    /// [`ResourceGraph::batches`].
    pub fn build(template: &Template) -> Result<Self, TemplateError> {
        let mut nodes = BTreeMap::new();

        for decl in &template.resources {
            if decl.logical_id.is_empty() {
                return Err(TemplateError::Invalid(format!(
                    "resource of type {} has an empty logical id",
                    decl.resource_type
                )));
            }
            if nodes.contains_key(&decl.logical_id) {
                return Err(TemplateError::DuplicateLogicalId(decl.logical_id.clone()));
            }

            let provider = decl.provider_kind();
            let service_token = decl.service_token.clone().filter(|t| !t.is_empty());
            if provider == ProviderKind::Custom && service_token.is_none() {
                return Err(TemplateError::MissingServiceToken(decl.logical_id.clone()));
            }

            let properties = decl.bag();
            let mut depends_on: BTreeSet<String> = decl.depends_on.iter().cloned().collect();
            depends_on.extend(properties.references().iter().map(|r| r.target().to_string()));

            nodes.insert(
                decl.logical_id.clone(),
                ResourceNode {
                    logical_id: decl.logical_id.clone(),
                    resource_type: decl.resource_type.clone(),
                    provider,
                    service_token,
                    properties,
                    depends_on,
                },
            );
        }

        for node in nodes.values() {
            if let Some(target) = node.depends_on.iter().find(|t| !nodes.contains_key(*t)) {
                return Err(TemplateError::UnresolvedReference {
                    from: node.logical_id.clone(),
                    target: target.clone(),
                });
            }
        }

        for (name, value) in &template.outputs {
            let mut refs = BTreeSet::new();
            collect_references(value, &mut refs);
            if let Some(missing) = refs.iter().find(|r| !nodes.contains_key(r.target())) {
                return Err(TemplateError::UnresolvedReference {
                    from: format!("output {name}"),
                    target: missing.target().to_string(),
                });
            }
        }

        log::debug!("built resource graph with {} nodes", nodes.len());
        Ok(Self {
            nodes,
            outputs: template.outputs.clone(),
        })
    }

    pub fn get(&self, logical_id: &str) -> Option<&ResourceNode> {
        self.nodes.get(logical_id)
    }

    pub fn nodes(&self) -> &BTreeMap<String, ResourceNode> {
        &self.nodes
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether any node goes through the custom provider gateway
    pub fn has_custom(&self) -> bool {
        self.nodes.values().any(|n| n.provider == ProviderKind::Custom)
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.nodes
            .values()
            .flat_map(|node| {
                node.depends_on.iter().map(|to| DependencyEdge {
                    from: node.logical_id.clone(),
                    to: to.clone(),
                })
            })
            .collect()
    }

    pub fn dependency_map(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.depends_on.clone()))
            .collect()
    }

    /// Provisioning batches in dependency order
    pub fn batches(&self) -> Result<Vec<Vec<String>>, TemplateError> {
        resolver::resolve(&self.dependency_map())
    }

    /// BLAKE3 hash over the canonical JSON form of the graph
    pub fn content_hash(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        let canonical = canonicalize(&value).to_string();
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::ResourceDeclaration;
    use serde_json::json;

    fn fan_out() -> Template {
        Template::new(vec![
            ResourceDeclaration::new("A", "Test::Thing"),
            ResourceDeclaration::new("B", "Test::Thing").property("parent", json!({"Ref": "A"})),
            ResourceDeclaration::new("C", "Test::Thing").depends_on("A"),
        ])
    }

    #[test]
    fn test_edges_from_refs_and_depends_on() {
        let graph = ResourceGraph::build(&fan_out()).unwrap();
        assert_eq!(
            graph.edges(),
            vec![
                DependencyEdge {
                    from: "B".into(),
                    to: "A".into()
                },
                DependencyEdge {
                    from: "C".into(),
                    to: "A".into()
                },
            ]
        );
        assert_eq!(graph.batches().unwrap(), vec![vec!["A"], vec!["B", "C"]]);
    }

    #[test]
    fn test_duplicate_logical_id() {
        let template = Template::new(vec![
            ResourceDeclaration::new("A", "Test::Thing"),
            ResourceDeclaration::new("A", "Test::Other"),
        ]);
        assert_eq!(
            ResourceGraph::build(&template).unwrap_err(),
            TemplateError::DuplicateLogicalId("A".into())
        );
    }

    #[test]
    fn test_unresolved_reference() {
        let template = Template::new(vec![
            ResourceDeclaration::new("A", "Test::Thing")
                .property("x", json!({"Fn::GetAtt": ["Ghost", "Arn"]})),
        ]);
        assert_eq!(
            ResourceGraph::build(&template).unwrap_err(),
            TemplateError::UnresolvedReference {
                from: "A".into(),
                target: "Ghost".into()
            }
        );
    }

    #[test]
    fn test_output_reference_must_resolve() {
        let template = Template::new(vec![ResourceDeclaration::new("A", "Test::Thing")])
            .output("Url", json!({"Fn::GetAtt": ["B", "Url"]}));
        assert!(matches!(
            ResourceGraph::build(&template).unwrap_err(),
            TemplateError::UnresolvedReference { target, .. } if target == "B"
        ));
    }

    #[test]
    fn test_custom_resource_needs_service_token() {
        let template = Template::new(vec![ResourceDeclaration::new("Hook", "Custom::Notify")]);
        assert_eq!(
            ResourceGraph::build(&template).unwrap_err(),
            TemplateError::MissingServiceToken("Hook".into())
        );

        let template = Template::new(vec![
            ResourceDeclaration::new("Hook", "Custom::Notify").service_token("http://hooks"),
        ]);
        let graph = ResourceGraph::build(&template).unwrap();
        assert!(graph.has_custom());
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = ResourceGraph::build(&fan_out()).unwrap();
        let b = ResourceGraph::build(&fan_out()).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let changed = Template::new(vec![
            ResourceDeclaration::new("A", "Test::Thing").property("size", json!(2)),
        ]);
        let c = ResourceGraph::build(&changed).unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_cycle_surfaces_from_batches() {
        let template = Template::new(vec![
            ResourceDeclaration::new("A", "Test::Thing").depends_on("B"),
            ResourceDeclaration::new("B", "Test::Thing").property("a", json!({"Ref": "A"})),
        ]);
        let graph = ResourceGraph::build(&template).unwrap();
        assert!(matches!(
            graph.batches().unwrap_err(),
            TemplateError::CyclicDependency { .. }
        ));
    }
}
