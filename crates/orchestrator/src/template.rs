//! Template declarations
//!
//! A template is an already-structured list of resource declarations plus
//! optional stack outputs. Parsing of any richer template syntax happens
//! before this point.

use crate::error::TemplateError;
use crate::properties::{Properties, PropertyBag, PropertyOverride};
use crate::types::ProviderKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Type prefix that marks a custom resource
pub const CUSTOM_TYPE_PREFIX: &str = "Custom::";

/// A single resource declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDeclaration {
    pub logical_id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<PropertyOverride>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_token: Option<String>,
}

impl ResourceDeclaration {
    pub fn new(logical_id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            resource_type: resource_type.into(),
            properties: Properties::new(),
            overrides: Vec::new(),
            depends_on: Vec::new(),
            provider: None,
            service_token: None,
        }
    }

    #[must_use]
    pub fn property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn depends_on(mut self, logical_id: &str) -> Self {
        self.depends_on.push(logical_id.to_string());
        self
    }

    #[must_use]
    pub fn service_token(mut self, token: &str) -> Self {
        self.service_token = Some(token.to_string());
        self
    }

    /// Explicit provider, or custom for `Custom::*` types
    pub fn provider_kind(&self) -> ProviderKind {
        match self.provider {
            Some(kind) => kind,
            None if self.resource_type.starts_with(CUSTOM_TYPE_PREFIX) => ProviderKind::Custom,
            None => ProviderKind::Native,
        }
    }

    pub fn bag(&self) -> PropertyBag {
        PropertyBag {
            properties: self.properties.clone(),
            overrides: self.overrides.clone(),
        }
    }
}

/// A full template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

impl Template {
    pub fn new(resources: Vec<ResourceDeclaration>) -> Self {
        Self {
            resources,
            outputs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn output(mut self, name: &str, value: Value) -> Self {
        self.outputs.insert(name.to_string(), value);
        self
    }

    /// Parse a JSON template
    pub fn from_json(content: &str) -> Result<Self, TemplateError> {
        serde_json::from_str(content).map_err(|e| TemplateError::Invalid(e.to_string()))
    }

    /// Interpret an already-parsed document (JSON, or TOML converted to JSON)
    pub fn from_value(value: Value) -> Result<Self, TemplateError> {
        serde_json::from_value(value).map_err(|e| TemplateError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_template() {
        let template = Template::from_json(
            r#"{
                "resources": [
                    {"logicalId": "Dir", "type": "Local::File", "properties": {"path": "/tmp/x"}},
                    {"logicalId": "Hook", "type": "Custom::Notify", "serviceToken": "http://hooks",
                     "dependsOn": ["Dir"],
                     "overrides": [{"op": "remove", "path": "debug"}]}
                ],
                "outputs": {"DirPath": {"Ref": "Dir"}}
            }"#,
        )
        .unwrap();

        assert_eq!(template.resources.len(), 2);
        assert_eq!(template.resources[0].provider_kind(), ProviderKind::Native);
        assert_eq!(template.resources[1].provider_kind(), ProviderKind::Custom);
        assert_eq!(template.resources[1].depends_on, vec!["Dir"]);
        assert_eq!(template.outputs["DirPath"], json!({"Ref": "Dir"}));
    }

    #[test]
    fn test_explicit_provider_wins() {
        let mut decl = ResourceDeclaration::new("Hook", "Acme::Thing");
        decl.provider = Some(ProviderKind::Custom);
        assert_eq!(decl.provider_kind(), ProviderKind::Custom);
    }

    #[test]
    fn test_malformed_template_is_invalid() {
        let err = Template::from_json(r#"{"resources": [{"type": "X"}]}"#).unwrap_err();
        assert!(matches!(err, TemplateError::Invalid(_)));
    }
}
