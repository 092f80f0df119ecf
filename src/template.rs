//! Template files: JSON, or TOML with the same shape.

use anyhow::{Context, Result};
use orchestrator::{Template, TemplateError};
use std::fs;
use std::path::Path;

/// Load a template, choosing the format by extension
pub fn load(path: &Path) -> Result<Template> {
    let content = fs::read_to_string(path).with_context(|| format!("Could not read template {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

    parse(&content, is_toml)
        .map_err(orchestrator::Error::from)
        .with_context(|| format!("Invalid template {}", path.display()))
}

fn parse(content: &str, is_toml: bool) -> std::result::Result<Template, TemplateError> {
    if is_toml {
        let value: serde_json::Value =
            toml::from_str(content).map_err(|e| TemplateError::Invalid(e.to_string()))?;
        Template::from_value(value)
    } else {
        Template::from_json(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::ErrorCategory;
    use tempfile::TempDir;

    #[test]
    fn test_toml_and_json_agree() {
        let json = parse(
            r#"{"resources": [
                {"logicalId": "Marker", "type": "Null::Resource", "properties": {"name": "a"}},
                {"logicalId": "Motd", "type": "Local::File",
                 "properties": {"path": "/tmp/motd", "content": {"Fn::GetAtt": ["Marker", "name"]}}}
            ]}"#,
            false,
        )
        .unwrap();
        let toml = parse(
            r#"
            [[resources]]
            logicalId = "Marker"
            type = "Null::Resource"
            properties = { name = "a" }

            [[resources]]
            logicalId = "Motd"
            type = "Local::File"
            properties = { path = "/tmp/motd", content = { "Fn::GetAtt" = ["Marker", "name"] } }
            "#,
            true,
        )
        .unwrap();
        assert_eq!(json, toml);
    }

    #[test]
    fn test_invalid_template_is_a_template_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stack.json");
        fs::write(&path, r#"{"resources": [{"type": "Null::Resource"}]}"#).unwrap();

        let err = load(&path).unwrap_err();
        let engine_err = err.downcast_ref::<orchestrator::Error>().unwrap();
        assert_eq!(engine_err.category(), ErrorCategory::Template);
    }
}
