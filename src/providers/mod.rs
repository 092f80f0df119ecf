//! Built-in native providers
//!
//! - `Local::File` - a file with declared content and mode
//! - `Local::Symlink` - a symlink at `target` pointing to `source`
//! - `Null::Resource` - no side effects; echoes its properties as outputs

pub mod file;
pub mod ledger;
pub mod null;
pub mod symlink;

pub use file::LocalFile;
pub use ledger::Ledger;
pub use null::NullResource;
pub use symlink::LocalSymlink;

use orchestrator::{Properties, ProviderError, ProviderRegistry};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Ledger namespace mapping idempotency tokens to physical ids
pub(crate) const TOKENS: &str = "tokens";

/// Registry with every built-in provider, sharing one ledger
pub fn builtin(ledger_dir: &Path) -> std::io::Result<ProviderRegistry> {
    let ledger = Arc::new(Ledger::open(ledger_dir)?);
    Ok(ProviderRegistry::new()
        .with(Arc::new(LocalFile::new(Arc::clone(&ledger))))
        .with(Arc::new(LocalSymlink::new(Arc::clone(&ledger))))
        .with(Arc::new(NullResource::new(ledger))))
}

/// A required string property
pub(crate) fn required_str<'a>(properties: &'a Properties, key: &str) -> Result<&'a str, ProviderError> {
    match properties.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(other) => Err(ProviderError::Rejected(format!(
            "property {key} must be a non-empty string, got {other}"
        ))),
        None => Err(ProviderError::Rejected(format!("missing required property {key}"))),
    }
}

/// A required path property, `~` expanded
pub(crate) fn required_path(properties: &Properties, key: &str) -> Result<PathBuf, ProviderError> {
    required_str(properties, key).map(crate::paths::expand)
}
