//! Local::File - a file with declared content
//!
//! Properties: `path` (replacement), `content`, `mode` (octal string, unix).
//! Physical id is the expanded path. Outputs: `Path`, `Hash` (BLAKE3 of the
//! content), `Size`.

use orchestrator::{CreateRequest, Properties, ProviderError, Provisioned, ResourceProvider};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use super::ledger::{Ledger, io_error};
use super::{TOKENS, required_path};

pub struct LocalFile {
    ledger: Arc<Ledger>,
}

impl LocalFile {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    fn content(properties: &Properties) -> Result<&str, ProviderError> {
        match properties.get("content") {
            None | Some(Value::Null) => Ok(""),
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(ProviderError::Rejected(format!("content must be a string, got {other}"))),
        }
    }

    fn mode(properties: &Properties) -> Result<Option<u32>, ProviderError> {
        match properties.get("mode") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => u32::from_str_radix(s.trim_start_matches("0o"), 8)
                .map(Some)
                .map_err(|_| ProviderError::Rejected(format!("mode {s} is not an octal permission string"))),
            Some(other) => Err(ProviderError::Rejected(format!("mode must be a string, got {other}"))),
        }
    }

    fn write(path: &Path, properties: &Properties) -> Result<Properties, ProviderError> {
        let content = Self::content(properties)?;
        let mode = Self::mode(properties)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, &e))?;
        }
        fs::write(path, content).map_err(|e| io_error(path, &e))?;
        set_mode(path, mode)?;
        log::debug!("wrote {} ({} bytes)", path.display(), content.len());
        Ok(outputs(path, content.as_bytes()))
    }
}

fn outputs(path: &Path, content: &[u8]) -> Properties {
    [
        ("Path".to_string(), Value::String(path.display().to_string())),
        (
            "Hash".to_string(),
            Value::String(blake3::hash(content).to_hex().to_string()),
        ),
        ("Size".to_string(), Value::from(content.len() as u64)),
    ]
    .into_iter()
    .collect()
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> Result<(), ProviderError> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_error(path, &e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, mode: Option<u32>) -> Result<(), ProviderError> {
    if mode.is_some() {
        log::warn!("file mode is ignored on this platform");
    }
    Ok(())
}

#[cfg(unix)]
fn read_mode(metadata: &fs::Metadata) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;
    Some(format!("{:04o}", metadata.permissions().mode() & 0o7777))
}

#[cfg(not(unix))]
fn read_mode(_metadata: &fs::Metadata) -> Option<String> {
    None
}

impl ResourceProvider for LocalFile {
    fn resource_type(&self) -> &str {
        "Local::File"
    }

    fn replacement_properties(&self) -> &[&str] {
        &["path"]
    }

    fn create(&self, request: &CreateRequest) -> Result<Provisioned, ProviderError> {
        let path = required_path(&request.properties, "path")?;
        let physical_id = path.display().to_string();

        let ours = self
            .ledger
            .get::<String>(TOKENS, &request.idempotency_token)?
            .is_some_and(|id| id == physical_id);
        if path.exists() && !ours {
            return Err(ProviderError::Rejected(format!("{physical_id} already exists")));
        }

        // Claim the path before touching it so a crash mid-write is found again
        self.ledger.put(TOKENS, &request.idempotency_token, &physical_id)?;
        let outputs = Self::write(&path, &request.properties)?;
        Ok(Provisioned { physical_id, outputs })
    }

    fn update(&self, physical_id: &str, _old: &Properties, new: &Properties) -> Result<Properties, ProviderError> {
        let path = Path::new(physical_id);
        if !path.exists() {
            return Err(ProviderError::NotFound(physical_id.to_string()));
        }
        Self::write(path, new)
    }

    fn delete(&self, physical_id: &str) -> Result<(), ProviderError> {
        let path = Path::new(physical_id);
        fs::remove_file(path).map_err(|e| io_error(path, &e))?;
        log::debug!("removed {physical_id}");
        Ok(())
    }

    fn read(&self, physical_id: &str) -> Result<Option<Properties>, ProviderError> {
        let path = Path::new(physical_id);
        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(path, &e)),
        };
        if !metadata.is_file() {
            return Ok(Some(
                [("path".to_string(), Value::String(physical_id.to_string()))]
                    .into_iter()
                    .collect(),
            ));
        }

        let content = fs::read(path).map_err(|e| io_error(path, &e))?;
        let mut properties = Properties::new();
        properties.insert("path".to_string(), Value::String(physical_id.to_string()));
        properties.insert(
            "content".to_string(),
            Value::String(String::from_utf8_lossy(&content).into_owned()),
        );
        if let Some(mode) = read_mode(&metadata) {
            properties.insert("mode".to_string(), Value::String(mode));
        }
        Ok(Some(properties))
    }

    fn find_by_token(&self, token: &str) -> Result<Option<Provisioned>, ProviderError> {
        let Some(physical_id) = self.ledger.get::<String>(TOKENS, token)? else {
            return Ok(None);
        };
        let path = Path::new(&physical_id);
        match fs::read(path) {
            Ok(content) => Ok(Some(Provisioned {
                outputs: outputs(path, &content),
                physical_id,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, &e)),
        }
    }
}
