//! Local::Symlink - a symlink at `target` pointing to `source`
//!
//! `target` forces replacement; a new `source` re-points the link in place.

use orchestrator::{CreateRequest, Properties, ProviderError, Provisioned, ResourceProvider};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::ledger::{Ledger, io_error};
use super::{TOKENS, required_path};

pub struct LocalSymlink {
    ledger: Arc<Ledger>,
}

#[derive(Debug)]
enum LinkState {
    Missing,
    Points(PathBuf),
    NotALink,
}

impl LocalSymlink {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    fn state(target: &Path) -> Result<LinkState, ProviderError> {
        match fs::symlink_metadata(target) {
            Ok(m) if m.file_type().is_symlink() => fs::read_link(target)
                .map(LinkState::Points)
                .map_err(|e| io_error(target, &e)),
            Ok(_) => Ok(LinkState::NotALink),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LinkState::Missing),
            Err(e) => Err(io_error(target, &e)),
        }
    }

    fn link(source: &Path, target: &Path) -> Result<(), ProviderError> {
        if !source.exists() {
            return Err(ProviderError::Rejected(format!(
                "source does not exist: {}",
                source.display()
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, &e))?;
        }
        if let LinkState::Points(_) = Self::state(target)? {
            fs::remove_file(target).map_err(|e| io_error(target, &e))?;
        }

        #[cfg(unix)]
        std::os::unix::fs::symlink(source, target).map_err(|e| io_error(target, &e))?;

        #[cfg(windows)]
        {
            use std::os::windows::fs::{symlink_dir, symlink_file};
            let made = if source.is_dir() {
                symlink_dir(source, target)
            } else {
                symlink_file(source, target)
            };
            made.map_err(|e| io_error(target, &e))?;
        }

        log::debug!("linked {} -> {}", target.display(), source.display());
        Ok(())
    }

    fn outputs(source: &Path, target: &Path) -> Properties {
        [
            ("Target".to_string(), Value::String(target.display().to_string())),
            ("Source".to_string(), Value::String(source.display().to_string())),
        ]
        .into_iter()
        .collect()
    }
}

impl ResourceProvider for LocalSymlink {
    fn resource_type(&self) -> &str {
        "Local::Symlink"
    }

    fn replacement_properties(&self) -> &[&str] {
        &["target"]
    }

    fn create(&self, request: &CreateRequest) -> Result<Provisioned, ProviderError> {
        let source = required_path(&request.properties, "source")?;
        let target = required_path(&request.properties, "target")?;
        let physical_id = target.display().to_string();

        match Self::state(&target)? {
            LinkState::Missing => {}
            LinkState::Points(existing) if existing == source => {
                let ours = self
                    .ledger
                    .get::<String>(TOKENS, &request.idempotency_token)?
                    .is_some_and(|id| id == physical_id);
                if !ours {
                    return Err(ProviderError::Rejected(format!("{physical_id} already exists")));
                }
            }
            LinkState::Points(_) | LinkState::NotALink => {
                return Err(ProviderError::Rejected(format!("{physical_id} already exists")));
            }
        }

        self.ledger.put(TOKENS, &request.idempotency_token, &physical_id)?;
        if !matches!(Self::state(&target)?, LinkState::Points(_)) {
            Self::link(&source, &target)?;
        }
        Ok(Provisioned {
            outputs: Self::outputs(&source, &target),
            physical_id,
        })
    }

    fn update(&self, physical_id: &str, _old: &Properties, new: &Properties) -> Result<Properties, ProviderError> {
        let target = Path::new(physical_id);
        let source = required_path(new, "source")?;
        match Self::state(target)? {
            LinkState::Missing => Err(ProviderError::NotFound(physical_id.to_string())),
            LinkState::NotALink => Err(ProviderError::Rejected(format!("{physical_id} is no longer a symlink"))),
            LinkState::Points(existing) if existing == source => Ok(Self::outputs(&source, target)),
            LinkState::Points(_) => {
                Self::link(&source, target)?;
                Ok(Self::outputs(&source, target))
            }
        }
    }

    fn delete(&self, physical_id: &str) -> Result<(), ProviderError> {
        let target = Path::new(physical_id);
        match Self::state(target)? {
            LinkState::Missing => Err(ProviderError::NotFound(physical_id.to_string())),
            LinkState::NotALink => Err(ProviderError::Rejected(format!(
                "refusing to remove {physical_id}: not a symlink"
            ))),
            LinkState::Points(_) => fs::remove_file(target).map_err(|e| io_error(target, &e)),
        }
    }

    fn read(&self, physical_id: &str) -> Result<Option<Properties>, ProviderError> {
        let mut properties = Properties::new();
        properties.insert("target".to_string(), Value::String(physical_id.to_string()));
        match Self::state(Path::new(physical_id))? {
            LinkState::Missing => Ok(None),
            LinkState::NotALink => Ok(Some(properties)),
            LinkState::Points(source) => {
                properties.insert("source".to_string(), Value::String(source.display().to_string()));
                Ok(Some(properties))
            }
        }
    }

    fn find_by_token(&self, token: &str) -> Result<Option<Provisioned>, ProviderError> {
        let Some(physical_id) = self.ledger.get::<String>(TOKENS, token)? else {
            return Ok(None);
        };
        let target = PathBuf::from(&physical_id);
        match Self::state(&target)? {
            LinkState::Points(source) => Ok(Some(Provisioned {
                outputs: Self::outputs(&source, &target),
                physical_id,
            })),
            _ => Ok(None),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        links: LocalSymlink,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            fs::write(tmp.path().join("a.conf"), "a").unwrap();
            fs::write(tmp.path().join("b.conf"), "b").unwrap();
            let links = LocalSymlink::new(Arc::new(Ledger::open(&tmp.path().join("ledger")).unwrap()));
            Self { tmp, links }
        }

        fn props(&self, source: &str) -> Properties {
            serde_json::from_value(json!({
                "source": self.tmp.path().join(source).display().to_string(),
                "target": self.tmp.path().join("links").join("app.conf").display().to_string(),
            }))
            .unwrap()
        }

        fn request(&self, source: &str, token: &str) -> CreateRequest {
            CreateRequest {
                logical_id: "Link".to_string(),
                resource_type: "Local::Symlink".to_string(),
                properties: self.props(source),
                idempotency_token: token.to_string(),
            }
        }
    }

    #[test]
    fn test_link_lifecycle() {
        let fx = Fixture::new();
        let created = fx.links.create(&fx.request("a.conf", "tok")).unwrap();
        let target = PathBuf::from(&created.physical_id);
        assert_eq!(fs::read_to_string(&target).unwrap(), "a");

        // Retried create with the same token
        assert_eq!(fx.links.create(&fx.request("a.conf", "tok")).unwrap(), created);
        assert!(fx.links.create(&fx.request("a.conf", "other")).is_err());

        fx.links
            .update(&created.physical_id, &fx.props("a.conf"), &fx.props("b.conf"))
            .unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "b");
        let read = fx.links.read(&created.physical_id).unwrap().unwrap();
        assert_eq!(read["source"], fx.props("b.conf")["source"]);

        fx.links.delete(&created.physical_id).unwrap();
        assert_eq!(fx.links.read(&created.physical_id).unwrap(), None);
        assert_eq!(fx.links.find_by_token("tok").unwrap(), None);
        assert!(fs::metadata(fx.tmp.path().join("b.conf")).is_ok());
    }

    #[test]
    fn test_refuses_regular_file() {
        let fx = Fixture::new();
        let target = fx.tmp.path().join("links").join("app.conf");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "mine").unwrap();

        assert!(matches!(
            fx.links.create(&fx.request("a.conf", "tok")).unwrap_err(),
            ProviderError::Rejected(_)
        ));
        assert!(fx.links.delete(&target.display().to_string()).is_err());
        assert_eq!(fs::read_to_string(&target).unwrap(), "mine");
    }

    #[test]
    fn test_missing_source() {
        let fx = Fixture::new();
        let err = fx.links.create(&fx.request("nope.conf", "tok")).unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }
}
