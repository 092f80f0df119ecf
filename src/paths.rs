//! Path resolution for strata
//!
//! # Environment Variables
//!
//! - `STRATA_CONFIG_DIR` - Override config directory
//! - `STRATA_STATE_DIR` - Override state directory (holds `strata.db`)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `STRATA_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/strata` (if set)
//! 3. Platform default:
//!    - Windows: `%APPDATA%\strata`
//!    - macOS/Linux: `~/.config/strata`
//!
//! For state_dir():
//! 1. `STRATA_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/strata` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\strata`
//!    - macOS/Linux: `~/.local/state/strata`

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "STRATA_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "STRATA_STATE_DIR";

const APP: &str = "strata";

/// Database file inside the state directory
pub const DATABASE_FILE: &str = "strata.db";

/// Get the strata config directory path
pub fn config_dir() -> Result<PathBuf> {
    let platform = {
        #[cfg(windows)]
        {
            dirs::config_dir().map(|p| p.join(APP))
        }
        #[cfg(not(windows))]
        {
            dirs::home_dir().map(|h| h.join(".config").join(APP))
        }
    };
    let path = resolve(
        std::env::var(ENV_CONFIG_DIR).ok(),
        std::env::var("XDG_CONFIG_HOME").ok(),
        platform,
    )
    .context("Could not determine config directory")?;
    log::debug!("Using config dir: {}", path.display());
    Ok(path)
}

/// Get the strata state directory path
pub fn state_dir() -> Result<PathBuf> {
    let platform = {
        #[cfg(windows)]
        {
            dirs::data_local_dir().map(|p| p.join(APP))
        }
        #[cfg(not(windows))]
        {
            dirs::home_dir().map(|h| h.join(".local").join("state").join(APP))
        }
    };
    let path = resolve(
        std::env::var(ENV_STATE_DIR).ok(),
        std::env::var("XDG_STATE_HOME").ok(),
        platform,
    )
    .context("Could not determine state directory")?;
    log::debug!("Using state dir: {}", path.display());
    Ok(path)
}

/// Default database location
pub fn database_path() -> Result<PathBuf> {
    Ok(state_dir()?.join(DATABASE_FILE))
}

/// Apply the override → XDG → platform priority
fn resolve(overridden: Option<String>, xdg: Option<String>, platform: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(dir) = overridden.filter(|d| !d.is_empty()) {
        return Some(expand(&dir));
    }
    if let Some(xdg) = xdg.filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(xdg).join(APP));
    }
    platform
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_wins() {
        let path = resolve(
            Some("/custom/state".to_string()),
            Some("/xdg".to_string()),
            Some(PathBuf::from("/home/me/.local/state/strata")),
        );
        assert_eq!(path, Some(PathBuf::from("/custom/state")));
    }

    #[test]
    fn test_override_with_tilde() {
        let home = dirs::home_dir().unwrap();
        let path = resolve(Some("~/infra/strata".to_string()), None, None);
        assert_eq!(path, Some(home.join("infra").join("strata")));
    }

    #[test]
    fn test_xdg_before_platform() {
        let path = resolve(None, Some("/tmp/xdg-state".to_string()), Some(PathBuf::from("/fallback")));
        assert_eq!(path, Some(PathBuf::from("/tmp/xdg-state/strata")));
    }

    #[test]
    fn test_empty_values_fall_through() {
        let path = resolve(Some(String::new()), Some(String::new()), Some(PathBuf::from("/fallback")));
        assert_eq!(path, Some(PathBuf::from("/fallback")));
    }

    #[test]
    fn test_expand_absolute() {
        assert_eq!(expand("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_unknown_env_var_unchanged() {
        let result = expand("/path/$NONEXISTENT_STRATA_VAR_12345/file");
        assert_eq!(result, PathBuf::from("/path/$NONEXISTENT_STRATA_VAR_12345/file"));
    }
}
