//! Configuration loading and config path resolution

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Logging section shared by every phyto config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (e.g. "info", "phyto_id=debug")
    ///
    /// `RUST_LOG` overrides this when set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Config file resolution in priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. Platform config directory (`<config dir>/phyto/<file_name>`), if it exists
///
/// Returns `None` when no file is found; callers fall back to built-in defaults.
pub fn resolve_config_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    file_name: &str,
) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Some(path) = env_value(env_var_name) {
        return Some(PathBuf::from(path));
    }

    // Priority 3: Platform config directory
    let candidate = default_config_dir()?.join(file_name);
    if candidate.exists() {
        Some(candidate)
    } else {
        debug!(path = %candidate.display(), "No config file in platform config dir");
        None
    }
}

/// Platform configuration directory for phyto (`~/.config/phyto` on Linux)
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("phyto"))
}

/// Load a TOML config file, or defaults when `path` is `None`
pub fn load_toml_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        debug!("No config file given, using defaults");
        return Ok(T::default());
    };

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Read only the `[logging]` section of a config file
///
/// Used to set up logging before the full config is loaded, so that load's
/// own messages are not lost. Any problem yields the default section; the
/// full load reports it.
pub fn load_logging_config(path: Option<&Path>) -> LoggingConfig {
    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct LoggingOnly {
        logging: LoggingConfig,
    }

    path
        .and_then(|p| std::fs::read_to_string(p).ok())
        .and_then(|content| toml::from_str::<LoggingOnly>(&content).ok())
        .map(|file| file.logging)
        .unwrap_or_default()
}

/// Write a TOML config file atomically (temp file + rename)
pub fn write_toml_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        warn!(path = %path.display(), error = %e, "Atomic rename failed");
        let _ = std::fs::remove_file(&tmp_path);
        return Err(Error::Io(e));
    }

    Ok(())
}

/// Read an environment variable, treating empty or whitespace-only values as unset
pub fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct SampleConfig {
        logging: LoggingConfig,
        name: Option<String>,
    }

    #[test]
    fn test_cli_arg_wins() {
        let path = resolve_config_path(
            Some(Path::new("/tmp/explicit.toml")),
            "PHYTO_TEST_UNUSED_VAR",
            "phyto-id.toml",
        );
        assert_eq!(path, Some(PathBuf::from("/tmp/explicit.toml")));
    }

    #[test]
    fn test_missing_path_gives_defaults() {
        let config: SampleConfig = load_toml_config(None).unwrap();
        assert_eq!(config, SampleConfig::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_write_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("sample.toml");

        let config = SampleConfig {
            logging: LoggingConfig {
                level: "debug".to_string(),
            },
            name: Some("rose".to_string()),
        };
        write_toml_config(&config, &path).unwrap();

        let loaded: SampleConfig = load_toml_config(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.toml");
        std::fs::write(&path, "logging = [not toml").unwrap();

        let result: Result<SampleConfig> = load_toml_config(Some(&path));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_logging_section_read_alone() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("phyto-id.toml");
        std::fs::write(
            &path,
            "[logging]\nlevel = \"debug\"\n\n[[providers]]\nname = \"plantnet\"\n",
        )
        .unwrap();

        assert_eq!(load_logging_config(Some(&path)).level, "debug");
    }

    #[test]
    fn test_logging_section_falls_back_to_default() {
        let temp_dir = TempDir::new().unwrap();
        let broken = temp_dir.path().join("broken.toml");
        std::fs::write(&broken, "logging = [not toml").unwrap();

        assert_eq!(load_logging_config(Some(&broken)), LoggingConfig::default());
        assert_eq!(load_logging_config(None), LoggingConfig::default());
        assert_eq!(
            load_logging_config(Some(&temp_dir.path().join("absent.toml"))),
            LoggingConfig::default()
        );
    }
}
