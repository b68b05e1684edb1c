use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::Config;

/// Find the config file: `./config.json`, then `~/.steward/config.json`.
pub fn find_config_path() -> PathBuf {
    let local = Path::new("config.json");
    if local.exists() {
        return local.to_path_buf();
    }

    let home_config = dirs::home_dir().map(|h| h.join(".steward").join("config.json"));
    match home_config {
        Some(path) => path,
        None => PathBuf::from("config.json"),
    }
}

/// Load configuration from a JSON file. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config '{}'", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse config '{}'", path.display()))
}

pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create config directory '{}'", parent.display())
        })?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg.agents.defaults.max_steps, 8);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.agents.defaults.max_steps = 3;
        cfg.gateway.port = 9000;

        save_config(&path, &cfg).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.agents.defaults.max_steps, 3);
        assert_eq!(loaded.gateway.port, 9000);
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }
}
