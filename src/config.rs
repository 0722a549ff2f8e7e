use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Where the ledger keeps its files. Stored as JSON next to the files it
/// points at so a data directory is self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_install_log")]
    pub install_log_file: String,
    #[serde(default = "default_active_list")]
    pub active_list_file: String,
    #[serde(default = "default_order_list")]
    pub order_list_file: String,
    /// Plugins the game refuses to start without, in their required order.
    #[serde(default)]
    pub critical_plugins: Vec<String>,
}

impl LedgerConfig {
    pub fn load_or_create(data_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir).context("create ledger data dir")?;
        let path = data_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read ledger config")?;
            let mut config: LedgerConfig =
                serde_json::from_str(&raw).context("parse ledger config")?;
            config.data_dir = data_dir.to_path_buf();
            return Ok(config);
        }

        let config = LedgerConfig {
            data_dir: data_dir.to_path_buf(),
            install_log_file: default_install_log(),
            active_list_file: default_active_list(),
            order_list_file: default_order_list(),
            critical_plugins: Vec::new(),
        };
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir).context("create ledger data dir")?;
        let path = self.data_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize ledger config")?;
        fs::write(path, raw).context("write ledger config")?;
        Ok(())
    }

    pub fn install_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.install_log_file)
    }

    pub fn active_list_path(&self) -> PathBuf {
        self.data_dir.join(&self.active_list_file)
    }

    pub fn order_list_path(&self) -> PathBuf {
        self.data_dir.join(&self.order_list_file)
    }
}

fn default_install_log() -> String {
    "InstallLog.xml".to_string()
}

fn default_active_list() -> String {
    "plugins.txt".to_string()
}

fn default_order_list() -> String {
    "loadorder.txt".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LedgerConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(config.install_log_path(), dir.path().join("InstallLog.xml"));
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn reload_keeps_overrides_and_retargets_the_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LedgerConfig::load_or_create(dir.path()).unwrap();
        config.critical_plugins = vec!["core.esm".to_string()];
        config.install_log_file = "Ledger.xml".to_string();
        config.save().unwrap();

        let reloaded = LedgerConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(reloaded.critical_plugins, ["core.esm"]);
        assert_eq!(reloaded.install_log_path(), dir.path().join("Ledger.xml"));
    }
}
