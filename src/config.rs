use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

const DEFAULT_EXTRACTION_BATCHES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Game installation the mods are applied to (`[GAME]`).
    pub target_dir: PathBuf,
    /// Scratch space, wiped at the start of every pass.
    pub temp_dir: PathBuf,
    /// Backups and patches of pre-existing files. `None` or blank disables them.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub extractor_path: PathBuf,
    #[serde(default)]
    pub decompiler_path: PathBuf,
    #[serde(default = "default_extraction_batches")]
    pub max_extraction_batches: usize,
    #[serde(default = "default_true")]
    pub collision_checking: bool,
}

impl EngineConfig {
    pub fn new(target_dir: &Path, temp_dir: &Path) -> Self {
        Self {
            target_dir: target_dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            backup_dir: None,
            extractor_path: PathBuf::new(),
            decompiler_path: PathBuf::new(),
            max_extraction_batches: DEFAULT_EXTRACTION_BATCHES,
            collision_checking: true,
        }
    }

    pub fn with_backup_dir(mut self, backup_dir: &Path) -> Self {
        self.backup_dir = Some(backup_dir.to_path_buf());
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).context("read engine config")?;
        let config: EngineConfig = serde_json::from_str(&raw).context("parse engine config")?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create config dir")?;
        }
        let raw = serde_json::to_string_pretty(self).context("serialize engine config")?;
        fs::write(path, raw).context("write engine config")?;
        Ok(())
    }

    pub fn backups_enabled(&self) -> bool {
        self.backup_root().is_some()
    }

    pub fn backup_root(&self) -> Option<&Path> {
        self.backup_dir
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    pub fn extraction_batches(&self) -> usize {
        self.max_extraction_batches.max(1)
    }

    pub fn default_data_dir() -> Result<PathBuf> {
        let base = BaseDirs::new().context("resolve home dir")?;
        Ok(base.data_local_dir().join("modweave"))
    }
}

fn default_extraction_batches() -> usize {
    DEFAULT_EXTRACTION_BATCHES
}

fn default_true() -> bool {
    true
}
