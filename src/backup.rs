//! Content-addressed backups of pre-existing files.
//!
//! Layout under the store root, keyed by the SHA-1 of the file's path
//! relative to the game directory:
//!
//! ```text
//! {root}/{sha1}/{sha1}.backup   pristine bytes, written once
//! {root}/{sha1}/{sha1}.patch1   delta from the pristine bytes to edit 1
//! {root}/{sha1}/{sha1}.patch2   delta from edit 1 to edit 2
//! {root}/{sha1}/meta.json
//! ```

use crate::delta::PatchCodec;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupMeta {
    pub relative_path: String,
    pub timestamp: u64,
    pub mod_id: String,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
    game_root: PathBuf,
}

impl BackupStore {
    pub fn new(root: &Path, game_root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            game_root: game_root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key(&self, file: &Path) -> String {
        let relative = file.strip_prefix(&self.game_root).unwrap_or(file);
        let normalized = relative.to_string_lossy().replace('\\', "/");
        let mut hasher = Sha1::new();
        hasher.update(normalized.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn entry_dir(&self, file: &Path) -> PathBuf {
        self.root.join(self.key(file))
    }

    pub fn base_path(&self, file: &Path) -> PathBuf {
        let key = self.key(file);
        self.root.join(&key).join(format!("{key}.backup"))
    }

    pub fn patch_path(&self, file: &Path, number: usize) -> PathBuf {
        let key = self.key(file);
        self.root.join(&key).join(format!("{key}.patch{number}"))
    }

    pub fn has_base(&self, file: &Path) -> bool {
        self.base_path(file).exists()
    }

    /// Copies `file` to its base backup unless one already exists.
    pub fn snapshot_base(&self, file: &Path, mod_id: &str) -> Result<bool> {
        let base = self.base_path(file);
        if base.exists() || !file.is_file() {
            return Ok(false);
        }
        let dir = self.entry_dir(file);
        fs::create_dir_all(&dir).context("create backup dir")?;
        fs::copy(file, &base).with_context(|| format!("back up {:?}", file))?;

        let meta = BackupMeta {
            relative_path: file
                .strip_prefix(&self.game_root)
                .unwrap_or(file)
                .to_string_lossy()
                .to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            mod_id: mod_id.to_string(),
        };
        let meta_json = serde_json::to_string_pretty(&meta).context("serialize backup meta")?;
        fs::write(dir.join("meta.json"), meta_json).context("write backup meta")?;
        info!(file = %file.display(), backup = %base.display(), "base backup created");
        Ok(true)
    }

    pub fn patch_count(&self, file: &Path) -> usize {
        let mut count = 0;
        while self.patch_path(file, count + 1).exists() {
            count += 1;
        }
        count
    }

    /// Stores the delta `before -> after` as the next numbered patch.
    pub fn record_patch(
        &self,
        file: &Path,
        before: &[u8],
        after: &[u8],
        codec: &dyn PatchCodec,
    ) -> Result<usize> {
        let number = self.patch_count(file) + 1;
        let patch = codec.diff(before, after).context("diff file versions")?;
        let path = self.patch_path(file, number);
        fs::create_dir_all(self.entry_dir(file)).context("create backup dir")?;
        fs::write(&path, patch).with_context(|| format!("write patch {:?}", path))?;
        debug!(file = %file.display(), number, "patch recorded");
        Ok(number)
    }

    /// Bytes of `file` after `version` edits: the base with patches
    /// `1..=version` applied oldest first.
    pub fn reconstruct(
        &self,
        file: &Path,
        version: usize,
        codec: &dyn PatchCodec,
    ) -> Result<Vec<u8>> {
        let base = self.base_path(file);
        let mut bytes = fs::read(&base).with_context(|| format!("read backup {:?}", base))?;
        for number in 1..=version {
            let path = self.patch_path(file, number);
            let patch = fs::read(&path).with_context(|| format!("read patch {:?}", path))?;
            bytes = codec
                .apply(&bytes, &patch)
                .with_context(|| format!("apply patch {number} to {:?}", file))?;
        }
        Ok(bytes)
    }

    /// Puts the pristine bytes back at `file`. Returns false without a base.
    pub fn restore(&self, file: &Path, codec: &dyn PatchCodec) -> Result<bool> {
        if !self.has_base(file) {
            return Ok(false);
        }
        let bytes = self.reconstruct(file, 0, codec)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).context("create restore dir")?;
        }
        fs::write(file, bytes).with_context(|| format!("restore {:?}", file))?;
        info!(file = %file.display(), "restored from backup");
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).context("remove backup tree")?;
        }
        Ok(())
    }
}
