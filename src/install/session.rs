//! State owned by a single install pass. A fresh [`Session`] is built for
//! every attempt and dropped afterwards; nothing is carried between calls
//! except the ledger that is handed back to the caller.

use crate::{
    actions::{ActionContext, ModAction},
    backup::BackupStore,
    collision::ModCollision,
    config::EngineConfig,
    error::EngineError,
    ledger::ModificationLedger,
    offset_writer::{unique_path, ByteOffsetWriter},
    progress::{ProgressCallback, ProgressTracker},
    vpath::PathScope,
};
use anyhow::{Context, Result};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassKind {
    Mods,
    Setup,
}

impl PassKind {
    pub(crate) fn subdir(self) -> &'static str {
        match self {
            PassKind::Mods => "mods",
            PassKind::Setup => "setup",
        }
    }

    pub(crate) fn context(self) -> ActionContext {
        match self {
            PassKind::Mods => ActionContext::Mod,
            PassKind::Setup => ActionContext::IntegrationSetup,
        }
    }
}

/// One mod (or the integration setup) taking part in a pass.
pub(crate) struct PassUnit<'a> {
    /// Mod checked against the ledger; `None` during integration setup.
    pub owner: Option<&'a str>,
    /// Id stored on ledger entries.
    pub record_id: &'a str,
    pub mod_cache: Option<&'a Path>,
    pub actions: Vec<&'a ModAction>,
}

pub(crate) struct ActionScope<'a> {
    pub owner: Option<&'a str>,
    pub record_id: &'a str,
    pub paths: PathScope<'a>,
}

pub(crate) struct Session {
    pub ledger: ModificationLedger,
    pub writer: ByteOffsetWriter,
    pub reserved: HashSet<PathBuf>,
    pub extracted: Mutex<HashSet<PathBuf>>,
    pub unzipped: HashSet<PathBuf>,
    pub decompiled: HashSet<PathBuf>,
    pub deleted: HashSet<PathBuf>,
    pub collisions: Vec<ModCollision>,
    pub backups: Option<BackupStore>,
    pub progress: ProgressTracker,
    temp_root: PathBuf,
}

impl Session {
    /// Snapshots the target tree and prepares scratch and backup folders.
    pub(crate) fn start(
        config: &EngineConfig,
        kind: PassKind,
        total_steps: usize,
        callback: Option<ProgressCallback>,
    ) -> Result<Self> {
        if !config.target_dir.is_dir() {
            return Err(EngineError::MissingResource(config.target_dir.clone()).into());
        }
        let reserved = snapshot_tree(&config.target_dir)?;
        debug!(
            target = %config.target_dir.display(),
            files = reserved.len(),
            "reserved files captured"
        );

        let temp_root = config.temp_dir.join(kind.subdir());
        if temp_root.exists() {
            fs::remove_dir_all(&temp_root).context("clear temp dir")?;
        }
        fs::create_dir_all(&temp_root).context("create temp dir")?;

        let backups = match config.backup_root() {
            Some(root) => {
                let root = root.join(kind.subdir());
                fs::create_dir_all(&root).context("create backup dir")?;
                Some(BackupStore::new(&root, &config.target_dir))
            }
            None => None,
        };

        Ok(Self {
            ledger: ModificationLedger::new(),
            writer: ByteOffsetWriter::new(),
            reserved,
            extracted: Mutex::new(HashSet::new()),
            unzipped: HashSet::new(),
            decompiled: HashSet::new(),
            deleted: HashSet::new(),
            collisions: Vec::new(),
            backups,
            progress: ProgressTracker::new(total_steps, callback),
            temp_root,
        })
    }

    pub(crate) fn is_reserved(&self, path: &Path) -> bool {
        self.reserved.contains(path)
    }

    /// Fresh, empty directory below the pass's temp root.
    pub(crate) fn scratch_dir(&self, label: &str) -> Result<PathBuf> {
        let dir = unique_path(&self.temp_root.join(label))?;
        fs::create_dir_all(&dir).context("create scratch dir")?;
        Ok(dir)
    }

    pub(crate) fn remove_temp(&self) {
        if self.temp_root.exists() {
            if let Err(err) = fs::remove_dir_all(&self.temp_root) {
                debug!(error = %err, "temp dir cleanup failed");
            }
        }
    }
}

fn snapshot_tree(root: &Path) -> Result<HashSet<PathBuf>> {
    let mut files = HashSet::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.context("scan target dir")?;
        if entry.file_type().is_file() {
            files.insert(entry.path().to_path_buf());
        }
    }
    Ok(files)
}
