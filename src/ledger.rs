//! Per-file record of every modification applied during an install session.

use anyhow::{Context, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

bitflags! {
    /// Kinds of change a file has received. A file accumulates the union of
    /// every kind applied to it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ModificationType: u32 {
        const ADDED = 1;
        const EDITED = 2;
        const DELETED = 4;
        const MOVED = 8;
        const REPLACED = 16;
    }
}

impl ModificationType {
    pub fn label(self) -> &'static str {
        match self {
            t if t == ModificationType::ADDED => "added",
            t if t == ModificationType::EDITED => "edited",
            t if t == ModificationType::DELETED => "deleted",
            t if t == ModificationType::MOVED => "moved",
            t if t == ModificationType::REPLACED => "replaced",
            t if t.is_empty() => "none",
            _ => "mixed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileModification {
    /// Only set for [`ModificationType::MOVED`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<PathBuf>,
    #[serde(rename = "type")]
    pub kind: ModificationType,
    pub mod_id: String,
    /// The file existed before the session started.
    pub reserved_file: bool,
}

impl FileModification {
    pub fn new(kind: ModificationType, mod_id: &str, reserved_file: bool) -> Self {
        Self {
            destination_path: None,
            kind,
            mod_id: mod_id.to_string(),
            reserved_file,
        }
    }

    pub fn moved(destination: &Path, mod_id: &str, reserved_file: bool) -> Self {
        Self {
            destination_path: Some(destination.to_path_buf()),
            ..Self::new(ModificationType::MOVED, mod_id, reserved_file)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct LedgerRecord {
    modifications: BTreeMap<PathBuf, Vec<FileModification>>,
}

/// File path -> ordered modifications, plus a derived bitmask per file.
///
/// Only the modification lists are persisted. The bitmask index is rebuilt
/// whenever a ledger is deserialized or copied from a previous one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "LedgerRecord", into = "LedgerRecord")]
pub struct ModificationLedger {
    modifications: BTreeMap<PathBuf, Vec<FileModification>>,
    index: HashMap<PathBuf, ModificationType>,
}

impl From<LedgerRecord> for ModificationLedger {
    fn from(record: LedgerRecord) -> Self {
        let mut ledger = ModificationLedger {
            modifications: record.modifications,
            index: HashMap::new(),
        };
        ledger.rebuild_index();
        ledger
    }
}

impl From<ModificationLedger> for LedgerRecord {
    fn from(ledger: ModificationLedger) -> Self {
        LedgerRecord {
            modifications: ledger.modifications,
        }
    }
}

impl ModificationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Carries a previous session's history forward entry by entry.
    pub fn from_previous(previous: &ModificationLedger) -> Self {
        let mut ledger = Self::new();
        for (file, modification) in previous.iter() {
            ledger.add_modification(file, modification.clone());
        }
        ledger
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = fs::read_to_string(path).context("read ledger")?;
        let ledger = serde_json::from_str(&raw).context("parse ledger")?;
        Ok(ledger)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create ledger dir")?;
        }
        let raw = serde_json::to_string_pretty(self).context("serialize ledger")?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, raw).context("write ledger temp")?;
        fs::rename(&temp, path).context("finalize ledger")?;
        Ok(())
    }

    pub fn add_modification(&mut self, file: &Path, modification: FileModification) {
        *self
            .index
            .entry(file.to_path_buf())
            .or_insert(ModificationType::empty()) |= modification.kind;
        self.modifications
            .entry(file.to_path_buf())
            .or_default()
            .push(modification);
    }

    pub fn has_any_modifications(&self, file: &Path) -> bool {
        self.index
            .get(file)
            .is_some_and(|mask| !mask.is_empty())
    }

    /// True when every bit of `mask` has been applied to `file`.
    pub fn has_modification(&self, file: &Path, mask: ModificationType) -> bool {
        !mask.is_empty()
            && self
                .index
                .get(file)
                .is_some_and(|current| current.contains(mask))
    }

    /// Most recent entry whose own kind is exactly `kind`.
    pub fn find_modification(
        &self,
        file: &Path,
        kind: ModificationType,
    ) -> Option<&FileModification> {
        if !self.has_modification(file, kind) {
            return None;
        }
        self.modifications
            .get(file)?
            .iter()
            .rev()
            .find(|modification| modification.kind == kind)
    }

    pub fn file_mask(&self, file: &Path) -> ModificationType {
        self.index
            .get(file)
            .copied()
            .unwrap_or(ModificationType::empty())
    }

    pub fn modifications_for(&self, file: &Path) -> &[FileModification] {
        self.modifications
            .get(file)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Filters entries by mod, kind (submask) and reserved flag.
    pub fn modifications<'a>(
        &'a self,
        mod_id: Option<&'a str>,
        kind: Option<ModificationType>,
        reserved: Option<bool>,
    ) -> impl Iterator<Item = (&'a Path, &'a FileModification)> + 'a {
        self.iter().filter(move |(_, modification)| {
            mod_id.map_or(true, |id| modification.mod_id == id)
                && kind.map_or(true, |mask| modification.kind.contains(mask))
                && reserved.map_or(true, |flag| modification.reserved_file == flag)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &FileModification)> {
        self.modifications.iter().flat_map(|(file, list)| {
            list.iter()
                .map(move |modification| (file.as_path(), modification))
        })
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.modifications.keys().map(PathBuf::as_path)
    }

    pub fn is_reserved(&self, file: &Path) -> bool {
        self.modifications_for(file)
            .iter()
            .any(|modification| modification.reserved_file)
    }

    pub fn len(&self) -> usize {
        self.modifications.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty()
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (file, list) in &self.modifications {
            let mask = list
                .iter()
                .fold(ModificationType::empty(), |mask, modification| {
                    mask | modification.kind
                });
            self.index.insert(file.clone(), mask);
        }
    }
}
