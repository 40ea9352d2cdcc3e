use super::{session::PassKind, Installer};
use crate::{
    backup::BackupStore,
    ledger::{ModificationLedger, ModificationType},
};
use anyhow::{Context, Result};
use std::{fs, path::Path};
use tracing::{debug, info, warn};

/// What a revert did, for logs and the CLI summary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RevertReport {
    pub removed: usize,
    pub restored: usize,
    pub warnings: Vec<String>,
}

impl Installer {
    pub(crate) fn backup_store(&self, kind: PassKind) -> Option<BackupStore> {
        self.config
            .backup_root()
            .map(|root| BackupStore::new(&root.join(kind.subdir()), &self.config.target_dir))
    }

    /// Undoes every change in `ledger`: files the pass created are removed,
    /// pre-existing files it changed are put back from their base backups,
    /// then the backup tree for `kind` is dropped.
    pub(crate) fn revert_ledger(
        &self,
        kind: PassKind,
        ledger: &ModificationLedger,
    ) -> Result<RevertReport> {
        let target_root = self.config.target_dir.as_path();
        let store = self.backup_store(kind);
        let mut report = RevertReport::default();

        for file in ledger.files() {
            if ledger.is_reserved(file) || !file.starts_with(target_root) {
                continue;
            }
            if !ledger.has_modification(file, ModificationType::ADDED) || !file.exists() {
                continue;
            }
            fs::remove_file(file).with_context(|| format!("remove {:?}", file))?;
            remove_empty_parents(file, target_root);
            report.removed += 1;
        }

        let changed = ModificationType::DELETED
            | ModificationType::EDITED
            | ModificationType::MOVED
            | ModificationType::REPLACED;
        for file in ledger.files() {
            if !ledger.is_reserved(file) || !ledger.file_mask(file).intersects(changed) {
                continue;
            }
            let restored = match &store {
                Some(store) => store.restore(file, self.codec.as_ref())?,
                None => false,
            };
            if restored {
                report.restored += 1;
            } else {
                let message = format!("no backup for {}", file.display());
                warn!(file = %file.display(), "no backup available, file left as is");
                report.warnings.push(message);
            }
        }

        if let Some(store) = &store {
            store.clear()?;
        }
        info!(
            removed = report.removed,
            restored = report.restored,
            warnings = report.warnings.len(),
            "changes reverted"
        );
        Ok(report)
    }
}

fn remove_empty_parents(file: &Path, stop: &Path) {
    let mut current = file.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        debug!(dir = %dir.display(), "empty folder removed");
        current = dir.parent();
    }
}
