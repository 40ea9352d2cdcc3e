//! Decides whether a proposed action collides with another mod's changes.
//!
//! Every check is a pure function of the acting mod, the files involved and
//! the ledger. Rules are evaluated in a fixed order and the first match wins.

use crate::{
    ledger::{FileModification, ModificationLedger, ModificationType},
    offset_writer::ByteOffsetWriter,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollisionSeverity {
    Clash,
    ResolvableConflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModCollision {
    /// The mod whose earlier change is in the way.
    pub mod_id: String,
    pub severity: CollisionSeverity,
    pub description: String,
}

/// Blake3 digests computed at most once per file within a single check.
#[derive(Default)]
struct ContentHashes {
    cache: HashMap<PathBuf, Option<blake3::Hash>>,
}

impl ContentHashes {
    fn get(&mut self, path: &Path) -> Option<blake3::Hash> {
        *self
            .cache
            .entry(path.to_path_buf())
            .or_insert_with(|| fs::read(path).ok().map(|bytes| blake3::hash(&bytes)))
    }

    fn differ(&mut self, a: &Path, b: &Path) -> bool {
        self.get(a) != self.get(b)
    }
}

struct Rule<'a> {
    current_mod: Option<&'a str>,
    action: &'static str,
    ledger: &'a ModificationLedger,
}

impl<'a> Rule<'a> {
    /// Latest entry of exactly `kind` on `file` made by a different mod.
    /// Newer entries of the acting mod do not hide it.
    fn by_other(&self, file: &Path, kind: ModificationType) -> Option<&'a FileModification> {
        self.ledger
            .modifications_for(file)
            .iter()
            .rev()
            .find(|modification| {
                modification.kind == kind
                    && Some(modification.mod_id.as_str()) != self.current_mod
            })
    }

    fn clash(&self, other: &FileModification, reason: &str, suffix: &str) -> ModCollision {
        let description = describe(self.current_mod, self.action, reason, suffix, &other.mod_id);
        warn!(
            offender = %other.mod_id,
            current = self.current_mod.unwrap_or("<none>"),
            "{description}"
        );
        ModCollision {
            mod_id: other.mod_id.clone(),
            severity: CollisionSeverity::Clash,
            description,
        }
    }
}

pub fn describe(
    current_mod: Option<&str>,
    action: &str,
    reason: &str,
    suffix: &str,
    other_mod: &str,
) -> String {
    let prefix = match current_mod {
        Some(id) => format!("Mod collision detected while installing mod ({id})"),
        None => "Mod collision detected while applying changes".to_string(),
    };
    format!(
        "{prefix} Attempting to {action} that has been {reason} another mod{suffix} (conflicting mod - {other_mod})"
    )
}

pub fn has_move_collision(
    current_mod: Option<&str>,
    file: &Path,
    dest: &Path,
    ledger: &ModificationLedger,
) -> Option<ModCollision> {
    let rule = Rule {
        current_mod,
        action: "move a file",
        ledger,
    };
    transfer_collision(&rule, file, dest)
}

pub fn has_copy_collision(
    current_mod: Option<&str>,
    file: &Path,
    dest: &Path,
    ledger: &ModificationLedger,
) -> Option<ModCollision> {
    let rule = Rule {
        current_mod,
        action: "copy a file",
        ledger,
    };
    transfer_collision(&rule, file, dest)
}

/// True when `file` has already been moved to exactly `dest`.
pub fn already_moved_to(ledger: &ModificationLedger, file: &Path, dest: &Path) -> bool {
    ledger
        .find_modification(file, ModificationType::MOVED)
        .and_then(|modification| modification.destination_path.as_deref())
        == Some(dest)
}

fn transfer_collision(rule: &Rule<'_>, file: &Path, dest: &Path) -> Option<ModCollision> {
    let ledger = rule.ledger;
    let mut hashes = ContentHashes::default();

    if let Some(moved) = ledger.find_modification(file, ModificationType::MOVED) {
        if moved.destination_path.as_deref() != Some(dest) {
            return Some(rule.clash(moved, "moved by", " to a different destination"));
        }
        // Same source, same destination: the move is already in place.
        return None;
    }
    for (kind, reason) in [
        (ModificationType::REPLACED, "replaced by"),
        (ModificationType::EDITED, "edited by"),
        (ModificationType::DELETED, "deleted by"),
    ] {
        if let Some(other) = rule.by_other(file, kind) {
            return Some(rule.clash(other, reason, ""));
        }
    }

    if !ledger.has_any_modifications(dest) {
        return None;
    }
    for (kind, reason) in [
        (ModificationType::REPLACED, "replaced by"),
        (ModificationType::EDITED, "edited by"),
        (ModificationType::ADDED, "added by"),
    ] {
        if let Some(other) = rule.by_other(dest, kind) {
            if hashes.differ(file, dest) {
                return Some(rule.clash(other, reason, " with different content"));
            }
        }
    }
    None
}

pub fn has_replace_collision(
    current_mod: Option<&str>,
    target: &Path,
    replacement: &Path,
    ledger: &ModificationLedger,
) -> Option<ModCollision> {
    let rule = Rule {
        current_mod,
        action: "replace a file",
        ledger,
    };
    let mut hashes = ContentHashes::default();

    if let Some(moved) = ledger.find_modification(target, ModificationType::MOVED) {
        return Some(rule.clash(moved, "moved by", ""));
    }
    if let Some(other) = rule.by_other(target, ModificationType::DELETED) {
        return Some(rule.clash(other, "deleted by", ""));
    }
    if let Some(other) = rule.by_other(target, ModificationType::EDITED) {
        return Some(rule.clash(other, "edited by", ""));
    }
    if let Some(other) = rule.by_other(target, ModificationType::REPLACED) {
        if hashes.differ(replacement, target) {
            return Some(rule.clash(other, "replaced by", " with different content"));
        }
    }
    None
}

/// `ranges` are the logical `[start, end)` spans the edit will write.
pub fn has_edit_collision(
    current_mod: Option<&str>,
    target: &Path,
    ranges: &[(i64, i64)],
    ledger: &ModificationLedger,
    writer: &ByteOffsetWriter,
) -> Option<ModCollision> {
    let rule = Rule {
        current_mod,
        action: "write to a file",
        ledger,
    };

    if let Some(other) = rule.by_other(target, ModificationType::MOVED) {
        return Some(rule.clash(other, "moved by", ""));
    }
    if let Some(other) = rule.by_other(target, ModificationType::REPLACED) {
        return Some(rule.clash(other, "replaced by", ""));
    }
    if let Some(other) = rule.by_other(target, ModificationType::DELETED) {
        return Some(rule.clash(other, "deleted by", ""));
    }
    if let Some(other) = rule.by_other(target, ModificationType::EDITED) {
        let overlaps = ranges
            .iter()
            .any(|&(start, end)| !writer.can_write(target, start, end));
        if overlaps {
            return Some(rule.clash(other, "edited by", " in an overlapping byte range"));
        }
    }
    None
}

pub fn has_zip_collision(
    current_mod: Option<&str>,
    files: &[PathBuf],
    dest: &Path,
    ledger: &ModificationLedger,
) -> Option<ModCollision> {
    let rule = Rule {
        current_mod,
        action: "zip files",
        ledger,
    };

    for (kind, reason) in [
        (ModificationType::ADDED, "added by"),
        (ModificationType::REPLACED, "replaced by"),
        (ModificationType::EDITED, "edited by"),
    ] {
        if let Some(other) = rule.by_other(dest, kind) {
            return Some(rule.clash(other, reason, " at the archive destination"));
        }
    }
    for file in files {
        if let Some(collision) = input_collision(&rule, file) {
            return Some(collision);
        }
    }
    None
}

pub fn has_unzip_collision(
    current_mod: Option<&str>,
    file: &Path,
    ledger: &ModificationLedger,
) -> Option<ModCollision> {
    let rule = Rule {
        current_mod,
        action: "unzip a file",
        ledger,
    };
    input_collision(&rule, file)
}

fn input_collision(rule: &Rule<'_>, file: &Path) -> Option<ModCollision> {
    for (kind, reason) in [
        (ModificationType::DELETED, "deleted by"),
        (ModificationType::MOVED, "moved by"),
        (ModificationType::REPLACED, "replaced by"),
        (ModificationType::EDITED, "edited by"),
    ] {
        if let Some(other) = rule.by_other(file, kind) {
            return Some(rule.clash(other, reason, ""));
        }
    }
    None
}
