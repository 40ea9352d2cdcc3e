//! How each action touches the disk, records itself in the ledger and
//! protects reserved files before the first change.

use super::{
    session::{ActionScope, Session},
    Installer, PassError,
};
use crate::{
    actions::{compile_filter, ActionGroup, ContentBlock, ModAction, Operation},
    archive,
    collision::{self, CollisionSeverity, ModCollision},
    error::EngineError,
    ledger::{FileModification, ModificationType},
    tools,
    vpath::PathScope,
};
use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Where produced files go and what happens to the input afterwards.
struct Output<'a> {
    destination: Option<&'a Path>,
    delete_on_complete: bool,
    auto_mapping: bool,
}

impl Installer {
    /// Runs one action. `nested` is set inside auto-mapping passes, which
    /// never trigger further auto-mapping.
    pub(super) fn execute_action(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        action: &ModAction,
        nested: bool,
    ) -> Result<(), PassError> {
        let paths = &scope.paths;
        match &action.operation {
            Operation::ExtractBinary {
                target_files,
                script,
                destination,
                delete_on_complete,
                auto_mapping,
            } => {
                let targets = resolve_all(paths, target_files)?;
                let script = resolve_optional(paths, script.as_deref())?;
                let destination = resolve_optional(paths, destination.as_deref())?;
                let output = Output {
                    destination: destination.as_deref(),
                    delete_on_complete: *delete_on_complete,
                    auto_mapping: *auto_mapping && !nested,
                };
                self.extract_binaries(session, scope, &targets, script.as_deref(), &output)
            }
            Operation::Decompile {
                target_files,
                destination,
            } => {
                let targets = resolve_all(paths, target_files)?;
                let destination = resolve_optional(paths, destination.as_deref())?;
                self.decompile_files(session, scope, &targets, destination.as_deref())
            }
            Operation::UnzipFiles {
                target_files,
                destination,
                delete_on_complete,
                auto_mapping,
            } => {
                let destination = resolve_optional(paths, destination.as_deref())?;
                let output = Output {
                    destination: destination.as_deref(),
                    delete_on_complete: *delete_on_complete,
                    auto_mapping: *auto_mapping && !nested,
                };
                for target in resolve_all(paths, target_files)? {
                    self.unzip_archive(session, scope, &target, &output)?;
                }
                Ok(())
            }
            Operation::UnzipFile {
                target_file,
                destination,
                delete_on_complete,
                auto_mapping,
            } => {
                let target = paths.resolve(target_file)?;
                let destination = resolve_optional(paths, destination.as_deref())?;
                let output = Output {
                    destination: destination.as_deref(),
                    delete_on_complete: *delete_on_complete,
                    auto_mapping: *auto_mapping && !nested,
                };
                self.unzip_archive(session, scope, &target, &output)
            }
            Operation::CopyFile {
                target_file,
                destination_path,
            } => {
                let source = paths.resolve(target_file)?;
                let dest = paths.resolve(destination_path)?;
                self.copy_file(session, scope, &source, &dest)
            }
            Operation::CopyFiles {
                target_path,
                destination_path,
                file_filter,
            } => {
                let filter = compile_filter(file_filter.as_deref())?;
                let source_root = paths.resolve(target_path)?;
                let dest_root = paths.resolve(destination_path)?;
                for (file, relative) in matching_files(&source_root, filter.as_ref())? {
                    self.copy_file(session, scope, &file, &dest_root.join(relative))?;
                }
                Ok(())
            }
            Operation::ReplaceFile {
                target_file,
                replacement_file,
            } => {
                let target = paths.resolve(target_file)?;
                let replacement = paths.resolve(replacement_file)?;
                self.replace_file(session, scope, &target, &replacement)
            }
            Operation::ReplaceFiles {
                target_path,
                replacement_path,
                file_filter,
            } => {
                let filter = compile_filter(file_filter.as_deref())?;
                let target_root = paths.resolve(target_path)?;
                let replacement_root = paths.resolve(replacement_path)?;
                for (replacement, relative) in matching_files(&replacement_root, filter.as_ref())? {
                    let target = target_root.join(&relative);
                    if !target.is_file() {
                        debug!(file = %target.display(), "no file to replace");
                        continue;
                    }
                    self.replace_file(session, scope, &target, &replacement)?;
                }
                Ok(())
            }
            Operation::WriteToFile {
                target_file,
                contents,
            } => {
                let target = paths.resolve(target_file)?;
                self.write_to_file(session, scope, &target, contents)
            }
            Operation::MoveFile {
                target_file,
                destination_path,
            } => {
                let source = paths.resolve(target_file)?;
                let dest = paths.resolve(destination_path)?;
                self.move_file(session, scope, &source, &dest)
            }
            Operation::MoveFiles {
                target_path,
                destination_path,
                file_filter,
            } => {
                let filter = compile_filter(file_filter.as_deref())?;
                let source_root = paths.resolve(target_path)?;
                let dest_root = paths.resolve(destination_path)?;
                for (file, relative) in matching_files(&source_root, filter.as_ref())? {
                    self.move_file(session, scope, &file, &dest_root.join(relative))?;
                }
                Ok(())
            }
            Operation::ZipFiles {
                target_files,
                destination_path,
                delete_on_complete,
            } => {
                let files = resolve_all(paths, target_files)?;
                let dest = paths.resolve(destination_path)?;
                self.zip_files(session, scope, &files, &dest, *delete_on_complete)
            }
            Operation::ZipDirectory {
                target_path,
                destination_path,
                delete_on_complete,
            } => {
                let dir = paths.resolve(target_path)?;
                let dest = paths.resolve(destination_path)?;
                self.zip_directory(session, scope, &dir, &dest, *delete_on_complete)
            }
            Operation::DeleteFiles { target_files } => {
                for target in resolve_all(paths, target_files)? {
                    self.delete_file(session, scope, &target)?;
                }
                Ok(())
            }
        }
    }

    fn check_collision(
        &self,
        session: &mut Session,
        found: Option<ModCollision>,
    ) -> Result<(), PassError> {
        let Some(collision) = found else {
            return Ok(());
        };
        let severity = collision.severity;
        session.collisions.push(collision);
        match severity {
            CollisionSeverity::Clash => Err(PassError::Conflict),
            CollisionSeverity::ResolvableConflict => Ok(()),
        }
    }

    /// Takes the base backup of a reserved file before its first change.
    /// Returns whether `path` is reserved.
    fn protect(&self, session: &Session, scope: &ActionScope<'_>, path: &Path) -> Result<bool> {
        let reserved = session.is_reserved(path);
        if reserved && path.is_file() {
            if let Some(store) = &session.backups {
                store.snapshot_base(path, scope.record_id)?;
            }
        }
        Ok(reserved)
    }

    fn record(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        path: &Path,
        kind: ModificationType,
    ) {
        let reserved = session.is_reserved(path);
        session.ledger.add_modification(
            path,
            FileModification::new(kind, scope.record_id, reserved),
        );
    }

    /// Copies a produced or supplied file to `dest`, recording it as added
    /// or as a replacement of what was there.
    fn place_file(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        source: &Path,
        dest: &Path,
    ) -> Result<()> {
        let existed = dest.exists();
        self.protect(session, scope, dest)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
        }
        let kind = if existed {
            ModificationType::REPLACED
        } else {
            ModificationType::ADDED
        };
        self.record(session, scope, dest, kind);
        fs::copy(source, dest).with_context(|| format!("copy {:?} -> {:?}", source, dest))?;
        Ok(())
    }

    fn place_tree(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        staging: &Path,
        staged: &[PathBuf],
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut produced = Vec::with_capacity(staged.len());
        for file in staged {
            let relative = file
                .strip_prefix(staging)
                .with_context(|| format!("{:?} is outside {:?}", file, staging))?;
            let dest = dest_dir.join(relative);
            self.place_file(session, scope, file, &dest)?;
            produced.push(dest);
        }
        Ok(produced)
    }

    fn finish_output(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        input: &Path,
        produced: &[PathBuf],
        output: &Output<'_>,
    ) -> Result<(), PassError> {
        if output.delete_on_complete {
            self.delete_file(session, scope, input)?;
        }
        if output.auto_mapping {
            for file in produced {
                self.auto_map(session, scope, file)?;
            }
        }
        Ok(())
    }

    fn copy_file(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        source: &Path,
        dest: &Path,
    ) -> Result<(), PassError> {
        if self.config.collision_checking {
            let found = collision::has_copy_collision(scope.owner, source, dest, &session.ledger);
            self.check_collision(session, found)?;
        }
        if !source.is_file() {
            return Err(EngineError::MissingResource(source.to_path_buf()).into());
        }
        if source == dest {
            return Ok(());
        }
        self.place_file(session, scope, source, dest)?;
        debug!(from = %source.display(), to = %dest.display(), "file copied");
        Ok(())
    }

    fn move_file(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        source: &Path,
        dest: &Path,
    ) -> Result<(), PassError> {
        if self.config.collision_checking {
            let found = collision::has_move_collision(scope.owner, source, dest, &session.ledger);
            self.check_collision(session, found)?;
        }
        if !source.exists() {
            if collision::already_moved_to(&session.ledger, source, dest) {
                debug!(from = %source.display(), to = %dest.display(), "move already applied");
                return Ok(());
            }
            return Err(EngineError::MissingResource(source.to_path_buf()).into());
        }
        if source == dest {
            return Ok(());
        }

        let dest_existed = dest.exists();
        let source_reserved = self.protect(session, scope, source)?;
        self.protect(session, scope, dest)?;

        // Entries go in before the files change so a failed relocation is
        // still rolled back.
        session.ledger.add_modification(
            source,
            FileModification::moved(dest, scope.record_id, source_reserved),
        );
        let kind = if dest_existed {
            ModificationType::REPLACED
        } else {
            ModificationType::ADDED
        };
        self.record(session, scope, dest, kind);
        relocate(source, dest)?;
        debug!(from = %source.display(), to = %dest.display(), "file moved");
        Ok(())
    }

    fn replace_file(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        target: &Path,
        replacement: &Path,
    ) -> Result<(), PassError> {
        if self.config.collision_checking {
            let found =
                collision::has_replace_collision(scope.owner, target, replacement, &session.ledger);
            self.check_collision(session, found)?;
        }
        if !replacement.is_file() {
            return Err(EngineError::MissingResource(replacement.to_path_buf()).into());
        }
        if !target.is_file() {
            return Err(EngineError::MissingResource(target.to_path_buf()).into());
        }

        self.protect(session, scope, target)?;
        self.record(session, scope, target, ModificationType::REPLACED);
        fs::copy(replacement, target)
            .with_context(|| format!("replace {:?} with {:?}", target, replacement))?;
        debug!(file = %target.display(), "file replaced");
        Ok(())
    }

    fn write_to_file(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        target: &Path,
        blocks: &[ContentBlock],
    ) -> Result<(), PassError> {
        let mut payloads = Vec::with_capacity(blocks.len());
        for block in blocks {
            let bytes = match (&block.text, &block.data_file) {
                (Some(text), _) => text.as_bytes().to_vec(),
                (None, Some(data_file)) => {
                    let path = scope.paths.resolve(data_file)?;
                    fs::read(&path).with_context(|| format!("read data file {:?}", path))?
                }
                (None, None) => Vec::new(),
            };
            let range = block.range(bytes.len());
            payloads.push((bytes, range));
        }

        if self.config.collision_checking {
            let ranges: Vec<(i64, i64)> = payloads.iter().map(|(_, range)| *range).collect();
            let found = collision::has_edit_collision(
                scope.owner,
                target,
                &ranges,
                &session.ledger,
                &session.writer,
            );
            self.check_collision(session, found)?;
        }
        if !target.is_file() {
            return Err(EngineError::MissingResource(target.to_path_buf()).into());
        }

        let reserved = self.protect(session, scope, target)?;
        let before = if reserved && session.backups.is_some() {
            Some(fs::read(target).with_context(|| format!("read {:?}", target))?)
        } else {
            None
        };

        // Recorded up front: a block that fails after earlier blocks landed
        // must still leave the file restorable.
        self.record(session, scope, target, ModificationType::EDITED);
        for (bytes, (start, end)) in &payloads {
            session
                .writer
                .write_range(target, bytes, *start, *end, false)?;
        }

        if let (Some(before), Some(store)) = (before, &session.backups) {
            let after = fs::read(target).with_context(|| format!("read {:?}", target))?;
            let number = store.record_patch(target, &before, &after, self.codec.as_ref())?;
            debug!(file = %target.display(), patch = number, "edit patch stored");
        }
        debug!(file = %target.display(), blocks = payloads.len(), "file edited");
        Ok(())
    }

    fn delete_file(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        path: &Path,
    ) -> Result<(), PassError> {
        if !session.deleted.insert(path.to_path_buf()) {
            return Ok(());
        }
        if !path.exists() {
            debug!(file = %path.display(), "nothing to delete");
            return Ok(());
        }
        self.protect(session, scope, path)?;
        self.record(session, scope, path, ModificationType::DELETED);
        fs::remove_file(path).with_context(|| format!("delete {:?}", path))?;
        debug!(file = %path.display(), "file deleted");
        Ok(())
    }

    fn unzip_archive(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        archive_path: &Path,
        output: &Output<'_>,
    ) -> Result<(), PassError> {
        if !session.unzipped.insert(archive_path.to_path_buf()) {
            debug!(archive = %archive_path.display(), "already unzipped");
            return Ok(());
        }
        if self.config.collision_checking {
            let found = collision::has_unzip_collision(scope.owner, archive_path, &session.ledger);
            self.check_collision(session, found)?;
        }
        if !archive_path.is_file() {
            return Err(EngineError::MissingResource(archive_path.to_path_buf()).into());
        }

        let dest_dir = output_dir(output.destination, archive_path)?;
        let staging = session.scratch_dir("unzip")?;
        let staged = archive::unzip(archive_path, &staging)?;
        let produced = self.place_tree(session, scope, &staging, &staged, &dest_dir)?;
        info!(
            archive = %archive_path.display(),
            files = produced.len(),
            "archive unpacked"
        );
        self.finish_output(session, scope, archive_path, &produced, output)
    }

    /// Extracts every target on a bounded pool, then places the results in
    /// the order the targets were declared.
    fn extract_binaries(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        targets: &[PathBuf],
        script: Option<&Path>,
        output: &Output<'_>,
    ) -> Result<(), PassError> {
        let pending: Vec<PathBuf> = {
            let extracted = session
                .extracted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            targets
                .iter()
                .filter(|target| !extracted.contains(*target))
                .cloned()
                .collect()
        };
        if let Some(missing) = pending.iter().find(|target| !target.is_file()) {
            return Err(EngineError::MissingResource(missing.clone()).into());
        }

        let mut jobs = Vec::with_capacity(pending.len());
        for target in pending {
            let out_dir = session.scratch_dir("extract")?;
            jobs.push((target, out_dir));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.extraction_batches())
            .build()
            .context("build extraction pool")?;
        let extractor = self.extractor.as_ref();
        let extracted = &session.extracted;
        let results: Vec<Option<Result<Vec<PathBuf>>>> = pool.install(|| {
            jobs.par_iter()
                .map(|(target, out_dir)| {
                    let first = extracted
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(target.clone());
                    if !first {
                        return None;
                    }
                    debug!(file = %target.display(), "extracting");
                    Some(extractor.extract(target, script, out_dir))
                })
                .collect()
        });

        for ((target, out_dir), result) in jobs.iter().zip(results) {
            let Some(result) = result else {
                continue;
            };
            let files = result.with_context(|| format!("extract {:?}", target))?;
            let dest_dir = output_dir(output.destination, target)?;
            let produced = self.place_tree(session, scope, out_dir, &files, &dest_dir)?;
            info!(file = %target.display(), files = produced.len(), "binary extracted");
            self.finish_output(session, scope, target, &produced, output)?;
        }
        Ok(())
    }

    fn decompile_files(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        targets: &[PathBuf],
        destination: Option<&Path>,
    ) -> Result<(), PassError> {
        for target in targets {
            if !session.decompiled.insert(target.clone()) {
                debug!(file = %target.display(), "already decompiled");
                continue;
            }
            if !target.is_file() {
                return Err(EngineError::MissingResource(target.clone()).into());
            }
            let out_dir = session.scratch_dir("decompile")?;
            let produced = self
                .decompiler
                .decompile(target, &out_dir)
                .with_context(|| format!("decompile {:?}", target))?;
            let name = produced
                .file_name()
                .ok_or_else(|| anyhow!("decompiler output has no file name: {:?}", produced))?;
            let dest = output_dir(destination, target)?.join(name);
            self.place_file(session, scope, &produced, &dest)?;
            info!(file = %target.display(), output = %dest.display(), "file decompiled");
        }
        Ok(())
    }

    fn zip_files(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        files: &[PathBuf],
        dest: &Path,
        delete_on_complete: bool,
    ) -> Result<(), PassError> {
        if self.config.collision_checking {
            let found = collision::has_zip_collision(scope.owner, files, dest, &session.ledger);
            self.check_collision(session, found)?;
        }
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            if !file.is_file() {
                return Err(EngineError::MissingResource(file.clone()).into());
            }
            let name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("no file name: {:?}", file))?;
            entries.push((name, file.clone()));
        }

        self.write_archive(session, scope, &entries, dest)?;
        if delete_on_complete {
            for file in files {
                self.delete_file(session, scope, file)?;
            }
        }
        Ok(())
    }

    fn zip_directory(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        dir: &Path,
        dest: &Path,
        delete_on_complete: bool,
    ) -> Result<(), PassError> {
        if !dir.is_dir() {
            return Err(EngineError::MissingResource(dir.to_path_buf()).into());
        }
        let entries: Vec<(String, PathBuf)> = archive::directory_entries(dir)?
            .into_iter()
            .filter(|(_, path)| path != dest)
            .collect();
        let files: Vec<PathBuf> = entries.iter().map(|(_, path)| path.clone()).collect();
        if self.config.collision_checking {
            let found = collision::has_zip_collision(scope.owner, &files, dest, &session.ledger);
            self.check_collision(session, found)?;
        }

        self.write_archive(session, scope, &entries, dest)?;
        if delete_on_complete {
            for file in &files {
                self.delete_file(session, scope, file)?;
            }
            prune_empty_dirs(dir);
        }
        Ok(())
    }

    fn write_archive(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        entries: &[(String, PathBuf)],
        dest: &Path,
    ) -> Result<()> {
        let existed = dest.exists();
        self.protect(session, scope, dest)?;
        let kind = if existed {
            ModificationType::REPLACED
        } else {
            ModificationType::ADDED
        };
        self.record(session, scope, dest, kind);
        archive::zip_files(entries, dest)?;
        info!(archive = %dest.display(), files = entries.len(), "archive written");
        Ok(())
    }

    /// Runs the actions of every auto-mapping whose folder contains
    /// `produced` and whose filter matches its relative path.
    fn auto_map(
        &self,
        session: &mut Session,
        scope: &ActionScope<'_>,
        produced: &Path,
    ) -> Result<(), PassError> {
        let Some(integration) = &self.integration else {
            return Ok(());
        };
        for mapping in &integration.auto_mappings {
            let root = scope.paths.resolve(&mapping.target_path)?;
            let Ok(relative) = produced.strip_prefix(&root) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if !mapping.filter()?.is_match(&relative) {
                continue;
            }
            info!(
                file = %produced.display(),
                mapping = %mapping.target_path,
                "running auto-mapped actions"
            );
            for group in ActionGroup::ORDER {
                for action in mapping.actions.iter().filter(|action| action.group() == group) {
                    self.execute_action(session, scope, action, true)?;
                }
            }
        }
        Ok(())
    }
}

fn resolve_all(paths: &PathScope<'_>, raw: &[String]) -> Result<Vec<PathBuf>, PassError> {
    raw.iter()
        .map(|raw| paths.resolve(raw).map_err(PassError::from))
        .collect()
}

fn resolve_optional(
    paths: &PathScope<'_>,
    raw: Option<&str>,
) -> Result<Option<PathBuf>, PassError> {
    Ok(raw.map(|raw| paths.resolve(raw)).transpose()?)
}

fn output_dir(destination: Option<&Path>, input: &Path) -> Result<PathBuf> {
    match destination {
        Some(dir) => Ok(dir.to_path_buf()),
        None => input
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("no parent folder for {:?}", input)),
    }
}

/// Files below `root` (with their `/`-separated relative paths) that match
/// `filter`, in file-name order.
fn matching_files(root: &Path, filter: Option<&Regex>) -> Result<Vec<(PathBuf, PathBuf)>> {
    if !root.is_dir() {
        return Err(EngineError::MissingResource(root.to_path_buf()).into());
    }
    let mut matches = Vec::new();
    for file in tools::list_files(root)? {
        let relative = file
            .strip_prefix(root)
            .with_context(|| format!("{:?} is outside {:?}", file, root))?
            .to_path_buf();
        let key = relative.to_string_lossy().replace('\\', "/");
        if filter.map_or(true, |filter| filter.is_match(&key)) {
            matches.push((file, relative));
        }
    }
    Ok(matches)
}

fn relocate(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    if dest.exists() {
        fs::remove_file(dest).with_context(|| format!("remove {:?}", dest))?;
    }
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    fs::copy(source, dest).with_context(|| format!("copy {:?} -> {:?}", source, dest))?;
    fs::remove_file(source).with_context(|| format!("remove {:?}", source))?;
    Ok(())
}

fn prune_empty_dirs(root: &Path) {
    for entry in WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        // Non-empty folders refuse removal and stay.
        if entry.file_type().is_dir() {
            if let Err(err) = fs::remove_dir(entry.path()) {
                debug!(dir = %entry.path().display(), error = %err, "folder kept");
            }
        }
    }
}
