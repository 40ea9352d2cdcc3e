//! Contracts for the external extraction and decompilation tools.

use crate::error::EngineError;
use anyhow::{Context, Result};
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::SystemTime,
};
use walkdir::WalkDir;

pub trait BinaryExtractor: Send + Sync {
    /// Unpacks `file` into `out_dir` and returns every produced file.
    fn extract(&self, file: &Path, script: Option<&Path>, out_dir: &Path) -> Result<Vec<PathBuf>>;
}

pub trait Decompiler: Send + Sync {
    /// Decompiles `file` into `out_dir` and returns the produced file.
    fn decompile(&self, file: &Path, out_dir: &Path) -> Result<PathBuf>;
}

/// Runs `{tool} [script] {file} {out_dir}`.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    pub tool: PathBuf,
}

impl BinaryExtractor for CommandExtractor {
    fn extract(&self, file: &Path, script: Option<&Path>, out_dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(out_dir).context("create extraction dir")?;
        let mut command = Command::new(&self.tool);
        if let Some(script) = script {
            if !script.is_file() {
                return Err(EngineError::MissingResource(script.to_path_buf()).into());
            }
            command.arg(script);
        }
        command.arg(file).arg(out_dir);
        run_tool(&self.tool, file, command)?;
        list_files(out_dir)
    }
}

/// Runs `{tool} {file} {out_dir}` and picks the newest file it wrote.
#[derive(Debug, Clone)]
pub struct CommandDecompiler {
    pub tool: PathBuf,
}

impl Decompiler for CommandDecompiler {
    fn decompile(&self, file: &Path, out_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(out_dir).context("create decompile dir")?;
        let mut command = Command::new(&self.tool);
        command.arg(file).arg(out_dir);
        run_tool(&self.tool, file, command)?;

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for path in list_files(out_dir)? {
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().map_or(true, |(time, _)| modified >= *time) {
                newest = Some((modified, path));
            }
        }
        newest.map(|(_, path)| path).ok_or_else(|| {
            EngineError::ToolFailed {
                tool: self.tool.display().to_string(),
                file: file.to_path_buf(),
                message: "no output produced".to_string(),
            }
            .into()
        })
    }
}

fn run_tool(tool: &Path, file: &Path, mut command: Command) -> Result<()> {
    let output = command
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();

    let output = match output {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::MissingResource(tool.to_path_buf()).into());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("launch {:?}", tool));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::ToolFailed {
            tool: tool.display().to_string(),
            file: file.to_path_buf(),
            message: stderr.trim().to_string(),
        }
        .into());
    }
    Ok(())
}

pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(files)
}
