//! Virtual paths rooted at one of three fixed tags.
//!
//! A virtual path looks like `[GAME]\Data\file.pak`. The tag selects the root
//! directory and the remainder is a relative path that may backtrack with `..`
//! as long as it never climbs above the root at any point.

use crate::error::PathError;
use std::{
    fmt,
    path::{Path, PathBuf},
};

const RESOURCES_DIR: &str = "resources";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathRoot {
    Game,
    Mod,
    Integration,
}

impl PathRoot {
    pub fn tag(self) -> &'static str {
        match self {
            PathRoot::Game => "[GAME]",
            PathRoot::Mod => "[MOD]",
            PathRoot::Integration => "[INTEGRATION]",
        }
    }

    fn all() -> [PathRoot; 3] {
        [PathRoot::Game, PathRoot::Mod, PathRoot::Integration]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPath {
    root: PathRoot,
    segments: Vec<String>,
    raw: String,
}

impl VirtualPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        let (root, rest) = PathRoot::all()
            .into_iter()
            .find_map(|root| trimmed.strip_prefix(root.tag()).map(|rest| (root, rest)))
            .ok_or_else(|| PathError::UnknownRoot(raw.to_string()))?;

        // The running depth must stay non-negative at every prefix, so
        // `a\..\..\b` is rejected even though it nets out to depth 0.
        let mut segments: Vec<String> = Vec::new();
        for part in rest.split(['\\', '/']) {
            match part {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathError::EscapesRoot(raw.to_string()));
                    }
                }
                other => segments.push(other.to_string()),
            }
        }

        Ok(Self {
            root,
            segments,
            raw: raw.to_string(),
        })
    }

    pub fn root(&self) -> PathRoot {
        self.root
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Normalized path below the root.
    pub fn relative(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    pub fn resolve(&self, scope: &PathScope<'_>) -> Result<PathBuf, PathError> {
        let base = match self.root {
            PathRoot::Game => scope.game_root.to_path_buf(),
            PathRoot::Mod => scope
                .mod_root
                .clone()
                .ok_or_else(|| PathError::MissingModContext(self.raw.clone()))?,
            PathRoot::Integration => scope
                .integration_root
                .clone()
                .ok_or_else(|| PathError::MissingIntegrationContext(self.raw.clone()))?,
        };
        Ok(base.join(self.relative()))
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Physical roots available while resolving paths for one action.
#[derive(Debug, Clone)]
pub struct PathScope<'a> {
    pub game_root: &'a Path,
    pub mod_root: Option<PathBuf>,
    pub integration_root: Option<PathBuf>,
}

impl<'a> PathScope<'a> {
    pub fn new(
        game_root: &'a Path,
        mod_cache: Option<&Path>,
        integration_cache: Option<&Path>,
    ) -> Self {
        Self {
            game_root,
            mod_root: mod_cache.map(|dir| dir.join(RESOURCES_DIR)),
            integration_root: integration_cache.map(|dir| dir.join(RESOURCES_DIR)),
        }
    }

    pub fn resolve(&self, raw: &str) -> Result<PathBuf, PathError> {
        VirtualPath::parse(raw)?.resolve(self)
    }
}
