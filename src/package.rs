use crate::actions::{has_errors, ActionContext, ModAction, ValidationIssue, ValidationSeverity};
use crate::error::EngineError;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// A mod and the actions it installs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModPackage {
    pub id: String,
    /// Unpacked mod folder; `[MOD]` resolves to `{cache_folder}/resources`.
    pub cache_folder: PathBuf,
    #[serde(default)]
    pub actions: Vec<ModAction>,
    #[serde(default)]
    pub settings: BTreeMap<String, bool>,
}

impl ModPackage {
    pub fn new(id: &str, cache_folder: &Path, actions: Vec<ModAction>) -> Self {
        Self {
            id: id.to_string(),
            cache_folder: cache_folder.to_path_buf(),
            actions,
            settings: BTreeMap::new(),
        }
    }

    pub fn enabled_actions(&self) -> impl Iterator<Item = &ModAction> {
        self.actions
            .iter()
            .filter(|action| !action.is_disabled(&self.settings))
    }
}

/// Follow-up actions run whenever extraction or unzip produces a file below
/// `target_path` whose relative path matches `file_filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoMapping {
    pub target_path: String,
    pub file_filter: String,
    pub actions: Vec<ModAction>,
}

impl AutoMapping {
    pub fn filter(&self) -> Result<Regex, EngineError> {
        Regex::new(&self.file_filter).map_err(|source| EngineError::InvalidFilter {
            pattern: self.file_filter.clone(),
            source,
        })
    }
}

/// The game integration the mods are installed into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    /// `[INTEGRATION]` resolves to `{cache_folder}/resources`.
    pub cache_folder: PathBuf,
    #[serde(default)]
    pub setup_actions: Vec<ModAction>,
    #[serde(default)]
    pub auto_mappings: Vec<AutoMapping>,
}

impl Integration {
    pub fn new(id: &str, cache_folder: &Path) -> Self {
        Self {
            id: id.to_string(),
            cache_folder: cache_folder.to_path_buf(),
            setup_actions: Vec::new(),
            auto_mappings: Vec::new(),
        }
    }

    /// Validates every auto-mapped action, rejecting recursive mappings.
    pub fn validate_auto_mappings(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for mapping in &self.auto_mappings {
            if let Err(err) = mapping.filter() {
                issues.push(ValidationIssue {
                    severity: ValidationSeverity::Error,
                    message: err.to_string(),
                });
            }
            for action in &mapping.actions {
                issues.extend(action.validate(ActionContext::AutoMapping));
            }
        }
        issues
    }

    pub fn auto_mappings_valid(&self) -> bool {
        !has_errors(&self.validate_auto_mappings())
    }
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {:?}", path))
}
