//! Typed install actions and their settings validation.

use crate::{
    error::EngineError,
    vpath::{PathRoot, VirtualPath},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModAction {
    /// Setting key (optionally `!`-prefixed) that disables this action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<String>,
    #[serde(flatten)]
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    ExtractBinary {
        target_files: Vec<String>,
        #[serde(default)]
        script: Option<String>,
        #[serde(default)]
        destination: Option<String>,
        #[serde(default)]
        delete_on_complete: bool,
        #[serde(default)]
        auto_mapping: bool,
    },
    Decompile {
        target_files: Vec<String>,
        #[serde(default)]
        destination: Option<String>,
    },
    UnzipFiles {
        target_files: Vec<String>,
        #[serde(default)]
        destination: Option<String>,
        #[serde(default)]
        delete_on_complete: bool,
        #[serde(default)]
        auto_mapping: bool,
    },
    UnzipFile {
        target_file: String,
        #[serde(default)]
        destination: Option<String>,
        #[serde(default)]
        delete_on_complete: bool,
        #[serde(default)]
        auto_mapping: bool,
    },
    CopyFile {
        target_file: String,
        destination_path: String,
    },
    CopyFiles {
        target_path: String,
        destination_path: String,
        #[serde(default)]
        file_filter: Option<String>,
    },
    ReplaceFile {
        target_file: String,
        replacement_file: String,
    },
    ReplaceFiles {
        target_path: String,
        replacement_path: String,
        #[serde(default)]
        file_filter: Option<String>,
    },
    WriteToFile {
        target_file: String,
        contents: Vec<ContentBlock>,
    },
    MoveFile {
        target_file: String,
        destination_path: String,
    },
    MoveFiles {
        target_path: String,
        destination_path: String,
        #[serde(default)]
        file_filter: Option<String>,
    },
    ZipFiles {
        target_files: Vec<String>,
        destination_path: String,
        #[serde(default)]
        delete_on_complete: bool,
    },
    ZipDirectory {
        target_path: String,
        destination_path: String,
        #[serde(default)]
        delete_on_complete: bool,
    },
    DeleteFiles {
        target_files: Vec<String>,
    },
}

/// One byte range edit inside a [`Operation::WriteToFile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub start_offset: i64,
    #[serde(default)]
    pub end_offset: Option<i64>,
    #[serde(default)]
    pub replace: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data_file: Option<String>,
}

impl ContentBlock {
    /// Logical `[start, end)` span replaced by `len` new bytes.
    pub fn range(&self, len: usize) -> (i64, i64) {
        match self.end_offset {
            Some(end) => (self.start_offset, end),
            None if self.replace => (self.start_offset, self.start_offset + len as i64),
            None => (self.start_offset, self.start_offset),
        }
    }
}

/// Fixed execution order; later groups may rely on files from earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionGroup {
    Extract,
    Decompile,
    UnzipMany,
    UnzipOne,
    CopyOne,
    CopyMany,
    ReplaceOne,
    ReplaceMany,
    Write,
    MoveOne,
    MoveMany,
    ZipFiles,
    ZipDirectory,
    DeleteMany,
}

impl ActionGroup {
    pub const ORDER: [ActionGroup; 14] = [
        ActionGroup::Extract,
        ActionGroup::Decompile,
        ActionGroup::UnzipMany,
        ActionGroup::UnzipOne,
        ActionGroup::CopyOne,
        ActionGroup::CopyMany,
        ActionGroup::ReplaceOne,
        ActionGroup::ReplaceMany,
        ActionGroup::Write,
        ActionGroup::MoveOne,
        ActionGroup::MoveMany,
        ActionGroup::ZipFiles,
        ActionGroup::ZipDirectory,
        ActionGroup::DeleteMany,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ActionGroup::Extract => "extract",
            ActionGroup::Decompile => "decompile",
            ActionGroup::UnzipMany => "unzip files",
            ActionGroup::UnzipOne => "unzip file",
            ActionGroup::CopyOne => "copy file",
            ActionGroup::CopyMany => "copy files",
            ActionGroup::ReplaceOne => "replace file",
            ActionGroup::ReplaceMany => "replace files",
            ActionGroup::Write => "write to file",
            ActionGroup::MoveOne => "move file",
            ActionGroup::MoveMany => "move files",
            ActionGroup::ZipFiles => "zip files",
            ActionGroup::ZipDirectory => "zip directory",
            ActionGroup::DeleteMany => "delete files",
        }
    }
}

impl Operation {
    pub fn group(&self) -> ActionGroup {
        match self {
            Operation::ExtractBinary { .. } => ActionGroup::Extract,
            Operation::Decompile { .. } => ActionGroup::Decompile,
            Operation::UnzipFiles { .. } => ActionGroup::UnzipMany,
            Operation::UnzipFile { .. } => ActionGroup::UnzipOne,
            Operation::CopyFile { .. } => ActionGroup::CopyOne,
            Operation::CopyFiles { .. } => ActionGroup::CopyMany,
            Operation::ReplaceFile { .. } => ActionGroup::ReplaceOne,
            Operation::ReplaceFiles { .. } => ActionGroup::ReplaceMany,
            Operation::WriteToFile { .. } => ActionGroup::Write,
            Operation::MoveFile { .. } => ActionGroup::MoveOne,
            Operation::MoveFiles { .. } => ActionGroup::MoveMany,
            Operation::ZipFiles { .. } => ActionGroup::ZipFiles,
            Operation::ZipDirectory { .. } => ActionGroup::ZipDirectory,
            Operation::DeleteFiles { .. } => ActionGroup::DeleteMany,
        }
    }

    pub fn requests_auto_mapping(&self) -> bool {
        matches!(
            self,
            Operation::ExtractBinary {
                auto_mapping: true,
                ..
            } | Operation::UnzipFiles {
                auto_mapping: true,
                ..
            } | Operation::UnzipFile {
                auto_mapping: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionContext {
    Mod,
    IntegrationSetup,
    AutoMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: ValidationSeverity,
    pub message: String,
}

struct Issues {
    context: ActionContext,
    list: Vec<ValidationIssue>,
}

impl Issues {
    fn error(&mut self, message: String) {
        self.list.push(ValidationIssue {
            severity: ValidationSeverity::Error,
            message,
        });
    }

    fn warning(&mut self, message: String) {
        self.list.push(ValidationIssue {
            severity: ValidationSeverity::Warning,
            message,
        });
    }

    fn path(&mut self, field: &str, raw: &str) {
        match VirtualPath::parse(raw) {
            Ok(path) => {
                if path.root() == PathRoot::Mod && self.context == ActionContext::IntegrationSetup {
                    self.error(format!("{field}: {raw:?} refers to a mod during integration setup"));
                }
            }
            Err(err) => self.error(format!("{field}: {err}")),
        }
    }

    fn optional_path(&mut self, field: &str, raw: Option<&String>) {
        if let Some(raw) = raw {
            self.path(field, raw);
        }
    }

    fn paths(&mut self, field: &str, list: &[String]) {
        if list.is_empty() {
            self.warning(format!("{field} is empty"));
        }
        for raw in list {
            self.path(field, raw);
        }
    }

    fn filter(&mut self, raw: Option<&String>) {
        if let Some(pattern) = raw {
            if let Err(err) = Regex::new(pattern) {
                self.error(format!("file_filter {pattern:?}: {err}"));
            }
        }
    }
}

impl ModAction {
    pub fn new(operation: Operation) -> Self {
        Self {
            disabled: None,
            operation,
        }
    }

    pub fn group(&self) -> ActionGroup {
        self.operation.group()
    }

    /// Evaluates the disabled predicate against the owning mod's settings.
    pub fn is_disabled(&self, settings: &BTreeMap<String, bool>) -> bool {
        let Some(predicate) = self.disabled.as_deref().map(str::trim) else {
            return false;
        };
        if predicate.is_empty() {
            return false;
        }
        match predicate.strip_prefix('!') {
            Some(key) => !settings.get(key.trim()).copied().unwrap_or(false),
            None => settings.get(predicate).copied().unwrap_or(false),
        }
    }

    pub fn validate(&self, context: ActionContext) -> Vec<ValidationIssue> {
        let mut issues = Issues {
            context,
            list: Vec::new(),
        };
        if context == ActionContext::AutoMapping && self.operation.requests_auto_mapping() {
            issues.error("auto-mapped actions may not request auto-mapping".to_string());
        }

        match &self.operation {
            Operation::ExtractBinary {
                target_files,
                script,
                destination,
                ..
            } => {
                issues.paths("target_files", target_files);
                issues.optional_path("script", script.as_ref());
                issues.optional_path("destination", destination.as_ref());
            }
            Operation::Decompile {
                target_files,
                destination,
            }
            | Operation::UnzipFiles {
                target_files,
                destination,
                ..
            } => {
                issues.paths("target_files", target_files);
                issues.optional_path("destination", destination.as_ref());
            }
            Operation::UnzipFile {
                target_file,
                destination,
                ..
            } => {
                issues.path("target_file", target_file);
                issues.optional_path("destination", destination.as_ref());
            }
            Operation::CopyFile {
                target_file,
                destination_path,
            }
            | Operation::MoveFile {
                target_file,
                destination_path,
            } => {
                issues.path("target_file", target_file);
                issues.path("destination_path", destination_path);
            }
            Operation::CopyFiles {
                target_path,
                destination_path,
                file_filter,
            }
            | Operation::MoveFiles {
                target_path,
                destination_path,
                file_filter,
            } => {
                issues.path("target_path", target_path);
                issues.path("destination_path", destination_path);
                issues.filter(file_filter.as_ref());
            }
            Operation::ReplaceFile {
                target_file,
                replacement_file,
            } => {
                issues.path("target_file", target_file);
                issues.path("replacement_file", replacement_file);
            }
            Operation::ReplaceFiles {
                target_path,
                replacement_path,
                file_filter,
            } => {
                issues.path("target_path", target_path);
                issues.path("replacement_path", replacement_path);
                issues.filter(file_filter.as_ref());
            }
            Operation::WriteToFile {
                target_file,
                contents,
            } => {
                issues.path("target_file", target_file);
                if contents.is_empty() {
                    issues.warning("contents is empty".to_string());
                }
                for (index, block) in contents.iter().enumerate() {
                    match (&block.text, &block.data_file) {
                        (Some(_), Some(_)) => issues.error(format!(
                            "contents[{index}]: text and data_file are mutually exclusive"
                        )),
                        (None, None) => {
                            issues.error(format!("contents[{index}]: no text or data_file"))
                        }
                        (None, Some(data_file)) => issues.path("data_file", data_file),
                        (Some(_), None) => {}
                    }
                    if block.start_offset < 0 {
                        issues.error(format!("contents[{index}]: negative start_offset"));
                    }
                    if let Some(end) = block.end_offset {
                        if end < block.start_offset {
                            issues.error(format!(
                                "contents[{index}]: end_offset {end} is before start_offset {}",
                                block.start_offset
                            ));
                        }
                    }
                }
            }
            Operation::ZipFiles {
                target_files,
                destination_path,
                ..
            } => {
                issues.paths("target_files", target_files);
                issues.path("destination_path", destination_path);
            }
            Operation::ZipDirectory {
                target_path,
                destination_path,
                ..
            } => {
                issues.path("target_path", target_path);
                issues.path("destination_path", destination_path);
            }
            Operation::DeleteFiles { target_files } => {
                issues.paths("target_files", target_files);
            }
        }
        issues.list
    }
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.severity == ValidationSeverity::Error)
}

pub fn compile_filter(pattern: Option<&str>) -> Result<Option<Regex>, EngineError> {
    pattern
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| EngineError::InvalidFilter {
                pattern: pattern.to_string(),
                source,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_actions() {
        let raw = r#"[
            {"type": "MoveFile", "target_file": "[GAME]\\a.pak", "destination_path": "[GAME]\\b.pak"},
            {"type": "WriteToFile", "disabled": "!hd", "target_file": "[GAME]\\c.txt",
             "contents": [{"start_offset": 4, "text": "hi", "replace": true}]}
        ]"#;
        let actions: Vec<ModAction> = serde_json::from_str(raw).unwrap();
        assert_eq!(actions[0].group(), ActionGroup::MoveOne);
        assert_eq!(actions[1].group(), ActionGroup::Write);
        assert_eq!(actions[1].disabled.as_deref(), Some("!hd"));
    }

    #[test]
    fn group_order_matches_execution_order() {
        let mut sorted = ActionGroup::ORDER.to_vec();
        sorted.sort();
        assert_eq!(sorted, ActionGroup::ORDER.to_vec());
        assert_eq!(ActionGroup::ORDER.first(), Some(&ActionGroup::Extract));
        assert_eq!(ActionGroup::ORDER.last(), Some(&ActionGroup::DeleteMany));
    }

    #[test]
    fn content_block_ranges() {
        let insert = ContentBlock {
            start_offset: 3,
            end_offset: None,
            replace: false,
            text: Some("abc".to_string()),
            data_file: None,
        };
        assert_eq!(insert.range(3), (3, 3));
        let replace = ContentBlock {
            replace: true,
            ..insert.clone()
        };
        assert_eq!(replace.range(3), (3, 6));
        let explicit = ContentBlock {
            end_offset: Some(10),
            ..insert
        };
        assert_eq!(explicit.range(3), (3, 10));
    }

    #[test]
    fn disabled_predicate_reads_settings() {
        let mut settings = BTreeMap::new();
        settings.insert("hd".to_string(), true);
        let mut action = ModAction::new(Operation::DeleteFiles {
            target_files: vec!["[GAME]\\a".to_string()],
        });
        assert!(!action.is_disabled(&settings));
        action.disabled = Some("hd".to_string());
        assert!(action.is_disabled(&settings));
        action.disabled = Some("!hd".to_string());
        assert!(!action.is_disabled(&settings));
        action.disabled = Some("!missing".to_string());
        assert!(action.is_disabled(&settings));
    }

    #[test]
    fn validation_flags_errors_and_warnings() {
        let bad = ModAction::new(Operation::CopyFiles {
            target_path: "[MOD]\\data".to_string(),
            destination_path: "[GAME]\\..\\outside".to_string(),
            file_filter: Some("(".to_string()),
        });
        let issues = bad.validate(ActionContext::IntegrationSetup);
        assert_eq!(
            issues
                .iter()
                .filter(|issue| issue.severity == ValidationSeverity::Error)
                .count(),
            3
        );

        let empty = ModAction::new(Operation::DeleteFiles {
            target_files: Vec::new(),
        });
        let issues = empty.validate(ActionContext::Mod);
        assert!(!has_errors(&issues));
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn auto_mapped_actions_cannot_recurse() {
        let action = ModAction::new(Operation::UnzipFile {
            target_file: "[GAME]\\a.zip".to_string(),
            destination: None,
            delete_on_complete: false,
            auto_mapping: true,
        });
        assert!(!has_errors(&action.validate(ActionContext::Mod)));
        assert!(has_errors(&action.validate(ActionContext::AutoMapping)));
    }
}
