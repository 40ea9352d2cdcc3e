//! The install engine. A pass validates every action, snapshots the target
//! tree, runs the actions group by group and hands back the ledger of what
//! changed. A failed pass is reverted and retried once without the last
//! mod; a second failure wipes the session.

mod execute;
mod revert;
mod session;

pub use revert::RevertReport;

use crate::{
    actions::{has_errors, ActionGroup, ValidationIssue, ValidationSeverity},
    collision::ModCollision,
    config::EngineConfig,
    delta::{PatchCodec, SpliceDelta},
    error::{EngineError, PathError},
    ledger::ModificationLedger,
    package::{Integration, ModPackage},
    progress::ProgressCallback,
    tools::{BinaryExtractor, CommandDecompiler, CommandExtractor, Decompiler},
    vpath::PathScope,
};
use serde::{Deserialize, Serialize};
use session::{ActionScope, PassKind, PassUnit, Session};
use std::{
    collections::BTreeMap,
    fs,
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallationStatus {
    Success,
    InvalidActions,
    UnresolvableConflict,
    ResolvableConflict,
    RolledBackError,
    FatalError,
}

impl InstallationStatus {
    pub fn label(self) -> &'static str {
        match self {
            InstallationStatus::Success => "success",
            InstallationStatus::InvalidActions => "invalid actions",
            InstallationStatus::UnresolvableConflict => "unresolvable conflict",
            InstallationStatus::ResolvableConflict => "resolvable conflict",
            InstallationStatus::RolledBackError => "rolled back",
            InstallationStatus::FatalError => "fatal error",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            InstallationStatus::Success | InstallationStatus::ResolvableConflict
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallResult {
    pub status: InstallationStatus,
    pub collisions: Vec<ModCollision>,
    pub ledger: ModificationLedger,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ValidationIssue>,
}

impl InstallResult {
    fn new(status: InstallationStatus, ledger: ModificationLedger) -> Self {
        Self {
            status,
            collisions: Vec::new(),
            ledger,
            issues: Vec::new(),
        }
    }
}

/// Why a pass stopped early.
#[derive(Debug)]
pub(crate) enum PassError {
    /// A clash was recorded in the session's collision list.
    Conflict,
    Fault(anyhow::Error),
}

impl From<anyhow::Error> for PassError {
    fn from(err: anyhow::Error) -> Self {
        PassError::Fault(err)
    }
}

impl From<PathError> for PassError {
    fn from(err: PathError) -> Self {
        PassError::Fault(err.into())
    }
}

impl From<EngineError> for PassError {
    fn from(err: EngineError) -> Self {
        PassError::Fault(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Conflict,
    Fault,
}

struct PassOutcome {
    ledger: ModificationLedger,
    collisions: Vec<ModCollision>,
    failure: Option<Failure>,
}

pub struct Installer {
    config: EngineConfig,
    integration: Option<Integration>,
    extractor: Arc<dyn BinaryExtractor>,
    decompiler: Arc<dyn Decompiler>,
    codec: Arc<dyn PatchCodec>,
    progress: Option<ProgressCallback>,
}

impl Installer {
    /// Uses the configured command-line tools and the splice codec.
    pub fn new(config: EngineConfig) -> Self {
        let extractor = Arc::new(CommandExtractor {
            tool: config.extractor_path.clone(),
        });
        let decompiler = Arc::new(CommandDecompiler {
            tool: config.decompiler_path.clone(),
        });
        Self {
            config,
            integration: None,
            extractor,
            decompiler,
            codec: Arc::new(SpliceDelta),
            progress: None,
        }
    }

    pub fn with_integration(mut self, integration: Integration) -> Self {
        self.integration = Some(integration);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn BinaryExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_decompiler(mut self, decompiler: Arc<dyn Decompiler>) -> Self {
        self.decompiler = decompiler;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn PatchCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn integration(&self) -> Option<&Integration> {
        self.integration.as_ref()
    }

    /// Applies the complete, ordered mod list. Changes recorded in
    /// `previous` are reverted first so every pass starts from the
    /// pristine tree.
    pub fn apply_changes(
        &self,
        mods: &[ModPackage],
        previous: Option<&ModificationLedger>,
    ) -> InstallResult {
        info!(mods = mods.len(), target = %self.config.target_dir.display(), "applying mods");
        let units: Vec<PassUnit<'_>> = mods
            .iter()
            .map(|package| PassUnit {
                owner: Some(package.id.as_str()),
                record_id: package.id.as_str(),
                mod_cache: Some(package.cache_folder.as_path()),
                actions: package.enabled_actions().collect(),
            })
            .collect();
        self.run(PassKind::Mods, &units, previous)
    }

    /// Runs [`Installer::apply_changes`] on a worker thread.
    pub fn apply_changes_in_background(
        self: &Arc<Self>,
        mods: Vec<ModPackage>,
        previous: Option<ModificationLedger>,
    ) -> JoinHandle<InstallResult> {
        let installer = Arc::clone(self);
        thread::spawn(move || installer.apply_changes(&mods, previous.as_ref()))
    }

    pub fn remove_all_changes(&self, ledger: &ModificationLedger) -> InstallResult {
        info!(entries = ledger.len(), "removing mod changes");
        self.remove(PassKind::Mods, ledger)
    }

    /// Applies the integration's own setup actions. Entries are recorded
    /// under the integration id and kept apart from mod backups.
    pub fn apply_setup_actions(&self, previous: Option<&ModificationLedger>) -> InstallResult {
        let Some(integration) = &self.integration else {
            let mut result = InstallResult::new(
                InstallationStatus::InvalidActions,
                previous.cloned().unwrap_or_default(),
            );
            result.issues.push(ValidationIssue {
                severity: ValidationSeverity::Error,
                message: "no integration configured".to_string(),
            });
            return result;
        };
        info!(integration = %integration.id, "applying integration setup");
        let no_settings = BTreeMap::new();
        let units = vec![PassUnit {
            owner: None,
            record_id: integration.id.as_str(),
            mod_cache: None,
            actions: integration
                .setup_actions
                .iter()
                .filter(|action| !action.is_disabled(&no_settings))
                .collect(),
        }];
        self.run(PassKind::Setup, &units, previous)
    }

    pub fn remove_setup_actions(&self, ledger: &ModificationLedger) -> InstallResult {
        info!(entries = ledger.len(), "removing integration setup");
        self.remove(PassKind::Setup, ledger)
    }

    fn remove(&self, kind: PassKind, ledger: &ModificationLedger) -> InstallResult {
        match self.revert_ledger(kind, ledger) {
            Ok(report) => {
                for warning in &report.warnings {
                    debug!(%warning, "revert warning");
                }
                InstallResult::new(InstallationStatus::Success, ModificationLedger::new())
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "revert failed");
                self.fatal(kind, None, Vec::new())
            }
        }
    }

    fn run(
        &self,
        kind: PassKind,
        units: &[PassUnit<'_>],
        previous: Option<&ModificationLedger>,
    ) -> InstallResult {
        let issues = self.validate(kind, units);
        if has_errors(&issues) {
            for issue in &issues {
                warn!(severity = ?issue.severity, "{}", issue.message);
            }
            let mut result = InstallResult::new(
                InstallationStatus::InvalidActions,
                previous.cloned().unwrap_or_default(),
            );
            result.issues = issues;
            return result;
        }

        if let Some(previous) = previous.filter(|ledger| !ledger.is_empty()) {
            let carried = ModificationLedger::from_previous(previous);
            if let Err(err) = self.revert_ledger(kind, &carried) {
                error!(error = %format!("{err:#}"), "could not revert previous changes");
                return self.fatal(kind, None, Vec::new());
            }
        }

        let mut count = units.len();
        let mut first_failure = None;
        let mut collisions = Vec::new();
        loop {
            let outcome = self.attempt(kind, &units[..count]);
            collisions.extend(outcome.collisions);

            let Some(failure) = outcome.failure else {
                let status = match first_failure {
                    None => InstallationStatus::Success,
                    Some(Failure::Conflict) => InstallationStatus::UnresolvableConflict,
                    Some(Failure::Fault) => InstallationStatus::RolledBackError,
                };
                info!(status = status.label(), entries = outcome.ledger.len(), "install finished");
                return InstallResult {
                    status,
                    collisions,
                    ledger: outcome.ledger,
                    issues,
                };
            };

            if first_failure.is_some() || count == 0 {
                return self.fatal(kind, Some(&outcome.ledger), collisions);
            }
            if let Err(err) = self.revert_ledger(kind, &outcome.ledger) {
                error!(error = %format!("{err:#}"), "rollback failed");
                return self.fatal(kind, None, collisions);
            }
            first_failure = Some(failure);
            count -= 1;
            warn!(mods = count, "pass reverted, retrying without the last mod");
        }
    }

    fn attempt(&self, kind: PassKind, units: &[PassUnit<'_>]) -> PassOutcome {
        let total: usize = units.iter().map(|unit| unit.actions.len()).sum();
        let mut session = match Session::start(&self.config, kind, total, self.progress.clone()) {
            Ok(session) => session,
            Err(err) => {
                error!(error = %format!("{err:#}"), "could not start install pass");
                return PassOutcome {
                    ledger: ModificationLedger::new(),
                    collisions: Vec::new(),
                    failure: Some(Failure::Fault),
                };
            }
        };

        let result = self.execute_units(&mut session, units);
        session.remove_temp();
        let failure = match result {
            Ok(()) => None,
            Err(PassError::Conflict) => {
                warn!(collisions = session.collisions.len(), "install pass hit a mod collision");
                Some(Failure::Conflict)
            }
            Err(PassError::Fault(err)) => {
                error!(error = %format!("{err:#}"), "install pass failed");
                Some(Failure::Fault)
            }
        };
        PassOutcome {
            ledger: session.ledger,
            collisions: session.collisions,
            failure,
        }
    }

    fn execute_units(&self, session: &mut Session, units: &[PassUnit<'_>]) -> Result<(), PassError> {
        let integration_cache = self
            .integration
            .as_ref()
            .map(|integration| integration.cache_folder.as_path());
        for group in ActionGroup::ORDER {
            for unit in units {
                let scope = ActionScope {
                    owner: unit.owner,
                    record_id: unit.record_id,
                    paths: PathScope::new(&self.config.target_dir, unit.mod_cache, integration_cache),
                };
                for action in unit.actions.iter().filter(|action| action.group() == group) {
                    debug!(mod_id = unit.record_id, action = group.label(), "running action");
                    self.execute_action(session, &scope, action, false)?;
                    session
                        .progress
                        .advance(Some(format!("{} ({})", group.label(), unit.record_id)))?;
                }
            }
        }
        Ok(())
    }

    fn validate(&self, kind: PassKind, units: &[PassUnit<'_>]) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for unit in units {
            for action in &unit.actions {
                for mut issue in action.validate(kind.context()) {
                    issue.message = format!("{}: {}", unit.record_id, issue.message);
                    issues.push(issue);
                }
            }
        }
        if let Some(integration) = &self.integration {
            issues.extend(integration.validate_auto_mappings());
        }
        issues
    }

    /// Reverts what it can, drops backups and scratch space, and returns an
    /// empty ledger.
    fn fatal(
        &self,
        kind: PassKind,
        pending: Option<&ModificationLedger>,
        collisions: Vec<ModCollision>,
    ) -> InstallResult {
        if let Some(ledger) = pending {
            if let Err(err) = self.revert_ledger(kind, ledger) {
                error!(error = %format!("{err:#}"), "rollback failed");
            }
        }
        if let Some(store) = self.backup_store(kind) {
            if let Err(err) = store.clear() {
                error!(error = %format!("{err:#}"), "could not remove backups");
            }
        }
        let temp = self.config.temp_dir.join(kind.subdir());
        if temp.exists() {
            if let Err(err) = fs::remove_dir_all(&temp) {
                debug!(error = %err, "temp dir cleanup failed");
            }
        }
        error!("install aborted, session state discarded");
        let mut result = InstallResult::new(InstallationStatus::FatalError, ModificationLedger::new());
        result.collisions = collisions;
        result
    }
}
