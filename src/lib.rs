//! Transactional file-installation engine for game mod packages.
//!
//! Mods describe their changes as typed actions over virtual paths. The
//! [`Installer`] applies them to a game folder in a fixed group order,
//! records every change in a [`ModificationLedger`], refuses changes that
//! collide with another mod's, and can undo everything it did.

pub mod actions;
pub mod archive;
pub mod backup;
pub mod collision;
pub mod config;
pub mod delta;
pub mod error;
pub mod install;
pub mod ledger;
pub mod offset_writer;
pub mod package;
pub mod progress;
pub mod tools;
pub mod vpath;

pub use actions::{ActionGroup, ContentBlock, ModAction, Operation, ValidationIssue};
pub use backup::BackupStore;
pub use collision::{CollisionSeverity, ModCollision};
pub use config::EngineConfig;
pub use delta::{PatchCodec, SpliceDelta};
pub use error::{EngineError, PathError, WriteError};
pub use install::{InstallResult, InstallationStatus, Installer, RevertReport};
pub use ledger::{FileModification, ModificationLedger, ModificationType};
pub use offset_writer::{ByteOffsetWriter, WriteRecord};
pub use package::{load_json, AutoMapping, Integration, ModPackage};
pub use progress::{InstallProgress, ProgressCallback, ProgressTracker};
pub use tools::{BinaryExtractor, CommandDecompiler, CommandExtractor, Decompiler};
pub use vpath::{PathRoot, PathScope, VirtualPath};
