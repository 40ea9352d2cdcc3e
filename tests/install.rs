use modweave::{
    archive, AutoMapping, BinaryExtractor, CollisionSeverity, ContentBlock, Decompiler,
    EngineConfig, InstallProgress, InstallationStatus, Installer, Integration, ModAction,
    ModPackage, ModificationLedger, ModificationType, Operation,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tempfile::TempDir;
use walkdir::WalkDir;

struct Fixture {
    _dir: TempDir,
    game: PathBuf,
    cache: PathBuf,
    backups: PathBuf,
    config: EngineConfig,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let game = dir.path().join("game");
    let cache = dir.path().join("cache");
    let backups = dir.path().join("backups");
    fs::create_dir_all(&game).unwrap();
    fs::create_dir_all(&cache).unwrap();
    let config = EngineConfig::new(&game, &dir.path().join("temp")).with_backup_dir(&backups);
    Fixture {
        _dir: dir,
        game,
        cache,
        backups,
        config,
    }
}

impl Fixture {
    fn game_file(&self, relative: &str, contents: &str) -> PathBuf {
        write_file(&self.game.join(relative), contents)
    }

    fn mod_package(&self, id: &str, actions: Vec<ModAction>) -> ModPackage {
        let folder = self.cache.join(id);
        fs::create_dir_all(folder.join("resources")).unwrap();
        ModPackage::new(id, &folder, actions)
    }

    fn mod_file(&self, id: &str, relative: &str, contents: &str) -> PathBuf {
        write_file(&self.cache.join(id).join("resources").join(relative), contents)
    }

    fn installer(&self) -> Installer {
        Installer::new(self.config.clone())
    }

    fn backup_files(&self, extension: &str) -> usize {
        if !self.backups.exists() {
            return 0;
        }
        WalkDir::new(&self.backups)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.path().extension().and_then(|ext| ext.to_str()) == Some(extension)
            })
            .count()
    }
}

fn write_file(path: &Path, contents: &str) -> PathBuf {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
    path.to_path_buf()
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

fn move_file(from: &str, to: &str) -> ModAction {
    ModAction::new(Operation::MoveFile {
        target_file: from.to_string(),
        destination_path: to.to_string(),
    })
}

fn copy_file(from: &str, to: &str) -> ModAction {
    ModAction::new(Operation::CopyFile {
        target_file: from.to_string(),
        destination_path: to.to_string(),
    })
}

fn insert_text(target: &str, offset: i64, text: &str) -> ModAction {
    ModAction::new(Operation::WriteToFile {
        target_file: target.to_string(),
        contents: vec![ContentBlock {
            start_offset: offset,
            end_offset: None,
            replace: false,
            text: Some(text.to_string()),
            data_file: None,
        }],
    })
}

fn text_block(start: i64, end: Option<i64>, text: &str) -> ContentBlock {
    ContentBlock {
        start_offset: start,
        end_offset: end,
        replace: false,
        text: Some(text.to_string()),
        data_file: None,
    }
}

fn write_blocks(target: &str, contents: Vec<ContentBlock>) -> ModAction {
    ModAction::new(Operation::WriteToFile {
        target_file: target.to_string(),
        contents,
    })
}

#[derive(Default)]
struct StubExtractor {
    calls: AtomicUsize,
}

impl BinaryExtractor for StubExtractor {
    fn extract(
        &self,
        file: &Path,
        _script: Option<&Path>,
        out_dir: &Path,
    ) -> anyhow::Result<Vec<PathBuf>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stem = file.file_stem().unwrap().to_string_lossy().into_owned();
        let out = out_dir.join(format!("{stem}.txt"));
        fs::write(&out, fs::read(file)?)?;
        Ok(vec![out])
    }
}

struct StubDecompiler;

impl Decompiler for StubDecompiler {
    fn decompile(&self, file: &Path, out_dir: &Path) -> anyhow::Result<PathBuf> {
        let stem = file.file_stem().unwrap().to_string_lossy().into_owned();
        let out = out_dir.join(format!("{stem}.src"));
        fs::write(&out, format!("decompiled {}", read(file)))?;
        Ok(out)
    }
}

#[test]
fn identical_moves_from_two_mods_succeed() {
    let fx = fixture();
    let source = fx.game_file("resource1.txt", "shared");
    let mods = vec![
        fx.mod_package(
            "mod1",
            vec![move_file(r"[GAME]\resource1.txt", r"[GAME]\resource3.txt")],
        ),
        fx.mod_package(
            "mod2",
            vec![move_file(r"[GAME]\resource1.txt", r"[GAME]\resource3.txt")],
        ),
    ];

    let result = fx.installer().apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::Success);
    assert!(result.collisions.is_empty());
    assert!(!source.exists());
    assert_eq!(read(&fx.game.join("resource3.txt")), "shared");
    assert!(result
        .ledger
        .has_modification(&source, ModificationType::MOVED));
}

#[test]
fn moves_of_different_files_onto_one_destination_conflict() {
    let fx = fixture();
    let first = fx.game_file("resource1.txt", "one");
    let second = fx.game_file("resource2.txt", "two");
    let dest = fx.game.join("resource3.txt");
    let mods = vec![
        fx.mod_package(
            "mod1",
            vec![move_file(r"[GAME]\resource1.txt", r"[GAME]\resource3.txt")],
        ),
        fx.mod_package(
            "mod2",
            vec![move_file(r"[GAME]\resource2.txt", r"[GAME]\resource3.txt")],
        ),
    ];

    let result = fx.installer().apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::UnresolvableConflict);
    assert_eq!(result.collisions.len(), 1);
    let collision = &result.collisions[0];
    assert_eq!(collision.mod_id, "mod1");
    assert_eq!(collision.severity, CollisionSeverity::Clash);
    assert!(collision
        .description
        .starts_with("Mod collision detected while installing mod (mod2)"));
    assert!(collision
        .description
        .ends_with("(conflicting mod - mod1)"));

    // The retry without mod2 is what is left on disk.
    assert!(!first.exists());
    assert_eq!(read(&dest), "one");
    assert_eq!(read(&second), "two");
    assert!(result
        .ledger
        .modifications(Some("mod2"), None, None)
        .next()
        .is_none());
}

#[test]
fn deleting_a_missing_file_is_a_no_op() {
    let fx = fixture();
    let mods = vec![fx.mod_package(
        "mod1",
        vec![ModAction::new(Operation::DeleteFiles {
            target_files: vec![r"[GAME]\not-there.txt".to_string()],
        })],
    )];

    let result = fx.installer().apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::Success);
    assert!(result.ledger.is_empty());
}

#[test]
fn editing_a_reserved_file_keeps_one_backup_and_one_patch() {
    let fx = fixture();
    let target = fx.game_file("config.ini", "hello world");
    let mods = vec![fx.mod_package("mod1", vec![insert_text(r"[GAME]\config.ini", 5, ",")])];
    let installer = fx.installer();

    let result = installer.apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::Success);
    assert_eq!(read(&target), "hello, world");
    assert_eq!(fx.backup_files("backup"), 1);
    assert_eq!(fx.backup_files("patch1"), 1);
    assert!(result.ledger.is_reserved(&target));

    let removed = installer.remove_all_changes(&result.ledger);
    assert_eq!(removed.status, InstallationStatus::Success);
    assert!(removed.ledger.is_empty());
    assert_eq!(read(&target), "hello world");
    assert_eq!(fx.backup_files("backup"), 0);
}

#[test]
fn several_edits_restore_to_the_original_bytes() {
    let fx = fixture();
    let target = fx.game_file("settings.cfg", "0123456789");
    let mods = vec![
        fx.mod_package("mod1", vec![insert_text(r"[GAME]\settings.cfg", 2, "AB")]),
        fx.mod_package("mod2", vec![insert_text(r"[GAME]\settings.cfg", 7, "CD")]),
    ];
    let installer = fx.installer();

    let result = installer.apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::Success);
    assert_eq!(read(&target), "01AB23456CD789");
    assert_eq!(fx.backup_files("patch1"), 1);
    assert_eq!(fx.backup_files("patch2"), 1);

    installer.remove_all_changes(&result.ledger);
    assert_eq!(read(&target), "0123456789");
}

#[test]
fn fault_in_last_mod_rolls_back_to_the_others() {
    let fx = fixture();
    fx.mod_file("mod1", "a.txt", "from mod1");
    let mods = vec![
        fx.mod_package("mod1", vec![copy_file(r"[MOD]\a.txt", r"[GAME]\a.txt")]),
        fx.mod_package("mod2", vec![copy_file(r"[MOD]\missing.txt", r"[GAME]\b.txt")]),
    ];

    let result = fx.installer().apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::RolledBackError);
    assert_eq!(read(&fx.game.join("a.txt")), "from mod1");
    assert!(!fx.game.join("b.txt").exists());
    assert!(result
        .ledger
        .iter()
        .all(|(_, modification)| modification.mod_id == "mod1"));
}

#[test]
fn failed_block_in_a_multi_block_edit_restores_the_file() {
    let fx = fixture();
    let target = fx.game_file("settings.cfg", "0123456789");
    let mods = vec![fx.mod_package(
        "mod1",
        vec![write_blocks(
            r"[GAME]\settings.cfg",
            vec![text_block(2, None, "AB"), text_block(50, None, "ZZ")],
        )],
    )];

    let result = fx.installer().apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::RolledBackError);
    assert_eq!(read(&target), "0123456789");
    assert!(result.ledger.is_empty());
    assert_eq!(fx.backup_files("backup"), 0);
}

#[test]
fn edit_overlapping_another_mod_is_caught_behind_an_own_edit() {
    let fx = fixture();
    let target = fx.game_file("s.cfg", "0123456789abcdef");
    let mods = vec![
        fx.mod_package(
            "mod1",
            vec![write_blocks(r"[GAME]\s.cfg", vec![text_block(2, Some(6), "WXYZ")])],
        ),
        fx.mod_package(
            "mod2",
            vec![
                write_blocks(r"[GAME]\s.cfg", vec![text_block(10, Some(12), "QR")]),
                write_blocks(r"[GAME]\s.cfg", vec![text_block(3, Some(5), "!!")]),
            ],
        ),
    ];

    let result = fx.installer().apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::UnresolvableConflict);
    assert_eq!(result.collisions.len(), 1);
    assert_eq!(result.collisions[0].mod_id, "mod1");
    assert!(result.collisions[0].description.contains("overlapping"));
    assert_eq!(read(&target), "01WXYZ6789abcdef");
    assert!(result
        .ledger
        .modifications(Some("mod2"), None, None)
        .next()
        .is_none());
}

#[test]
fn failure_in_both_tiers_discards_the_session() {
    let fx = fixture();
    let config = fx.game_file("config.ini", "original");
    let mods = vec![
        fx.mod_package(
            "mod1",
            vec![
                insert_text(r"[GAME]\config.ini", 0, "patched "),
                move_file(r"[GAME]\gone.txt", r"[GAME]\moved.txt"),
            ],
        ),
        fx.mod_package("mod2", vec![copy_file(r"[MOD]\missing.txt", r"[GAME]\b.txt")]),
    ];

    let result = fx.installer().apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::FatalError);
    assert!(result.ledger.is_empty());
    assert_eq!(read(&config), "original");
    assert!(!fx.game.join("b.txt").exists());
    assert!(!fx.backups.join("mods").exists());
    assert_eq!(fx.backup_files("backup"), 0);
}

#[test]
fn failed_setup_pass_is_rolled_back() {
    let fx = fixture();
    let launcher = fx.game_file("launcher.cfg", "launch");
    let mut integration = Integration::new("game", &fx.cache.join("integration"));
    integration
        .setup_actions
        .push(insert_text(r"[GAME]\launcher.cfg", 6, " --modded"));
    integration
        .setup_actions
        .push(move_file(r"[GAME]\gone.dll", r"[GAME]\loader.dll"));
    let installer = fx.installer().with_integration(integration);

    let result = installer.apply_setup_actions(None);

    assert_eq!(result.status, InstallationStatus::RolledBackError);
    assert!(result.ledger.is_empty());
    assert_eq!(read(&launcher), "launch");
    assert!(!fx.game.join("loader.dll").exists());
    assert_eq!(fx.backup_files("backup"), 0);
}

#[test]
fn invalid_actions_leave_the_tree_untouched() {
    let fx = fixture();
    let target = fx.game_file("keep.txt", "keep");
    let mods = vec![fx.mod_package(
        "mod1",
        vec![
            ModAction::new(Operation::DeleteFiles {
                target_files: vec![r"[GAME]\keep.txt".to_string()],
            }),
            copy_file(r"[MOD]\a.txt", r"[GAME]\..\..\outside.txt"),
        ],
    )];

    let result = fx.installer().apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::InvalidActions);
    assert!(!result.issues.is_empty());
    assert!(result.ledger.is_empty());
    assert_eq!(read(&target), "keep");
}

#[test]
fn reapplying_reverts_the_previous_ledger_first() {
    let fx = fixture();
    fx.mod_file("mod1", "a.txt", "a");
    let config = fx.game_file("config.ini", "original");
    let installer = fx.installer();
    let mods = vec![fx.mod_package(
        "mod1",
        vec![
            copy_file(r"[MOD]\a.txt", r"[GAME]\added\a.txt"),
            insert_text(r"[GAME]\config.ini", 0, "patched "),
        ],
    )];

    let first = installer.apply_changes(&mods, None);
    assert_eq!(first.status, InstallationStatus::Success);
    assert_eq!(read(&config), "patched original");

    let ledger_path = fx.cache.join("ledger.json");
    first.ledger.save(&ledger_path).unwrap();
    let stored = ModificationLedger::load(&ledger_path).unwrap();
    assert_eq!(stored, first.ledger);

    // Same mod list again: the edit is not applied twice.
    let second = installer.apply_changes(&mods, Some(&stored));
    assert_eq!(second.status, InstallationStatus::Success);
    assert_eq!(read(&config), "patched original");

    // Empty mod list: everything goes back.
    let third = installer.apply_changes(&[], Some(&second.ledger));
    assert_eq!(third.status, InstallationStatus::Success);
    assert!(third.ledger.is_empty());
    assert_eq!(read(&config), "original");
    assert!(!fx.game.join("added").exists());
}

#[test]
fn extraction_fans_out_and_triggers_auto_mapping() {
    let mut fx = fixture();
    fx.config.max_extraction_batches = 2;
    for name in ["a", "b", "c"] {
        fx.game_file(&format!("Data/{name}.bin"), name);
    }
    let mut integration = Integration::new("game", &fx.cache.join("integration"));
    integration.auto_mappings.push(AutoMapping {
        target_path: r"[GAME]\Data".to_string(),
        file_filter: r"^b\.txt$".to_string(),
        actions: vec![copy_file(r"[GAME]\Data\b.txt", r"[GAME]\Mapped\b.txt")],
    });
    let extractor = Arc::new(StubExtractor::default());
    let installer = fx
        .installer()
        .with_integration(integration)
        .with_extractor(extractor.clone());
    let mods = vec![fx.mod_package(
        "mod1",
        vec![ModAction::new(Operation::ExtractBinary {
            target_files: vec![
                r"[GAME]\Data\a.bin".to_string(),
                r"[GAME]\Data\b.bin".to_string(),
                r"[GAME]\Data\c.bin".to_string(),
                r"[GAME]\Data\a.bin".to_string(),
            ],
            script: None,
            destination: None,
            delete_on_complete: true,
            auto_mapping: true,
        })],
    )];

    let result = installer.apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::Success);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
    for name in ["a", "b", "c"] {
        assert_eq!(read(&fx.game.join("Data").join(format!("{name}.txt"))), name);
        assert!(!fx.game.join("Data").join(format!("{name}.bin")).exists());
    }
    assert_eq!(read(&fx.game.join("Mapped").join("b.txt")), "b");
    assert!(!fx.game.join("Mapped").join("a.txt").exists());

    installer.remove_all_changes(&result.ledger);
    assert_eq!(read(&fx.game.join("Data").join("a.bin")), "a");
    assert!(!fx.game.join("Data").join("a.txt").exists());
    assert!(!fx.game.join("Mapped").exists());
}

#[test]
fn decompiled_output_lands_next_to_the_input() {
    let fx = fixture();
    fx.game_file("Scripts/code.bin", "bytecode");
    let installer = fx.installer().with_decompiler(Arc::new(StubDecompiler));
    let mods = vec![fx.mod_package(
        "mod1",
        vec![ModAction::new(Operation::Decompile {
            target_files: vec![r"[GAME]\Scripts\code.bin".to_string()],
            destination: None,
        })],
    )];

    let result = installer.apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::Success);
    let output = fx.game.join("Scripts").join("code.src");
    assert_eq!(read(&output), "decompiled bytecode");
    assert!(result
        .ledger
        .has_modification(&output, ModificationType::ADDED));
}

#[test]
fn unzip_and_zip_round_out_the_tree() {
    let fx = fixture();
    let loose = fx.mod_file("mod1", "loose/readme.txt", "readme");
    let archive_path = fx.cache.join("mod1").join("resources").join("pack.zip");
    archive::zip_files(&[("Textures/wall.dds".to_string(), loose)], &archive_path).unwrap();
    let first = fx.game_file("Data/one.txt", "1");
    let second = fx.game_file("Data/two.txt", "2");
    let installer = fx.installer();
    let mods = vec![fx.mod_package(
        "mod1",
        vec![
            ModAction::new(Operation::UnzipFile {
                target_file: r"[MOD]\pack.zip".to_string(),
                destination: Some(r"[GAME]\Data".to_string()),
                delete_on_complete: false,
                auto_mapping: false,
            }),
            ModAction::new(Operation::ZipFiles {
                target_files: vec![
                    r"[GAME]\Data\one.txt".to_string(),
                    r"[GAME]\Data\two.txt".to_string(),
                ],
                destination_path: r"[GAME]\bundle.zip".to_string(),
                delete_on_complete: true,
            }),
        ],
    )];

    let result = installer.apply_changes(&mods, None);

    assert_eq!(result.status, InstallationStatus::Success);
    let unpacked = fx.game.join("Data").join("Textures").join("wall.dds");
    assert_eq!(read(&unpacked), "readme");
    assert!(fx.game.join("bundle.zip").is_file());
    assert!(!first.exists());
    assert!(!second.exists());
    assert!(result
        .ledger
        .has_modification(&first, ModificationType::DELETED));

    let removed = installer.remove_all_changes(&result.ledger);
    assert_eq!(removed.status, InstallationStatus::Success);
    assert_eq!(read(&first), "1");
    assert_eq!(read(&second), "2");
    assert!(!unpacked.exists());
    assert!(!fx.game.join("bundle.zip").exists());
}

#[test]
fn setup_actions_are_recorded_under_the_integration() {
    let fx = fixture();
    let integration_folder = fx.cache.join("integration");
    write_file(
        &integration_folder.join("resources").join("loader.dll"),
        "loader",
    );
    let mut integration = Integration::new("game", &integration_folder);
    integration.setup_actions.push(copy_file(
        r"[INTEGRATION]\loader.dll",
        r"[GAME]\loader.dll",
    ));
    let installer = fx.installer().with_integration(integration);

    let result = installer.apply_setup_actions(None);

    assert_eq!(result.status, InstallationStatus::Success);
    let loader = fx.game.join("loader.dll");
    assert_eq!(read(&loader), "loader");
    assert!(result
        .ledger
        .iter()
        .all(|(_, modification)| modification.mod_id == "game"));

    let removed = installer.remove_setup_actions(&result.ledger);
    assert_eq!(removed.status, InstallationStatus::Success);
    assert!(!loader.exists());
}

#[test]
fn setup_actions_cannot_reference_a_mod() {
    let fx = fixture();
    let mut integration = Integration::new("game", &fx.cache.join("integration"));
    integration
        .setup_actions
        .push(copy_file(r"[MOD]\a.txt", r"[GAME]\a.txt"));
    let installer = fx.installer().with_integration(integration);

    let result = installer.apply_setup_actions(None);

    assert_eq!(result.status, InstallationStatus::InvalidActions);
    assert!(!fx.game.join("a.txt").exists());
}

#[test]
fn background_apply_reports_progress() {
    let fx = fixture();
    fx.mod_file("mod1", "a.txt", "a");
    fx.mod_file("mod1", "b.txt", "b");
    let seen: Arc<Mutex<Vec<InstallProgress>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let installer = Arc::new(fx.installer().with_progress(Arc::new(move |progress: InstallProgress| {
        sink.lock().unwrap().push(progress);
    })));
    let mods = vec![fx.mod_package(
        "mod1",
        vec![
            copy_file(r"[MOD]\a.txt", r"[GAME]\a.txt"),
            copy_file(r"[MOD]\b.txt", r"[GAME]\b.txt"),
        ],
    )];

    let handle = installer.apply_changes_in_background(mods, None);
    let result = handle.join().unwrap();

    assert_eq!(result.status, InstallationStatus::Success);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen.last().map(|progress| progress.completed), Some(2));
    assert!(seen.iter().all(|progress| progress.total == 2));
}
