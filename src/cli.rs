use anyhow::{bail, Context, Result};
use modweave::{
    load_json, EngineConfig, InstallProgress, InstallResult, Installer, Integration,
    ModPackage, ModificationLedger,
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::Level;

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

pub struct GlobalOptions {
    pub level: Level,
    format: OutputFormat,
}

enum CliCommand {
    Apply(PassFiles),
    Remove(PassFiles),
    Setup(PassFiles),
    Unsetup(PassFiles),
    Ledger { ledger: Option<PathBuf> },
    Help,
    Version,
}

#[derive(Default)]
struct PassFiles {
    config: Option<PathBuf>,
    mods: Option<PathBuf>,
    integration: Option<PathBuf>,
    ledger: Option<PathBuf>,
}

impl PassFiles {
    fn config(&self) -> Result<EngineConfig> {
        let Some(path) = &self.config else {
            bail!("--config is required");
        };
        EngineConfig::load(path)
    }

    fn integration(&self) -> Result<Option<Integration>> {
        self.integration
            .as_deref()
            .map(load_json::<Integration>)
            .transpose()
    }

    fn ledger_path(&self, default_name: &str) -> Result<PathBuf> {
        match &self.ledger {
            Some(path) => Ok(path.clone()),
            None => Ok(EngineConfig::default_data_dir()?.join(default_name)),
        }
    }
}

pub struct Cli {
    pub global: GlobalOptions,
    command: CliCommand,
}

pub fn parse() -> Result<Cli> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    parse_args(&args)
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let (global, tokens) = parse_global_options(args)?;
    let Some(head) = tokens.first() else {
        return Ok(Cli {
            global,
            command: CliCommand::Help,
        });
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    let command = match head.as_str() {
        "apply" => CliCommand::Apply(parse_pass_files(rest)?),
        "remove" => CliCommand::Remove(parse_pass_files(rest)?),
        "setup" => CliCommand::Setup(parse_pass_files(rest)?),
        "unsetup" => CliCommand::Unsetup(parse_pass_files(rest)?),
        "ledger" => CliCommand::Ledger {
            ledger: parse_pass_files(rest)?.ledger,
        },
        "help" | "--help" | "-h" => CliCommand::Help,
        "version" | "--version" | "-V" => CliCommand::Version,
        other => bail!("Unknown command: {other}"),
    };
    Ok(Cli { global, command })
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut level = Level::INFO;
    let mut format = OutputFormat::Text;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--verbose" | "-v" => level = Level::DEBUG,
            "--quiet" | "-q" => level = Level::WARN,
            "--format" => {
                let Some(value) = iter.next() else {
                    bail!("--format requires a value");
                };
                format = OutputFormat::parse(value)
                    .with_context(|| format!("Unknown format: {value}"))?;
            }
            _ => {
                if let Some(value) = arg.strip_prefix("--format=") {
                    format = OutputFormat::parse(value)
                        .with_context(|| format!("Unknown format: {value}"))?;
                } else {
                    tokens.push(arg.to_string());
                }
            }
        }
    }
    Ok((GlobalOptions { level, format }, tokens))
}

fn parse_pass_files(args: &[String]) -> Result<PassFiles> {
    let mut files = PassFiles::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let slot = match arg.as_str() {
            "--config" => &mut files.config,
            "--mods" => &mut files.mods,
            "--integration" => &mut files.integration,
            "--ledger" => &mut files.ledger,
            other => bail!("Unknown option: {other}"),
        };
        let Some(value) = iter.next() else {
            bail!("{arg} requires a path");
        };
        *slot = Some(PathBuf::from(value));
    }
    Ok(files)
}

pub fn run(cli: Cli) -> Result<bool> {
    let format = cli.global.format;
    match cli.command {
        CliCommand::Help => {
            print_help();
            Ok(true)
        }
        CliCommand::Version => {
            println!("modweave v{}", env!("CARGO_PKG_VERSION"));
            Ok(true)
        }
        CliCommand::Apply(files) => {
            let Some(mods_path) = &files.mods else {
                bail!("--mods is required");
            };
            let mods: Vec<ModPackage> = load_json(mods_path)?;
            let installer = build_installer(&files, format)?;
            let ledger_path = files.ledger_path("ledger.json")?;
            let previous = ModificationLedger::load(&ledger_path)?;
            let result = installer.apply_changes(&mods, Some(&previous));
            finish(&result, &ledger_path, format)
        }
        CliCommand::Remove(files) => {
            let installer = build_installer(&files, format)?;
            let ledger_path = files.ledger_path("ledger.json")?;
            let ledger = ModificationLedger::load(&ledger_path)?;
            let result = installer.remove_all_changes(&ledger);
            finish(&result, &ledger_path, format)
        }
        CliCommand::Setup(files) => {
            let installer = build_installer(&files, format)?;
            if installer.integration().is_none() {
                bail!("--integration is required");
            }
            let ledger_path = files.ledger_path("setup-ledger.json")?;
            let previous = ModificationLedger::load(&ledger_path)?;
            let result = installer.apply_setup_actions(Some(&previous));
            finish(&result, &ledger_path, format)
        }
        CliCommand::Unsetup(files) => {
            let installer = build_installer(&files, format)?;
            let ledger_path = files.ledger_path("setup-ledger.json")?;
            let ledger = ModificationLedger::load(&ledger_path)?;
            let result = installer.remove_setup_actions(&ledger);
            finish(&result, &ledger_path, format)
        }
        CliCommand::Ledger { ledger } => {
            let path = match ledger {
                Some(path) => path,
                None => EngineConfig::default_data_dir()?.join("ledger.json"),
            };
            print_ledger(&ModificationLedger::load(&path)?, format)?;
            Ok(true)
        }
    }
}

fn build_installer(files: &PassFiles, format: OutputFormat) -> Result<Installer> {
    let config = files.config()?;
    let mut installer = Installer::new(config);
    if let Some(integration) = files.integration()? {
        installer = installer.with_integration(integration);
    }
    if format == OutputFormat::Text {
        installer = installer.with_progress(Arc::new(|progress: InstallProgress| {
            eprintln!(
                "[{:>3.0}%] {}",
                progress.fraction() * 100.0,
                progress.detail.as_deref().unwrap_or("")
            );
        }));
    }
    Ok(installer)
}

/// Persists the returned ledger and prints the outcome. Returns whether the
/// pass succeeded.
fn finish(result: &InstallResult, ledger_path: &Path, format: OutputFormat) -> Result<bool> {
    result.ledger.save(ledger_path)?;
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        OutputFormat::Text => {
            println!("Status: {}", result.status.label());
            println!("Ledger: {} ({} entries)", ledger_path.display(), result.ledger.len());
            for issue in &result.issues {
                println!("  {:?}: {}", issue.severity, issue.message);
            }
            for collision in &result.collisions {
                println!("  {}", collision.description);
            }
        }
    }
    Ok(result.status.is_success())
}

#[derive(Serialize)]
struct LedgerLine<'a> {
    file: String,
    kind: &'a str,
    mod_id: &'a str,
    reserved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination: Option<String>,
}

fn print_ledger(ledger: &ModificationLedger, format: OutputFormat) -> Result<()> {
    let lines: Vec<LedgerLine<'_>> = ledger
        .iter()
        .map(|(file, modification)| LedgerLine {
            file: file.display().to_string(),
            kind: modification.kind.label(),
            mod_id: &modification.mod_id,
            reserved: modification.reserved_file,
            destination: modification
                .destination_path
                .as_ref()
                .map(|path| path.display().to_string()),
        })
        .collect();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&lines)?),
        OutputFormat::Text => {
            if lines.is_empty() {
                println!("Ledger is empty.");
            }
            for line in &lines {
                let reserved = if line.reserved { " (reserved)" } else { "" };
                match &line.destination {
                    Some(dest) => println!(
                        "{} {} -> {} [{}]{}",
                        line.kind, line.file, dest, line.mod_id, reserved
                    ),
                    None => println!("{} {} [{}]{}", line.kind, line.file, line.mod_id, reserved),
                }
            }
        }
    }
    Ok(())
}

fn print_help() {
    println!("modweave v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  modweave apply --config <file> --mods <file> [--integration <file>] [--ledger <file>]");
    println!("  modweave remove --config <file> [--ledger <file>]");
    println!("  modweave setup --config <file> --integration <file> [--ledger <file>]");
    println!("  modweave unsetup --config <file> [--integration <file>] [--ledger <file>]");
    println!("  modweave ledger [--ledger <file>]");
    println!();
    println!("Global options:");
    println!("  --format <json|text>            Output format");
    println!("  -v, --verbose                   Debug logging");
    println!("  -q, --quiet                     Warnings and errors only");
    println!("  -h, --help                      Show help");
    println!("  -V, --version                   Show version");
}
