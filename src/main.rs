mod cli;

use anyhow::Result;
use std::process::ExitCode;

fn main() -> Result<ExitCode> {
    let cli = cli::parse()?;
    tracing_subscriber::fmt()
        .with_max_level(cli.global.level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if cli::run(cli)? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
