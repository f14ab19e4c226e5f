mod cli;
mod core;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;

use cli::Cli;
use core::{BackupConfig, DockerRuntime, VolumeBackup};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BackupConfig::default();

    std::fs::create_dir_all(&config.backup_root).with_context(|| {
        format!(
            "Failed to create backup directory {}",
            config.backup_root.display()
        )
    })?;

    let runtime = DockerRuntime::connect()?;
    let backup = VolumeBackup::new(runtime, config);
    let report = backup.backup_volumes(&cli.container).await?;

    for warning in &report.warnings {
        eprintln!("Warning: {}", warning);
    }
    println!(
        "Backed up {} volume(s) from {}",
        report.archived.len(),
        cli.container
    );

    Ok(())
}
