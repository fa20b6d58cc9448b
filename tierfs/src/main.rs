use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tierfs::config::Config;
use tierfs::vfs::demo;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tierfs", version, about = "tierfs cache engine tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a YAML config file and print it with defaults filled in
    CheckConfig { file: PathBuf },
    /// Write, flush and read back a file through the full cache stack
    Demo {
        /// Working directory for objects and the disk cache
        dir: PathBuf,
        /// Use this config instead of a local one under `dir`
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { file } => {
            let cfg = Config::from_file(&file)
                .with_context(|| format!("load config {}", file.display()))?;
            print!("{}", cfg.to_yaml()?);
        }
        Commands::Demo { dir, config } => {
            let cfg = match config {
                Some(path) => Config::from_file(&path)
                    .with_context(|| format!("load config {}", path.display()))?,
                None => demo::local_config(&dir),
            };
            let report = demo::e2e_demo(&cfg).await.context("demo failed")?;
            println!(
                "demo: OK (inode {}, {} bytes, {} descriptors, {} bytes in disk cache)",
                report.inode_id, report.bytes, report.descriptors, report.disk_cache_bytes
            );
        }
    }

    Ok(())
}
