use anyhow::{Context, Result, bail};
use bkzip::config::AppConfig;
use bkzip::context::AppContext;
use bkzip::core::archive;
use bkzip::core::{
    BackupRestoreController, ControllerState, Direction, JobRequest, ProgressModel, ProgressView,
    UserCommand,
};
use bkzip::logging::{self, LogConfig};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Parser)]
#[command(name = "bkzip")]
#[command(about = "Back up and restore application data as ZIP archives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./bkzip.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a backup archive to PATH
    Export { path: PathBuf },
    /// Restore the data directory from the archive at PATH
    Import { path: PathBuf },
    /// Validate an archive and print its metadata
    Inspect { path: PathBuf },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    abort_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;
    logging::init(LogConfig::from(&config));

    match cli.command {
        Commands::Export { path } => run_job(config, Direction::Export, path)
            .await
            .context("Export did not complete")?,
        Commands::Import { path } => run_job(config, Direction::Import, path)
            .await
            .context("Import did not complete")?,
        Commands::Inspect { path } => run_inspect(&path)?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

async fn run_job(config: AppConfig, direction: Direction, target: PathBuf) -> Result<()> {
    let ctx = AppContext::new(config);
    let (commands_tx, commands_rx) = mpsc::channel(4);

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if commands_tx.send(UserCommand::RequestExit).await.is_err() {
                break;
            }
        }
    });

    let mut controller = BackupRestoreController::new(ctx, ConsoleView::default());
    let state = controller
        .run(JobRequest { direction, target }, commands_rx)
        .await?;

    match state {
        ControllerState::Completed(outcome) if outcome.is_success() => Ok(()),
        ControllerState::Completed(_) => bail!("{} failed", direction),
        ControllerState::Aborted { worker_stopped, .. } => {
            if !worker_stopped {
                warn!("Worker was still running when the abort timeout expired");
            }
            bail!("{} aborted", direction)
        }
        other => bail!("Unexpected controller state {:?}", other),
    }
}

fn run_inspect(path: &std::path::Path) -> Result<()> {
    let (archive, metadata) = archive::open_backup_file(path)
        .with_context(|| format!("{} is not a usable backup", path.display()))?;

    println!("app:      {} {}", metadata.app_id, metadata.app_version);
    println!("format:   {}", metadata.backup_version);
    println!("created:  {}", metadata.backup_date.to_rfc3339());
    println!("entries:  {}", archive.len());
    println!("checksums: {}", metadata.checksums.len());
    Ok(())
}

/// Line-oriented progress on stdout. Ctrl-C aborts without asking again.
#[derive(Default)]
struct ConsoleView {
    last_line: Option<String>,
}

impl ProgressView for ConsoleView {
    fn render(&mut self, model: &ProgressModel) {
        let mut line = String::new();
        if let Some(hint) = &model.hint {
            line.push_str(hint);
            line.push(' ');
        }
        if model.show_percentage {
            line.push_str(&format!("[{}] ", model.percent));
        }
        line.push_str(&model.message);

        if self.last_line.as_deref() != Some(line.as_str()) {
            println!("{}", line);
            self.last_line = Some(line);
        }
    }

    fn confirm_abort(&mut self, direction: Direction) -> bool {
        println!("Aborting {}...", direction);
        true
    }

    fn prompt_restart(&mut self, message: &str) {
        println!("{}", message);
    }

    fn close(&mut self) {}
}
