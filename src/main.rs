use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use timeport::config::Overrides;
use timeport::output::Format;

#[derive(Parser)]
#[command(
    name = "timeport",
    version,
    about = "Billing-exact migration of legacy time logs, schedules, and task lists"
)]
struct Cli {
    /// Project root containing the legacy documents (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate legacy documents into the canonical store
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Remove an abandoned migration lock
    Unlock {
        /// Remove the lock even if its owner still holds it
        #[arg(long)]
        force: bool,
    },
    /// List backup snapshots, newest first
    Backups,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Parse and report what would be written, without writing
    DryRun {
        #[command(flatten)]
        common: CommonOptions,
    },
    /// Snapshot, parse, write in batches, and validate
    Execute {
        #[command(flatten)]
        common: CommonOptions,
        /// Keep checkpoint files after a successful run
        #[arg(long)]
        keep_checkpoints: bool,
        /// Discard an unfinished checkpoint and start over
        #[arg(long)]
        restart: bool,
        #[arg(long, hide = true)]
        halt_after: Option<usize>,
    },
    /// Check existing output against the legacy documents
    Validate {
        /// Skip git attribution for rows without a user
        #[arg(long)]
        no_blame: bool,
    },
    /// Restore a backup snapshot
    Rollback {
        /// Backup id (default: most recent)
        #[arg(long = "backup")]
        backup: Option<String>,
    },
    /// Continue an interrupted migration from its last checkpoint. Batch
    /// size, anonymization and encryption marking come from the checkpoint;
    /// the flags below only apply when there is none and a fresh run starts.
    Resume {
        #[command(flatten)]
        common: CommonOptions,
        /// Keep checkpoint files after a successful run
        #[arg(long)]
        keep_checkpoints: bool,
        #[arg(long, hide = true)]
        halt_after: Option<usize>,
    },
}

#[derive(Args)]
struct CommonOptions {
    /// Sessions per batch
    #[arg(long)]
    batch_size: Option<usize>,
    /// Replace user names with stable tokens
    #[arg(long)]
    anonymize: bool,
    /// Tag per-user files as holding externally encrypted fields
    #[arg(long)]
    encrypt_mark: bool,
    /// Skip git attribution for rows without a user
    #[arg(long)]
    no_blame: bool,
}

impl CommonOptions {
    fn overrides(&self, keep_checkpoints: bool) -> Overrides {
        Overrides {
            batch_size: self.batch_size,
            anonymize: self.anonymize,
            mark_encrypted: self.encrypt_mark,
            keep_checkpoints,
            no_blame: self.no_blame,
        }
    }
}

fn run(cli: Cli, format: Format) -> timeport::error::Result<()> {
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Migrate { action } => match action {
            MigrateAction::DryRun { common } => {
                timeport::commands::migrate::dry_run(&root, &common.overrides(false), format)
            }
            MigrateAction::Execute {
                common,
                keep_checkpoints,
                restart,
                halt_after,
            } => timeport::commands::migrate::execute(
                &root,
                &common.overrides(keep_checkpoints),
                restart,
                halt_after,
                format,
            ),
            MigrateAction::Validate { no_blame } => {
                let overrides = Overrides {
                    no_blame,
                    ..Overrides::default()
                };
                timeport::commands::migrate::validate(&root, &overrides, format)
            }
            MigrateAction::Rollback { backup } => {
                timeport::commands::migrate::rollback(&root, backup.as_deref(), format)
            }
            MigrateAction::Resume {
                common,
                keep_checkpoints,
                halt_after,
            } => timeport::commands::migrate::resume(
                &root,
                &common.overrides(keep_checkpoints),
                halt_after,
                format,
            ),
        },
        Commands::Unlock { force } => timeport::commands::unlock::run(&root, force, format),
        Commands::Backups => timeport::commands::backups::run(&root, format),
    }
}

fn main() {
    timeport::logging::init();
    let cli = Cli::parse();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": e.code(),
                        "kind": e.kind().to_string(),
                        "message": e.to_string()
                    })
                );
            }
            Format::Pretty => eprintln!("error: {e}"),
        }
        std::process::exit(e.exit_code());
    }
}
