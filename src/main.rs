use anyhow::Result;
use clap::Parser;
use mission_relay::{init_telemetry, CoordinationError, MissionRelayConfig};

mod cli;

use cli::commands::config::{ConfigInitCommand, ConfigShowCommand};
use cli::commands::documents::{ApplyCommand, CreateCommand, InsertCommand, ReadCommand, SignalCommand};
use cli::commands::status::StatusCommand;
use cli::commands::watch::WatchCommand;
use cli::commands::{default_holder, Command, Context};
use cli::{Cli, Commands, ConfigAction};

/// Exit status for edits whose anchor no longer matches; callers re-read and retry.
const EXIT_EDIT_CONFLICT: i32 = 2;
/// Exit status for lock waits that ran out or leases that lapsed mid-edit.
const EXIT_LOCK_TIMEOUT: i32 = 3;

fn main() {
    if let Err(e) = run() {
        eprintln!("❌ {e:#}");
        let code = match e.downcast_ref::<CoordinationError>() {
            Some(err) if err.is_edit_conflict() => EXIT_EDIT_CONFLICT,
            Some(CoordinationError::LockTimeout { .. } | CoordinationError::LeaseLost { .. }) => EXIT_LOCK_TIMEOUT,
            _ => 1,
        };
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let _ = MissionRelayConfig::load_env_file();
    let mut config = match &cli.global.root {
        Some(root) => MissionRelayConfig::load_from(root)?,
        None => MissionRelayConfig::load()?,
    };
    if let Some(root) = &cli.global.root {
        config.mission.root = root.clone();
    }
    init_telemetry(&config.observability)?;

    let ctx = Context {
        config,
        holder: cli.global.holder.clone().unwrap_or_else(default_holder),
        json: cli.global.json,
    };

    tokio::runtime::Runtime::new()?.block_on(async move {
        match cli.command {
            Commands::Read { document } => ReadCommand { ctx, document }.execute().await,
            Commands::Apply {
                document,
                search,
                replace,
            } => {
                ApplyCommand {
                    ctx,
                    document,
                    search,
                    replace,
                }
                .execute()
                .await
            }
            Commands::Insert { document, marker, text } => {
                InsertCommand {
                    ctx,
                    document,
                    marker,
                    text,
                }
                .execute()
                .await
            }
            Commands::Signal {
                document,
                agent,
                message,
                direction,
            } => {
                SignalCommand {
                    ctx,
                    document,
                    agent,
                    message,
                    direction: direction.into(),
                }
                .execute()
                .await
            }
            Commands::Create {
                document,
                template,
                template_file,
            } => {
                CreateCommand {
                    ctx,
                    document,
                    template,
                    template_file,
                }
                .execute()
                .await
            }
            Commands::Status => StatusCommand { ctx }.execute().await,
            Commands::Watch { consumer, duration } => WatchCommand { ctx, consumer, duration }.execute().await,
            Commands::Config { action } => match action {
                ConfigAction::Show => ConfigShowCommand { ctx }.execute().await,
                ConfigAction::Init { force } => ConfigInitCommand { ctx, force }.execute().await,
            },
        }
    })
}
