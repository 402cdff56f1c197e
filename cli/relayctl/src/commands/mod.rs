//! CLI commands.

mod relays;
mod routes;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tailrelay_agent::{Config, Reconciler, RouteName};

use crate::error::CliError;
use crate::output::{print_info, print_single, OutputFormat};

/// relayctl - manage Caddy reverse-proxy routes and socat TCP relays.
#[derive(Debug, Parser)]
#[command(name = "relayctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    /// Log reconciler activity to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage reverse-proxy routes (Caddy server blocks).
    #[command(alias = "routes")]
    Route(routes::RouteCommand),

    /// Manage TCP relays (socat forwarders).
    #[command(alias = "relays")]
    Relay(relays::RelayCommand),

    /// Dump Caddy's live configuration.
    Config,

    /// Correct every record's status from live state once.
    Sweep,

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let format = if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Table
        };

        if let Commands::Version = self.command {
            println!("relayctl {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        let config = with_forwarder_log(Config::from_env()?);
        let reconciler = Reconciler::from_config(&config)
            .with_context(|| format!("Failed to initialize with {}", config.db_path.display()))?;
        let ctx = CommandContext { reconciler, format };

        match self.command {
            Commands::Route(cmd) => cmd.run(ctx).await,
            Commands::Relay(cmd) => cmd.run(ctx).await,
            Commands::Config => {
                let live = ctx.reconciler.live_config().await?;
                print_single(&live);
                Ok(())
            }
            Commands::Sweep => {
                let report = ctx.reconciler.sweep().await;
                match ctx.format {
                    OutputFormat::Json => print_single(&serde_json::json!({
                        "routes_checked": report.routes_checked,
                        "relays_checked": report.relays_checked,
                        "corrected": report.corrected,
                        "errors": report.errors,
                    })),
                    OutputFormat::Table => {
                        print_info(&format!(
                            "Checked {} routes and {} relays, corrected {}",
                            report.routes_checked, report.relays_checked, report.corrected
                        ));
                        for error in &report.errors {
                            eprintln!("{error}");
                        }
                    }
                }
                if report.errors.is_empty() {
                    Ok(())
                } else {
                    anyhow::bail!("Sweep finished with {} errors", report.errors.len())
                }
            }
            Commands::Version => Ok(()),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub reconciler: Reconciler,
    pub format: OutputFormat,
}

/// Forwarders outlive this process, so their stderr goes to a file.
fn with_forwarder_log(mut config: Config) -> Config {
    if config.forwarder_log.is_none() {
        config.forwarder_log = Some(config.db_path.with_extension("forwarders.log"));
    }
    config
}

/// Parse a route name given on the command line.
pub fn parse_route_name(raw: &str) -> Result<RouteName> {
    RouteName::parse(raw).map_err(|e| {
        CliError::InvalidName {
            name: raw.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}
