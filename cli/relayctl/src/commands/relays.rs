//! Relay commands (socat forwarders).

use anyhow::Result;
use clap::{Args, Subcommand};
use tabled::Tabled;
use tailrelay_agent::{OnCreate, ProbeStatus, RelaySpec, TcpRelay};

use crate::error::CliError;
use crate::output::{print_output, print_result, print_single, status_label, OutputFormat};

use super::CommandContext;

/// Relay command.
#[derive(Debug, Args)]
pub struct RelayCommand {
    #[command(subcommand)]
    command: RelaySubcommand,
}

#[derive(Debug, Subcommand)]
enum RelaySubcommand {
    /// List relays with statuses checked against the process table.
    List,

    /// Get a single relay.
    Get(RelayIdArgs),

    /// Create a relay.
    Create(CreateRelayArgs),

    /// Update a relay. Running relays are restarted.
    Update(UpdateRelayArgs),

    /// Spawn the relay's forwarder.
    Start(RelayIdArgs),

    /// Terminate the relay's forwarder.
    Stop(RelayIdArgs),

    /// Stop and delete a relay.
    Delete(RelayIdArgs),

    /// Show live status without updating the record.
    Status(RelayIdArgs),
}

#[derive(Debug, Args)]
struct RelayIdArgs {
    /// Relay ID.
    id: i64,
}

#[derive(Debug, Args)]
struct CreateRelayArgs {
    /// Local port to listen on.
    #[arg(long)]
    listen_port: u16,

    /// Host to forward connections to.
    #[arg(long)]
    target_host: String,

    /// Port to forward connections to.
    #[arg(long)]
    target_port: u16,

    /// Idle timeout in seconds.
    #[arg(long)]
    timeout: Option<u32>,

    /// Start the relay right after creating it.
    #[arg(long, default_value_t = false)]
    start: bool,
}

#[derive(Debug, Args)]
struct UpdateRelayArgs {
    /// Relay ID.
    id: i64,

    /// New listening port.
    #[arg(long)]
    listen_port: Option<u16>,

    /// New target host.
    #[arg(long)]
    target_host: Option<String>,

    /// New target port.
    #[arg(long)]
    target_port: Option<u16>,

    /// New idle timeout in seconds.
    #[arg(long, conflicts_with = "clear_timeout")]
    timeout: Option<u32>,

    /// Drop the idle timeout.
    #[arg(long, default_value_t = false)]
    clear_timeout: bool,
}

impl UpdateRelayArgs {
    fn is_empty(&self) -> bool {
        self.listen_port.is_none()
            && self.target_host.is_none()
            && self.target_port.is_none()
            && self.timeout.is_none()
            && !self.clear_timeout
    }

    fn apply(self, mut spec: RelaySpec) -> RelaySpec {
        if let Some(port) = self.listen_port {
            spec.listening_port = port;
        }
        if let Some(host) = self.target_host {
            spec.target_host = host;
        }
        if let Some(port) = self.target_port {
            spec.target_port = port;
        }
        if self.clear_timeout {
            spec.timeout_secs = None;
        } else if let Some(secs) = self.timeout {
            spec.timeout_secs = Some(secs);
        }
        spec
    }
}

#[derive(Debug, Tabled)]
struct RelayRow {
    #[tabled(rename = "ID")]
    id: i64,

    #[tabled(rename = "Listen")]
    listening_port: u16,

    #[tabled(rename = "Target")]
    target: String,

    #[tabled(rename = "Timeout")]
    timeout: String,

    #[tabled(rename = "Status")]
    status: String,

    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&TcpRelay> for RelayRow {
    fn from(relay: &TcpRelay) -> Self {
        Self {
            id: relay.id,
            listening_port: relay.listening_port(),
            target: format!("{}:{}", relay.spec.target_host, relay.spec.target_port),
            timeout: relay
                .spec
                .timeout_secs
                .map(|secs| format!("{secs}s"))
                .unwrap_or_else(|| "-".to_string()),
            status: status_label(relay.last_known_status.is_running()),
            created_at: relay.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl RelayCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            RelaySubcommand::List => {
                let relays = ctx.reconciler.list_relays().await?;
                let rows: Vec<RelayRow> = relays.iter().map(RelayRow::from).collect();
                print_output(&rows, &relays, ctx.format);
                Ok(())
            }
            RelaySubcommand::Get(args) => {
                let relay = ctx.reconciler.get_relay(args.id).await?;
                match ctx.format {
                    OutputFormat::Table => {
                        print_output(&[RelayRow::from(&relay)], &[&relay], ctx.format)
                    }
                    OutputFormat::Json => print_single(&relay),
                }
                Ok(())
            }
            RelaySubcommand::Create(args) => create_relay(ctx, args).await,
            RelaySubcommand::Update(args) => update_relay(ctx, args).await,
            RelaySubcommand::Start(args) => {
                let relay = ctx.reconciler.start_relay(args.id).await?;
                report(&ctx, "Started", &relay);
                Ok(())
            }
            RelaySubcommand::Stop(args) => {
                let relay = ctx.reconciler.stop_relay(args.id).await?;
                report(&ctx, "Stopped", &relay);
                Ok(())
            }
            RelaySubcommand::Delete(args) => {
                let relay = ctx.reconciler.delete_relay(args.id).await?;
                report(&ctx, "Deleted", &relay);
                Ok(())
            }
            RelaySubcommand::Status(args) => {
                let status = ctx.reconciler.current_relay_status(args.id).await?;
                match (ctx.format, status) {
                    (OutputFormat::Table, ProbeStatus::Running(pid)) => {
                        println!("{} (pid {pid})", status_label(true))
                    }
                    (OutputFormat::Table, ProbeStatus::Stopped) => {
                        println!("{}", status_label(false))
                    }
                    (OutputFormat::Json, _) => print_single(&serde_json::json!({
                        "id": args.id,
                        "status": if status.is_running() { "running" } else { "stopped" },
                        "pid": status.pid(),
                    })),
                }
                Ok(())
            }
        }
    }
}

fn report(ctx: &CommandContext, verb: &str, relay: &TcpRelay) {
    let message = format!(
        "{verb} relay {} (:{} -> {}:{}), now {}",
        relay.id,
        relay.listening_port(),
        relay.spec.target_host,
        relay.spec.target_port,
        relay.last_known_status
    );
    print_result(&message, relay, ctx.format);
}

async fn create_relay(ctx: CommandContext, args: CreateRelayArgs) -> Result<()> {
    let mut spec = RelaySpec::new(args.listen_port, args.target_host, args.target_port);
    if let Some(secs) = args.timeout {
        spec = spec.with_timeout(secs);
    }

    let on_create = if args.start {
        OnCreate::Start
    } else {
        OnCreate::Persist
    };
    let relay = ctx.reconciler.create_relay(spec, on_create).await?;
    report(&ctx, "Created", &relay);
    Ok(())
}

async fn update_relay(ctx: CommandContext, args: UpdateRelayArgs) -> Result<()> {
    if args.is_empty() {
        return Err(CliError::EmptyUpdate.into());
    }

    let current = ctx.reconciler.get_relay(args.id).await?;
    let id = args.id;
    let spec = args.apply(current.spec);
    let relay = ctx.reconciler.update_relay(id, spec).await?;
    report(&ctx, "Updated", &relay);
    Ok(())
}
