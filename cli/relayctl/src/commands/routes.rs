//! Route commands (Caddy server blocks).

use anyhow::Result;
use clap::{Args, Subcommand};
use tabled::Tabled;
use tailrelay_agent::{OnCreate, ProxyRoute, RouteSpec};

use crate::error::CliError;
use crate::output::{print_output, print_result, print_single, status_label, OutputFormat};

use super::{parse_route_name, CommandContext};

/// Route command.
#[derive(Debug, Args)]
pub struct RouteCommand {
    #[command(subcommand)]
    command: RouteSubcommand,
}

#[derive(Debug, Subcommand)]
enum RouteSubcommand {
    /// List routes with statuses checked against Caddy.
    List,

    /// Get a single route by ID or name.
    Get(RouteRefArgs),

    /// Create a route.
    Create(CreateRouteArgs),

    /// Update a route. Running routes are moved in Caddy.
    Update(UpdateRouteArgs),

    /// Push the route's server block to Caddy.
    Start(RouteIdArgs),

    /// Remove the route's server block from Caddy.
    Stop(RouteIdArgs),

    /// Stop a route by name, adopting live blocks that have no record.
    StopByName(RouteNameArgs),

    /// Stop and delete a route.
    Delete(RouteIdArgs),

    /// Show live status without updating the record.
    Status(RouteIdArgs),

    /// Adopt a live server block that has no record.
    Recover(RouteNameArgs),
}

#[derive(Debug, Args)]
struct RouteIdArgs {
    /// Route ID.
    id: i64,
}

#[derive(Debug, Args)]
struct RouteNameArgs {
    /// Route name as it appears in Caddy (e.g. srv1a2b3c4d).
    name: String,
}

#[derive(Debug, Args)]
struct RouteRefArgs {
    /// Route ID, or name when it is not numeric.
    route: String,
}

#[derive(Debug, Args)]
struct CreateRouteArgs {
    /// Hostname to match.
    #[arg(long)]
    hostname: String,

    /// Port Caddy listens on.
    #[arg(long)]
    port: u16,

    /// Upstream to dial, as host:port.
    #[arg(long)]
    upstream: String,

    /// PEM file trusted for TLS to the upstream.
    #[arg(long)]
    tls_trust_pool: Option<String>,

    /// Trusted proxy range (repeatable).
    #[arg(long = "trusted-proxy")]
    trusted_proxies: Vec<String>,

    /// Start the route right after creating it.
    #[arg(long, default_value_t = false)]
    start: bool,
}

#[derive(Debug, Args)]
struct UpdateRouteArgs {
    /// Route ID.
    id: i64,

    /// New hostname.
    #[arg(long)]
    hostname: Option<String>,

    /// New listen port.
    #[arg(long)]
    port: Option<u16>,

    /// New upstream, as host:port.
    #[arg(long)]
    upstream: Option<String>,

    /// New TLS trust pool PEM file.
    #[arg(long, conflicts_with = "clear_tls_trust_pool")]
    tls_trust_pool: Option<String>,

    /// Drop the TLS trust pool.
    #[arg(long, default_value_t = false)]
    clear_tls_trust_pool: bool,

    /// Replace trusted proxy ranges (repeatable).
    #[arg(long = "trusted-proxy", conflicts_with = "clear_trusted_proxies")]
    trusted_proxies: Vec<String>,

    /// Drop all trusted proxy ranges.
    #[arg(long, default_value_t = false)]
    clear_trusted_proxies: bool,
}

impl UpdateRouteArgs {
    fn is_empty(&self) -> bool {
        self.hostname.is_none()
            && self.port.is_none()
            && self.upstream.is_none()
            && self.tls_trust_pool.is_none()
            && !self.clear_tls_trust_pool
            && self.trusted_proxies.is_empty()
            && !self.clear_trusted_proxies
    }

    /// Apply the given flags on top of the current spec.
    fn apply(self, mut spec: RouteSpec) -> RouteSpec {
        if let Some(hostname) = self.hostname {
            spec.hostname = hostname;
        }
        if let Some(port) = self.port {
            spec.port = port;
        }
        if let Some(upstream) = self.upstream {
            spec.upstream_address = upstream;
        }
        if self.clear_tls_trust_pool {
            spec.tls_trust_pool = None;
        } else if let Some(pool) = self.tls_trust_pool {
            spec.tls_trust_pool = Some(pool);
        }
        if self.clear_trusted_proxies {
            spec.trusted_proxies = None;
        } else if !self.trusted_proxies.is_empty() {
            spec.trusted_proxies = Some(self.trusted_proxies);
        }
        spec
    }
}

#[derive(Debug, Tabled)]
struct RouteRow {
    #[tabled(rename = "ID")]
    id: i64,

    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Hostname")]
    hostname: String,

    #[tabled(rename = "Port")]
    port: u16,

    #[tabled(rename = "Upstream")]
    upstream: String,

    #[tabled(rename = "Status")]
    status: String,

    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&ProxyRoute> for RouteRow {
    fn from(route: &ProxyRoute) -> Self {
        Self {
            id: route.id,
            name: route.name.to_string(),
            hostname: route.spec.hostname.clone(),
            port: route.spec.port,
            upstream: route.spec.upstream_address.clone(),
            status: status_label(route.last_known_status.is_running()),
            created_at: route.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl RouteCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            RouteSubcommand::List => list_routes(ctx).await,
            RouteSubcommand::Get(args) => get_route(ctx, args).await,
            RouteSubcommand::Create(args) => create_route(ctx, args).await,
            RouteSubcommand::Update(args) => update_route(ctx, args).await,
            RouteSubcommand::Start(args) => {
                let route = ctx.reconciler.start_route(args.id).await?;
                report(&ctx, "Started", &route);
                Ok(())
            }
            RouteSubcommand::Stop(args) => {
                let route = ctx.reconciler.stop_route(args.id).await?;
                report(&ctx, "Stopped", &route);
                Ok(())
            }
            RouteSubcommand::StopByName(args) => {
                let name = parse_route_name(&args.name)?;
                let route = ctx.reconciler.stop_route_by_name(&name).await?;
                report(&ctx, "Stopped", &route);
                Ok(())
            }
            RouteSubcommand::Delete(args) => {
                let route = ctx.reconciler.delete_route(args.id).await?;
                report(&ctx, "Deleted", &route);
                Ok(())
            }
            RouteSubcommand::Status(args) => {
                let status = ctx.reconciler.current_route_status(args.id).await?;
                match ctx.format {
                    OutputFormat::Table => println!("{}", status_label(status.is_running())),
                    OutputFormat::Json => {
                        print_single(&serde_json::json!({ "id": args.id, "status": status }))
                    }
                }
                Ok(())
            }
            RouteSubcommand::Recover(args) => {
                let name = parse_route_name(&args.name)?;
                let route = ctx.reconciler.recover_route(&name).await?;
                report(&ctx, "Recovered", &route);
                Ok(())
            }
        }
    }
}

fn report(ctx: &CommandContext, verb: &str, route: &ProxyRoute) {
    let message = format!(
        "{verb} route {} '{}' ({}:{} -> {}), now {}",
        route.id,
        route.name,
        route.spec.hostname,
        route.spec.port,
        route.spec.upstream_address,
        route.last_known_status
    );
    print_result(&message, route, ctx.format);
}

async fn list_routes(ctx: CommandContext) -> Result<()> {
    let routes = ctx.reconciler.list_routes().await?;
    let rows: Vec<RouteRow> = routes.iter().map(RouteRow::from).collect();
    print_output(&rows, &routes, ctx.format);
    Ok(())
}

async fn get_route(ctx: CommandContext, args: RouteRefArgs) -> Result<()> {
    let route = match args.route.parse::<i64>() {
        Ok(id) => ctx.reconciler.get_route(id).await?,
        Err(_) => {
            let name = parse_route_name(&args.route)?;
            ctx.reconciler.get_route_by_name(&name).await?
        }
    };

    match ctx.format {
        OutputFormat::Table => print_output(&[RouteRow::from(&route)], &[&route], ctx.format),
        OutputFormat::Json => print_single(&route),
    }
    Ok(())
}

async fn create_route(ctx: CommandContext, args: CreateRouteArgs) -> Result<()> {
    let mut spec = RouteSpec::new(args.hostname, args.port, args.upstream);
    if let Some(pool) = args.tls_trust_pool {
        spec = spec.with_tls_trust_pool(pool);
    }
    if !args.trusted_proxies.is_empty() {
        spec = spec.with_trusted_proxies(args.trusted_proxies);
    }

    let on_create = if args.start {
        OnCreate::Start
    } else {
        OnCreate::Persist
    };
    let route = ctx.reconciler.create_route(spec, on_create).await?;
    report(&ctx, "Created", &route);
    Ok(())
}

async fn update_route(ctx: CommandContext, args: UpdateRouteArgs) -> Result<()> {
    if args.is_empty() {
        return Err(CliError::EmptyUpdate.into());
    }

    let current = ctx.reconciler.get_route(args.id).await?;
    let id = args.id;
    let spec = args.apply(current.spec);
    let route = ctx.reconciler.update_route(id, spec).await?;
    report(&ctx, "Updated", &route);
    Ok(())
}
