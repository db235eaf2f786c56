// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::Context;
use clap::{Args, Subcommand};
use console::style;
use fleetnet_control::{ControlPlane, ControlPlaneConfig, GraphqlControlPlane};
use fleetnet_tunnel::{Tunnel, TunnelConfig};
use http::Uri;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Subcommand)]
pub enum Commands {
	/// Bring a tunnel up and hold it until Ctrl+C
	Up,
	/// Resolve a name's AAAA records through the tunnel
	Lookup(LookupArgs),
	/// Fetch a URL through the tunnel
	Get(GetArgs),
}

#[derive(Debug, Clone, Args)]
pub struct LookupArgs {
	/// Name inside the private network, e.g. my-app.internal
	pub name: String,
}

#[derive(Debug, Clone, Args)]
pub struct GetArgs {
	pub url: Uri,

	/// Send the control-plane token as a bearer token
	#[arg(long)]
	pub authenticated: bool,
}

pub struct CliContext {
	pub config: ControlPlaneConfig,
	pub tunnel_config: TunnelConfig,
}

impl CliContext {
	pub fn from_env() -> anyhow::Result<Self> {
		let config = ControlPlaneConfig::from_env().context("loading control-plane configuration")?;
		Ok(Self {
			config,
			tunnel_config: TunnelConfig::from_env(),
		})
	}

	async fn bring_up(&self) -> anyhow::Result<Tunnel> {
		let control: Arc<dyn ControlPlane> = Arc::new(GraphqlControlPlane::new(&self.config)?);
		let tunnel = Tunnel::establish(control, &self.config, &self.tunnel_config)
			.await
			.context("establishing tunnel")?;
		Ok(tunnel)
	}
}

pub async fn run(command: Commands, ctx: &CliContext) -> anyhow::Result<()> {
	match command {
		Commands::Up => handle_up(ctx).await,
		Commands::Lookup(args) => handle_lookup(args, ctx).await,
		Commands::Get(args) => handle_get(args, ctx).await,
	}
}

#[instrument(skip(ctx))]
async fn handle_up(ctx: &CliContext) -> anyhow::Result<()> {
	let tunnel = ctx.bring_up().await?;
	let plan = tunnel.plan();

	println!("{} Tunnel up", style("✓").green().bold());
	println!("  Peer:     {}", style(tunnel.peer_name()).cyan());
	println!("  Address:  {}", style(plan.local_address()).cyan());
	println!("  Network:  {}", style(plan.remote_network).cyan());
	println!("  Resolver: {}", style(plan.resolver).cyan());
	println!("  Endpoint: {}", style(tunnel.session().endpoint()).cyan());
	println!("\nPress Ctrl+C to stop the tunnel...");

	tokio::signal::ctrl_c().await?;
	println!("\n{} Shutting down...", style("→").yellow());

	tunnel.down().await;
	println!("{} Tunnel stopped", style("✓").green().bold());
	Ok(())
}

#[instrument(skip(ctx))]
async fn handle_lookup(args: LookupArgs, ctx: &CliContext) -> anyhow::Result<()> {
	let tunnel = ctx.bring_up().await?;
	let result = tunnel.lookup_aaaa(&args.name).await;
	tunnel.down().await;

	let addrs = result.with_context(|| format!("resolving {}", args.name))?;
	if addrs.is_empty() {
		println!("{} no AAAA records for {}", style("!").yellow().bold(), args.name);
	}
	for addr in addrs {
		println!("{addr}");
	}
	Ok(())
}

#[instrument(skip(ctx))]
async fn handle_get(args: GetArgs, ctx: &CliContext) -> anyhow::Result<()> {
	let tunnel = ctx.bring_up().await?;
	let client = tunnel.http_client(args.authenticated.then_some(&ctx.config));
	let result = client.get_bytes(args.url.clone()).await;
	tunnel.down().await;

	let (status, body) = result.with_context(|| format!("fetching {}", args.url))?;
	let marker = if status.is_success() {
		style("✓").green().bold()
	} else {
		style("✗").red().bold()
	};
	eprintln!("{marker} {status}");
	println!("{}", String::from_utf8_lossy(&body));
	Ok(())
}
