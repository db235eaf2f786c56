// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod commands;
mod logging;

use clap::Parser;
use commands::{CliContext, Commands};

#[derive(Debug, Parser)]
#[command(name = "fleetnet", version, about = "User-space tunnels into a private fleet network")]
struct Cli {
	/// Log filter, e.g. `fleetnet=debug`. `RUST_LOG` takes precedence.
	#[arg(long, global = true)]
	log_level: Option<String>,

	/// Emit logs as JSON
	#[arg(long, global = true)]
	json_logs: bool,

	#[command(subcommand)]
	command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	logging::init(cli.log_level.as_deref(), cli.json_logs);

	let ctx = CliContext::from_env()?;
	commands::run(cli.command, &ctx).await
}
