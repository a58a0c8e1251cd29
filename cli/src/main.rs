mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tflineage_core::config::{self, Config};
use tflineage_core::Engine;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Track Terraform / OpenTofu state history: import, diff and export snapshots.
#[derive(Debug, Parser)]
#[command(name = "tflineage", author, version, about, long_about = None)]
struct Cli {
	/// Config file (defaults to the platform config dir).
	#[arg(long, global = true, env = "TFLINEAGE_CONFIG")]
	config: Option<PathBuf>,

	/// Database directory, overriding the config file.
	#[arg(long, global = true)]
	db: Option<PathBuf>,

	/// Use a throwaway in-memory database.
	#[arg(long, global = true)]
	in_memory: bool,

	/// Write logs to this file instead of stderr.
	#[arg(long, global = true)]
	log_file: Option<PathBuf>,

	/// Print machine-readable JSON.
	#[arg(long, global = true)]
	json: bool,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Import one or more state files (paths, globs or object store URLs).
	Import(commands::import::ImportArgs),
	/// Show the diff between two versions of a lineage, or list stored diffs.
	Diff(commands::diff::DiffArgs),
	/// Rebuild a state document from stored records.
	Export(commands::export::ExportArgs),
	/// List known lineages.
	Lineages,
	/// List the snapshots of one lineage.
	History(commands::history::HistoryArgs),
}

/// Shared state handed to every command.
pub struct AppContext {
	pub engine: Engine,
	pub config: Config,
	pub json: bool,
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
	match log_file {
		Some(path) => {
			let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
			let name = path.file_name().context("--log-file must name a file")?;
			std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
			let file_appender = tracing_appender::rolling::never(dir, name);
			tracing_subscriber::registry()
				.with(tracing_subscriber::fmt::layer().with_writer(file_appender).with_ansi(false))
				.with(filter)
				.init();
		}
		None => {
			tracing_subscriber::registry()
				.with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
				.with(filter)
				.init();
		}
	}
	Ok(())
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.log_file.as_ref())?;

	let mut config = config::load(cli.config.as_deref()).context("failed to load configuration")?;
	if let Some(db) = &cli.db {
		config.store.path = Some(db.clone());
	}
	if cli.in_memory {
		config.store.in_memory = true;
	}

	let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

	runtime.block_on(async {
		let engine = Engine::open(&config).await.context("failed to open state database")?;
		tracing::debug!(store = engine.store().name(), parallelism = config.import.parallelism, "engine ready");
		let ctx = AppContext { engine, config, json: cli.json };

		match cli.command {
			Commands::Import(args) => commands::import::execute(args, &ctx).await,
			Commands::Diff(args) => commands::diff::execute(args, &ctx).await,
			Commands::Export(args) => commands::export::execute(args, &ctx).await,
			Commands::Lineages => commands::lineages::execute(&ctx).await,
			Commands::History(args) => commands::history::execute(args, &ctx).await,
		}
	})
}
