use anyhow::{Context, Result};
use clap::Args;

use super::print_json;
use crate::AppContext;

#[derive(Debug, Args)]
pub struct HistoryArgs {
	/// Lineage identifier.
	pub lineage: String,
}

pub async fn execute(args: HistoryArgs, ctx: &AppContext) -> Result<()> {
	let snapshots = ctx
		.engine
		.lineage_history(&args.lineage)
		.await
		.with_context(|| format!("failed to load history of {}", args.lineage))?;

	if ctx.json {
		return print_json(&snapshots);
	}
	if snapshots.is_empty() {
		anyhow::bail!("no snapshots for lineage {}", args.lineage);
	}

	for snapshot in &snapshots {
		println!(
			"  v{:<6} {}  {:>5} resources  {}  {}",
			snapshot.version,
			snapshot.imported_at.format("%Y-%m-%d %H:%M:%S"),
			snapshot.resource_count,
			snapshot.tool_version.as_deref().unwrap_or("-"),
			snapshot.source_locator
		);
	}
	Ok(())
}
