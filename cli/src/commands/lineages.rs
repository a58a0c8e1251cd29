use anyhow::{Context, Result};

use super::print_json;
use crate::AppContext;

pub async fn execute(ctx: &AppContext) -> Result<()> {
	let lineages = ctx.engine.list_lineages().await.context("failed to list lineages")?;

	if ctx.json {
		return print_json(&lineages);
	}
	if lineages.is_empty() {
		println!("No lineages imported yet");
		return Ok(());
	}

	println!("{:<38} {:>8} {:>10}  {}", "LINEAGE", "LATEST", "SNAPSHOTS", "LAST IMPORT");
	for lineage in &lineages {
		println!(
			"{:<38} {:>8} {:>10}  {}",
			lineage.id,
			lineage.latest_version,
			lineage.total_snapshots,
			lineage.last_imported_at.format("%Y-%m-%d %H:%M:%S")
		);
	}
	Ok(())
}
