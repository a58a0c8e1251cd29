use anyhow::{Context, Result};
use clap::Args;
use tflineage_core::models::Diff;

use super::print_json;
use crate::AppContext;

#[derive(Debug, Args)]
pub struct DiffArgs {
	/// Lineage identifier.
	pub lineage: String,

	/// Older version. Omit both versions to list stored diffs.
	pub old: Option<u64>,

	/// Newer version.
	pub new: Option<u64>,
}

pub async fn execute(args: DiffArgs, ctx: &AppContext) -> Result<()> {
	match (args.old, args.new) {
		(Some(old), Some(new)) => {
			let diff = ctx
				.engine
				.compute_diff(&args.lineage, old, new)
				.await
				.with_context(|| format!("failed to diff {} v{old} -> v{new}", args.lineage))?;
			if ctx.json {
				print_json(&diff)
			} else {
				print_diff(&diff);
				Ok(())
			}
		}
		(None, None) => {
			let diffs = ctx.engine.list_diffs(&args.lineage).await.context("failed to list diffs")?;
			if ctx.json {
				return print_json(&diffs);
			}
			if diffs.is_empty() {
				println!("No diffs stored for {}", args.lineage);
			}
			for diff in &diffs {
				println!(
					"  v{} -> v{}  +{} ~{} -{}  ({})",
					diff.old_version,
					diff.new_version,
					diff.summary.added_count,
					diff.summary.modified_count,
					diff.summary.deleted_count,
					diff.calculated_at.format("%Y-%m-%d %H:%M:%S")
				);
			}
			Ok(())
		}
		_ => anyhow::bail!("give both OLD and NEW versions, or neither to list stored diffs"),
	}
}

fn print_diff(diff: &Diff) {
	println!("{} v{} -> v{}", diff.lineage_id, diff.old_version, diff.new_version);
	for added in &diff.changes.added {
		println!("  + {}", added.address);
	}
	for modified in &diff.changes.modified {
		println!("  ~ {}", modified.address);
		for change in &modified.changes {
			println!("      {}: {} -> {}", change.field, change.old_value, change.new_value);
		}
	}
	for deleted in &diff.changes.deleted {
		println!("  - {}", deleted.address);
	}
	println!(
		"{} added, {} modified, {} deleted",
		diff.summary.added_count, diff.summary.modified_count, diff.summary.deleted_count
	);
}
