use anyhow::{Context, Result};
use clap::Args;
use tflineage_core::engine::importer::SourceSpec;
use tflineage_core::engine::ingestor::ImportResult;
use tflineage_core::Engine;

use super::print_json;
use crate::AppContext;

#[derive(Debug, Args)]
pub struct ImportArgs {
	/// State file paths, one glob pattern (`envs/**/*.tfstate`) or object store URLs.
	#[arg(required = true)]
	pub sources: Vec<String>,

	/// Sources imported concurrently per batch.
	#[arg(long, short = 'p')]
	pub parallelism: Option<usize>,

	/// Keep only resources whose address matches one of these globs.
	#[arg(long)]
	pub include: Vec<String>,

	/// Drop resources whose address matches one of these globs.
	#[arg(long)]
	pub exclude: Vec<String>,

	/// Keep only these resource types.
	#[arg(long = "type")]
	pub types: Vec<String>,

	/// Keep only resources of these providers.
	#[arg(long = "provider")]
	pub providers: Vec<String>,
}

impl ImportArgs {
	fn has_filter_flags(&self) -> bool {
		!(self.include.is_empty() && self.exclude.is_empty() && self.types.is_empty() && self.providers.is_empty())
	}
}

pub async fn execute(args: ImportArgs, ctx: &AppContext) -> Result<()> {
	let engine = if args.has_filter_flags() {
		let mut config = ctx.config.clone();
		config.filter.include.extend(args.include.iter().cloned());
		config.filter.exclude.extend(args.exclude.iter().cloned());
		config.filter.types.extend(args.types.iter().cloned());
		config.filter.providers.extend(args.providers.iter().cloned());
		Engine::with_config(ctx.engine.store().clone(), &config).context("invalid resource filter")?
	} else {
		ctx.engine.clone()
	};

	let parallelism = args.parallelism.unwrap_or(ctx.config.import.parallelism);
	let spec = SourceSpec::from_args(&args.sources);
	let report = engine.import_many(&spec, parallelism).await.context("failed to resolve sources")?;

	if ctx.json {
		print_json(&report)?;
	} else {
		for detail in &report.imports {
			match &detail.result {
				ImportResult::Skipped { existing_snapshot_id, .. } => {
					println!("  = {}  duplicate of {}", detail.locator, existing_snapshot_id);
				}
				ImportResult::Imported(s) => {
					let diff = match (&s.diff_summary, s.is_first) {
						(_, true) => "first snapshot".to_string(),
						(Some(d), _) => format!("+{} ~{} -{}", d.added_count, d.modified_count, d.deleted_count),
						(None, false) => "not diffed".to_string(),
					};
					println!(
						"  + {}  {} v{}  {} resources ({} extracted)  {}",
						detail.locator, s.lineage_id, s.version, s.resources_inserted, s.resources_extracted, diff
					);
				}
			}
		}
		for failure in &report.failures {
			println!("  ! {}  [{}] {}", failure.locator, failure.kind, failure.error);
		}
		println!();
		println!(
			"{} imported, {} skipped, {} failed in {:.2}s",
			report.succeeded - report.skipped,
			report.skipped,
			report.failed,
			report.duration.as_secs_f64()
		);
	}

	if report.failed > 0 {
		anyhow::bail!("{} of {} sources failed", report.failed, report.total());
	}
	Ok(())
}
