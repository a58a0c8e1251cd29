use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{Map, Value};
use tflineage_core::engine::exporter::ExportSelector;

use crate::AppContext;

#[derive(Debug, Args)]
pub struct ExportArgs {
	/// Lineage to export from.
	#[arg(long)]
	pub lineage: Option<String>,

	/// Export the snapshot imported from this locator.
	#[arg(long)]
	pub source: Option<String>,

	/// Version to export; defaults to the latest for --lineage/--source, else the last import.
	#[arg(long, short = 'v')]
	pub version: Option<u64>,

	/// Only export these resource types.
	#[arg(long = "type")]
	pub types: Vec<String>,

	/// `terraform_version` written into the document.
	#[arg(long)]
	pub tool_version: Option<String>,

	/// Lineage written into the document; a fresh UUID when omitted.
	#[arg(long)]
	pub output_lineage: Option<String>,

	/// JSON file holding the `outputs` object.
	#[arg(long)]
	pub outputs: Option<PathBuf>,

	/// Write the document here instead of stdout.
	#[arg(long, short = 'o')]
	pub output: Option<PathBuf>,
}

pub async fn execute(args: ExportArgs, ctx: &AppContext) -> Result<()> {
	let outputs = match &args.outputs {
		Some(path) => Some(read_outputs(path)?),
		None => None,
	};
	let selector = ExportSelector {
		lineage_id: args.lineage,
		source_locator: args.source,
		version: args.version,
		resource_types: args.types,
		tool_version: args.tool_version,
		output_lineage: args.output_lineage,
		outputs,
	};

	let exported = ctx.engine.export_snapshot(&selector).await.context("export failed")?;
	let rendered = serde_json::to_string_pretty(&exported.document)?;

	match &args.output {
		Some(path) => {
			std::fs::write(path, format!("{rendered}\n")).with_context(|| format!("failed to write {}", path.display()))?;
			eprintln!(
				"exported {} v{} ({} resources) to {}",
				exported.lineage_id,
				exported.version,
				exported.resource_count,
				path.display()
			);
		}
		None => println!("{rendered}"),
	}
	Ok(())
}

fn read_outputs(path: &Path) -> Result<Map<String, Value>> {
	let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
	match serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))? {
		Value::Object(map) => Ok(map),
		_ => anyhow::bail!("{} must hold a JSON object", path.display()),
	}
}
