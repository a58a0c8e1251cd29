//! End-to-end behaviour of the engine over both lookup paths: a store that
//! advertises partitions and one that only supports full scans.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tflineage_core::engine::exporter::ExportSelector;
use tflineage_core::engine::extractor::resource_address;
use tflineage_core::engine::filter::ResourceFilter;
use tflineage_core::engine::glob::GlobMatcher;
use tflineage_core::engine::hasher::canonical_json;
use tflineage_core::engine::importer::SourceSpec;
use tflineage_core::engine::ingestor::ImportResult;
use tflineage_core::models::{FieldChange, ResourceMode, ResourceRecord};
use tflineage_core::store::{Lookup, MemoryStore, StoreOp, Table};
use tflineage_core::Engine;

fn stores() -> Vec<(&'static str, MemoryStore)> {
	vec![("partitioned", MemoryStore::new()), ("scan-only", MemoryStore::without_partitions())]
}

fn engine(store: &MemoryStore) -> Engine {
	Engine::new(Arc::new(store.clone()), &ResourceFilter::default()).unwrap()
}

fn state(lineage: &str, serial: u64, resources: Value) -> Value {
	json!({
		"version": 4,
		"terraform_version": "1.6.0",
		"serial": serial,
		"lineage": lineage,
		"outputs": {},
		"resources": resources,
	})
}

fn managed(resource_type: &str, name: &str, attributes: Value) -> Value {
	json!({
		"mode": "managed",
		"type": resource_type,
		"name": name,
		"provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
		"instances": [{"schema_version": 1, "attributes": attributes}],
	})
}

fn imported(result: ImportResult) -> tflineage_core::engine::ingestor::ImportedSnapshot {
	match result {
		ImportResult::Imported(snapshot) => snapshot,
		other => panic!("expected an import, got {other:?}"),
	}
}

#[tokio::test]
async fn reimporting_identical_content_is_skipped() {
	for (label, store) in stores() {
		let engine = engine(&store);
		let doc = state("lin-idem", 1, json!([managed("aws_instance", "web", json!({"id": "i-1"}))]));

		let first = imported(engine.import_snapshot("a.tfstate", &doc).await.unwrap());
		let rows_after_first = store.count(Table::Resource);

		let second = engine.import_snapshot("copy-of-a.tfstate", &doc).await.unwrap();

		match second {
			ImportResult::Skipped { existing_snapshot_id, .. } => {
				assert_eq!(existing_snapshot_id, first.snapshot_id, "{label}")
			}
			other => panic!("{label}: expected skip, got {other:?}"),
		}
		assert_eq!(store.count(Table::Resource), rows_after_first, "{label}");
		assert_eq!(store.count(Table::Snapshot), 1, "{label}");
	}
}

#[tokio::test]
async fn out_of_order_imports_keep_latest_version() {
	for (label, store) in stores() {
		let engine = engine(&store);
		for serial in [3, 1, 2] {
			let doc = state("lin-mono", serial, json!([managed("aws_instance", "web", json!({"serial": serial}))]));
			engine.import_snapshot(&format!("v{serial}.tfstate"), &doc).await.unwrap();
		}

		let lineage = engine.get_lineage("lin-mono").await.unwrap().unwrap();
		assert_eq!(lineage.latest_version, 3, "{label}");
		assert_eq!(lineage.total_snapshots, 3, "{label}");

		let versions: Vec<u64> =
			engine.lineage_history("lin-mono").await.unwrap().iter().map(|s| s.version).collect();
		assert_eq!(versions, vec![1, 2, 3], "{label}");
	}
}

#[tokio::test]
async fn diff_reports_added_and_modified_resources() {
	for (label, store) in stores() {
		let engine = engine(&store);
		let a = state("lin-diff", 1, json!([managed("aws_instance", "web", json!({"x": 1}))]));
		let b = state(
			"lin-diff",
			2,
			json!([managed("aws_instance", "web", json!({"x": 2})), managed("aws_s3_bucket", "logs", json!({}))]),
		);
		engine.import_snapshot("a.tfstate", &a).await.unwrap();
		let second = imported(engine.import_snapshot("b.tfstate", &b).await.unwrap());
		assert!(!second.is_first, "{label}");

		let diff = engine.compute_diff("lin-diff", 1, 2).await.unwrap();

		let added: Vec<&str> = diff.changes.added.iter().map(|r| r.address.as_str()).collect();
		assert_eq!(added, vec!["aws_s3_bucket.logs"], "{label}");
		assert!(diff.changes.deleted.is_empty(), "{label}");
		assert_eq!(diff.changes.modified.len(), 1, "{label}");
		assert_eq!(diff.changes.modified[0].address, "aws_instance.web", "{label}");
		assert_eq!(
			diff.changes.modified[0].changes,
			vec![FieldChange { field: "x".into(), old_value: json!(1), new_value: json!(2) }],
			"{label}"
		);

		// Computed once during import; the explicit call returns the stored row.
		assert_eq!(store.count(Table::Diff), 1, "{label}");
		let stored = engine.list_diffs("lin-diff").await.unwrap();
		assert_eq!(stored.len(), 1, "{label}");
		assert_eq!(stored[0].id, diff.id, "{label}");
	}
}

#[tokio::test]
async fn first_snapshot_of_a_lineage_persists_no_diff() {
	for (label, store) in stores() {
		let engine = engine(&store);
		let doc = state("lin-first", 7, json!([managed("aws_instance", "web", json!({"id": "i-1"}))]));

		let result = imported(engine.import_snapshot("first.tfstate", &doc).await.unwrap());

		assert!(result.is_first, "{label}");
		assert!(result.diff_summary.is_none(), "{label}");
		assert_eq!(store.count(Table::Diff), 0, "{label}");
		assert!(engine.list_diffs("lin-first").await.unwrap().is_empty(), "{label}");
	}
}

#[tokio::test]
async fn export_reconstructs_the_extracted_instances() {
	for (label, store) in stores() {
		let engine = engine(&store);
		let doc = state(
			"lin-export",
			5,
			json!([
				managed("aws_instance", "web", json!({"id": "i-1", "ami": "ami-123", "tags": {"b": "2", "a": "1"}})),
				{
					"mode": "managed",
					"type": "aws_subnet",
					"name": "private",
					"provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
					"instances": [
						{"index_key": 1, "schema_version": 0, "attributes": {"id": "subnet-b"}},
						{"index_key": 0, "schema_version": 0, "attributes": {"id": "subnet-a"}, "dependencies": ["aws_vpc.main"]},
					],
				},
				{
					"mode": "data",
					"type": "aws_ami",
					"name": "ubuntu",
					"provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
					"instances": [{"schema_version": 0, "attributes": {"id": "ami-123"}}],
				},
			]),
		);
		let snapshot = imported(engine.import_snapshot("export.tfstate", &doc).await.unwrap());

		let exported = engine
			.export_snapshot(&ExportSelector {
				lineage_id: Some("lin-export".into()),
				version: Some(5),
				..ExportSelector::default()
			})
			.await
			.unwrap();
		assert_eq!(exported.resource_count, 4, "{label}");
		assert_eq!(exported.document["serial"], 5, "{label}");
		assert_eq!(exported.document["version"], 4, "{label}");

		let lookup = Lookup::new(engine.store().clone());
		let records: Vec<ResourceRecord> = lookup
			.fetch_where(Table::Resource, &[("snapshot_id", json!(snapshot.snapshot_id))])
			.await
			.unwrap();
		let expected: BTreeSet<(String, String)> = records
			.iter()
			.map(|r| (r.resource_address.clone(), canonical_json(&Value::Object(r.attributes.clone())).unwrap()))
			.collect();

		assert_eq!(document_instances(&exported.document), expected, "{label}");
	}
}

fn document_instances(document: &Value) -> BTreeSet<(String, String)> {
	let mut out = BTreeSet::new();
	for resource in document["resources"].as_array().unwrap() {
		let mode = ResourceMode::parse(resource["mode"].as_str().unwrap()).unwrap();
		let module = resource.get("module").and_then(Value::as_str);
		let resource_type = resource["type"].as_str().unwrap();
		let name = resource["name"].as_str().unwrap();
		for instance in resource["instances"].as_array().unwrap() {
			let address = resource_address(module, mode, resource_type, name, instance.get("index_key"));
			out.insert((address, canonical_json(&instance["attributes"]).unwrap()));
		}
	}
	out
}

#[tokio::test]
async fn include_filter_drops_unmatched_resources_but_counts_them() {
	for (label, store) in stores() {
		let filter = ResourceFilter { include: vec!["aws_instance.*".into()], ..ResourceFilter::default() };
		let engine = Engine::new(Arc::new(store.clone()), &filter).unwrap();
		let doc = state(
			"lin-filter",
			1,
			json!([managed("aws_instance", "web", json!({"id": "i-1"})), managed("aws_s3_bucket", "logs", json!({}))]),
		);

		let result = imported(engine.import_snapshot("filter.tfstate", &doc).await.unwrap());

		assert_eq!(result.resources_extracted, 2, "{label}");
		assert_eq!(result.resources_inserted, 1, "{label}");
		let lookup = Lookup::new(engine.store().clone());
		let records: Vec<ResourceRecord> =
			lookup.fetch_where(Table::Resource, &[("lineage_id", json!("lin-filter"))]).await.unwrap();
		let addresses: Vec<&str> = records.iter().map(|r| r.resource_address.as_str()).collect();
		assert_eq!(addresses, vec!["aws_instance.web"], "{label}");
	}
}

#[test]
fn recursive_glob_matches_nested_state_files_only() {
	let matcher = GlobMatcher::new("environments/**/*.tfstate").unwrap();

	assert!(matcher.matches("environments/prod/us-east/terraform.tfstate"));
	assert!(matcher.matches("environments/terraform.tfstate"));
	assert!(!matcher.matches("environments/terraform.tfstate.bak"));
	assert!(!matcher.matches("modules/prod/terraform.tfstate"));
}

#[tokio::test]
async fn pattern_import_walks_the_directory_tree() {
	let tmp = tempfile::tempdir().unwrap();
	let root = tmp.path().join("environments");
	for (dir, lineage) in [("prod/us-east", "lin-prod"), ("staging", "lin-staging")] {
		std::fs::create_dir_all(root.join(dir)).unwrap();
		let doc = state(lineage, 1, json!([managed("aws_instance", "web", json!({"id": lineage}))]));
		std::fs::write(root.join(dir).join("terraform.tfstate"), doc.to_string()).unwrap();
	}
	std::fs::write(root.join("terraform.tfstate.bak"), "not json").unwrap();

	let store = MemoryStore::new();
	let engine = engine(&store);
	let pattern = format!("{}/**/*.tfstate", root.display());
	let report = engine.import_many(&SourceSpec::Pattern(pattern), 5).await.unwrap();

	assert_eq!(report.succeeded, 2);
	assert_eq!(report.failed, 0);
	assert_eq!(engine.list_lineages().await.unwrap().len(), 2);
}

#[tokio::test]
async fn one_unreadable_source_does_not_abort_the_batch() {
	for (label, store) in stores() {
		let tmp = tempfile::tempdir().unwrap();
		let mut sources = Vec::new();
		for n in 1..=5u64 {
			let path = tmp.path().join(format!("s{n}.tfstate"));
			if n != 3 {
				let doc = state(&format!("lin-batch-{n}"), 1, json!([managed("aws_instance", "web", json!({"n": n}))]));
				std::fs::write(&path, doc.to_string()).unwrap();
			}
			sources.push(path.display().to_string());
		}

		let engine = engine(&store);
		let report = engine.import_many(&SourceSpec::List(sources.clone()), 2).await.unwrap();

		assert_eq!(report.succeeded, 4, "{label}");
		assert_eq!(report.failed, 1, "{label}");
		assert_eq!(report.imports.len(), 4, "{label}");
		assert_eq!(report.failures.len(), 1, "{label}");
		assert_eq!(report.failures[0].locator, sources[2], "{label}");
		assert_eq!(report.failures[0].kind, "source_not_found", "{label}");
		assert_eq!(report.total_resources_inserted, 4, "{label}");
	}
}

#[tokio::test]
async fn lookups_take_the_partition_path_when_available() {
	let partitioned = MemoryStore::new();
	let scan_only = MemoryStore::without_partitions();
	let doc = state("lin-path", 1, json!([managed("aws_instance", "web", json!({"id": "i-1"}))]));

	for store in [&partitioned, &scan_only] {
		let engine = engine(store);
		engine.import_snapshot("a.tfstate", &doc).await.unwrap();
		store.clear_operations();
		engine.import_snapshot("a.tfstate", &doc).await.unwrap();
	}

	let hash_lookup = StoreOp::PartitionLookup {
		table: Table::Snapshot,
		partition: "idx_snapshot_content_hash".into(),
	};
	assert!(partitioned.operations().contains(&hash_lookup));
	assert!(!partitioned.operations().contains(&StoreOp::Scan { table: Table::Snapshot }));
	assert!(scan_only.operations().contains(&StoreOp::Scan { table: Table::Snapshot }));
}

#[tokio::test]
async fn reimported_serial_does_not_block_later_versions() {
	for (label, store) in stores() {
		let engine = engine(&store);
		let web = |x: u64| json!([managed("aws_instance", "web", json!({"id": "i-1", "x": x}))]);

		engine.import_snapshot("v1.tfstate", &state("lin-repeat", 1, web(1))).await.unwrap();
		engine.import_snapshot("v2.tfstate", &state("lin-repeat", 2, web(2))).await.unwrap();
		engine.import_snapshot("v2-rewritten.tfstate", &state("lin-repeat", 2, web(20))).await.unwrap();
		let third = imported(engine.import_snapshot("v3.tfstate", &state("lin-repeat", 3, web(3))).await.unwrap());

		let summary = third.diff_summary.unwrap_or_else(|| panic!("{label}: v3 has no diff"));
		assert_eq!((summary.added_count, summary.modified_count, summary.deleted_count), (0, 1, 0), "{label}");

		let diff = engine.compute_diff("lin-repeat", 2, 3).await.unwrap();
		assert_eq!(
			diff.changes.modified[0].changes,
			vec![FieldChange { field: "x".into(), old_value: json!(20), new_value: json!(3) }],
			"{label}"
		);
		let lineage = engine.get_lineage("lin-repeat").await.unwrap().unwrap();
		assert_eq!((lineage.latest_version, lineage.total_snapshots), (3, 4), "{label}");
	}
}
