use std::{
	path::{Path, PathBuf},
	time::SystemTime,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use super::{parse_document, SourceDriver, SourceError, StateFileInfo};
use crate::engine::glob::{has_wildcard, GlobMatcher};

/// State files on the local filesystem, selected by a glob pattern.
///
/// A pattern without wildcards names a single file.
#[derive(Debug, Clone)]
pub struct LocalDriver {
	matcher: GlobMatcher,
	root: PathBuf,
}

impl LocalDriver {
	pub fn new(pattern: &str) -> Result<Self, SourceError> {
		let matcher = GlobMatcher::new(pattern).map_err(|e| SourceError::InvalidPattern {
			pattern: pattern.to_string(),
			message: e.to_string(),
		})?;
		let root = match matcher.base() {
			"" => PathBuf::from("."),
			base => PathBuf::from(base),
		};
		Ok(Self { matcher, root })
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn pattern(&self) -> &str {
		self.matcher.as_str()
	}
}

#[async_trait]
impl SourceDriver for LocalDriver {
	fn kind(&self) -> &'static str {
		"local"
	}

	async fn initialize(&self) -> Result<(), SourceError> {
		if !self.root.exists() {
			return Err(SourceError::RootNotFound(self.root.display().to_string()));
		}
		Ok(())
	}

	async fn list_state_files(&self) -> Result<Vec<StateFileInfo>, SourceError> {
		if !has_wildcard(self.matcher.as_str()) {
			return Ok(vec![self.get_state_file_metadata(self.matcher.as_str()).await?]);
		}

		let (files, skipped) = tokio::task::spawn_blocking({
			let driver = self.clone();
			move || walk_matching(&driver)
		})
		.await
		.map_err(|e| SourceError::IoError(format!("task join error: {e}")))??;

		debug!(pattern = self.matcher.as_str(), found = files.len(), skipped, "listed local state files");
		Ok(files)
	}

	async fn read_state_file(&self, path: &str) -> Result<Value, SourceError> {
		let bytes = tokio::fs::read(path).await.map_err(|e| SourceError::from_io(e, path))?;
		parse_document(&bytes, path)
	}

	async fn get_state_file_metadata(&self, path: &str) -> Result<StateFileInfo, SourceError> {
		let metadata = tokio::fs::metadata(path).await.map_err(|e| SourceError::from_io(e, path))?;
		if !metadata.is_file() {
			return Err(SourceError::NotFound(path.to_string()));
		}
		Ok(file_info(path.to_string(), &metadata))
	}

	async fn close(&self) -> Result<(), SourceError> {
		Ok(())
	}
}

/// Paths are reported as `root/relative`, which is what the pattern is
/// matched against. Symlinks and unreadable entries are skipped and counted.
fn walk_matching(driver: &LocalDriver) -> Result<(Vec<StateFileInfo>, u64), SourceError> {
	let root = driver.root.as_path();
	if !root.exists() {
		return Err(SourceError::RootNotFound(root.display().to_string()));
	}
	if !root.is_dir() {
		return Err(SourceError::IoError(format!("{} is not a directory", root.display())));
	}

	let mut files = Vec::new();
	let mut skipped = 0u64;

	for result in WalkDir::new(root).follow_links(false).sort_by_file_name() {
		let entry = match result {
			Ok(e) => e,
			Err(_) => {
				skipped += 1;
				continue;
			}
		};

		if entry.file_type().is_symlink() {
			skipped += 1;
			continue;
		}
		if entry.file_type().is_dir() {
			continue;
		}

		let path = display_path(root, entry.path());
		if !driver.matcher.matches(&path) {
			continue;
		}

		match entry.metadata() {
			Ok(metadata) => files.push(file_info(path, &metadata)),
			Err(_) => skipped += 1,
		}
	}

	Ok((files, skipped))
}

fn display_path(root: &Path, path: &Path) -> String {
	if root == Path::new(".") {
		if let Ok(relative) = path.strip_prefix(root) {
			return relative.to_string_lossy().replace('\\', "/");
		}
	}
	path.to_string_lossy().replace('\\', "/")
}

fn file_info(path: String, metadata: &std::fs::Metadata) -> StateFileInfo {
	let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
	let last_modified: DateTime<Utc> = modified.into();
	let size = metadata.len();
	StateFileInfo {
		etag: Some(format!("{:x}-{:x}", last_modified.timestamp_millis(), size)),
		path,
		last_modified,
		size,
	}
}

#[cfg(test)]
mod tests {
	use std::fs;

	use chrono::Duration;

	use super::*;

	const STATE: &str = r#"{"version": 4, "serial": 1, "lineage": "lin", "resources": []}"#;

	fn setup_tree(dir: &Path) {
		fs::create_dir_all(dir.join("environments/prod/us-east")).unwrap();
		fs::create_dir_all(dir.join("environments/staging")).unwrap();
		fs::write(dir.join("environments/terraform.tfstate"), STATE).unwrap();
		fs::write(dir.join("environments/prod/us-east/terraform.tfstate"), STATE).unwrap();
		fs::write(dir.join("environments/staging/terraform.tfstate"), STATE).unwrap();
		fs::write(dir.join("environments/staging/terraform.tfstate.bak"), STATE).unwrap();
		fs::write(dir.join("environments/notes.txt"), "hello").unwrap();
	}

	fn pattern(dir: &Path, suffix: &str) -> String {
		format!("{}/{suffix}", dir.display())
	}

	#[tokio::test]
	async fn lists_only_matching_files() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		let driver = LocalDriver::new(&pattern(tmp.path(), "environments/**/*.tfstate")).unwrap();

		let files = driver.list_state_files().await.unwrap();

		let mut names: Vec<String> = files
			.iter()
			.map(|f| f.path.trim_start_matches(&format!("{}/", tmp.path().display())).to_string())
			.collect();
		names.sort();
		assert_eq!(
			names,
			vec![
				"environments/prod/us-east/terraform.tfstate",
				"environments/staging/terraform.tfstate",
				"environments/terraform.tfstate",
			]
		);
		assert!(files.iter().all(|f| f.size == STATE.len() as u64 && f.etag.is_some()));
	}

	#[tokio::test]
	async fn single_star_does_not_descend() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		let driver = LocalDriver::new(&pattern(tmp.path(), "environments/*.tfstate")).unwrap();

		let files = driver.list_state_files().await.unwrap();

		assert_eq!(files.len(), 1);
		assert!(files[0].path.ends_with("environments/terraform.tfstate"));
	}

	#[tokio::test]
	async fn skips_symlinks() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		std::os::unix::fs::symlink(
			tmp.path().join("environments/terraform.tfstate"),
			tmp.path().join("environments/link.tfstate"),
		)
		.unwrap();
		let driver = LocalDriver::new(&pattern(tmp.path(), "environments/**/*.tfstate")).unwrap();

		let (files, skipped) = walk_matching(&driver).unwrap();

		assert_eq!(files.len(), 3);
		assert_eq!(skipped, 1);
	}

	#[tokio::test]
	async fn literal_pattern_names_one_file() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		let path = pattern(tmp.path(), "environments/staging/terraform.tfstate");
		let driver = LocalDriver::new(&path).unwrap();

		let files = driver.list_state_files().await.unwrap();

		assert_eq!(files.len(), 1);
		assert_eq!(files[0].path, path);
	}

	#[tokio::test]
	async fn reads_and_parses() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		let path = pattern(tmp.path(), "environments/terraform.tfstate");
		let driver = LocalDriver::new(&path).unwrap();

		let doc = driver.read_state_file(&path).await.unwrap();

		assert_eq!(doc["lineage"], "lin");
	}

	#[tokio::test]
	async fn missing_file_is_not_found() {
		let tmp = tempfile::tempdir().unwrap();
		let path = pattern(tmp.path(), "gone.tfstate");
		let driver = LocalDriver::new(&path).unwrap();

		let err = driver.read_state_file(&path).await.unwrap_err();

		assert!(matches!(err, SourceError::NotFound(_)));
	}

	#[tokio::test]
	async fn bad_json_is_a_parse_error() {
		let tmp = tempfile::tempdir().unwrap();
		let path = pattern(tmp.path(), "broken.tfstate");
		fs::write(&path, "{not json").unwrap();
		let driver = LocalDriver::new(&path).unwrap();

		let err = driver.read_state_file(&path).await.unwrap_err();

		assert!(matches!(err, SourceError::Parse { .. }));
	}

	#[tokio::test]
	async fn missing_root_fails_initialize() {
		let driver = LocalDriver::new("/tmp/tflineage_definitely_not_real/**/*.tfstate").unwrap();
		assert!(matches!(driver.initialize().await, Err(SourceError::RootNotFound(_))));
	}

	#[tokio::test]
	async fn modification_check_uses_mtime() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		let path = pattern(tmp.path(), "environments/terraform.tfstate");
		let driver = LocalDriver::new(&path).unwrap();

		let info = driver.get_state_file_metadata(&path).await.unwrap();

		assert!(driver.has_been_modified(&path, info.last_modified - Duration::seconds(60)).await.unwrap());
		assert!(!driver.has_been_modified(&path, info.last_modified + Duration::seconds(60)).await.unwrap());
	}
}
