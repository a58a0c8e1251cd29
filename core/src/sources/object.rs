//! Object storage source backed by the `object_store` crate.
//!
//! Locators look like `s3://bucket/environments/**/*.tfstate`. Listing goes
//! through the non-wildcard prefix of the key pattern, then every key is
//! filtered with the same glob semantics the local driver uses.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::{path::Path as ObjectPath, ObjectMeta, ObjectStore};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{parse_document, SourceDriver, SourceError, StateFileInfo};
use crate::engine::glob::{has_wildcard, GlobMatcher};

pub const SUPPORTED_SCHEMES: [&str; 6] = ["s3", "gs", "az", "azure", "file", "memory"];

/// Whether a locator should be handled by [`ObjectStoreDriver`] rather than the
/// local filesystem driver.
pub fn is_object_url(locator: &str) -> bool {
	locator
		.split_once("://")
		.is_some_and(|(scheme, _)| SUPPORTED_SCHEMES.contains(&scheme))
}

pub struct ObjectStoreDriver {
	store: Arc<dyn ObjectStore>,
	/// `scheme://bucket/`, prepended to keys when reporting paths.
	origin: String,
	matcher: GlobMatcher,
}

impl std::fmt::Debug for ObjectStoreDriver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ObjectStoreDriver")
			.field("origin", &self.origin)
			.field("pattern", &self.matcher.as_str())
			.finish()
	}
}

impl ObjectStoreDriver {
	/// Build a driver from a locator URL. Credentials come from the usual
	/// provider environment variables.
	pub fn from_url(locator: &str) -> Result<Self, SourceError> {
		let (scheme, rest) = locator
			.split_once("://")
			.ok_or_else(|| SourceError::ObjectStore(format!("not an object store URL: {locator}")))?;
		let (bucket, key_pattern) = rest.split_once('/').unwrap_or((rest, ""));

		let store: Arc<dyn ObjectStore> = match scheme {
			"s3" => s3_store(&bucket_url(scheme, bucket)?)?,
			"gs" => gcs_store(&bucket_url(scheme, bucket)?)?,
			"az" | "azure" => azure_store(&bucket_url(scheme, bucket)?)?,
			"file" => Arc::new(object_store::local::LocalFileSystem::new()),
			"memory" => Arc::new(object_store::memory::InMemory::new()),
			other => {
				return Err(SourceError::ObjectStore(format!(
					"unsupported URL scheme '{other}'. Supported: s3, gs, az, file, memory"
				)))
			}
		};

		Self::new(store, &format!("{scheme}://{bucket}/"), key_pattern)
	}

	/// Driver over an existing store. `origin` is prefixed to every key in
	/// reported paths; `key_pattern` is matched against object keys.
	pub fn new(store: Arc<dyn ObjectStore>, origin: &str, key_pattern: &str) -> Result<Self, SourceError> {
		let key_pattern = key_pattern.trim_start_matches('/');
		if key_pattern.is_empty() {
			return Err(SourceError::InvalidPattern {
				pattern: format!("{origin}{key_pattern}"),
				message: "missing object key or pattern".into(),
			});
		}
		let matcher = GlobMatcher::new(key_pattern).map_err(|e| SourceError::InvalidPattern {
			pattern: format!("{origin}{key_pattern}"),
			message: e.to_string(),
		})?;
		Ok(Self { store, origin: origin.to_string(), matcher })
	}

	pub fn store(&self) -> &Arc<dyn ObjectStore> {
		&self.store
	}

	/// Object key for a reported path or a bare key.
	fn key_for<'a>(&self, path: &'a str) -> &'a str {
		path.strip_prefix(self.origin.as_str()).unwrap_or(path).trim_start_matches('/')
	}

	fn info(&self, meta: &ObjectMeta) -> StateFileInfo {
		StateFileInfo {
			path: format!("{}{}", self.origin, meta.location),
			last_modified: meta.last_modified,
			size: meta.size as u64,
			etag: meta.e_tag.clone(),
		}
	}
}

#[async_trait]
impl SourceDriver for ObjectStoreDriver {
	fn kind(&self) -> &'static str {
		"object_store"
	}

	async fn initialize(&self) -> Result<(), SourceError> {
		Ok(())
	}

	async fn list_state_files(&self) -> Result<Vec<StateFileInfo>, SourceError> {
		if !has_wildcard(self.matcher.as_str()) {
			return Ok(vec![self.get_state_file_metadata(self.matcher.as_str()).await?]);
		}

		let base = self.matcher.base().trim_matches('/');
		let prefix = (!base.is_empty()).then(|| ObjectPath::from(base));
		let objects: Vec<ObjectMeta> = self
			.store
			.list(prefix.as_ref())
			.try_collect()
			.await
			.map_err(|e| SourceError::ObjectStore(format!("failed to list {}{base}: {e}", self.origin)))?;

		let mut files: Vec<StateFileInfo> = objects
			.iter()
			.filter(|meta| self.matcher.matches(meta.location.as_ref()))
			.map(|meta| self.info(meta))
			.collect();
		files.sort_by(|a, b| a.path.cmp(&b.path));

		debug!(origin = %self.origin, pattern = self.matcher.as_str(), listed = objects.len(), matched = files.len(), "listed objects");
		Ok(files)
	}

	async fn read_state_file(&self, path: &str) -> Result<Value, SourceError> {
		let key = ObjectPath::from(self.key_for(path));
		let result = self.store.get(&key).await.map_err(|e| object_error(e, path))?;
		let bytes = result.bytes().await.map_err(|e| object_error(e, path))?;
		parse_document(&bytes, path)
	}

	async fn get_state_file_metadata(&self, path: &str) -> Result<StateFileInfo, SourceError> {
		let key = ObjectPath::from(self.key_for(path));
		let meta = self.store.head(&key).await.map_err(|e| object_error(e, path))?;
		Ok(self.info(&meta))
	}

	async fn close(&self) -> Result<(), SourceError> {
		Ok(())
	}
}

fn object_error(err: object_store::Error, path: &str) -> SourceError {
	match err {
		object_store::Error::NotFound { .. } => SourceError::NotFound(path.to_string()),
		other => SourceError::ObjectStore(format!("{path}: {other}")),
	}
}

fn bucket_url(scheme: &str, bucket: &str) -> Result<Url, SourceError> {
	let url = Url::parse(&format!("{scheme}://{bucket}"))
		.map_err(|e| SourceError::ObjectStore(format!("invalid URL '{scheme}://{bucket}': {e}")))?;
	if url.host_str().map_or(true, str::is_empty) {
		return Err(SourceError::ObjectStore(format!("{scheme} URL must include a bucket name as host")));
	}
	Ok(url)
}

fn host(url: &Url) -> Result<&str, SourceError> {
	url.host_str()
		.ok_or_else(|| SourceError::ObjectStore(format!("{} URL must include a bucket name as host", url.scheme())))
}

fn s3_store(url: &Url) -> Result<Arc<dyn ObjectStore>, SourceError> {
	let mut builder = object_store::aws::AmazonS3Builder::new()
		.with_bucket_name(host(url)?)
		.with_region(std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()));

	if let Ok(key_id) = std::env::var("AWS_ACCESS_KEY_ID") {
		builder = builder.with_access_key_id(key_id);
	}
	if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
		builder = builder.with_secret_access_key(secret);
	}
	// MinIO and friends
	if let Ok(endpoint) = std::env::var("AWS_ENDPOINT") {
		builder = builder.with_endpoint(endpoint).with_virtual_hosted_style_request(false);
	}

	let store = builder
		.build()
		.map_err(|e| SourceError::ObjectStore(format!("failed to create S3 store: {e}")))?;
	Ok(Arc::new(store))
}

fn gcs_store(url: &Url) -> Result<Arc<dyn ObjectStore>, SourceError> {
	let mut builder = object_store::gcp::GoogleCloudStorageBuilder::new().with_bucket_name(host(url)?);
	if let Ok(creds_path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
		builder = builder.with_service_account_path(creds_path);
	}
	let store = builder
		.build()
		.map_err(|e| SourceError::ObjectStore(format!("failed to create GCS store: {e}")))?;
	Ok(Arc::new(store))
}

fn azure_store(url: &Url) -> Result<Arc<dyn ObjectStore>, SourceError> {
	let account = std::env::var("AZURE_STORAGE_ACCOUNT_NAME")
		.map_err(|_| SourceError::ObjectStore("AZURE_STORAGE_ACCOUNT_NAME environment variable not set".into()))?;
	let mut builder = object_store::azure::MicrosoftAzureBuilder::new()
		.with_account(account)
		.with_container_name(host(url)?);
	if let Ok(key) = std::env::var("AZURE_STORAGE_ACCOUNT_KEY") {
		builder = builder.with_access_key(key);
	}
	let store = builder
		.build()
		.map_err(|e| SourceError::ObjectStore(format!("failed to create Azure store: {e}")))?;
	Ok(Arc::new(store))
}
