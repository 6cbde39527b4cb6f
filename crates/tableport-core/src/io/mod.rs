//! Storage I/O over local filesystems and object stores.
//!
//! A [`FileIo`] addresses files by their full location string, so the same
//! metadata can reference `/abs/path`, `file:///abs/path` or
//! `s3://bucket/key` files. It keeps the configuration map it was built from
//! so loaders can hand it to every process verbatim.

mod file;

pub use file::{InputFile, OutputFile};

use crate::{Result, StorageError};
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// S3 region.
pub const S3_REGION: &str = "s3.region";
/// S3-compatible endpoint URL; `http://` endpoints allow plain HTTP.
pub const S3_ENDPOINT: &str = "s3.endpoint";
pub const S3_ACCESS_KEY_ID: &str = "s3.access-key-id";
pub const S3_SECRET_ACCESS_KEY: &str = "s3.secret-access-key";
pub const S3_SESSION_TOKEN: &str = "s3.session-token";
/// `true` to address buckets as `endpoint/bucket` rather than `bucket.endpoint`.
pub const S3_PATH_STYLE_ACCESS: &str = "s3.path-style-access";
/// `etag` (default) or `disabled`. Create-only metadata writes need `etag`.
pub const S3_CONDITIONAL_PUT: &str = "s3.conditional-put";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Scheme {
    Local,
    S3 { bucket: String },
}

impl Scheme {
    fn parse(location: &str) -> Result<Self> {
        if let Some((bucket, _)) = split_s3(location) {
            if bucket.is_empty() {
                return Err(StorageError::InvalidLocation(format!(
                    "missing bucket in {}",
                    location
                ))
                .into());
            }
            return Ok(Scheme::S3 {
                bucket: bucket.to_string(),
            });
        }
        if location.starts_with("file:") || !location.contains("://") {
            return Ok(Scheme::Local);
        }
        Err(StorageError::InvalidLocation(format!("unsupported scheme in {}", location)).into())
    }
}

/// Storage abstraction used to read and write table files.
#[derive(Clone)]
pub struct FileIo {
    scheme: Scheme,
    store: Arc<dyn ObjectStore>,
    properties: Arc<BTreeMap<String, String>>,
}

impl fmt::Debug for FileIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileIo")
            .field("scheme", &self.scheme)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FileIo {
    /// Build a file I/O able to address `location` and its children.
    pub fn from_location(location: &str, properties: BTreeMap<String, String>) -> Result<Self> {
        let scheme = Scheme::parse(location)?;
        let store: Arc<dyn ObjectStore> = match &scheme {
            Scheme::Local => Arc::new(LocalFileSystem::new()),
            Scheme::S3 { bucket } => create_s3_store(bucket, &properties)?,
        };

        debug!(location = %location, scheme = ?scheme, "Created file IO");

        Ok(Self {
            scheme,
            store,
            properties: Arc::new(properties),
        })
    }

    /// Configuration this file I/O was built from.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn new_output(&self, location: &str) -> Result<OutputFile> {
        let path = self.object_path(location)?;
        Ok(OutputFile::new(self.store.clone(), path, location.to_string()))
    }

    pub fn new_input(&self, location: &str) -> Result<InputFile> {
        let path = self.object_path(location)?;
        Ok(InputFile::new(self.store.clone(), path, location.to_string()))
    }

    /// Delete a file. Missing files are not an error.
    pub async fn delete(&self, location: &str) -> Result<()> {
        let path = self.object_path(location)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, location: &str) -> Result<bool> {
        self.new_input(location)?.exists().await
    }

    fn object_path(&self, location: &str) -> Result<ObjectPath> {
        match &self.scheme {
            Scheme::Local => {
                let absolute = local_path(location)?;
                Ok(ObjectPath::from(absolute.trim_start_matches('/')))
            }
            Scheme::S3 { bucket } => match split_s3(location) {
                Some((b, key)) if b == bucket => Ok(ObjectPath::from(key)),
                Some((b, _)) => Err(StorageError::InvalidLocation(format!(
                    "{} is outside bucket {} (got {})",
                    location, bucket, b
                ))
                .into()),
                None => Err(StorageError::InvalidLocation(format!(
                    "{} is not an s3 location",
                    location
                ))
                .into()),
            },
        }
    }
}

/// Split `s3://bucket/key` into bucket and key.
fn split_s3(location: &str) -> Option<(&str, &str)> {
    let rest = ["s3://", "s3a://", "s3n://"]
        .iter()
        .find_map(|prefix| location.strip_prefix(prefix))?;
    Some(match rest.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (rest, ""),
    })
}

/// Resolve a local location to an absolute filesystem path.
fn local_path(location: &str) -> Result<String> {
    let path = if let Some(rest) = location.strip_prefix("file://") {
        rest
    } else if let Some(rest) = location.strip_prefix("file:") {
        rest
    } else {
        location
    };

    if path.starts_with('/') {
        return Ok(path.to_string());
    }

    let cwd = std::env::current_dir()?;
    cwd.join(path)
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| StorageError::InvalidLocation(format!("non UTF-8 path {}", location)).into())
}

fn create_s3_store(
    bucket: &str,
    properties: &BTreeMap<String, String>,
) -> Result<Arc<dyn ObjectStore>> {
    use object_store::aws::{AmazonS3Builder, S3ConditionalPut};

    let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);

    if let Some(region) = properties.get(S3_REGION) {
        builder = builder.with_region(region);
    }

    if let Some(access_key) = properties.get(S3_ACCESS_KEY_ID) {
        builder = builder.with_access_key_id(access_key);
    }

    if let Some(secret_key) = properties.get(S3_SECRET_ACCESS_KEY) {
        builder = builder.with_secret_access_key(secret_key);
    }

    if let Some(token) = properties.get(S3_SESSION_TOKEN) {
        builder = builder.with_token(token);
    }

    if let Some(endpoint) = properties.get(S3_ENDPOINT) {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }

    if let Some(path_style) = properties.get(S3_PATH_STYLE_ACCESS) {
        builder =
            builder.with_virtual_hosted_style_request(!path_style.eq_ignore_ascii_case("true"));
    }

    match properties.get(S3_CONDITIONAL_PUT).map(String::as_str) {
        None | Some("etag") => builder = builder.with_conditional_put(S3ConditionalPut::ETagMatch),
        Some("disabled") => {}
        Some(other) => {
            return Err(StorageError::InvalidLocation(format!(
                "unknown {} value {}",
                S3_CONDITIONAL_PUT, other
            ))
            .into())
        }
    }

    let store = builder
        .build()
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_scheme_parse() {
        assert_eq!(Scheme::parse("/tmp/t").unwrap(), Scheme::Local);
        assert_eq!(Scheme::parse("file:///tmp/t").unwrap(), Scheme::Local);
        assert_eq!(
            Scheme::parse("s3://bucket/warehouse/t").unwrap(),
            Scheme::S3 {
                bucket: "bucket".into()
            }
        );
        assert!(Scheme::parse("gs://bucket/t").is_err());
        assert!(Scheme::parse("s3:///t").is_err());
    }

    #[test]
    fn test_local_path_forms_are_equivalent() {
        assert_eq!(local_path("/tmp/a").unwrap(), "/tmp/a");
        assert_eq!(local_path("file:/tmp/a").unwrap(), "/tmp/a");
        assert_eq!(local_path("file:///tmp/a").unwrap(), "/tmp/a");
    }

    #[test]
    fn test_s3_store_from_properties() {
        let mut props = BTreeMap::new();
        props.insert(S3_REGION.to_string(), "eu-west-1".to_string());
        props.insert(S3_ENDPOINT.to_string(), "http://localhost:9000".to_string());
        props.insert(S3_PATH_STYLE_ACCESS.to_string(), "true".to_string());
        let io = FileIo::from_location("s3://bucket/warehouse", props).unwrap();

        assert_eq!(io.property(S3_REGION), Some("eu-west-1"));
        assert!(io.new_output("s3://bucket/warehouse/a.json").is_ok());
        assert!(io.new_output("s3://other/warehouse/a.json").is_err());
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_str().unwrap();
        let io = FileIo::from_location(root, BTreeMap::new()).unwrap();

        let location = format!("{}/nested/dir/file.txt", root);
        let mut output = io.new_output(&location).unwrap();
        output.write_all(b"hello").unwrap();
        assert_eq!(output.close().await.unwrap(), 5);

        let input = io.new_input(&format!("file://{}", location)).unwrap();
        assert_eq!(input.read().await.unwrap().as_ref(), b"hello");
        assert_eq!(input.length().await.unwrap(), 5);

        io.delete(&location).await.unwrap();
        assert!(!io.exists(&location).await.unwrap());
        io.delete(&location).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_new_refuses_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_str().unwrap();
        let io = FileIo::from_location(root, BTreeMap::new()).unwrap();
        let location = format!("{}/v1.metadata.json", root);

        let mut first = io.new_output(&location).unwrap();
        first.write_all(b"first").unwrap();
        first.close_new().await.unwrap();

        let mut second = io.new_output(&location).unwrap();
        second.write_all(b"second").unwrap();
        let err = second.close_new().await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::AlreadyExists(_))
        ));

        let content = io.new_input(&location).unwrap().read().await.unwrap();
        assert_eq!(content.as_ref(), b"first");
    }
}
