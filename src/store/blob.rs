//! Byte storage for job input and output, addressed by opaque reference.
//!
//! Backed by `object_store`, so the same code serves S3/MinIO or a local
//! directory depending on the configured URL:
//!
//! ```text
//! # S3
//! PDF2MD_BLOB_STORE_URL=s3://pdf2md-jobs?region=us-east-1
//!
//! # MinIO (self-hosted S3-compatible)
//! PDF2MD_BLOB_STORE_URL=s3://pdf2md-jobs?endpoint=http://minio:9000&region=us-east-1
//!
//! # Local filesystem (great for dev/testing)
//! PDF2MD_BLOB_STORE_URL=file:///var/lib/pdf2md/blobs
//! ```
//!
//! References (`uploads/<uuid>.pdf` for input, `jobs/<job_id>/result.md`
//! for output) are stored on the job row; nothing outside this module
//! interprets them. Input refs are minted before the job row exists, so
//! upload bytes are always in place by the time a worker can claim the
//! job.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use object_store::path::Path;
use object_store::ObjectStore;
use uuid::Uuid;

#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
}

impl BlobStore {
    pub fn from_url(url: &str) -> Result<Self> {
        let store = build_object_store(url)?;
        Ok(Self {
            store: Arc::from(store),
        })
    }

    /// Mint a fresh input reference. Deliberately not derived from a job
    /// id: the bytes are written under this ref first and the job row is
    /// created after, pointing at it.
    pub fn new_input_ref() -> String {
        format!("uploads/{}.pdf", Uuid::new_v4())
    }

    pub fn result_ref(job_id: &str, extension: &str) -> String {
        format!("jobs/{job_id}/result.{extension}")
    }

    pub async fn put(&self, reference: &str, bytes: Bytes) -> Result<()> {
        self.store
            .put(&Path::from(reference), bytes.into())
            .await
            .with_context(|| format!("writing blob {reference}"))?;
        Ok(())
    }

    pub async fn get(&self, reference: &str) -> Result<Bytes> {
        let result = self
            .store
            .get(&Path::from(reference))
            .await
            .with_context(|| format!("reading blob {reference}"))?;
        result
            .bytes()
            .await
            .with_context(|| format!("draining blob {reference}"))
    }
}

fn build_object_store(url: &str) -> Result<Box<dyn ObjectStore>> {
    if let Some(dir) = url.strip_prefix("file://") {
        std::fs::create_dir_all(dir).with_context(|| format!("creating blob directory {dir}"))?;
        let store = object_store::local::LocalFileSystem::new_with_prefix(dir)
            .context("failed to create local file system object store")?;
        return Ok(Box::new(store));
    }

    if let Some(without_scheme) = url.strip_prefix("s3://") {
        let bucket = without_scheme.split('?').next().unwrap_or(without_scheme);

        let endpoint = parse_query_param(url, "endpoint");
        let region = parse_query_param(url, "region").unwrap_or_else(|| "us-east-1".to_string());

        let mut builder = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(&region);

        if let Some(ep) = endpoint {
            builder = builder.with_endpoint(&ep).with_allow_http(true);
        }

        let store = builder.build().context("failed to build S3 object store")?;
        return Ok(Box::new(store));
    }

    if let Some(without_scheme) = url.strip_prefix("gs://") {
        let bucket = without_scheme.split('?').next().unwrap_or(without_scheme);
        let store = object_store::gcp::GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .context("failed to build GCS object store")?;
        return Ok(Box::new(store));
    }

    if let Some(without_scheme) = url.strip_prefix("az://") {
        let container = without_scheme.split('?').next().unwrap_or(without_scheme);
        let store = object_store::azure::MicrosoftAzureBuilder::from_env()
            .with_container_name(container)
            .build()
            .context("failed to build Azure object store")?;
        return Ok(Box::new(store));
    }

    anyhow::bail!("unsupported blob store URL scheme: {}", url)
}

fn parse_query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}
