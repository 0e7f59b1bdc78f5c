//! Host a static website on S3 behind CloudFront.
//!
//! `deploy` creates a website bucket, uploads a local directory into it, and fronts
//! it with a CloudFront distribution. `cleanup` reverses that setup: it finds the
//! distribution whose origin is the bucket's website endpoint, disables and deletes
//! it, empties every object version from the bucket, and finally deletes the bucket.
//!
//! All calls to AWS go through the [Storage] and [Cdn] traits so that the ordering
//! and waiting logic can be exercised against [mocks].

use serde::Deserialize;
use std::{fmt, fs::File, future::Future, path::Path, time::Duration};
use thiserror::Error;

pub mod bucket;
pub mod cleanup;
pub use cleanup::cleanup;
pub mod cloudfront;
pub mod deploy;
pub use deploy::deploy;
pub mod locate;
pub mod mocks;
pub mod prompt;
pub mod s3;
pub mod teardown;
pub mod upload;
pub mod utils;

pub const DEPLOY_CMD: &str = "deploy";
pub const CLEANUP_CMD: &str = "cleanup";

/// Region a bucket lives in when S3 reports no location constraint
pub const DEFAULT_REGION: &str = "us-east-1";

/// Domain suffix of S3 website endpoints
pub const CLOUD_DOMAIN: &str = "amazonaws.com";

/// Maximum number of keys accepted by a single `DeleteObjects` request
pub const MAX_DELETE_BATCH: usize = 1000;

/// Operations issued against S3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Operation {
    GetBucketLocation,
    HeadBucket,
    CreateBucket,
    PutPublicAccessBlock,
    PutBucketWebsite,
    PutBucketPolicy,
    PutObject,
    GetBucketVersioning,
    ListObjectVersions,
    DeleteObjects,
    DeleteBucket,
}

impl fmt::Display for S3Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Operations issued against CloudFront
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudFrontOperation {
    ListDistributions,
    GetDistributionConfig,
    GetDistribution,
    UpdateDistribution,
    DeleteDistribution,
    CreateDistribution,
}

impl fmt::Display for CloudFrontOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a mutating CloudFront call was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The `If-Match` token no longer matches the distribution
    StaleEtag,
    /// Another update to the distribution has not finished yet
    UpdateInProgress,
    /// The distribution changed between our disable and our delete
    ConcurrentModification,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::StaleEtag => "stale etag",
            Self::UpdateInProgress => "update in progress",
            Self::ConcurrentModification => "modified concurrently",
        };
        f.write_str(reason)
    }
}

/// An object version that a bulk delete could not remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub version_id: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("distribution not found: {0}")]
    DistributionNotFound(String),
    #[error("multiple distributions use {origin} as origin: {ids:?}")]
    AmbiguousDistribution { origin: String, ids: Vec<String> },
    #[error("distribution {id} rejected the request: {reason}")]
    Conflict { id: String, reason: ConflictReason },
    #[error("distribution {0} is not disabled")]
    DistributionNotDisabled(String),
    #[error("bucket {0} is not empty")]
    BucketNotEmpty(String),
    #[error("timed out waiting for {operation} after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },
    #[error("failed to delete {} object versions from bucket {bucket}", .failures.len())]
    PartialBatchFailure {
        bucket: String,
        failures: Vec<DeleteFailure>,
    },
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("bucket name already taken: {0}")]
    BucketNameTaken(String),
    #[error("no available bucket name after {0} attempts")]
    BucketNameAttemptsExhausted(usize),
    #[error("no bucket name provided")]
    MissingBucketName,
    #[error("region of bucket {0} could not be determined")]
    RegionUnresolved(String),
    #[error("response missing {0}")]
    MissingField(&'static str),
    #[error("s3 {operation} failed for bucket {bucket}: {source}")]
    AwsS3 {
        bucket: String,
        operation: S3Operation,
        #[source]
        source: Box<aws_sdk_s3::Error>,
    },
    #[error("cloudfront {operation} failed: {source}")]
    AwsCloudFront {
        operation: CloudFrontOperation,
        #[source]
        source: Box<aws_sdk_cloudfront::Error>,
    },
    #[error("invalid request: {0}")]
    Build(#[from] aws_sdk_s3::error::BuildError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Deployment and teardown settings, optionally loaded from a YAML file
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub region: String,
    pub source_dir: String,
    pub bucket_prefix: String,
    pub index_document: String,
    pub error_document: String,
    pub exclude_extensions: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub cloudfront_poll_interval_secs: u64,
    pub cloudfront_timeout_secs: u64,
    pub deploy_timeout_secs: u64,
    pub empty_timeout_secs: u64,
    pub bucket_poll_interval_secs: u64,
    pub bucket_poll_attempts: usize,
    pub bucket_name_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        fn strings(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }
        Self {
            region: DEFAULT_REGION.to_string(),
            source_dir: "../WebApp".to_string(),
            bucket_prefix: "static-site".to_string(),
            index_document: "index.html".to_string(),
            error_document: "error.html".to_string(),
            exclude_extensions: strings(&[
                ".ps1",
                ".py",
                ".pyc",
                ".git",
                ".gitignore",
                ".DS_Store",
                ".sh",
                ".tf",
                ".tfstate",
                ".tfstate.backup",
                ".tfvars",
                ".tfvars.json",
            ]),
            exclude_dirs: strings(&[
                "deployment-python",
                ".git",
                "__pycache__",
                ".github",
                ".vscode",
                "deployment-terraform",
            ]),
            cloudfront_poll_interval_secs: 10,
            cloudfront_timeout_secs: 600,
            deploy_timeout_secs: 30 * 60,
            empty_timeout_secs: 300,
            bucket_poll_interval_secs: 15,
            bucket_poll_attempts: 20,
            bucket_name_attempts: 5,
        }
    }
}

impl Config {
    /// Reads the configuration at `path`, or returns the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn timings(&self) -> Timings {
        Timings {
            distribution_poll_interval: Duration::from_secs(self.cloudfront_poll_interval_secs),
            distribution_timeout: Duration::from_secs(self.cloudfront_timeout_secs),
            deploy_timeout: Duration::from_secs(self.deploy_timeout_secs),
            empty_timeout: Duration::from_secs(self.empty_timeout_secs),
            bucket_poll_interval: Duration::from_secs(self.bucket_poll_interval_secs),
            bucket_poll_attempts: self.bucket_poll_attempts,
        }
    }
}

/// Bounds for every wait loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    pub distribution_poll_interval: Duration,
    pub distribution_timeout: Duration,
    pub deploy_timeout: Duration,
    pub empty_timeout: Duration,
    pub bucket_poll_interval: Duration,
    pub bucket_poll_attempts: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Config::default().timings()
    }
}

/// A bucket and the region it lives in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketRef {
    pub name: String,
    pub region: String,
}

impl BucketRef {
    /// Host name of the bucket's static website endpoint
    pub fn website_endpoint(&self) -> String {
        website_endpoint(&self.name, &self.region)
    }
}

/// Host name S3 serves a bucket's website from
pub fn website_endpoint(bucket: &str, region: &str) -> String {
    format!("{bucket}.s3-website-{region}.{CLOUD_DOMAIN}")
}

/// A distribution located by its origin, as seen during discovery.
///
/// Only `id` is carried into the teardown. Its `etag`, enabled flag and
/// [DistributionStatus] go stale as soon as anyone else touches the distribution,
/// so the teardown reads them again before its first mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistributionRef {
    pub id: String,
    pub etag: String,
    pub enabled: bool,
}

/// Propagation state reported by CloudFront
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributionStatus {
    InProgress,
    Deployed,
}

impl DistributionStatus {
    pub fn parse(status: &str) -> Self {
        if status == "Deployed" {
            Self::Deployed
        } else {
            Self::InProgress
        }
    }
}

/// Live state of a distribution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DistributionState {
    pub status: DistributionStatus,
    pub enabled: bool,
}

/// A distribution's configuration as last read, with its concurrency token
#[derive(Clone, Debug)]
pub struct DistributionSnapshot<C> {
    pub etag: String,
    pub enabled: bool,
    pub origins: Vec<String>,
    pub config: C,
}

/// One page of distribution ids
#[derive(Clone, Debug, Default)]
pub struct DistributionPage {
    pub ids: Vec<String>,
    pub next_marker: Option<String>,
}

/// Website distribution to create in front of a bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebsiteDistribution {
    pub bucket: String,
    pub origin_domain: String,
    pub default_root_object: String,
    pub caller_reference: String,
}

/// A created distribution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedDistribution {
    pub id: String,
    pub domain_name: String,
}

/// One stored object version or delete marker
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectVersionKey {
    pub key: String,
    pub version_id: String,
}

impl ObjectVersionKey {
    pub fn new(key: impl Into<String>, version_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version_id: version_id.into(),
        }
    }
}

/// Position to resume a version listing from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionMarker {
    pub key_marker: Option<String>,
    pub version_id_marker: Option<String>,
}

/// One page of object versions followed by delete markers
#[derive(Clone, Debug, Default)]
pub struct VersionPage {
    pub keys: Vec<ObjectVersionKey>,
    pub next: Option<VersionMarker>,
}

/// A file to upload and its metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectUpload<'a> {
    pub key: &'a str,
    pub path: &'a Path,
    pub content_type: &'a str,
    pub cache_control: Option<&'a str>,
}

/// Object storage operations consumed by deployment and teardown
pub trait Storage: Clone + Send + Sync + 'static {
    /// Returns a handle whose bucket-level calls target `region`
    fn for_region(&self, region: &str) -> Self;

    /// Location constraint of the bucket (`None` when S3 reports none)
    fn bucket_region(
        &self,
        bucket: &str,
    ) -> impl Future<Output = Result<Option<String>, Error>> + Send;

    fn bucket_exists(&self, bucket: &str) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Creates the bucket; succeeds if the caller already owns it
    fn create_bucket(
        &self,
        bucket: &str,
        region: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn disable_block_public_access(
        &self,
        bucket: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn put_website(
        &self,
        bucket: &str,
        index_document: &str,
        error_document: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn put_bucket_policy(
        &self,
        bucket: &str,
        policy: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn upload_object(
        &self,
        bucket: &str,
        upload: ObjectUpload<'_>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn versioning_enabled(&self, bucket: &str) -> impl Future<Output = Result<bool, Error>> + Send;

    fn list_object_versions(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> impl Future<Output = Result<VersionPage, Error>> + Send;

    /// Deletes up to [MAX_DELETE_BATCH] versions, returning the ones that could not be removed
    fn delete_objects(
        &self,
        bucket: &str,
        batch: &[ObjectVersionKey],
    ) -> impl Future<Output = Result<Vec<DeleteFailure>, Error>> + Send;

    fn delete_bucket(&self, bucket: &str) -> impl Future<Output = Result<(), Error>> + Send;
}

/// CDN control-plane operations consumed by deployment and teardown
pub trait Cdn: Clone + Send + Sync + 'static {
    /// Full distribution configuration, echoed back when updating
    type Config: Clone + Send + Sync + 'static;

    fn list_distributions(
        &self,
        marker: Option<String>,
    ) -> impl Future<Output = Result<DistributionPage, Error>> + Send;

    fn get_distribution_config(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<DistributionSnapshot<Self::Config>, Error>> + Send;

    fn get_distribution(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<DistributionState, Error>> + Send;

    /// Writes `config` back with `enabled = false`, returning the new token
    fn disable_distribution(
        &self,
        id: &str,
        config: Self::Config,
        etag: &str,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    fn delete_distribution(
        &self,
        id: &str,
        etag: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn create_distribution(
        &self,
        spec: &WebsiteDistribution,
    ) -> impl Future<Output = Result<CreatedDistribution, Error>> + Send;
}
