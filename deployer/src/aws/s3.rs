//! [Storage] for the AWS S3 SDK client

use crate::aws::{
    DeleteFailure, Error, ObjectUpload, ObjectVersionKey, S3Operation, Storage, VersionMarker,
    VersionPage, DEFAULT_REGION,
};
pub use aws_config::Region;
use aws_sdk_s3::{
    config::{retry::RetryConfig, Builder as S3ConfigBuilder},
    error::ProvideErrorMetadata,
    primitives::ByteStream,
    types::{
        BucketLocationConstraint, BucketVersioningStatus, CreateBucketConfiguration, Delete,
        ErrorDocument, IndexDocument, ObjectIdentifier, PublicAccessBlockConfiguration,
        WebsiteConfiguration,
    },
    Client as S3Client,
};
use tracing::{debug, info};

/// Version id S3 reports for objects written while versioning was never enabled
const NULL_VERSION: &str = "null";

/// Config override that sends a mutating request exactly once
fn single_attempt() -> S3ConfigBuilder {
    S3ConfigBuilder::default().retry_config(RetryConfig::disabled())
}

/// Maps an S3 service error onto the crate's error taxonomy
fn classify(bucket: &str, operation: S3Operation, source: aws_sdk_s3::Error) -> Error {
    if matches!(source, aws_sdk_s3::Error::NoSuchBucket(_)) {
        return Error::BucketNotFound(bucket.to_string());
    }
    match source.code() {
        Some("NoSuchBucket") => Error::BucketNotFound(bucket.to_string()),
        Some("BucketNotEmpty") => Error::BucketNotEmpty(bucket.to_string()),
        Some("AccessDenied") => Error::AccessDenied(bucket.to_string()),
        _ => Error::AwsS3 {
            bucket: bucket.to_string(),
            operation,
            source: Box::new(source),
        },
    }
}

impl Storage for S3Client {
    fn for_region(&self, region: &str) -> Self {
        let config = self
            .config()
            .to_builder()
            .region(Region::new(region.to_string()))
            .build();
        S3Client::from_conf(config)
    }

    async fn bucket_region(&self, bucket: &str) -> Result<Option<String>, Error> {
        let resp = self
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| {
                classify(
                    bucket,
                    S3Operation::GetBucketLocation,
                    e.into_service_error().into(),
                )
            })?;
        Ok(resp
            .location_constraint()
            .map(|constraint| constraint.as_str().to_string()))
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, Error> {
        match self.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    return Ok(false);
                }
                Err(classify(
                    bucket,
                    S3Operation::HeadBucket,
                    service_err.into(),
                ))
            }
        }
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), Error> {
        // us-east-1 must not have a location constraint
        let mut request = self.create_bucket().bucket(bucket);
        if region != DEFAULT_REGION {
            let bucket_config = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build();
            request = request.create_bucket_configuration(bucket_config);
        }

        match request
            .customize()
            .config_override(single_attempt())
            .send()
            .await
        {
            Ok(_) => {
                info!(bucket, region, "created bucket");
                Ok(())
            }
            Err(e) => {
                let s3_err = aws_sdk_s3::Error::from(e.into_service_error());
                match &s3_err {
                    aws_sdk_s3::Error::BucketAlreadyOwnedByYou(_) => {
                        info!(bucket, "bucket already owned by this account");
                        Ok(())
                    }
                    aws_sdk_s3::Error::BucketAlreadyExists(_) => {
                        Err(Error::BucketNameTaken(bucket.to_string()))
                    }
                    _ => Err(classify(bucket, S3Operation::CreateBucket, s3_err)),
                }
            }
        }
    }

    async fn disable_block_public_access(&self, bucket: &str) -> Result<(), Error> {
        let config = PublicAccessBlockConfiguration::builder()
            .block_public_acls(false)
            .ignore_public_acls(false)
            .block_public_policy(false)
            .restrict_public_buckets(false)
            .build();
        self.put_public_access_block()
            .bucket(bucket)
            .public_access_block_configuration(config)
            .send()
            .await
            .map_err(|e| {
                classify(
                    bucket,
                    S3Operation::PutPublicAccessBlock,
                    e.into_service_error().into(),
                )
            })?;
        debug!(bucket, "disabled public access block");
        Ok(())
    }

    async fn put_website(
        &self,
        bucket: &str,
        index_document: &str,
        error_document: &str,
    ) -> Result<(), Error> {
        let website = WebsiteConfiguration::builder()
            .index_document(IndexDocument::builder().suffix(index_document).build()?)
            .error_document(ErrorDocument::builder().key(error_document).build()?)
            .build();
        self.put_bucket_website()
            .bucket(bucket)
            .website_configuration(website)
            .send()
            .await
            .map_err(|e| {
                classify(
                    bucket,
                    S3Operation::PutBucketWebsite,
                    e.into_service_error().into(),
                )
            })?;
        debug!(bucket, index_document, error_document, "configured website hosting");
        Ok(())
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), Error> {
        self.put_bucket_policy()
            .bucket(bucket)
            .policy(policy)
            .send()
            .await
            .map_err(|e| {
                classify(
                    bucket,
                    S3Operation::PutBucketPolicy,
                    e.into_service_error().into(),
                )
            })?;
        debug!(bucket, "applied bucket policy");
        Ok(())
    }

    async fn upload_object(&self, bucket: &str, upload: ObjectUpload<'_>) -> Result<(), Error> {
        let body = ByteStream::from_path(upload.path)
            .await
            .map_err(std::io::Error::other)?;
        self.put_object()
            .bucket(bucket)
            .key(upload.key)
            .body(body)
            .content_type(upload.content_type)
            .set_cache_control(upload.cache_control.map(str::to_string))
            .send()
            .await
            .map_err(|e| {
                classify(bucket, S3Operation::PutObject, e.into_service_error().into())
            })?;
        debug!(bucket, key = upload.key, "uploaded object");
        Ok(())
    }

    async fn versioning_enabled(&self, bucket: &str) -> Result<bool, Error> {
        let resp = self
            .get_bucket_versioning()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| {
                classify(
                    bucket,
                    S3Operation::GetBucketVersioning,
                    e.into_service_error().into(),
                )
            })?;
        Ok(resp.status() == Some(&BucketVersioningStatus::Enabled))
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> Result<VersionPage, Error> {
        let marker = marker.unwrap_or_default();
        let resp = self
            .list_object_versions()
            .bucket(bucket)
            .set_key_marker(marker.key_marker)
            .set_version_id_marker(marker.version_id_marker)
            .send()
            .await
            .map_err(|e| {
                classify(
                    bucket,
                    S3Operation::ListObjectVersions,
                    e.into_service_error().into(),
                )
            })?;

        let versions = resp
            .versions()
            .iter()
            .map(|v| (v.key(), v.version_id()));
        let markers = resp
            .delete_markers()
            .iter()
            .map(|m| (m.key(), m.version_id()));
        let keys = versions
            .chain(markers)
            .filter_map(|(key, version_id)| {
                Some(ObjectVersionKey::new(
                    key?,
                    version_id.unwrap_or(NULL_VERSION),
                ))
            })
            .collect();

        let next = if resp.is_truncated() == Some(true) {
            Some(VersionMarker {
                key_marker: resp.next_key_marker().map(str::to_string),
                version_id_marker: resp.next_version_id_marker().map(str::to_string),
            })
        } else {
            None
        };
        Ok(VersionPage { keys, next })
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        batch: &[ObjectVersionKey],
    ) -> Result<Vec<DeleteFailure>, Error> {
        let identifiers = batch
            .iter()
            .map(|object| {
                ObjectIdentifier::builder()
                    .key(&object.key)
                    .version_id(&object.version_id)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(true)
            .build()?;

        let resp = self
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .customize()
            .config_override(single_attempt())
            .send()
            .await
            .map_err(|e| {
                classify(
                    bucket,
                    S3Operation::DeleteObjects,
                    e.into_service_error().into(),
                )
            })?;
        Ok(resp
            .errors()
            .iter()
            .map(|e| DeleteFailure {
                key: e.key().unwrap_or_default().to_string(),
                version_id: e.version_id().map(str::to_string),
                code: e.code().map(str::to_string),
                message: e.message().map(str::to_string),
            })
            .collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), Error> {
        self.delete_bucket()
            .bucket(bucket)
            .customize()
            .config_override(single_attempt())
            .send()
            .await
            .map_err(|e| {
                classify(
                    bucket,
                    S3Operation::DeleteBucket,
                    e.into_service_error().into(),
                )
            })?;
        info!(bucket, "delete bucket request accepted");
        Ok(())
    }
}
