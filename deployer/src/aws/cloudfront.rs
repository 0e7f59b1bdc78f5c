//! [Cdn] for the AWS CloudFront SDK client
//!
//! Distributions created here serve a bucket's website endpoint through a custom
//! origin, since website endpoints only speak plain HTTP.

use crate::aws::{
    Cdn, CloudFrontOperation, ConflictReason, CreatedDistribution, DistributionPage,
    DistributionSnapshot, DistributionState, DistributionStatus, Error, WebsiteDistribution,
};
use aws_sdk_cloudfront::{
    config::{retry::RetryConfig, Builder as CloudFrontConfigBuilder},
    error::ProvideErrorMetadata,
    types::{
        CustomOriginConfig, DefaultCacheBehavior, DistributionConfig, Origin,
        OriginProtocolPolicy, OriginSslProtocols, Origins, PriceClass, SslProtocol,
        ViewerProtocolPolicy,
    },
    Client as CloudFrontClient,
};
use tracing::{debug, info};

/// Managed `CachingOptimized` cache policy
const CACHING_OPTIMIZED_POLICY_ID: &str = "658327ea-f89d-4fab-a63d-7e88639e58f6";

const HTTP_PORT: i32 = 80;
const HTTPS_PORT: i32 = 443;
const ORIGIN_READ_TIMEOUT_SECS: i32 = 30;
const ORIGIN_KEEPALIVE_TIMEOUT_SECS: i32 = 5;

/// Config override that sends a mutating request exactly once
fn single_attempt() -> CloudFrontConfigBuilder {
    CloudFrontConfigBuilder::default().retry_config(RetryConfig::disabled())
}

/// Maps a CloudFront service error onto the crate's error taxonomy
fn classify(id: &str, operation: CloudFrontOperation, source: aws_sdk_cloudfront::Error) -> Error {
    match source.code() {
        Some("NoSuchDistribution") => Error::DistributionNotFound(id.to_string()),
        Some("InvalidIfMatchVersion") | Some("PreconditionFailed") => Error::Conflict {
            id: id.to_string(),
            reason: ConflictReason::StaleEtag,
        },
        Some("IllegalUpdate") => Error::Conflict {
            id: id.to_string(),
            reason: ConflictReason::UpdateInProgress,
        },
        Some("DistributionNotDisabled") => Error::DistributionNotDisabled(id.to_string()),
        Some("AccessDenied") => Error::AccessDenied(id.to_string()),
        _ => Error::AwsCloudFront {
            operation,
            source: Box::new(source),
        },
    }
}

/// Builds the configuration of a distribution fronting a website endpoint
pub fn website_distribution_config(spec: &WebsiteDistribution) -> Result<DistributionConfig, Error> {
    let origin_id = format!("S3-Website-{}", spec.bucket);

    let ssl_protocols = OriginSslProtocols::builder()
        .quantity(1)
        .items(SslProtocol::from("TLSv1.2"))
        .build()?;
    let custom_origin = CustomOriginConfig::builder()
        .http_port(HTTP_PORT)
        .https_port(HTTPS_PORT)
        .origin_protocol_policy(OriginProtocolPolicy::from("http-only"))
        .origin_ssl_protocols(ssl_protocols)
        .origin_read_timeout(ORIGIN_READ_TIMEOUT_SECS)
        .origin_keepalive_timeout(ORIGIN_KEEPALIVE_TIMEOUT_SECS)
        .build()?;
    let origin = Origin::builder()
        .id(&origin_id)
        .domain_name(&spec.origin_domain)
        .custom_origin_config(custom_origin)
        .build()?;
    let origins = Origins::builder().quantity(1).items(origin).build()?;

    let default_cache_behavior = DefaultCacheBehavior::builder()
        .target_origin_id(&origin_id)
        .viewer_protocol_policy(ViewerProtocolPolicy::RedirectToHttps)
        .cache_policy_id(CACHING_OPTIMIZED_POLICY_ID)
        .compress(true)
        .build()?;

    Ok(DistributionConfig::builder()
        .caller_reference(&spec.caller_reference)
        .comment(format!("Static website for {}", spec.bucket))
        .origins(origins)
        .default_cache_behavior(default_cache_behavior)
        .default_root_object(&spec.default_root_object)
        .enabled(true)
        .price_class(PriceClass::PriceClassAll)
        .build()?)
}

impl Cdn for CloudFrontClient {
    type Config = DistributionConfig;

    async fn list_distributions(&self, marker: Option<String>) -> Result<DistributionPage, Error> {
        let resp = self
            .list_distributions()
            .set_marker(marker)
            .send()
            .await
            .map_err(|e| Error::AwsCloudFront {
                operation: CloudFrontOperation::ListDistributions,
                source: Box::new(aws_sdk_cloudfront::Error::from(e.into_service_error())),
            })?;
        let Some(list) = resp.distribution_list else {
            return Ok(DistributionPage::default());
        };
        let ids = list.items().iter().map(|d| d.id().to_string()).collect();
        let next_marker = if list.is_truncated() {
            list.next_marker.filter(|marker| !marker.is_empty())
        } else {
            None
        };
        Ok(DistributionPage { ids, next_marker })
    }

    async fn get_distribution_config(
        &self,
        id: &str,
    ) -> Result<DistributionSnapshot<DistributionConfig>, Error> {
        let resp = self
            .get_distribution_config()
            .id(id)
            .send()
            .await
            .map_err(|e| {
                classify(
                    id,
                    CloudFrontOperation::GetDistributionConfig,
                    e.into_service_error().into(),
                )
            })?;
        let etag = resp.e_tag.ok_or(Error::MissingField("ETag"))?;
        let config = resp
            .distribution_config
            .ok_or(Error::MissingField("DistributionConfig"))?;
        let origins = config
            .origins()
            .map(|origins| {
                origins
                    .items()
                    .iter()
                    .map(|origin| origin.domain_name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(DistributionSnapshot {
            etag,
            enabled: config.enabled,
            origins,
            config,
        })
    }

    async fn get_distribution(&self, id: &str) -> Result<DistributionState, Error> {
        let resp = self
            .get_distribution()
            .id(id)
            .send()
            .await
            .map_err(|e| {
                classify(
                    id,
                    CloudFrontOperation::GetDistribution,
                    e.into_service_error().into(),
                )
            })?;
        let distribution = resp
            .distribution
            .ok_or(Error::MissingField("Distribution"))?;
        let enabled = distribution
            .distribution_config()
            .map(|config| config.enabled)
            .unwrap_or(false);
        Ok(DistributionState {
            status: DistributionStatus::parse(distribution.status()),
            enabled,
        })
    }

    async fn disable_distribution(
        &self,
        id: &str,
        mut config: DistributionConfig,
        etag: &str,
    ) -> Result<String, Error> {
        config.enabled = false;
        let resp = self
            .update_distribution()
            .id(id)
            .if_match(etag)
            .distribution_config(config)
            .customize()
            .config_override(single_attempt())
            .send()
            .await
            .map_err(|e| {
                classify(
                    id,
                    CloudFrontOperation::UpdateDistribution,
                    e.into_service_error().into(),
                )
            })?;
        debug!(id, "update to disable distribution accepted");
        resp.e_tag.ok_or(Error::MissingField("ETag"))
    }

    async fn delete_distribution(&self, id: &str, etag: &str) -> Result<(), Error> {
        self.delete_distribution()
            .id(id)
            .if_match(etag)
            .customize()
            .config_override(single_attempt())
            .send()
            .await
            .map_err(|e| {
                classify(
                    id,
                    CloudFrontOperation::DeleteDistribution,
                    e.into_service_error().into(),
                )
            })?;
        debug!(id, "delete distribution accepted");
        Ok(())
    }

    async fn create_distribution(
        &self,
        spec: &WebsiteDistribution,
    ) -> Result<CreatedDistribution, Error> {
        let config = website_distribution_config(spec)?;
        let resp = self
            .create_distribution()
            .distribution_config(config)
            .customize()
            .config_override(single_attempt())
            .send()
            .await
            .map_err(|e| Error::AwsCloudFront {
                operation: CloudFrontOperation::CreateDistribution,
                source: Box::new(aws_sdk_cloudfront::Error::from(e.into_service_error())),
            })?;
        let distribution = resp
            .distribution
            .ok_or(Error::MissingField("Distribution"))?;
        let created = CreatedDistribution {
            id: distribution.id().to_string(),
            domain_name: distribution.domain_name().to_string(),
        };
        info!(
            id = created.id.as_str(),
            domain = created.domain_name.as_str(),
            "created CloudFront distribution"
        );
        Ok(created)
    }
}
