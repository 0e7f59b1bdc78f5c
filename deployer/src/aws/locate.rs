//! Resolve a bucket's region and the distribution serving its website endpoint

use crate::aws::{website_endpoint, Cdn, DistributionRef, Error, Storage, DEFAULT_REGION};
use tracing::{debug, info, warn};

/// Outcome of searching for the distribution in front of a bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Discovery {
    /// No distribution uses the bucket's website endpoint as an origin
    None,
    /// Exactly one distribution does
    Found(DistributionRef),
    /// More than one does (the ids of the first two matches); nothing is selected
    Ambiguous(Vec<String>),
}

/// Returns the region `bucket` lives in.
///
/// A bucket without a location constraint lives in [DEFAULT_REGION].
pub async fn locate_region<S: Storage>(storage: &S, bucket: &str) -> Result<String, Error> {
    let region = storage
        .bucket_region(bucket)
        .await?
        .filter(|region| !region.is_empty())
        .unwrap_or_else(|| DEFAULT_REGION.to_string());
    debug!(bucket, region = region.as_str(), "resolved bucket region");
    Ok(region)
}

/// Searches every distribution for one whose origin is the website endpoint of
/// `bucket` in `region`.
///
/// Origins are compared by exact, case-sensitive equality. The search stops at the
/// second match and reports [Discovery::Ambiguous]. A distribution whose
/// configuration cannot be fetched is skipped.
pub async fn find_distribution<C: Cdn>(
    cdn: &C,
    bucket: &str,
    region: &str,
) -> Result<Discovery, Error> {
    let origin = website_endpoint(bucket, region);
    info!(origin = origin.as_str(), "searching for CloudFront distribution");

    let mut found: Option<DistributionRef> = None;
    let mut marker: Option<String> = None;
    loop {
        let page = cdn.list_distributions(marker.take()).await?;
        for id in page.ids {
            let snapshot = match cdn.get_distribution_config(&id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(
                        id = id.as_str(),
                        error = %e,
                        "could not read distribution config, skipping"
                    );
                    continue;
                }
            };
            if !snapshot.origins.iter().any(|domain| *domain == origin) {
                continue;
            }
            info!(id = id.as_str(), "found matching distribution");
            if let Some(first) = found {
                warn!(
                    origin = origin.as_str(),
                    first = first.id.as_str(),
                    second = id.as_str(),
                    "multiple distributions use this origin, refusing to choose"
                );
                return Ok(Discovery::Ambiguous(vec![first.id, id]));
            }
            found = Some(DistributionRef {
                id,
                etag: snapshot.etag,
                enabled: snapshot.enabled,
            });
        }
        match page.next_marker {
            Some(next) => marker = Some(next),
            None => break,
        }
    }

    match found {
        Some(distribution) => Ok(Discovery::Found(distribution)),
        None => {
            info!(
                origin = origin.as_str(),
                "no CloudFront distribution uses this origin"
            );
            Ok(Discovery::None)
        }
    }
}
