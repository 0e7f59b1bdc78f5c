//! Tear down a deployed site: its distribution first, then the bucket contents, then
//! the bucket itself.

use crate::aws::{
    bucket::{delete_bucket, empty_bucket},
    locate::{find_distribution, locate_region, Discovery},
    prompt::{ask_trimmed, confirm, Prompt, Terminal, NO_DISTRIBUTION},
    teardown::teardown_distribution,
    utils::sdk_config,
    BucketRef, Cdn, Config, Error, Storage, Timings,
};
use aws_config::Region;
use aws_sdk_cloudfront::Client as CloudFrontClient;
use aws_sdk_s3::Client as S3Client;
use std::fmt;
use tracing::{error, info, warn};

/// Which teardown stages finished
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownOutcome {
    /// Also set when there was no distribution to delete
    pub distribution_deleted: bool,
    pub bucket_emptied: bool,
    pub bucket_deleted: bool,
}

impl TeardownOutcome {
    pub fn success(&self) -> bool {
        self.distribution_deleted && self.bucket_emptied && self.bucket_deleted
    }
}

/// Summary of a confirmed teardown
#[derive(Debug)]
pub struct CleanupReport {
    pub bucket: BucketRef,
    /// The distribution that was targeted, if one was located
    pub distribution: Option<String>,
    pub outcome: TeardownOutcome,
    /// The error that stopped the teardown
    pub failure: Option<Error>,
}

impl CleanupReport {
    pub fn success(&self) -> bool {
        self.outcome.success()
    }
}

fn status(done: bool) -> &'static str {
    if done {
        "DELETED"
    } else {
        "FAILED"
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "\n{rule}\nCLEANUP SUMMARY\n{rule}")?;
        match &self.distribution {
            Some(id) => writeln!(
                f,
                " CloudFront {id}:  {}",
                status(self.outcome.distribution_deleted)
            )?,
            None => writeln!(f, " CloudFront:            {NO_DISTRIBUTION}")?,
        }
        writeln!(
            f,
            " S3 Bucket Contents:    {}",
            status(self.outcome.bucket_emptied)
        )?;
        writeln!(
            f,
            " S3 Bucket {}:  {}",
            self.bucket.name,
            status(self.outcome.bucket_deleted)
        )?;
        if let Some(failure) = &self.failure {
            writeln!(f, " Stopped by:            {failure}")?;
        }
        write!(f, "{rule}")
    }
}

/// How a cleanup run ended
#[derive(Debug)]
pub enum Teardown {
    /// The operator declined; nothing was modified
    Cancelled,
    Completed(CleanupReport),
}

/// Resolves the bucket's region, falling back to asking the operator
async fn resolve_region<S: Storage, P: Prompt>(
    storage: &S,
    prompt: &mut P,
    bucket: &str,
) -> Result<String, Error> {
    match locate_region(storage, bucket).await {
        Ok(region) => {
            info!(bucket, region = region.as_str(), "bucket region resolved");
            Ok(region)
        }
        Err(e) => {
            warn!(bucket, error = %e, "could not determine bucket region");
            ask_trimmed(prompt, &format!("Enter the region of bucket {bucket}: "))
                .await
                .ok_or_else(|| Error::RegionUnresolved(bucket.to_string()))
        }
    }
}

/// Tears down `bucket` and the distribution in front of it.
///
/// Nothing is modified until the operator confirms. Each stage only runs once the
/// previous one succeeded; the first failure is recorded in the returned report.
pub async fn run_cleanup<S: Storage, C: Cdn, P: Prompt>(
    storage: &S,
    cdn: &C,
    prompt: &mut P,
    bucket: &str,
    timings: &Timings,
) -> Result<Teardown, Error> {
    let region = resolve_region(storage, prompt, bucket).await?;
    let storage = storage.for_region(&region);
    let bucket = BucketRef {
        name: bucket.to_string(),
        region,
    };

    let distribution = match find_distribution(cdn, &bucket.name, &bucket.region).await? {
        // The teardown reads a fresh token, so only the id is kept
        Discovery::Found(distribution) => Some(distribution.id),
        Discovery::None => None,
        Discovery::Ambiguous(ids) => {
            let ambiguous = Error::AmbiguousDistribution {
                origin: bucket.website_endpoint(),
                ids,
            };
            warn!(error = %ambiguous, "no distribution will be deleted");
            prompt.say(&format!(
                "WARNING: {ambiguous}. None of them will be deleted; remove them manually."
            ));
            None
        }
    };

    if !confirm(prompt, &bucket.name, distribution.as_deref()).await {
        return Ok(Teardown::Cancelled);
    }

    let mut report = CleanupReport {
        bucket,
        distribution,
        outcome: TeardownOutcome::default(),
        failure: None,
    };
    if let Err(e) = run_stages(&storage, cdn, &mut report, timings).await {
        error!(bucket = report.bucket.name.as_str(), error = %e, "cleanup stopped");
        report.failure = Some(e);
    } else {
        info!(bucket = report.bucket.name.as_str(), "cleanup complete");
    }
    prompt.say(&report.to_string());
    Ok(Teardown::Completed(report))
}

async fn run_stages<S: Storage, C: Cdn>(
    storage: &S,
    cdn: &C,
    report: &mut CleanupReport,
    timings: &Timings,
) -> Result<(), Error> {
    // The bucket is untouched until nothing can be reading from it
    if let Some(id) = &report.distribution {
        teardown_distribution(cdn, id, timings).await?;
    }
    report.outcome.distribution_deleted = true;

    let deleted = empty_bucket(storage, &report.bucket.name, timings).await?;
    info!(bucket = report.bucket.name.as_str(), deleted, "bucket contents removed");
    report.outcome.bucket_emptied = true;

    delete_bucket(storage, &report.bucket.name, timings).await?;
    report.outcome.bucket_deleted = true;
    Ok(())
}

/// Tears down `bucket` (asked for when `None`) using the default AWS credential chain.
pub async fn cleanup(config: &Config, bucket: Option<String>) -> Result<Teardown, Error> {
    let mut prompt = Terminal::new();
    let bucket = match bucket {
        Some(bucket) => bucket,
        None => ask_trimmed(&mut prompt, "Enter the S3 bucket name to delete: ")
            .await
            .ok_or(Error::MissingBucketName)?,
    };
    let sdk = sdk_config(Region::new(config.region.clone())).await;
    let storage = S3Client::new(&sdk);
    let cdn = CloudFrontClient::new(&sdk);
    run_cleanup(&storage, &cdn, &mut prompt, &bucket, &config.timings()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{
        mocks::{CdnCall, MockCdn, MockStorage, Rejection, ScriptedPrompt},
        DistributionStatus::Deployed,
    };

    const ORIGIN: &str = "site-abc.s3-website-us-east-1.amazonaws.com";

    fn completed(teardown: Teardown) -> CleanupReport {
        match teardown {
            Teardown::Completed(report) => report,
            Teardown::Cancelled => panic!("teardown was cancelled"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_without_distribution() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", None);
        storage.add_objects("site-abc", 42);
        let cdn = MockCdn::new();
        cdn.add_distribution("E1", &["other.example.com"], true, Deployed);
        let mut prompt = ScriptedPrompt::new(["yes"]);

        let report = completed(
            run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
                .await
                .unwrap(),
        );
        assert_eq!(
            report.outcome,
            TeardownOutcome {
                distribution_deleted: true,
                bucket_emptied: true,
                bucket_deleted: true,
            }
        );
        assert!(report.success());
        assert_eq!(report.bucket.region, "us-east-1");
        assert_eq!(storage.batch_sizes(), vec![42]);
        assert!(!storage.exists("site-abc"));
        assert_eq!(cdn.mutations(), 0);
        assert!(cdn.exists("E1"));
        assert!(prompt.transcript().contains("CloudFront:            N/A (None Found)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_with_distribution() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", Some("eu-west-1"));
        storage.add_objects("site-abc", 3);
        let cdn = MockCdn::new();
        cdn.add_distribution(
            "E1",
            &["site-abc.s3-website-eu-west-1.amazonaws.com"],
            true,
            Deployed,
        );
        let mut prompt = ScriptedPrompt::new(["yes"]);

        let report = completed(
            run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
                .await
                .unwrap(),
        );
        assert!(report.success());
        assert_eq!(report.distribution.as_deref(), Some("E1"));
        assert!(!cdn.exists("E1"));
        assert!(!storage.exists("site-abc"));
        assert_eq!(storage.regions(), vec!["eu-west-1".to_string()]);

        let transcript = prompt.transcript();
        assert!(transcript.contains("CloudFront Distro:  E1"));
        assert!(transcript.contains("CloudFront E1:  DELETED"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refusal_changes_nothing() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", None);
        storage.add_objects("site-abc", 5);
        let cdn = MockCdn::new();
        cdn.add_distribution("E1", &[ORIGIN], true, Deployed);
        let mut prompt = ScriptedPrompt::new(["no"]);

        let teardown = run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
            .await
            .unwrap();
        assert!(matches!(teardown, Teardown::Cancelled));
        assert_eq!(cdn.mutations(), 0);
        assert!(storage.batches().is_empty());
        assert_eq!(storage.delete_bucket_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_input_cancels() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", None);
        let cdn = MockCdn::new();
        let mut prompt = ScriptedPrompt::closed();

        let teardown = run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
            .await
            .unwrap();
        assert!(matches!(teardown, Teardown::Cancelled));
        assert!(storage.exists("site-abc"));
        assert!(prompt.transcript().contains("N/A (None Found)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distribution_failure_spares_bucket() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", None);
        storage.add_objects("site-abc", 5);
        let cdn = MockCdn::new();
        cdn.set_deploy_polls(usize::MAX);
        cdn.add_distribution("E1", &[ORIGIN], true, Deployed);
        let mut prompt = ScriptedPrompt::new(["yes"]);

        let report = completed(
            run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
                .await
                .unwrap(),
        );
        assert!(!report.success());
        assert_eq!(report.outcome, TeardownOutcome::default());
        assert!(matches!(report.failure, Some(Error::Timeout { .. })));
        assert!(storage.batches().is_empty());
        assert_eq!(storage.delete_bucket_calls(), 0);
        assert!(prompt.transcript().contains("CloudFront E1:  FAILED"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_delete_spares_bucket() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", None);
        storage.add_objects("site-abc", 5);
        let cdn = MockCdn::new();
        cdn.add_distribution("E1", &[ORIGIN], false, Deployed);
        cdn.reject_delete("E1", Rejection::NotDisabled);
        let mut prompt = ScriptedPrompt::new(["yes"]);

        let report = completed(
            run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
                .await
                .unwrap(),
        );
        assert_eq!(report.outcome, TeardownOutcome::default());
        assert!(matches!(
            report.failure,
            Some(Error::DistributionNotDisabled(ref id)) if id == "E1"
        ));
        let deletes = cdn
            .calls()
            .into_iter()
            .filter(|c| matches!(c, CdnCall::Delete { .. }))
            .count();
        assert_eq!(deletes, 1);
        assert!(storage.batches().is_empty());
        assert_eq!(storage.delete_bucket_calls(), 0);
        assert_eq!(storage.bucket("site-abc").unwrap().versions.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_failure_spares_bucket() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", None);
        storage.add_objects("site-abc", 5);
        storage.fail_key("object-000002");
        let cdn = MockCdn::new();
        let mut prompt = ScriptedPrompt::new(["yes"]);

        let report = completed(
            run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
                .await
                .unwrap(),
        );
        assert_eq!(
            report.outcome,
            TeardownOutcome {
                distribution_deleted: true,
                bucket_emptied: false,
                bucket_deleted: false,
            }
        );
        assert!(matches!(
            report.failure,
            Some(Error::PartialBatchFailure { .. })
        ));
        assert_eq!(storage.delete_bucket_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_region_entered_manually() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", Some("ap-south-1"));
        storage.fail_region_lookup();
        let cdn = MockCdn::new();
        let mut prompt = ScriptedPrompt::new([" ap-south-1 ", "yes"]);

        let report = completed(
            run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
                .await
                .unwrap(),
        );
        assert_eq!(report.bucket.region, "ap-south-1");
        assert!(report.success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_region_unresolved() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", None);
        storage.fail_region_lookup();
        let cdn = MockCdn::new();
        let mut prompt = ScriptedPrompt::new([""]);

        let result =
            run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default()).await;
        assert!(matches!(result, Err(Error::RegionUnresolved(_))));
        assert!(storage.exists("site-abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_distributions_untouched() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", None);
        let cdn = MockCdn::new();
        cdn.add_distribution("E1", &[ORIGIN], true, Deployed);
        cdn.add_distribution("E2", &[ORIGIN], true, Deployed);
        let mut prompt = ScriptedPrompt::new(["yes"]);

        let report = completed(
            run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
                .await
                .unwrap(),
        );
        assert_eq!(report.distribution, None);
        assert_eq!(cdn.mutations(), 0);
        assert!(cdn.exists("E1") && cdn.exists("E2"));

        let transcript = prompt.transcript();
        assert!(transcript.contains("CloudFront Distro:  N/A (None Found)"));
        assert!(transcript.contains("E1"));
        assert!(transcript.contains("E2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_after_bucket_deleted() {
        let storage = MockStorage::new();
        storage.add_bucket("site-abc", None);
        let cdn = MockCdn::new();
        let mut prompt = ScriptedPrompt::new(["yes"]);
        let report = completed(
            run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
                .await
                .unwrap(),
        );
        assert!(report.success());

        // The region lookup fails for a missing bucket, so the operator supplies it
        let mut prompt = ScriptedPrompt::new(["us-east-1", "yes"]);
        let report = completed(
            run_cleanup(&storage, &cdn, &mut prompt, "site-abc", &Timings::default())
                .await
                .unwrap(),
        );
        assert!(report.success());
    }
}
