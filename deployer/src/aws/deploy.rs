//! Create a website bucket, upload a site into it, and front it with CloudFront

use crate::aws::{
    prompt::{ask_trimmed, Prompt, Terminal},
    upload::{cache_control, collect_uploads, content_type},
    utils::{poll_until, sdk_config},
    website_endpoint, Cdn, Config, CreatedDistribution, DistributionStatus, Error, ObjectUpload,
    Storage, Timings, WebsiteDistribution,
};
use aws_config::Region;
use aws_sdk_cloudfront::Client as CloudFrontClient;
use aws_sdk_s3::Client as S3Client;
use std::{
    fmt,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{error, info, warn};

/// Number of random hex characters appended to the default bucket name
const NAME_SUFFIX_LEN: usize = 5;

/// Statement id of the public-read bucket policy
pub const POLICY_SID: &str = "PublicReadGetObject";

/// Result of a deployment
#[derive(Debug)]
pub struct DeployReport {
    pub bucket: String,
    pub region: String,
    pub uploaded: usize,
    pub failed_uploads: usize,
    /// The created distribution, or why it could not be created
    pub distribution: Result<CreatedDistribution, String>,
    /// Whether the distribution finished deploying before we stopped waiting
    pub deployed: bool,
}

impl DeployReport {
    pub fn website_url(&self) -> String {
        format!("http://{}", website_endpoint(&self.bucket, &self.region))
    }

    pub fn success(&self) -> bool {
        self.distribution.is_ok()
    }
}

impl fmt::Display for DeployReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "\n{rule}\nDEPLOYMENT SUMMARY\n{rule}")?;
        writeln!(f, " S3 Bucket:             {}", self.bucket)?;
        writeln!(f, " Region:                {}", self.region)?;
        writeln!(f, " Website Endpoint:      {}", self.website_url())?;
        writeln!(
            f,
            " Files Uploaded:        {} ({} failed)",
            self.uploaded, self.failed_uploads
        )?;
        match &self.distribution {
            Ok(distribution) => {
                writeln!(f, " CloudFront ID:         {}", distribution.id)?;
                writeln!(f, " CloudFront URL:        https://{}", distribution.domain_name)?;
                if !self.deployed {
                    writeln!(f, " CloudFront Status:     still deploying")?;
                }
            }
            Err(reason) => writeln!(f, " CloudFront:            FAILED ({reason})")?,
        }
        write!(f, "{rule}")
    }
}

/// Generates a fresh bucket name for this run
pub fn default_bucket_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..NAME_SUFFIX_LEN])
}

/// Public-read policy for every object in `bucket`
pub fn public_read_policy(bucket: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": POLICY_SID,
            "Effect": "Allow",
            "Principal": "*",
            "Action": "s3:GetObject",
            "Resource": format!("arn:aws:s3:::{bucket}/*"),
        }],
    })
    .to_string()
}

/// Creates a bucket named `requested` (or an operator-chosen name), asking for a new
/// name whenever the current one is owned by another account. Returns the name used.
pub async fn create_named_bucket<S: Storage, P: Prompt>(
    storage: &S,
    prompt: &mut P,
    config: &Config,
    requested: Option<String>,
) -> Result<String, Error> {
    let mut name = match requested {
        Some(name) => name,
        None => {
            let default = default_bucket_name(&config.bucket_prefix);
            ask_trimmed(prompt, &format!("Enter S3 bucket name [{default}]: "))
                .await
                .unwrap_or(default)
        }
    };
    let attempts = config.bucket_name_attempts;
    for attempt in 1..=attempts {
        match storage.create_bucket(&name, &config.region).await {
            Ok(()) => return Ok(name),
            Err(Error::BucketNameTaken(_)) => {
                warn!(bucket = name.as_str(), attempt, "bucket name already taken");
                if attempt == attempts {
                    break;
                }
                name = ask_trimmed(prompt, "Bucket name is taken, enter another: ")
                    .await
                    .ok_or(Error::MissingBucketName)?;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::BucketNameAttemptsExhausted(attempts))
}

/// Uploads every selected file under `source_dir`, returning (uploaded, failed)
async fn upload_site<S: Storage>(
    storage: &S,
    bucket: &str,
    config: &Config,
) -> Result<(usize, usize), Error> {
    let files = collect_uploads(
        Path::new(&config.source_dir),
        &config.exclude_dirs,
        &config.exclude_extensions,
    )?;
    info!(
        bucket,
        source = config.source_dir.as_str(),
        files = files.len(),
        "uploading site"
    );
    let mut uploaded = 0;
    let mut failed = 0;
    for file in &files {
        let content_type = content_type(&file.path);
        let upload = ObjectUpload {
            key: &file.key,
            path: &file.path,
            content_type,
            cache_control: cache_control(content_type),
        };
        match storage.upload_object(bucket, upload).await {
            Ok(()) => uploaded += 1,
            Err(e) => {
                warn!(bucket, key = file.key.as_str(), error = %e, "upload failed");
                failed += 1;
            }
        }
    }
    info!(bucket, uploaded, failed, "upload finished");
    Ok((uploaded, failed))
}

/// Waits for `id` to deploy, returning whether it did within `timings.deploy_timeout`
async fn wait_for_deployment<C: Cdn>(cdn: &C, id: &str, timings: &Timings) -> bool {
    info!(id, "waiting for CloudFront distribution to deploy");
    let result = poll_until(
        "distribution deployment",
        timings.distribution_poll_interval,
        timings.deploy_timeout,
        |_| async move {
            cdn.get_distribution(id)
                .await
                .map(|state| state.status == DistributionStatus::Deployed)
        },
    )
    .await;
    match result {
        Ok(elapsed) => {
            info!(id, elapsed_secs = elapsed.as_secs(), "CloudFront distribution deployed");
            true
        }
        Err(e) => {
            warn!(id, error = %e, "distribution is still deploying, it will finish in the background");
            false
        }
    }
}

/// Runs a deployment against the given collaborators and shows the summary.
pub async fn run_deploy<S: Storage, C: Cdn, P: Prompt>(
    storage: &S,
    cdn: &C,
    prompt: &mut P,
    config: &Config,
    bucket: Option<String>,
) -> Result<DeployReport, Error> {
    let timings = config.timings();
    let bucket = create_named_bucket(storage, prompt, config, bucket).await?;

    storage.disable_block_public_access(&bucket).await?;
    storage
        .put_website(&bucket, &config.index_document, &config.error_document)
        .await?;
    storage
        .put_bucket_policy(&bucket, &public_read_policy(&bucket))
        .await?;
    info!(bucket = bucket.as_str(), "bucket configured for website hosting");

    let (uploaded, failed_uploads) = upload_site(storage, &bucket, config).await?;

    let created_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let spec = WebsiteDistribution {
        bucket: bucket.clone(),
        origin_domain: website_endpoint(&bucket, &config.region),
        default_root_object: config.index_document.clone(),
        caller_reference: format!("site-deployer-{bucket}-{created_at}"),
    };
    let (distribution, deployed) = match cdn.create_distribution(&spec).await {
        Ok(created) => {
            let deployed = wait_for_deployment(cdn, &created.id, &timings).await;
            (Ok(created), deployed)
        }
        Err(e) => {
            error!(bucket = bucket.as_str(), error = %e, "failed to create CloudFront distribution");
            (Err(e.to_string()), false)
        }
    };

    let report = DeployReport {
        bucket,
        region: config.region.clone(),
        uploaded,
        failed_uploads,
        distribution,
        deployed,
    };
    prompt.say(&report.to_string());
    Ok(report)
}

/// Deploys `config.source_dir` to a new bucket in `config.region` using the
/// default AWS credential chain.
pub async fn deploy(config: &Config, bucket: Option<String>) -> Result<DeployReport, Error> {
    let sdk = sdk_config(Region::new(config.region.clone())).await;
    let storage = S3Client::new(&sdk);
    let cdn = CloudFrontClient::new(&sdk);
    let mut prompt = Terminal::new();
    run_deploy(&storage, &cdn, &mut prompt, config, bucket).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::mocks::{CdnCall, MockCdn, MockStorage, ScriptedPrompt};
    use std::{fs, path::PathBuf};

    fn write_site(files: &[&str]) -> PathBuf {
        let root = std::env::temp_dir().join(format!("site-deployer-{}", uuid::Uuid::new_v4()));
        for file in files {
            let path = root.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"content").unwrap();
        }
        root
    }

    fn config_for(root: &Path) -> Config {
        Config {
            source_dir: root.to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_bucket_name() {
        let name = default_bucket_name("static-site");
        let suffix = name.strip_prefix("static-site-").unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_public_read_policy() {
        let policy: serde_json::Value =
            serde_json::from_str(&public_read_policy("site-abc")).unwrap();
        let statement = &policy["Statement"][0];
        assert_eq!(statement["Sid"], "PublicReadGetObject");
        assert_eq!(statement["Principal"], "*");
        assert_eq!(statement["Action"], "s3:GetObject");
        assert_eq!(statement["Resource"], "arn:aws:s3:::site-abc/*");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_site() {
        let root = write_site(&["index.html", "css/site.css", "logo.png", "deploy.sh"]);
        let storage = MockStorage::new();
        let cdn = MockCdn::new();
        let mut prompt = ScriptedPrompt::new([""]);

        let report = run_deploy(&storage, &cdn, &mut prompt, &config_for(&root), None)
            .await
            .unwrap();
        assert!(report.success());
        assert!(report.deployed);
        assert_eq!((report.uploaded, report.failed_uploads), (3, 0));
        assert!(report.bucket.starts_with("static-site-"));

        let bucket = storage.bucket(&report.bucket).unwrap();
        assert!(!bucket.public_access_blocked);
        assert_eq!(
            bucket.website,
            Some(("index.html".to_string(), "error.html".to_string()))
        );
        assert!(bucket.policy.unwrap().contains("PublicReadGetObject"));
        assert_eq!(
            bucket.uploads.get("css/site.css"),
            Some(&("text/css".to_string(), Some("max-age=3600".to_string())))
        );
        assert_eq!(
            bucket.uploads.get("logo.png"),
            Some(&("image/png".to_string(), None))
        );
        assert!(!bucket.uploads.contains_key("deploy.sh"));

        let origin = website_endpoint(&report.bucket, "us-east-1");
        assert!(cdn.calls().contains(&CdnCall::Create(origin)));
        assert!(prompt.transcript().contains("DEPLOYMENT SUMMARY"));
        fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_taken_name_prompts_again() {
        let root = write_site(&["index.html"]);
        let storage = MockStorage::new();
        storage.take_name("taken-1");
        let mut prompt = ScriptedPrompt::new(["taken-2"]);

        let name = create_named_bucket(
            &storage,
            &mut prompt,
            &config_for(&root),
            Some("taken-1".into()),
        )
        .await
        .unwrap();
        assert_eq!(name, "taken-2");
        assert!(storage.exists("taken-2"));
        assert!(!storage.exists("taken-1"));
        fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn test_name_attempts_capped() {
        let storage = MockStorage::new();
        storage.take_name("taken-1");
        storage.take_name("taken-2");
        let config = Config {
            bucket_name_attempts: 2,
            ..Default::default()
        };
        let mut prompt = ScriptedPrompt::new(["taken-2", "never-asked"]);

        let result =
            create_named_bucket(&storage, &mut prompt, &config, Some("taken-1".into())).await;
        assert!(matches!(result, Err(Error::BucketNameAttemptsExhausted(2))));
        assert_eq!(prompt.remaining(), 1);
    }

    #[tokio::test]
    async fn test_empty_replacement_name() {
        let storage = MockStorage::new();
        storage.take_name("taken-1");
        let mut prompt = ScriptedPrompt::new([""]);
        let result = create_named_bucket(
            &storage,
            &mut prompt,
            &Config::default(),
            Some("taken-1".into()),
        )
        .await;
        assert!(matches!(result, Err(Error::MissingBucketName)));
    }

    #[tokio::test]
    async fn test_region_constraint() {
        let storage = MockStorage::new();
        let config = Config {
            region: "eu-west-1".into(),
            ..Default::default()
        };
        let mut prompt = ScriptedPrompt::closed();
        create_named_bucket(&storage, &mut prompt, &config, Some("site-abc".into()))
            .await
            .unwrap();
        assert_eq!(
            storage.bucket("site-abc").unwrap().region.as_deref(),
            Some("eu-west-1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_uploads_counted() {
        let root = write_site(&["index.html", "app.js"]);
        let storage = MockStorage::new();
        storage.fail_upload("app.js");
        let cdn = MockCdn::new();
        let mut prompt = ScriptedPrompt::closed();

        let report = run_deploy(
            &storage,
            &cdn,
            &mut prompt,
            &config_for(&root),
            Some("site-abc".into()),
        )
        .await
        .unwrap();
        assert_eq!((report.uploaded, report.failed_uploads), (1, 1));
        assert!(report.success());
        fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_distribution_failure() {
        let root = write_site(&["index.html"]);
        let storage = MockStorage::new();
        let cdn = MockCdn::new();
        cdn.fail_create();
        let mut prompt = ScriptedPrompt::closed();

        let report = run_deploy(
            &storage,
            &cdn,
            &mut prompt,
            &config_for(&root),
            Some("site-abc".into()),
        )
        .await
        .unwrap();
        assert!(!report.success());
        assert!(storage.bucket("site-abc").unwrap().website.is_some());
        assert!(prompt.transcript().contains("CloudFront:            FAILED"));
        fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_deployment_is_not_failure() {
        let root = write_site(&["index.html"]);
        let storage = MockStorage::new();
        let cdn = MockCdn::new();
        cdn.set_deploy_polls(usize::MAX);
        let mut prompt = ScriptedPrompt::closed();
        let config = Config {
            deploy_timeout_secs: 60,
            ..config_for(&root)
        };

        let report = run_deploy(&storage, &cdn, &mut prompt, &config, Some("site-abc".into()))
            .await
            .unwrap();
        assert!(report.success());
        assert!(!report.deployed);
        assert!(prompt.transcript().contains("still deploying"));
        fs::remove_dir_all(root).unwrap();
    }
}
