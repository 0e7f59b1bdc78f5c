//! Empty a bucket of every object version and delete it

use crate::aws::{
    utils::poll_attempts, Error, ObjectVersionKey, Storage, Timings, MAX_DELETE_BATCH,
};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Maximum number of per-object failures written to the log
const LOGGED_FAILURES: usize = 10;

/// Deletes every object version and delete marker in `bucket`, returning how many
/// were removed.
///
/// Versions are deleted in batches of [MAX_DELETE_BATCH] as the listing is paged
/// through. Any per-object error fails the whole operation, as does exceeding
/// `timings.empty_timeout`. A bucket that does not exist is already empty.
pub async fn empty_bucket<S: Storage>(
    storage: &S,
    bucket: &str,
    timings: &Timings,
) -> Result<usize, Error> {
    match drain(storage, bucket, timings.empty_timeout).await {
        Err(Error::BucketNotFound(_)) => {
            info!(bucket, "bucket already absent, nothing to empty");
            Ok(0)
        }
        result => result,
    }
}

async fn drain<S: Storage>(storage: &S, bucket: &str, timeout: Duration) -> Result<usize, Error> {
    let start = Instant::now();
    let versioned = storage.versioning_enabled(bucket).await?;
    info!(bucket, versioned, "emptying bucket");

    let mut pending: Vec<ObjectVersionKey> = Vec::new();
    let mut deleted = 0;
    let mut marker = None;
    loop {
        let page = storage.list_object_versions(bucket, marker.take()).await?;
        debug!(bucket, listed = page.keys.len(), "listed object versions");
        pending.extend(page.keys);
        while pending.len() >= MAX_DELETE_BATCH {
            let batch: Vec<_> = pending.drain(..MAX_DELETE_BATCH).collect();
            deleted += delete_batch(storage, bucket, &batch, start, timeout).await?;
        }
        match page.next {
            Some(next) => marker = Some(next),
            None => break,
        }
    }
    if !pending.is_empty() {
        deleted += delete_batch(storage, bucket, &pending, start, timeout).await?;
    }
    info!(bucket, deleted, "bucket emptied");
    Ok(deleted)
}

async fn delete_batch<S: Storage>(
    storage: &S,
    bucket: &str,
    batch: &[ObjectVersionKey],
    start: Instant,
    timeout: Duration,
) -> Result<usize, Error> {
    let elapsed = start.elapsed();
    if elapsed > timeout {
        return Err(Error::Timeout {
            operation: format!("emptying bucket {bucket}"),
            elapsed,
        });
    }
    let failures = storage.delete_objects(bucket, batch).await?;
    if failures.is_empty() {
        debug!(bucket, count = batch.len(), "deleted batch");
        return Ok(batch.len());
    }
    for failure in failures.iter().take(LOGGED_FAILURES) {
        warn!(
            bucket,
            key = failure.key.as_str(),
            version_id = failure.version_id.as_deref(),
            code = failure.code.as_deref(),
            message = failure.message.as_deref(),
            "failed to delete object version"
        );
    }
    Err(Error::PartialBatchFailure {
        bucket: bucket.to_string(),
        failures,
    })
}

/// Deletes `bucket` and waits until S3 no longer reports it.
///
/// A bucket that is already absent counts as deleted.
pub async fn delete_bucket<S: Storage>(
    storage: &S,
    bucket: &str,
    timings: &Timings,
) -> Result<(), Error> {
    info!(bucket, "deleting bucket");
    match storage.delete_bucket(bucket).await {
        Ok(()) => {}
        Err(Error::BucketNotFound(_)) => {
            info!(bucket, "bucket already absent");
            return Ok(());
        }
        Err(Error::BucketNotEmpty(name)) => {
            error!(
                bucket,
                "bucket still holds object versions after emptying"
            );
            return Err(Error::BucketNotEmpty(name));
        }
        Err(e) => return Err(e),
    }

    let attempts = poll_attempts(
        "bucket deletion",
        timings.bucket_poll_interval,
        timings.bucket_poll_attempts,
        |_| async move { storage.bucket_exists(bucket).await.map(|exists| !exists) },
    )
    .await?;
    info!(bucket, attempts, "bucket deleted");
    Ok(())
}
