//! In-memory collaborators for exercising deployment and teardown without AWS.
//!
//! Both mocks are cheap to clone and share their state, so a test can hand one
//! clone to the code under test and inspect the other afterwards.

use crate::aws::{
    prompt::Prompt, Cdn, ConflictReason, CreatedDistribution, DeleteFailure, DistributionPage,
    DistributionSnapshot, DistributionState, DistributionStatus, Error, ObjectUpload,
    ObjectVersionKey, Storage, VersionMarker, VersionPage, WebsiteDistribution, DEFAULT_REGION,
    MAX_DELETE_BATCH,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

/// Contents and settings of a mock bucket
#[derive(Clone, Debug, Default)]
pub struct MockBucket {
    pub region: Option<String>,
    pub versioned: bool,
    pub public_access_blocked: bool,
    pub website: Option<(String, String)>,
    pub policy: Option<String>,
    /// Stored versions in listing order, mapped to whether they are delete markers
    pub versions: BTreeMap<(String, String), bool>,
    /// Uploaded keys with their content type and cache control
    pub uploads: BTreeMap<String, (String, Option<String>)>,
}

struct StorageState {
    buckets: BTreeMap<String, MockBucket>,
    taken: HashSet<String>,
    page_size: usize,
    failing_keys: HashSet<String>,
    failing_uploads: HashSet<String>,
    region_lookup_fails: bool,
    delete_latency: Duration,
    lingering_polls: usize,
    lingering: usize,
    batches: Vec<Vec<ObjectVersionKey>>,
    delete_bucket_calls: usize,
    regions: Vec<String>,
}

impl Default for StorageState {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
            taken: HashSet::new(),
            page_size: MAX_DELETE_BATCH,
            failing_keys: HashSet::new(),
            failing_uploads: HashSet::new(),
            region_lookup_fails: false,
            delete_latency: Duration::ZERO,
            lingering_polls: 0,
            lingering: 0,
            batches: Vec::new(),
            delete_bucket_calls: 0,
            regions: Vec::new(),
        }
    }
}

/// An in-memory [Storage]
#[derive(Clone, Default)]
pub struct MockStorage {
    state: Arc<Mutex<StorageState>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StorageState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an empty bucket; `None` models a bucket without a location constraint
    pub fn add_bucket(&self, name: &str, region: Option<&str>) {
        self.state().buckets.insert(
            name.to_string(),
            MockBucket {
                region: region.map(str::to_string),
                public_access_blocked: true,
                ..Default::default()
            },
        );
    }

    pub fn set_versioned(&self, bucket: &str, versioned: bool) {
        if let Some(b) = self.state().buckets.get_mut(bucket) {
            b.versioned = versioned;
        }
    }

    /// Stores `count` object versions named `object-{i:06}`
    pub fn add_objects(&self, bucket: &str, count: usize) {
        let keys = (0..count).map(|i| ObjectVersionKey::new(format!("object-{i:06}"), "v1"));
        self.add_versions(bucket, keys, false);
    }

    pub fn add_versions(
        &self,
        bucket: &str,
        keys: impl IntoIterator<Item = ObjectVersionKey>,
        delete_markers: bool,
    ) {
        let mut state = self.state();
        let Some(b) = state.buckets.get_mut(bucket) else {
            return;
        };
        for key in keys {
            b.versions.insert((key.key, key.version_id), delete_markers);
        }
    }

    /// Limits the number of versions returned per listing page
    pub fn set_page_size(&self, page_size: usize) {
        self.state().page_size = page_size;
    }

    /// Makes bulk deletes report an error for every version of `key`
    pub fn fail_key(&self, key: &str) {
        self.state().failing_keys.insert(key.to_string());
    }

    pub fn fail_upload(&self, key: &str) {
        self.state().failing_uploads.insert(key.to_string());
    }

    pub fn fail_region_lookup(&self) {
        self.state().region_lookup_fails = true;
    }

    /// Marks `name` as owned by another account
    pub fn take_name(&self, name: &str) {
        self.state().taken.insert(name.to_string());
    }

    /// Delays every bulk delete by `latency`
    pub fn set_delete_latency(&self, latency: Duration) {
        self.state().delete_latency = latency;
    }

    /// Keeps reporting a deleted bucket as existing for `polls` existence checks
    pub fn set_lingering_polls(&self, polls: usize) {
        self.state().lingering_polls = polls;
    }

    pub fn bucket(&self, name: &str) -> Option<MockBucket> {
        self.state().buckets.get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state().buckets.contains_key(name)
    }

    /// Every bulk delete issued, in order
    pub fn batches(&self) -> Vec<Vec<ObjectVersionKey>> {
        self.state().batches.clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state().batches.iter().map(Vec::len).collect()
    }

    pub fn delete_bucket_calls(&self) -> usize {
        self.state().delete_bucket_calls
    }

    /// Regions passed to [Storage::for_region]
    pub fn regions(&self) -> Vec<String> {
        self.state().regions.clone()
    }
}

fn with_bucket<T>(
    state: &mut StorageState,
    bucket: &str,
    f: impl FnOnce(&mut MockBucket) -> T,
) -> Result<T, Error> {
    state
        .buckets
        .get_mut(bucket)
        .map(f)
        .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))
}

impl Storage for MockStorage {
    fn for_region(&self, region: &str) -> Self {
        self.state().regions.push(region.to_string());
        self.clone()
    }

    async fn bucket_region(&self, bucket: &str) -> Result<Option<String>, Error> {
        let mut state = self.state();
        if state.region_lookup_fails {
            return Err(Error::AccessDenied(bucket.to_string()));
        }
        with_bucket(&mut state, bucket, |b| b.region.clone())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, Error> {
        let mut state = self.state();
        if state.buckets.contains_key(bucket) {
            return Ok(true);
        }
        if state.lingering > 0 {
            state.lingering -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), Error> {
        let exists = {
            let state = self.state();
            if state.taken.contains(bucket) {
                return Err(Error::BucketNameTaken(bucket.to_string()));
            }
            state.buckets.contains_key(bucket)
        };
        if !exists {
            let constraint = (region != DEFAULT_REGION).then_some(region);
            self.add_bucket(bucket, constraint);
        }
        Ok(())
    }

    async fn disable_block_public_access(&self, bucket: &str) -> Result<(), Error> {
        with_bucket(&mut self.state(), bucket, |b| b.public_access_blocked = false)
    }

    async fn put_website(
        &self,
        bucket: &str,
        index_document: &str,
        error_document: &str,
    ) -> Result<(), Error> {
        with_bucket(&mut self.state(), bucket, |b| {
            b.website = Some((index_document.to_string(), error_document.to_string()))
        })
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), Error> {
        with_bucket(&mut self.state(), bucket, |b| b.policy = Some(policy.to_string()))
    }

    async fn upload_object(&self, bucket: &str, upload: ObjectUpload<'_>) -> Result<(), Error> {
        let mut state = self.state();
        if state.failing_uploads.contains(upload.key) {
            return Err(Error::AccessDenied(upload.key.to_string()));
        }
        with_bucket(&mut state, bucket, |b| {
            b.uploads.insert(
                upload.key.to_string(),
                (
                    upload.content_type.to_string(),
                    upload.cache_control.map(str::to_string),
                ),
            );
            b.versions
                .insert((upload.key.to_string(), "null".to_string()), false);
        })
    }

    async fn versioning_enabled(&self, bucket: &str) -> Result<bool, Error> {
        with_bucket(&mut self.state(), bucket, |b| b.versioned)
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> Result<VersionPage, Error> {
        let mut state = self.state();
        let page_size = state.page_size;
        with_bucket(&mut state, bucket, |b| {
            let after = marker.map(|m| {
                (
                    m.key_marker.unwrap_or_default(),
                    m.version_id_marker.unwrap_or_default(),
                )
            });
            let mut remaining = b
                .versions
                .iter()
                .filter(|(entry, _)| after.as_ref().map_or(true, |after| *entry > after));
            let page: Vec<_> = remaining.by_ref().take(page_size).collect();
            let more = remaining.next().is_some();

            // S3 returns the versions of a page before its delete markers
            let mut keys: Vec<ObjectVersionKey> = page
                .iter()
                .filter(|(_, marker)| !**marker)
                .map(|((key, version), _)| ObjectVersionKey::new(key.clone(), version.clone()))
                .collect();
            keys.extend(
                page.iter()
                    .filter(|(_, marker)| **marker)
                    .map(|((key, version), _)| {
                        ObjectVersionKey::new(key.clone(), version.clone())
                    }),
            );
            let next = match (more, page.last()) {
                (true, Some(((key, version), _))) => Some(VersionMarker {
                    key_marker: Some(key.clone()),
                    version_id_marker: Some(version.clone()),
                }),
                _ => None,
            };
            VersionPage { keys, next }
        })
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        batch: &[ObjectVersionKey],
    ) -> Result<Vec<DeleteFailure>, Error> {
        assert!(
            batch.len() <= MAX_DELETE_BATCH,
            "bulk delete of {} keys",
            batch.len()
        );
        let latency = self.state().delete_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        state.batches.push(batch.to_vec());
        let failing = state.failing_keys.clone();
        with_bucket(&mut state, bucket, |b| {
            let mut failures = Vec::new();
            for key in batch {
                if failing.contains(&key.key) {
                    failures.push(DeleteFailure {
                        key: key.key.clone(),
                        version_id: Some(key.version_id.clone()),
                        code: Some("AccessDenied".to_string()),
                        message: Some("Access Denied".to_string()),
                    });
                    continue;
                }
                b.versions.remove(&(key.key.clone(), key.version_id.clone()));
            }
            failures
        })
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), Error> {
        let mut state = self.state();
        state.delete_bucket_calls += 1;
        let empty = with_bucket(&mut state, bucket, |b| b.versions.is_empty())?;
        if !empty {
            return Err(Error::BucketNotEmpty(bucket.to_string()));
        }
        state.buckets.remove(bucket);
        state.lingering = state.lingering_polls;
        Ok(())
    }
}

/// A call received by [MockCdn]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CdnCall {
    List(Option<String>),
    GetConfig(String),
    Get(String),
    Disable { id: String, etag: String },
    Delete { id: String, etag: String },
    Create(String),
}

/// A mock distribution
#[derive(Clone, Debug)]
pub struct MockDistribution {
    pub id: String,
    pub origins: Vec<String>,
    pub enabled: bool,
    pub etag: String,
    pub status: DistributionStatus,
    pending_polls: usize,
    deleting: Option<usize>,
    tampered: bool,
}

/// A rejection CloudFront may answer a mutating call with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// The distribution is still enabled or deploying
    NotDisabled,
    /// The `If-Match` token is no longer current
    StaleEtag,
}

impl Rejection {
    fn into_error(self, id: &str) -> Error {
        match self {
            Self::NotDisabled => Error::DistributionNotDisabled(id.to_string()),
            Self::StaleEtag => Error::Conflict {
                id: id.to_string(),
                reason: ConflictReason::StaleEtag,
            },
        }
    }
}

struct CdnState {
    distributions: Vec<MockDistribution>,
    page_size: usize,
    deploy_polls: usize,
    delete_polls: usize,
    unreadable: HashSet<String>,
    busy: HashSet<String>,
    rejected_disables: HashMap<String, Rejection>,
    rejected_deletes: HashMap<String, Rejection>,
    fail_create: bool,
    versions: u64,
    calls: Vec<CdnCall>,
}

impl Default for CdnState {
    fn default() -> Self {
        Self {
            distributions: Vec::new(),
            page_size: 100,
            deploy_polls: 2,
            delete_polls: 1,
            unreadable: HashSet::new(),
            busy: HashSet::new(),
            rejected_disables: HashMap::new(),
            rejected_deletes: HashMap::new(),
            fail_create: false,
            versions: 0,
            calls: Vec::new(),
        }
    }
}

impl CdnState {
    fn next_etag(&mut self) -> String {
        self.versions += 1;
        format!("ETAG{}", self.versions)
    }

    fn find(&mut self, id: &str) -> Result<&mut MockDistribution, Error> {
        self.distributions
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::DistributionNotFound(id.to_string()))
    }
}

/// An in-memory [Cdn]
#[derive(Clone, Default)]
pub struct MockCdn {
    state: Arc<Mutex<CdnState>>,
}

impl MockCdn {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CdnState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a distribution and returns its current etag
    pub fn add_distribution(
        &self,
        id: &str,
        origins: &[&str],
        enabled: bool,
        status: DistributionStatus,
    ) -> String {
        let mut state = self.state();
        let etag = state.next_etag();
        let pending_polls = match status {
            DistributionStatus::Deployed => 0,
            DistributionStatus::InProgress => state.deploy_polls,
        };
        state.distributions.push(MockDistribution {
            id: id.to_string(),
            origins: origins.iter().map(|o| o.to_string()).collect(),
            enabled,
            etag: etag.clone(),
            status,
            pending_polls,
            deleting: None,
            tampered: false,
        });
        etag
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.state().page_size = page_size;
    }

    /// Number of status polls a change stays `InProgress` for (`usize::MAX` for never)
    pub fn set_deploy_polls(&self, polls: usize) {
        self.state().deploy_polls = polls;
    }

    /// Number of status polls a deleted distribution remains visible for
    pub fn set_delete_polls(&self, polls: usize) {
        self.state().delete_polls = polls;
    }

    /// Makes fetching the configuration of `id` fail
    pub fn make_unreadable(&self, id: &str) {
        self.state().unreadable.insert(id.to_string());
    }

    /// Simulates another operator updating `id` during the next status poll
    pub fn tamper_during_wait(&self, id: &str) {
        if let Ok(d) = self.state().find(id) {
            d.tampered = true;
        }
    }

    /// Makes updates to `id` fail as if another update were still in progress
    pub fn make_busy(&self, id: &str) {
        self.state().busy.insert(id.to_string());
    }

    /// Makes every update of `id` fail with `rejection`
    pub fn reject_disable(&self, id: &str, rejection: Rejection) {
        self.state()
            .rejected_disables
            .insert(id.to_string(), rejection);
    }

    /// Makes every delete of `id` fail with `rejection`
    pub fn reject_delete(&self, id: &str, rejection: Rejection) {
        self.state()
            .rejected_deletes
            .insert(id.to_string(), rejection);
    }

    /// Completes any pending deployment of `id` on its next status poll
    pub fn finish_deploying(&self, id: &str) {
        if let Ok(d) = self.state().find(id) {
            d.pending_polls = 0;
        }
    }

    pub fn fail_create(&self) {
        self.state().fail_create = true;
    }

    pub fn calls(&self) -> Vec<CdnCall> {
        self.state().calls.clone()
    }

    /// Number of mutating calls received
    pub fn mutations(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, CdnCall::Disable { .. } | CdnCall::Delete { .. }))
            .count()
    }

    pub fn distribution(&self, id: &str) -> Option<MockDistribution> {
        self.state().find(id).ok().cloned()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.distribution(id).is_some()
    }
}

impl Cdn for MockCdn {
    type Config = ();

    async fn list_distributions(&self, marker: Option<String>) -> Result<DistributionPage, Error> {
        let mut state = self.state();
        state.calls.push(CdnCall::List(marker.clone()));
        let start = match marker {
            Some(marker) => state
                .distributions
                .iter()
                .position(|d| d.id == marker)
                .unwrap_or(state.distributions.len()),
            None => 0,
        };
        let end = (start + state.page_size).min(state.distributions.len());
        Ok(DistributionPage {
            ids: state.distributions[start..end]
                .iter()
                .map(|d| d.id.clone())
                .collect(),
            next_marker: state.distributions.get(end).map(|d| d.id.clone()),
        })
    }

    async fn get_distribution_config(
        &self,
        id: &str,
    ) -> Result<DistributionSnapshot<()>, Error> {
        let mut state = self.state();
        state.calls.push(CdnCall::GetConfig(id.to_string()));
        if state.unreadable.contains(id) {
            return Err(Error::AccessDenied(id.to_string()));
        }
        let d = state.find(id)?;
        Ok(DistributionSnapshot {
            etag: d.etag.clone(),
            enabled: d.enabled,
            origins: d.origins.clone(),
            config: (),
        })
    }

    async fn get_distribution(&self, id: &str) -> Result<DistributionState, Error> {
        let mut state = self.state();
        state.calls.push(CdnCall::Get(id.to_string()));
        let tampered = state.find(id)?.tampered;
        if tampered {
            let etag = state.next_etag();
            let d = state.find(id)?;
            d.etag = etag;
            d.tampered = false;
        }
        let d = state.find(id)?;
        if let Some(remaining) = d.deleting {
            if remaining == 0 {
                state.distributions.retain(|d| d.id != id);
                return Err(Error::DistributionNotFound(id.to_string()));
            }
            d.deleting = Some(remaining - 1);
        }
        if d.status == DistributionStatus::InProgress {
            if d.pending_polls == 0 {
                d.status = DistributionStatus::Deployed;
            } else if d.pending_polls != usize::MAX {
                d.pending_polls -= 1;
            }
        }
        Ok(DistributionState {
            status: d.status,
            enabled: d.enabled,
        })
    }

    async fn disable_distribution(&self, id: &str, _config: (), etag: &str) -> Result<String, Error> {
        let mut state = self.state();
        state.calls.push(CdnCall::Disable {
            id: id.to_string(),
            etag: etag.to_string(),
        });
        if state.busy.contains(id) {
            return Err(Error::Conflict {
                id: id.to_string(),
                reason: ConflictReason::UpdateInProgress,
            });
        }
        if let Some(rejection) = state.rejected_disables.get(id) {
            return Err(rejection.into_error(id));
        }
        let deploy_polls = state.deploy_polls;
        let next = state.next_etag();
        let d = state.find(id)?;
        if d.etag != etag {
            return Err(Error::Conflict {
                id: id.to_string(),
                reason: ConflictReason::StaleEtag,
            });
        }
        d.enabled = false;
        d.etag = next.clone();
        d.status = DistributionStatus::InProgress;
        d.pending_polls = deploy_polls;
        Ok(next)
    }

    async fn delete_distribution(&self, id: &str, etag: &str) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(CdnCall::Delete {
            id: id.to_string(),
            etag: etag.to_string(),
        });
        if let Some(rejection) = state.rejected_deletes.get(id) {
            return Err(rejection.into_error(id));
        }
        let delete_polls = state.delete_polls;
        let d = state.find(id)?;
        if d.etag != etag {
            return Err(Error::Conflict {
                id: id.to_string(),
                reason: ConflictReason::StaleEtag,
            });
        }
        if d.enabled || d.status != DistributionStatus::Deployed {
            return Err(Error::DistributionNotDisabled(id.to_string()));
        }
        d.deleting = Some(delete_polls);
        Ok(())
    }

    async fn create_distribution(
        &self,
        spec: &WebsiteDistribution,
    ) -> Result<CreatedDistribution, Error> {
        let fail = {
            let mut state = self.state();
            state.calls.push(CdnCall::Create(spec.origin_domain.clone()));
            state.fail_create
        };
        if fail {
            return Err(Error::AccessDenied(spec.bucket.clone()));
        }
        let id = format!("E{}", self.state().distributions.len() + 1);
        self.add_distribution(
            &id,
            &[spec.origin_domain.as_str()],
            true,
            DistributionStatus::InProgress,
        );
        Ok(CreatedDistribution {
            domain_name: format!("{}.cloudfront.net", id.to_lowercase()),
            id,
        })
    }
}

/// A [Prompt] that replays canned answers and records everything shown
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<Option<String>>,
    transcript: Vec<String>,
}

impl ScriptedPrompt {
    /// Answers questions in order; once the answers run out the input is closed
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(|a| Some(a.into())).collect(),
            transcript: Vec::new(),
        }
    }

    /// A prompt whose input stream is already closed
    pub fn closed() -> Self {
        Self::default()
    }

    /// Everything asked or shown so far
    pub fn transcript(&self) -> String {
        self.transcript.join("\n")
    }

    /// Number of answers not consumed
    pub fn remaining(&self) -> usize {
        self.answers.len()
    }
}

impl Prompt for ScriptedPrompt {
    async fn ask(&mut self, question: &str) -> Option<String> {
        self.transcript.push(question.to_string());
        self.answers.pop_front().flatten()
    }

    fn say(&mut self, text: &str) {
        self.transcript.push(text.to_string());
    }
}
