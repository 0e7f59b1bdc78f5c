use site_deployer::aws::{
    mocks::{MockCdn, MockStorage},
    website_endpoint, DistributionStatus,
};

/// A deployed site held by in-memory collaborators
pub struct Site {
    pub storage: MockStorage,
    pub cdn: MockCdn,
}

impl Site {
    /// A bucket holding `objects` object versions with no distribution in front of it
    pub fn bucket_only(bucket: &str, region: Option<&str>, objects: usize) -> Self {
        let storage = MockStorage::new();
        storage.add_bucket(bucket, region);
        storage.add_objects(bucket, objects);
        Self {
            storage,
            cdn: MockCdn::new(),
        }
    }

    /// Adds a distribution serving the website endpoint of `bucket` in `region`
    pub fn with_distribution(self, id: &str, bucket: &str, region: &str, enabled: bool) -> Self {
        let origin = website_endpoint(bucket, region);
        self.cdn
            .add_distribution(id, &[origin.as_str()], enabled, DistributionStatus::Deployed);
        self
    }
}
