//! Deploy a static website to S3 behind CloudFront, and tear it down again.
//!
//! See [aws] for the deployment workflow and the teardown orchestrator.

pub mod aws;
