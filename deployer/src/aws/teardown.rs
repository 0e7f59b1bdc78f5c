//! Disable, wait out, and delete a CloudFront distribution.
//!
//! The machine never trusts a token across a wait: it reads the live configuration
//! on entry and again after the disable has propagated, so re-running it after an
//! interruption resumes from whatever state the distribution is actually in.

use crate::aws::{
    utils::poll_until, Cdn, ConflictReason, DistributionStatus, Error, Timings,
};
use tracing::{debug, info};

/// Steps of a distribution teardown
enum Phase<C> {
    /// Reading the live configuration
    Inspecting,
    /// Writing the configuration back with `enabled = false`
    Disabling { config: C, etag: String },
    /// Waiting for the disable to be deployed; `etag` is the last token we know of
    WaitingDisabled { etag: String },
    Deleting { etag: String },
    WaitingDeleted,
    Gone,
}

impl<C> Phase<C> {
    fn name(&self) -> &'static str {
        match self {
            Self::Inspecting => "inspecting",
            Self::Disabling { .. } => "disabling",
            Self::WaitingDisabled { .. } => "waiting_disabled",
            Self::Deleting { .. } => "deleting",
            Self::WaitingDeleted => "waiting_deleted",
            Self::Gone => "gone",
        }
    }
}

/// Deletes distribution `id`, waiting for each change to propagate.
///
/// A distribution that no longer exists is treated as already deleted. Conflicts,
/// rejected deletes, and timeouts are returned without retrying any call.
pub async fn teardown_distribution<C: Cdn>(
    cdn: &C,
    id: &str,
    timings: &Timings,
) -> Result<(), Error> {
    let mut phase = Phase::Inspecting;
    loop {
        debug!(id, phase = phase.name(), "distribution teardown step");
        phase = match phase {
            Phase::Inspecting => inspect(cdn, id).await?,
            Phase::Disabling { config, etag } => {
                info!(id, "disabling distribution");
                let etag = cdn.disable_distribution(id, config, &etag).await?;
                Phase::WaitingDisabled { etag }
            }
            Phase::WaitingDisabled { etag } => {
                info!(id, "waiting for disabled distribution to deploy");
                wait_deployed(cdn, id, timings).await?;
                refresh(cdn, id, &etag).await?
            }
            Phase::Deleting { etag } => {
                info!(id, "deleting distribution");
                match cdn.delete_distribution(id, &etag).await {
                    Ok(()) => Phase::WaitingDeleted,
                    Err(Error::DistributionNotFound(_)) => Phase::Gone,
                    Err(e) => return Err(e),
                }
            }
            Phase::WaitingDeleted => {
                info!(id, "waiting for distribution to disappear");
                wait_deleted(cdn, id, timings).await?;
                Phase::Gone
            }
            Phase::Gone => {
                info!(id, "distribution deleted");
                return Ok(());
            }
        };
    }
}

async fn inspect<C: Cdn>(cdn: &C, id: &str) -> Result<Phase<C::Config>, Error> {
    let snapshot = match cdn.get_distribution_config(id).await {
        Ok(snapshot) => snapshot,
        Err(Error::DistributionNotFound(_)) => {
            info!(id, "distribution already absent");
            return Ok(Phase::Gone);
        }
        Err(e) => return Err(e),
    };
    if snapshot.enabled {
        return Ok(Phase::Disabling {
            config: snapshot.config,
            etag: snapshot.etag,
        });
    }
    let state = match cdn.get_distribution(id).await {
        Ok(state) => state,
        Err(Error::DistributionNotFound(_)) => return Ok(Phase::Gone),
        Err(e) => return Err(e),
    };
    if state.status == DistributionStatus::Deployed {
        info!(id, "distribution already disabled");
        Ok(Phase::Deleting {
            etag: snapshot.etag,
        })
    } else {
        info!(id, "distribution disabled but still deploying");
        Ok(Phase::WaitingDisabled {
            etag: snapshot.etag,
        })
    }
}

/// Re-reads the configuration after a wait, refusing to delete if anyone else
/// touched the distribution in the meantime.
async fn refresh<C: Cdn>(cdn: &C, id: &str, expected: &str) -> Result<Phase<C::Config>, Error> {
    let snapshot = match cdn.get_distribution_config(id).await {
        Ok(snapshot) => snapshot,
        Err(Error::DistributionNotFound(_)) => return Ok(Phase::Gone),
        Err(e) => return Err(e),
    };
    if snapshot.enabled || snapshot.etag != expected {
        return Err(Error::Conflict {
            id: id.to_string(),
            reason: ConflictReason::ConcurrentModification,
        });
    }
    Ok(Phase::Deleting {
        etag: snapshot.etag,
    })
}

async fn wait_deployed<C: Cdn>(cdn: &C, id: &str, timings: &Timings) -> Result<(), Error> {
    poll_until(
        "distribution deployment",
        timings.distribution_poll_interval,
        timings.distribution_timeout,
        |elapsed| async move {
            match cdn.get_distribution(id).await {
                Ok(state) => {
                    debug!(
                        id,
                        status = ?state.status,
                        elapsed_secs = elapsed.as_secs(),
                        "distribution status"
                    );
                    Ok(state.status == DistributionStatus::Deployed)
                }
                // Nothing left to wait for; the refresh that follows observes the absence
                Err(Error::DistributionNotFound(_)) => Ok(true),
                Err(e) => Err(e),
            }
        },
    )
    .await?;
    Ok(())
}

async fn wait_deleted<C: Cdn>(cdn: &C, id: &str, timings: &Timings) -> Result<(), Error> {
    poll_until(
        "distribution deletion",
        timings.distribution_poll_interval,
        timings.distribution_timeout,
        |_| async move {
            match cdn.get_distribution(id).await {
                Ok(_) => Ok(false),
                Err(Error::DistributionNotFound(_)) => Ok(true),
                Err(e) => Err(e),
            }
        },
    )
    .await?;
    Ok(())
}
