// Janitor time windows.
//
// `sweep()` is a pure function of (now, liveness, inactivity, retention):
// every delete it issues is bounded by one of the cutoffs computed here.

use chrono::{DateTime, Duration, Utc};

use crate::error::{CollabError, CollabResult};

const DEFAULT_LIVENESS_SECS: i64 = 60;
const DEFAULT_INACTIVITY_SECS: i64 = 30 * 60;
const DEFAULT_EDIT_RETENTION_SECS: i64 = 2 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// A participant not seen for this long is no longer listed as active.
    pub liveness_window: Duration,
    /// An empty session idle for this long is reclaimed.
    pub inactivity_window: Duration,
    /// Edits older than this are pruned from the log.
    pub edit_retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            liveness_window: Duration::seconds(DEFAULT_LIVENESS_SECS),
            inactivity_window: Duration::seconds(DEFAULT_INACTIVITY_SECS),
            edit_retention: Duration::seconds(DEFAULT_EDIT_RETENTION_SECS),
        }
    }
}

/// Absolute cutoffs for one sweep. Rows strictly older than a cutoff are
/// eligible for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepCutoffs {
    pub liveness: DateTime<Utc>,
    pub inactivity: DateTime<Utc>,
    pub edit_retention: DateTime<Utc>,
}

impl RetentionPolicy {
    pub fn from_secs(liveness: u64, inactivity: u64, edit_retention: u64) -> CollabResult<Self> {
        let policy = Self {
            liveness_window: seconds(liveness)?,
            inactivity_window: seconds(inactivity)?,
            edit_retention: seconds(edit_retention)?,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Rejects windows that would let the janitor remove state a live
    /// participant can still ask for.
    pub fn validate(&self) -> CollabResult<()> {
        if self.liveness_window <= Duration::zero()
            || self.inactivity_window <= Duration::zero()
            || self.edit_retention <= Duration::zero()
        {
            return Err(CollabError::InvalidInput("retention windows must be positive".into()));
        }
        if self.edit_retention < self.liveness_window {
            return Err(CollabError::InvalidInput(
                "edit retention must be at least the liveness window".into(),
            ));
        }
        Ok(())
    }

    pub fn cutoffs(&self, now: DateTime<Utc>) -> SweepCutoffs {
        SweepCutoffs {
            liveness: now - self.liveness_window,
            inactivity: now - self.inactivity_window,
            edit_retention: now - self.edit_retention,
        }
    }
}

fn seconds(value: u64) -> CollabResult<Duration> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| CollabError::InvalidInput(format!("window of {value}s is out of range")))
}
