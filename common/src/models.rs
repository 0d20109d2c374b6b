use crate::clock::truncate_to_minute;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Job Models
// ============================================================================

/// A scheduled publishing job. Created by the API layer, mutated only by the
/// scheduler runner through the repository's compare-and-set primitive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_feature: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job. `scheduled_at` is truncated to the minute and
    /// `max_attempts` is clamped to at least one.
    pub fn new_pending(
        id: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            scheduled_at: truncate_to_minute(scheduled_at),
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            next_retry_at: None,
            required_feature: None,
            payload,
            last_error: None,
            updated_at: scheduled_at,
        }
    }

    pub fn with_required_feature(mut self, feature: impl Into<String>) -> Self {
        self.required_feature = Some(feature.into());
        self
    }

    /// The instant at which this job becomes eligible for dispatch
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            JobStatus::Pending => Some(self.scheduled_at),
            JobStatus::Retrying => self.next_retry_at,
            _ => None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at().is_some_and(|at| at <= now)
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Apply a status change and its accompanying fields
    pub fn apply(&mut self, status: JobStatus, update: &JobUpdate) {
        self.status = status;
        self.attempt_count = update.attempt_count;
        self.next_retry_at = update.next_retry_at;
        self.last_error = update.last_error.clone();
        self.updated_at = update.updated_at;
    }
}

/// Fields written atomically together with a status transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobUpdate {
    /// Start from the job's current field values
    pub fn from_job(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            attempt_count: job.attempt_count,
            next_retry_at: job.next_retry_at,
            last_error: job.last_error.clone(),
            updated_at: now,
        }
    }
}

/// JobStatus represents where a job is in its dispatch lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses permit no further mutation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

// ============================================================================
// License Models
// ============================================================================

pub const FEATURE_AUDIO_REPLACE: &str = "audio_replace";
pub const FEATURE_HOT_SWAP: &str = "hot_swap";
pub const FEATURE_HOT_SWAP_IMMEDIATE: &str = "hot_swap_immediate";
pub const FEATURE_LOOPED_WINDOW: &str = "looped_window";

/// Commercial tier carried by a lease
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum LicenseTier {
    #[default]
    Basic,
    Premium,
    Ultimate,
}

impl LicenseTier {
    /// Features implied by the tier alone
    pub fn implied_features(&self) -> &'static [&'static str] {
        match self {
            LicenseTier::Basic => &[],
            LicenseTier::Premium => &[FEATURE_AUDIO_REPLACE, FEATURE_HOT_SWAP, FEATURE_LOOPED_WINDOW],
            LicenseTier::Ultimate => &[
                FEATURE_AUDIO_REPLACE,
                FEATURE_HOT_SWAP,
                FEATURE_LOOPED_WINDOW,
                FEATURE_HOT_SWAP_IMMEDIATE,
            ],
        }
    }
}

impl fmt::Display for LicenseTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LicenseTier::Basic => write!(f, "basic"),
            LicenseTier::Premium => write!(f, "premium"),
            LicenseTier::Ultimate => write!(f, "ultimate"),
        }
    }
}

/// Lease status, derived from the current lease and the time of observation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Unacquired,
    Valid,
    Grace,
    Expired,
}

impl LeaseStatus {
    /// Numeric encoding used for the lease status gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            LeaseStatus::Unacquired => 0.0,
            LeaseStatus::Valid => 1.0,
            LeaseStatus::Grace => 2.0,
            LeaseStatus::Expired => 3.0,
        }
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseStatus::Unacquired => write!(f, "unacquired"),
            LeaseStatus::Valid => write!(f, "valid"),
            LeaseStatus::Grace => write!(f, "grace"),
            LeaseStatus::Expired => write!(f, "expired"),
        }
    }
}

/// A time-bounded license lease. Immutable once built; renewal replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub grace_until: DateTime<Utc>,
    pub tier: LicenseTier,
    pub features: BTreeSet<String>,
}

impl Lease {
    /// Build a lease. `grace_until` earlier than `expires_at` is raised to it,
    /// and the tier's implied features are merged into `features`.
    pub fn new(
        token: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        grace_until: DateTime<Utc>,
        tier: LicenseTier,
        features: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut features: BTreeSet<String> = features.into_iter().collect();
        features.extend(tier.implied_features().iter().map(|f| f.to_string()));

        Self {
            token: token.into(),
            issued_at,
            expires_at,
            grace_until: grace_until.max(expires_at),
            tier,
            features,
        }
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> LeaseStatus {
        if now < self.expires_at {
            LeaseStatus::Valid
        } else if now <= self.grace_until {
            LeaseStatus::Grace
        } else {
            LeaseStatus::Expired
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

/// Credentials identifying this installation to the lease issuer
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LicenseCredentials {
    pub install_id: String,
    pub install_secret: String,
}

impl fmt::Debug for LicenseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LicenseCredentials")
            .field("install_id", &self.install_id)
            .field("install_secret", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Runner Lock Models
// ============================================================================

/// Exclusive ownership of the dispatch cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerLockHandle {
    pub resource: String,
    pub owner_id: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_new_pending_truncates_schedule() {
        let job = Job::new_pending("job-1", t0() + TimeDelta::seconds(42), 0, serde_json::json!({}));
        assert_eq!(job.scheduled_at, t0());
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_due_at_depends_on_status() {
        let mut job = Job::new_pending("job-1", t0(), 3, serde_json::json!({}));
        assert!(job.is_due(t0()));
        assert!(!job.is_due(t0() - TimeDelta::seconds(1)));

        job.status = JobStatus::Retrying;
        job.next_retry_at = Some(t0() + TimeDelta::minutes(5));
        assert!(!job.is_due(t0() + TimeDelta::minutes(4)));
        assert!(job.is_due(t0() + TimeDelta::minutes(5)));

        job.status = JobStatus::Running;
        assert!(!job.is_due(t0() + TimeDelta::days(1)));
    }

    #[test]
    fn test_job_status_round_trip_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Retrying,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_lease_status_boundaries() {
        let lease = Lease::new(
            "tok",
            t0(),
            t0() + TimeDelta::seconds(3600),
            t0() + TimeDelta::seconds(3900),
            LicenseTier::Basic,
            Vec::new(),
        );
        assert_eq!(lease.status_at(t0() + TimeDelta::seconds(3599)), LeaseStatus::Valid);
        assert_eq!(lease.status_at(t0() + TimeDelta::seconds(3600)), LeaseStatus::Grace);
        assert_eq!(lease.status_at(t0() + TimeDelta::seconds(3900)), LeaseStatus::Grace);
        assert_eq!(lease.status_at(t0() + TimeDelta::seconds(3901)), LeaseStatus::Expired);
    }

    #[test]
    fn test_lease_grace_never_precedes_expiry() {
        let lease = Lease::new(
            "tok",
            t0(),
            t0() + TimeDelta::hours(1),
            t0(),
            LicenseTier::Basic,
            Vec::new(),
        );
        assert_eq!(lease.grace_until, lease.expires_at);
    }

    #[test]
    fn test_tier_features_are_merged() {
        let lease = Lease::new(
            "tok",
            t0(),
            t0() + TimeDelta::hours(1),
            t0() + TimeDelta::hours(2),
            LicenseTier::Premium,
            vec!["multi_destination".to_string()],
        );
        assert!(lease.has_feature("multi_destination"));
        assert!(lease.has_feature(FEATURE_HOT_SWAP));
        assert!(!lease.has_feature(FEATURE_HOT_SWAP_IMMEDIATE));
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = LicenseCredentials {
            install_id: "install-1".into(),
            install_secret: "s3cret".into(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("install-1"));
        assert!(!rendered.contains("s3cret"));
    }
}
