//! Single-writer election over an annotation on a shared lock object.
//!
//! Every replica runs a [`LeaderElector`]. Followers poll the record every
//! retry period and take over once the lease is vacant or has not changed for
//! a full lease duration. The leader renews every retry period and steps down
//! if it cannot renew within the renew deadline. Since the renew deadline is
//! shorter than the lease duration, the old leader has stopped before a new
//! one can acquire.
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ClusterApi};
use crate::identity::Identity;
use crate::signal::StopSignal;

mod record;

pub use record::{LeaderElectionRecord, LEADER_ANNOTATION};

/// How much a follower's poll interval may be stretched, as a multiple of the
/// retry period. The renew deadline must leave room for one such interval.
pub const JITTER_FACTOR: f64 = 1.2;

/// The longest lease duration accepted.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Invalid combinations of election timings.
#[derive(Error, Debug, PartialEq)]
pub enum ElectionConfigError {
    /// The lease would expire before the leader gives up renewing.
    #[error("lease duration ({lease:?}) must be greater than renew deadline ({renew:?})")]
    LeaseTooShort {
        /// Configured lease duration.
        lease: Duration,
        /// Configured renew deadline.
        renew: Duration,
    },
    /// The leader would not get a retry in before the renew deadline.
    #[error("renew deadline ({renew:?}) must be greater than {JITTER_FACTOR} times the retry period ({retry:?})")]
    RenewTooShort {
        /// Configured renew deadline.
        renew: Duration,
        /// Configured retry period.
        retry: Duration,
    },
    /// Leases longer than [`MAX_LEASE_DURATION`] are refused.
    #[error("lease duration ({lease:?}) must be at most {MAX_LEASE_DURATION:?}")]
    LeaseTooLong {
        /// Configured lease duration.
        lease: Duration,
    },
    /// A zero retry period would spin.
    #[error("retry period must be greater than zero")]
    ZeroRetryPeriod,
}

/// Timing for the election.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// How long a lease is honored after it was last seen to change.
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before stepping down.
    pub renew_deadline: Duration,
    /// How often the record is read or renewed.
    pub retry_period: Duration,
    /// Whether a leader clears the record when stopped.
    pub release_on_cancel: bool,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        LeaderElectionConfig {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            release_on_cancel: true,
        }
    }
}

impl LeaderElectionConfig {
    /// Checks that [`MAX_LEASE_DURATION`] >= lease duration > renew deadline >
    /// retry period × [`JITTER_FACTOR`].
    pub fn validate(&self) -> Result<(), ElectionConfigError> {
        if self.retry_period == Duration::from_secs(0) {
            return Err(ElectionConfigError::ZeroRetryPeriod);
        }
        if self.lease_duration > MAX_LEASE_DURATION {
            return Err(ElectionConfigError::LeaseTooLong {
                lease: self.lease_duration,
            });
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(ElectionConfigError::LeaseTooShort {
                lease: self.lease_duration,
                renew: self.renew_deadline,
            });
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(ElectionConfigError::RenewTooShort {
                renew: self.renew_deadline,
                retry: self.retry_period,
            });
        }
        Ok(())
    }
}

/// Where a replica stands in the election.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Watching someone else's lease, or nobody's.
    Follower,
    /// Attempting to write itself into the record.
    Candidate,
    /// Holding the lease.
    Leader,
}

/// Runs the election for one replica.
pub struct LeaderElector {
    api: Arc<dyn ClusterApi>,
    identity: Identity,
    config: LeaderElectionConfig,
    role: Role,
    observed: Option<LeaderElectionRecord>,
    observed_version: Option<String>,
    observed_at: Instant,
    // When the last successful write was sent
    last_renew: Option<Instant>,
}

impl LeaderElector {
    /// Creates a follower. The config should already have been validated.
    pub fn new(api: Arc<dyn ClusterApi>, identity: Identity, config: LeaderElectionConfig) -> Self {
        LeaderElector {
            api,
            identity,
            config,
            role: Role::Follower,
            observed: None,
            observed_version: None,
            observed_at: Instant::now(),
            last_renew: None,
        }
    }

    /// The current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns true while this replica holds the lease.
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Runs one round of the state machine and returns the resulting role.
    pub async fn step(&mut self) -> Role {
        match self.role {
            Role::Follower | Role::Candidate => {
                match self.observe().await {
                    Ok(()) if self.may_acquire() => {
                        self.role = Role::Candidate;
                        self.try_acquire().await;
                    }
                    Ok(()) => {
                        debug!(
                            holder = self.holder().unwrap_or_default(),
                            "Lease is held by another replica"
                        );
                        self.role = Role::Follower;
                    }
                    Err(e) => {
                        warn!(error = %e, "Unable to read leader record");
                        self.role = Role::Follower;
                    }
                }
            }
            Role::Leader => self.renew().await,
        }
        self.role
    }

    /// Runs the election until `stop` fires, publishing whether this replica
    /// leads on `leading`. A leader stopped with `release_on_cancel` set
    /// clears the record on the way out so a successor need not wait.
    pub async fn run(mut self, leading: watch::Sender<bool>, stop: StopSignal) {
        loop {
            let is_leader = self.step().await == Role::Leader;
            if *leading.borrow() != is_leader {
                let _ = leading.send(is_leader);
            }
            let wait = if is_leader {
                self.until_next_renew()
            } else {
                jittered(self.config.retry_period)
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.stopped() => break,
            }
        }
        let _ = leading.send(false);
        if self.is_leader() && self.config.release_on_cancel {
            self.release().await;
        }
    }

    fn holder(&self) -> Option<&str> {
        self.observed.as_ref().map(|r| r.holder_identity.as_str())
    }

    async fn observe(&mut self) -> Result<(), ApiError> {
        let lock = self.api.get_leader_record().await?;
        // Expiry is measured from when we saw the record change, not from its
        // renewTime, so the holder's clock does not matter.
        if lock.record != self.observed || lock.resource_version != self.observed_version {
            self.observed = lock.record;
            self.observed_version = lock.resource_version;
            self.observed_at = Instant::now();
        }
        Ok(())
    }

    fn may_acquire(&self) -> bool {
        match &self.observed {
            None => true,
            Some(record) if record.is_vacant() => true,
            Some(record) if record.holder_identity == self.identity.get() => true,
            Some(_) => self
                .observed_at
                .checked_add(self.config.lease_duration)
                .map_or(false, |expiry| expiry <= Instant::now()),
        }
    }

    fn next_record(&self) -> LeaderElectionRecord {
        let now = record::now();
        let mut next = LeaderElectionRecord {
            holder_identity: self.identity.to_string(),
            lease_duration_seconds: self.config.lease_duration.as_secs() as i64,
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            leader_transitions: 0,
        };
        if let Some(previous) = &self.observed {
            if previous.holder_identity == self.identity.get() {
                next.acquire_time = previous.acquire_time.clone();
                next.leader_transitions = previous.leader_transitions;
            } else {
                next.leader_transitions = previous.leader_transitions + 1;
            }
        }
        next
    }

    async fn write(&mut self, record: LeaderElectionRecord) -> Result<(), ApiError> {
        // The lease counts from before the request, since the write may land
        // on the server any time before the response comes back
        let sent_at = Instant::now();
        let version = self
            .api
            .update_leader_record(&record, self.observed_version.as_deref())
            .await?;
        self.observed = Some(record);
        self.observed_version = Some(version);
        self.observed_at = Instant::now();
        self.last_renew = Some(sent_at);
        Ok(())
    }

    fn renew_deadline(&self) -> Option<Instant> {
        self.last_renew
            .and_then(|at| at.checked_add(self.config.renew_deadline))
    }

    // The leader wakes up at the renew deadline even when that comes before
    // the next retry period, so it never leads past the deadline.
    fn until_next_renew(&self) -> Duration {
        match self.renew_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.config.retry_period),
            None => self.config.retry_period,
        }
    }

    async fn try_acquire(&mut self) {
        let record = self.next_record();
        let transitions = record.leader_transitions;
        match self.write(record).await {
            Ok(()) => {
                info!(
                    identity = %self.identity,
                    transitions,
                    "Acquired leadership"
                );
                self.role = Role::Leader;
            }
            Err(ApiError::Conflict(_)) => {
                debug!("Lost the race for leadership");
                self.role = Role::Follower;
            }
            Err(e) => {
                warn!(error = %e, "Unable to acquire leadership");
                self.role = Role::Follower;
            }
        }
    }

    /// Renews the lease, stepping down once the renew deadline has passed
    /// without a successful write. An attempt still running at the deadline
    /// is abandoned.
    async fn renew(&mut self) {
        let deadline = match self.renew_deadline() {
            Some(deadline) if deadline > Instant::now() => deadline,
            _ => {
                warn!(
                    deadline = ?self.config.renew_deadline,
                    "Unable to renew leadership before the deadline"
                );
                self.step_down();
                return;
            }
        };
        match tokio::time::timeout_at(deadline, self.try_renew()).await {
            Ok(Ok(true)) => debug!("Renewed leadership"),
            Ok(Ok(false)) => self.step_down(),
            Ok(Err(e)) if Instant::now() >= deadline => {
                warn!(error = %e, "Unable to renew leadership before the deadline");
                self.step_down();
            }
            Ok(Err(e)) => debug!(error = %e, "Renew failed, retrying"),
            Err(_) => {
                warn!(
                    deadline = ?self.config.renew_deadline,
                    "Renew did not complete before the deadline"
                );
                self.step_down();
            }
        }
    }

    /// Returns false if another replica holds the lease now.
    async fn try_renew(&mut self) -> Result<bool, ApiError> {
        self.observe().await?;
        if let Some(holder) = self.holder() {
            if !holder.is_empty() && holder != self.identity.get() {
                warn!(holder, "Leadership was taken over by another replica");
                return Ok(false);
            }
        }
        self.write(self.next_record()).await?;
        Ok(true)
    }

    fn step_down(&mut self) {
        info!(identity = %self.identity, "Stepping down from leadership");
        self.role = Role::Follower;
        self.last_renew = None;
    }

    async fn release(&mut self) {
        let now = record::now();
        let record = LeaderElectionRecord {
            holder_identity: String::new(),
            lease_duration_seconds: 1,
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            leader_transitions: self
                .observed
                .as_ref()
                .map(|r| r.leader_transitions)
                .unwrap_or_default(),
        };
        match self.write(record).await {
            Ok(()) => info!("Released leadership"),
            Err(e) => warn!(error = %e, "Unable to release leadership"),
        }
        self.role = Role::Follower;
    }
}

/// Stretches `period` by a random amount up to [`JITTER_FACTOR`] times itself
/// so that followers do not poll in lockstep.
fn jittered(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.0..JITTER_FACTOR);
    period + period.mul_f64(factor)
}
