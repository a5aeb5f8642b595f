//! Background job coordination
//!
//! Jobs are mutually excluded through named exclusivity groups. A submission
//! for an occupied group is rejected immediately; nothing is ever queued
//! behind another job. Each accepted job runs on its own tokio task and keeps
//! its group lease until the task ends, whichever way it ends.

pub mod actions;

use crate::services::{
    store::{AtomicStore, StoreError},
    system_actions::CommandError,
};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

pub const JOB_HISTORY_KEY: &str = "job_history";
pub const JOB_HISTORY_LIMIT: usize = 50;

const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Update,
    CheckForUpdates,
    Reboot,
    Shutdown,
    GenerateSshKey,
    GenerateTlsCert,
    ConnectNetwork,
    ScanNetworks,
}

impl JobKind {
    /// Groups claimed by a job of this kind, primary group first
    pub fn groups(self) -> &'static [ExclusivityGroup] {
        use ExclusivityGroup::*;

        match self {
            JobKind::Update | JobKind::CheckForUpdates => &[System],
            JobKind::Reboot | JobKind::Shutdown => &[System, Network],
            JobKind::GenerateSshKey | JobKind::GenerateTlsCert => &[Crypto],
            JobKind::ConnectNetwork | JobKind::ScanNetworks => &[Network],
        }
    }

    pub fn exclusivity_group(self) -> ExclusivityGroup {
        self.groups()[0]
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::Update => "update",
            JobKind::CheckForUpdates => "check-for-updates",
            JobKind::Reboot => "reboot",
            JobKind::Shutdown => "shutdown",
            JobKind::GenerateSshKey => "generate-ssh-key",
            JobKind::GenerateTlsCert => "generate-tls-cert",
            JobKind::ConnectNetwork => "connect-network",
            JobKind::ScanNetworks => "scan-networks",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclusivityGroup {
    System,
    Network,
    Crypto,
}

impl fmt::Display for ExclusivityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExclusivityGroup::System => "system",
            ExclusivityGroup::Network => "network",
            ExclusivityGroup::Crypto => "crypto",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobErrorKind {
    Timeout,
    CommandFailed,
    Corrupt,
    Busy,
    InvalidRequest,
    Internal,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    fn from_anyhow(e: &anyhow::Error) -> Self {
        Self {
            kind: classify(e),
            message: format!("{e:#}"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub exclusivity_group: ExclusivityGroup,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Vec<String>,
    pub error: Option<JobError>,
}

/// Compact record of a finished job kept in the `job_history` store record
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct JobHistory {
    #[serde(default)]
    pub entries: Vec<JobSummary>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SubmitError {
    #[error("exclusivity group '{group}' is busy")]
    Busy { group: ExclusivityGroup },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelOutcome {
    Accepted,
    TooLate,
    Unknown,
}

/// Returned by `checkpoint()` and `commit()` once cancellation was requested
#[derive(Debug, Error)]
#[error("job cancelled")]
pub struct Cancelled;

/// Rejection of a job request by its body
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InvalidRequest(pub String);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Holder {
    Job(JobId),
    Provisioning,
}

type Holders = Arc<Mutex<HashMap<ExclusivityGroup, Holder>>>;

/// Exclusive claim on one or more groups, released on drop
#[must_use = "the groups are released as soon as the lease is dropped"]
pub struct GroupLease {
    groups: Vec<ExclusivityGroup>,
    holders: Holders,
}

impl fmt::Debug for GroupLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupLease")
            .field("groups", &self.groups)
            .finish()
    }
}

impl Drop for GroupLease {
    fn drop(&mut self) {
        let mut holders = lock(&self.holders);
        for group in &self.groups {
            holders.remove(group);
        }
        debug!("released groups {:?}", self.groups);
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CancelState {
    Open,
    Requested,
    Committed,
}

struct JobEntry {
    job: Job,
    cancel: Arc<Mutex<CancelState>>,
    state_tx: watch::Sender<JobState>,
}

struct CoordinatorInner {
    holders: Holders,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    history: Option<AtomicStore>,
}

/// Tracks in-flight jobs and enforces group exclusivity
///
/// Cheap to clone; all clones share the same job table.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for JobCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl JobCoordinator {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Coordinator that appends a summary of each finished job to `store`
    pub fn with_history(store: AtomicStore) -> Self {
        Self::build(Some(store))
    }

    fn build(history: Option<AtomicStore>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                holders: Arc::default(),
                jobs: Mutex::default(),
                history,
            }),
        }
    }

    /// Submit a job
    ///
    /// The groups of `kind` are claimed atomically before anything else
    /// happens; if any of them is held the submission is rejected.
    ///
    /// # Arguments
    /// * `kind` - Kind of the job, determines its exclusivity groups
    /// * `body` - Work to run on a dedicated task
    ///
    /// # Returns
    /// The id of the accepted job or `SubmitError::Busy`
    pub fn submit<F, Fut>(&self, kind: JobKind, body: F) -> Result<JobId, SubmitError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = JobId::new();
        let lease = self.try_acquire(kind.groups(), Holder::Job(id))?;
        let cancel = Arc::new(Mutex::new(CancelState::Open));
        let (state_tx, _) = watch::channel(JobState::Queued);

        lock(&self.inner.jobs).insert(
            id,
            JobEntry {
                job: Job {
                    id,
                    kind,
                    exclusivity_group: kind.exclusivity_group(),
                    state: JobState::Queued,
                    submitted_at: Utc::now(),
                    started_at: None,
                    ended_at: None,
                    output: Vec::new(),
                    error: None,
                },
                cancel: cancel.clone(),
                state_tx,
            },
        );
        info!("job {id} ({kind}) accepted");

        let context = JobContext {
            id,
            coordinator: self.clone(),
            cancel,
        };
        let coordinator = self.clone();

        tokio::spawn(async move {
            let result = match context.checkpoint() {
                Err(e) => Err(e.into()),
                Ok(()) => {
                    coordinator.mark_running(id);
                    AssertUnwindSafe(async move { body(context).await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(anyhow!("job panicked: {}", panic_message(panic.as_ref())))
                        })
                }
            };

            coordinator.finish(id, result, lease).await;
        });

        Ok(id)
    }

    /// Claim groups for a holder that is not a job
    pub fn try_acquire(
        &self,
        groups: &[ExclusivityGroup],
        holder: Holder,
    ) -> Result<GroupLease, SubmitError> {
        let mut holders = lock(&self.inner.holders);

        if let Some(group) = groups.iter().find(|g| holders.contains_key(g)) {
            debug!("group {group} is held by {:?}", holders.get(group));
            return Err(SubmitError::Busy { group: *group });
        }

        for group in groups {
            holders.insert(*group, holder);
        }

        Ok(GroupLease {
            groups: groups.to_vec(),
            holders: self.inner.holders.clone(),
        })
    }

    /// Claim groups, polling until `wait` elapses
    pub async fn acquire(
        &self,
        groups: &[ExclusivityGroup],
        holder: Holder,
        wait: Duration,
    ) -> Result<GroupLease, SubmitError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            match self.try_acquire(groups, holder) {
                Err(e) if tokio::time::Instant::now() < deadline => {
                    debug!("waiting for lease: {e}");
                    tokio::time::sleep(LEASE_POLL_INTERVAL).await;
                }
                result => return result,
            }
        }
    }

    pub fn status(&self, id: JobId) -> Option<Job> {
        lock(&self.inner.jobs).get(&id).map(|e| e.job.clone())
    }

    /// All known jobs, oldest submission first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = lock(&self.inner.jobs)
            .values()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    pub fn subscribe(&self, id: JobId) -> Option<watch::Receiver<JobState>> {
        lock(&self.inner.jobs)
            .get(&id)
            .map(|e| e.state_tx.subscribe())
    }

    /// Wait until a job reaches a terminal state
    pub async fn wait(&self, id: JobId) -> Option<Job> {
        let mut rx = self.subscribe(id)?;
        if rx.wait_for(|s| s.is_finished()).await.is_err() {
            warn!("job {id} vanished while waiting for it");
        }
        self.status(id)
    }

    /// Request cooperative cancellation
    pub fn cancel(&self, id: JobId) -> CancelOutcome {
        let jobs = lock(&self.inner.jobs);

        let Some(entry) = jobs.get(&id) else {
            return CancelOutcome::Unknown;
        };

        if entry.job.state.is_finished() {
            return CancelOutcome::TooLate;
        }

        let mut cancel = lock(&entry.cancel);
        match *cancel {
            CancelState::Committed => CancelOutcome::TooLate,
            CancelState::Open | CancelState::Requested => {
                *cancel = CancelState::Requested;
                info!("cancellation of job {id} requested");
                CancelOutcome::Accepted
            }
        }
    }

    /// Drop finished jobs from memory
    ///
    /// # Returns
    /// Number of removed jobs
    pub fn prune(&self) -> usize {
        let mut jobs = lock(&self.inner.jobs);
        let before = jobs.len();
        jobs.retain(|_, e| !e.job.state.is_finished());
        let pruned = before - jobs.len();
        debug!("pruned {pruned} finished jobs");
        pruned
    }

    /// Summaries of finished jobs, oldest first
    pub async fn history(&self) -> Result<Vec<JobSummary>> {
        let Some(store) = self.inner.history.clone() else {
            return Ok(vec![]);
        };

        let history: JobHistory =
            tokio::task::spawn_blocking(move || store.read_as(JOB_HISTORY_KEY)).await??;
        Ok(history.entries)
    }

    fn append_output(&self, id: JobId, line: String) {
        if let Some(entry) = lock(&self.inner.jobs).get_mut(&id) {
            entry.job.output.push(line);
        }
    }

    fn mark_running(&self, id: JobId) {
        if let Some(entry) = lock(&self.inner.jobs).get_mut(&id) {
            entry.job.state = JobState::Running;
            entry.job.started_at = Some(Utc::now());
            entry.state_tx.send_replace(JobState::Running);
        }
        debug!("job {id} running");
    }

    /// Record the outcome and release the job's groups
    ///
    /// The lease is only dropped together with the terminal state, so a
    /// group never admits a new job while its previous holder still reports
    /// `running`.
    async fn finish(&self, id: JobId, result: Result<()>, lease: GroupLease) {
        let (state, error) = match result {
            Ok(()) => (JobState::Succeeded, None),
            Err(e) if e.is::<Cancelled>() => (JobState::Cancelled, None),
            Err(e) => (JobState::Failed, Some(JobError::from_anyhow(&e))),
        };
        let ended_at = Utc::now();

        let Some(kind) = lock(&self.inner.jobs).get(&id).map(|e| e.job.kind) else {
            return;
        };

        match &error {
            Some(e) => warn!("job {id} ({kind}) failed: {}", e.message),
            None => info!("job {id} ({kind}) {state:?}"),
        }

        // the summary is on disk before observers learn about the terminal state
        self.record_history(JobSummary {
            id,
            kind,
            state,
            ended_at: Some(ended_at),
            error: error.clone(),
        })
        .await;

        let mut jobs = lock(&self.inner.jobs);
        if let Some(entry) = jobs.get_mut(&id) {
            entry.job.state = state;
            entry.job.ended_at = Some(ended_at);
            entry.job.error = error;
            drop(lease);
            entry.state_tx.send_replace(state);
        }
    }

    async fn record_history(&self, summary: JobSummary) {
        let Some(store) = self.inner.history.clone() else {
            return;
        };

        let appended = tokio::task::spawn_blocking(move || {
            store.update_as::<JobHistory, _, _>(JOB_HISTORY_KEY, |history| {
                history.entries.push(summary);
                let excess = history.entries.len().saturating_sub(JOB_HISTORY_LIMIT);
                history.entries.drain(..excess);
            })
        })
        .await;

        match appended {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("failed to record job history: {e:#}"),
            Err(e) => error!("job history task failed: {e:#}"),
        }
    }
}

/// Handle given to a job body
#[derive(Clone)]
pub struct JobContext {
    id: JobId,
    coordinator: JobCoordinator,
    cancel: Arc<Mutex<CancelState>>,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Append a line to the job output
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("job {}: {line}", self.id);
        self.coordinator.append_output(self.id, line);
    }

    /// Fail with `Cancelled` if cancellation was requested
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        match *lock(&self.cancel) {
            CancelState::Requested => Err(Cancelled),
            CancelState::Open | CancelState::Committed => Ok(()),
        }
    }

    /// Pass the point of no return; later cancel requests report `TooLate`
    pub fn commit(&self) -> Result<(), Cancelled> {
        let mut cancel = lock(&self.cancel);
        match *cancel {
            CancelState::Requested => Err(Cancelled),
            CancelState::Open | CancelState::Committed => {
                *cancel = CancelState::Committed;
                Ok(())
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn classify(e: &anyhow::Error) -> JobErrorKind {
    for cause in e.chain() {
        if let Some(e) = cause.downcast_ref::<CommandError>() {
            return match e {
                CommandError::Timeout { .. } => JobErrorKind::Timeout,
                CommandError::Failed { .. } | CommandError::Spawn { .. } => {
                    JobErrorKind::CommandFailed
                }
            };
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return match e {
                StoreError::Corrupt { .. } => JobErrorKind::Corrupt,
                StoreError::Busy { .. } => JobErrorKind::Busy,
                StoreError::Io { .. } | StoreError::InvalidKey(_) => JobErrorKind::Internal,
            };
        }
        if cause.is::<InvalidRequest>() {
            return JobErrorKind::InvalidRequest;
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return JobErrorKind::Timeout;
        }
    }

    JobErrorKind::Internal
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use tokio::sync::oneshot;

    async fn wait_state(coordinator: &JobCoordinator, id: JobId, state: JobState) {
        let mut rx = coordinator.subscribe(id).expect("job should exist");
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state should be reached")
            .expect("sender alive");
    }

    #[tokio::test]
    async fn test_same_group_is_rejected_while_running() {
        let coordinator = JobCoordinator::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let update = coordinator
            .submit(JobKind::Update, |_| async move {
                release_rx.await.ok();
                Ok(())
            })
            .expect("update should be accepted");

        let reboot = coordinator.submit(JobKind::Reboot, |_| async { Ok(()) });
        assert_eq!(
            reboot,
            Err(SubmitError::Busy {
                group: ExclusivityGroup::System
            })
        );

        release_tx.send(()).unwrap();
        let job = coordinator.wait(update).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);

        coordinator
            .submit(JobKind::Reboot, |_| async { Ok(()) })
            .expect("reboot should be accepted once the update finished");
    }

    #[tokio::test]
    async fn test_group_stays_claimed_until_job_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = AtomicStore::open(dir.path(), Duration::from_secs(10)).unwrap();
        let coordinator = JobCoordinator::with_history(store);

        // keep the history record locked through a second handle
        let other = AtomicStore::open(dir.path(), Duration::from_secs(10)).unwrap();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (unlock_tx, unlock_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            other
                .update(JOB_HISTORY_KEY, |record| {
                    locked_tx.send(()).unwrap();
                    unlock_rx.recv().ok();
                    record
                })
                .unwrap();
        });
        locked_rx.recv().unwrap();

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let scan = coordinator
            .submit(JobKind::ScanNetworks, |_| async move {
                done_tx.send(()).ok();
                Ok(())
            })
            .unwrap();
        done_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the body returned but the outcome is still being recorded
        assert_eq!(coordinator.status(scan).unwrap().state, JobState::Running);
        assert_eq!(
            coordinator.submit(JobKind::ConnectNetwork, |_| async { Ok(()) }),
            Err(SubmitError::Busy {
                group: ExclusivityGroup::Network
            })
        );

        unlock_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(
            coordinator.wait(scan).await.unwrap().state,
            JobState::Succeeded
        );

        let connect = coordinator
            .submit(JobKind::ConnectNetwork, |_| async { Ok(()) })
            .expect("network group must be free once the scan is terminal");
        coordinator.wait(connect).await.unwrap();
        assert_eq!(coordinator.history().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_admit_exactly_one() {
        let coordinator = JobCoordinator::new();
        let (release_tx, release_rx) = watch::channel(false);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = coordinator.clone();
                let mut release_rx = release_rx.clone();
                tokio::spawn(async move {
                    coordinator
                        .submit(JobKind::ScanNetworks, |_| async move {
                            release_rx.wait_for(|r| *r).await.ok();
                            Ok(())
                        })
                        .is_ok()
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        release_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_different_groups_run_concurrently() {
        let coordinator = JobCoordinator::new();
        let (release_tx, release_rx) = watch::channel(false);

        let mut ids = vec![];
        for kind in [JobKind::Update, JobKind::GenerateSshKey, JobKind::ScanNetworks] {
            let mut rx = release_rx.clone();
            ids.push(
                coordinator
                    .submit(kind, move |_| async move {
                        rx.wait_for(|r| *r).await.ok();
                        Ok(())
                    })
                    .expect("independent groups should be accepted"),
            );
        }

        for id in &ids {
            wait_state(&coordinator, *id, JobState::Running).await;
        }
        release_tx.send(true).unwrap();
        for id in ids {
            assert_eq!(
                coordinator.wait(id).await.unwrap().state,
                JobState::Succeeded
            );
        }
    }

    #[tokio::test]
    async fn test_reboot_also_blocks_network() {
        let coordinator = JobCoordinator::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        coordinator
            .submit(JobKind::Reboot, |_| async move {
                release_rx.await.ok();
                Ok(())
            })
            .unwrap();

        assert_eq!(
            coordinator
                .submit(JobKind::ConnectNetwork, |_| async { Ok(()) })
                .unwrap_err(),
            SubmitError::Busy {
                group: ExclusivityGroup::Network
            }
        );
        release_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_commit_is_accepted() {
        let coordinator = JobCoordinator::new();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let id = coordinator
            .submit(JobKind::Update, |ctx| async move {
                go_rx.await.ok();
                ctx.checkpoint()?;
                ctx.log("should not be reached");
                Ok(())
            })
            .unwrap();

        wait_state(&coordinator, id, JobState::Running).await;
        assert_eq!(coordinator.cancel(id), CancelOutcome::Accepted);
        go_tx.send(()).unwrap();

        let job = coordinator.wait(id).await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.output.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_commit_is_too_late() {
        let coordinator = JobCoordinator::new();
        let (committed_tx, committed_rx) = oneshot::channel::<()>();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let id = coordinator
            .submit(JobKind::Reboot, |ctx| async move {
                ctx.commit()?;
                committed_tx.send(()).ok();
                go_rx.await.ok();
                ctx.checkpoint()?;
                Ok(())
            })
            .unwrap();

        committed_rx.await.unwrap();
        assert_eq!(coordinator.cancel(id), CancelOutcome::TooLate);
        go_tx.send(()).unwrap();

        assert_eq!(
            coordinator.wait(id).await.unwrap().state,
            JobState::Succeeded
        );
        assert_eq!(coordinator.cancel(id), CancelOutcome::TooLate);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let coordinator = JobCoordinator::new();
        assert_eq!(coordinator.cancel(JobId::new()), CancelOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_panicking_job_fails_and_releases_group() {
        let coordinator = JobCoordinator::new();

        let id = coordinator
            .submit(JobKind::GenerateTlsCert, |_| async {
                let host: Option<&str> = None;
                host.expect("certificate tool exploded");
                Ok(())
            })
            .unwrap();

        let job = coordinator.wait(id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        let error = job.error.unwrap();
        assert_eq!(error.kind, JobErrorKind::Internal);
        assert!(error.message.contains("certificate tool exploded"));

        coordinator
            .submit(JobKind::GenerateSshKey, |_| async { Ok(()) })
            .expect("crypto group must be free again");
    }

    #[tokio::test]
    async fn test_output_is_visible_while_running() {
        let coordinator = JobCoordinator::new();
        let (logged_tx, logged_rx) = oneshot::channel::<()>();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let id = coordinator
            .submit(JobKind::Update, |ctx| async move {
                ctx.log("Updating 1a2b..3c4d");
                logged_tx.send(()).ok();
                go_rx.await.ok();
                ctx.log("Fast-forward");
                Ok(())
            })
            .unwrap();

        logged_rx.await.unwrap();
        let job = coordinator.status(id).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.output, ["Updating 1a2b..3c4d"]);

        go_tx.send(()).unwrap();
        let job = coordinator.wait(id).await.unwrap();
        assert_eq!(job.output, ["Updating 1a2b..3c4d", "Fast-forward"]);
    }

    #[tokio::test]
    async fn test_failed_job_carries_classified_error() {
        let coordinator = JobCoordinator::new();

        let id = coordinator
            .submit(JobKind::ScanNetworks, |_| async {
                Err(anyhow::Error::new(CommandError::Timeout {
                    command: "nmcli device wifi list".into(),
                    timeout: Duration::from_secs(10),
                }))
            })
            .unwrap();
        let error = coordinator.wait(id).await.unwrap().error.unwrap();
        assert_eq!(error.kind, JobErrorKind::Timeout);

        let id = coordinator
            .submit(JobKind::ScanNetworks, |_| async {
                bail!(InvalidRequest("ssid must not be empty".into()))
            })
            .unwrap();
        let error = coordinator.wait(id).await.unwrap().error.unwrap();
        assert_eq!(error.kind, JobErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_prune_keeps_running_jobs() {
        let coordinator = JobCoordinator::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let done = coordinator
            .submit(JobKind::GenerateSshKey, |_| async { Ok(()) })
            .unwrap();
        coordinator.wait(done).await;

        let running = coordinator
            .submit(JobKind::Update, |_| async move {
                release_rx.await.ok();
                Ok(())
            })
            .unwrap();

        assert_eq!(coordinator.prune(), 1);
        assert!(coordinator.status(done).is_none());
        assert!(coordinator.status(running).is_some());
        release_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_provisioning_lease_blocks_network_jobs() {
        let coordinator = JobCoordinator::new();

        let lease = coordinator
            .try_acquire(&[ExclusivityGroup::Network], Holder::Provisioning)
            .unwrap();
        assert!(
            coordinator
                .submit(JobKind::ScanNetworks, |_| async { Ok(()) })
                .is_err()
        );

        drop(lease);
        assert!(
            coordinator
                .submit(JobKind::ScanNetworks, |_| async { Ok(()) })
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_finished_jobs_are_recorded_in_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = AtomicStore::open(dir.path(), Duration::from_secs(1)).unwrap();
        let coordinator = JobCoordinator::with_history(store);

        for _ in 0..(JOB_HISTORY_LIMIT + 3) {
            let id = coordinator
                .submit(JobKind::ScanNetworks, |_| async { Ok(()) })
                .unwrap();
            coordinator.wait(id).await;
        }

        let failed = coordinator
            .submit(JobKind::Update, |_| async { bail!("remote hung up") })
            .unwrap();
        coordinator.wait(failed).await;

        let history = coordinator.history().await.unwrap();
        assert_eq!(history.len(), JOB_HISTORY_LIMIT);
        let last = history.last().unwrap();
        assert_eq!(last.id, failed);
        assert_eq!(last.state, JobState::Failed);
        assert!(last.error.as_ref().unwrap().message.contains("remote hung up"));
    }
}
