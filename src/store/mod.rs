//! Shared transactional store for the agent registry and job ledger.
//!
//! [`Store`] is the single owner of controller state. It is cheap to clone
//! and is passed explicitly to every component that needs it. Every
//! mutation runs as one transaction under the write lock, so concurrent
//! readers see either all of a transition or none of it.
//!
//! Lock acquisition is bounded by the configured timeout; a caller that
//! cannot get the lock in time receives the retryable
//! [`ControllerError::Timeout`].
//!
//! Snapshots are captured under the write lock and written to disk after
//! it is released. Each capture takes a sequence number and the writer
//! drops any capture older than the one already on disk.

pub mod snapshot;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{ControllerError, Result};
use crate::ledger::{Job, JobLedger, JobState};
use crate::registry::{Agent, AgentRegistry, AgentStatus};

pub use snapshot::{Snapshot, SnapshotFile};

/// Registry and ledger, always mutated together.
#[derive(Debug, Default, Clone)]
pub struct ControllerState {
    pub registry: AgentRegistry,
    pub ledger: JobLedger,
}

impl ControllerState {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            registry: AgentRegistry::new(),
            ledger: JobLedger::with_capacity(max_jobs),
        }
    }

    /// Make the registry and ledger agree after a restore.
    ///
    /// A job held by an agent that is missing or not active goes back to
    /// the queue. Every agent's outstanding set is rebuilt from the jobs
    /// that name it as holder. Returns the jobs put back in the queue.
    pub fn reconcile(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let held: Vec<(Uuid, Option<Uuid>)> = self
            .ledger
            .jobs()
            .filter(|j| matches!(j.state, JobState::Assigned | JobState::Running))
            .map(|j| (j.id, j.assigned_agent))
            .collect();

        let mut holding: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();
        let mut reclaimed = Vec::new();
        for (job_id, holder) in held {
            let active = holder
                .and_then(|id| self.registry.get(id).ok())
                .filter(|agent| agent.is_active())
                .map(|agent| agent.id);
            match active {
                Some(agent_id) => {
                    holding.entry(agent_id).or_default().insert(job_id);
                }
                None => match self.ledger.reclaim(job_id, now) {
                    Ok(()) => reclaimed.push(job_id),
                    Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Could not reclaim job"),
                },
            }
        }

        let repaired = self.registry.reset_outstanding(holding);
        if !reclaimed.is_empty() || repaired > 0 {
            tracing::warn!(
                reclaimed = reclaimed.len(),
                agents_repaired = repaired,
                "Reconciled restored state"
            );
        }
        reclaimed.sort();
        reclaimed
    }
}

/// Snapshot file plus the ordering of captures headed for it.
struct SnapshotWriter {
    file: SnapshotFile,
    /// Sequence of the newest capture, assigned under the state write lock.
    captured: AtomicU64,
    /// Sequence of the capture currently on disk.
    written: Mutex<u64>,
}

impl SnapshotWriter {
    fn new(file: SnapshotFile) -> Self {
        Self {
            file,
            captured: AtomicU64::new(0),
            written: Mutex::new(0),
        }
    }

    /// Must run while the state write lock is held.
    fn capture(&self, state: &ControllerState) -> Option<(u64, Snapshot)> {
        match Snapshot::capture(state) {
            Ok(snapshot) => Some((self.captured.fetch_add(1, Ordering::SeqCst) + 1, snapshot)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to capture snapshot");
                None
            }
        }
    }

    async fn write(&self, seq: u64, snapshot: Snapshot) {
        let mut written = self.written.lock().await;
        if seq <= *written {
            tracing::debug!(seq, written = *written, "Newer snapshot already on disk");
            return;
        }
        // In-memory state stays authoritative; a failed write is retried by the next commit.
        match self.file.save(&snapshot).await {
            Ok(()) => *written = seq,
            Err(e) => {
                tracing::error!(path = %self.file.path().display(), error = %e, "Failed to write snapshot")
            }
        }
    }
}

#[derive(Clone)]
pub struct Store {
    state: Arc<RwLock<ControllerState>>,
    lock_timeout: Duration,
    snapshot: Option<Arc<SnapshotWriter>>,
}

impl Store {
    /// A store that lives only in memory.
    pub fn in_memory(max_jobs: usize, lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(ControllerState::new(max_jobs))),
            lock_timeout,
            snapshot: None,
        }
    }

    /// A store backed by a snapshot file, restored from it when present.
    pub async fn open(path: impl Into<PathBuf>, max_jobs: usize, lock_timeout: Duration) -> Result<Self> {
        let file = SnapshotFile::new(path);
        let state = match file.load().await? {
            Some(snapshot) => snapshot.restore(max_jobs),
            None => {
                tracing::info!(path = %file.path().display(), "No snapshot found, starting empty");
                ControllerState::new(max_jobs)
            }
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            lock_timeout,
            snapshot: Some(Arc::new(SnapshotWriter::new(file))),
        })
    }

    pub async fn read(&self) -> Result<RwLockReadGuard<'_, ControllerState>> {
        tokio::time::timeout(self.lock_timeout, self.state.read())
            .await
            .map_err(|_| ControllerError::Timeout("store read lock"))
    }

    async fn write(&self) -> Result<RwLockWriteGuard<'_, ControllerState>> {
        tokio::time::timeout(self.lock_timeout, self.state.write())
            .await
            .map_err(|_| ControllerError::Timeout("store write lock"))
    }

    /// Run `f` as one transaction.
    ///
    /// `f` must validate before mutating: an `Err` from `f` is returned as-is
    /// and nothing is persisted. After a successful transaction the snapshot
    /// (if any) is captured under the lock and written once the lock is
    /// released, before this returns.
    pub async fn transact<T>(
        &self,
        f: impl FnOnce(&mut ControllerState) -> Result<T>,
    ) -> Result<T> {
        let (out, pending) = {
            let mut state = self.write().await?;
            let out = f(&mut *state)?;
            (out, self.capture(&state))
        };
        self.persist(pending).await;
        Ok(out)
    }

    /// Compare-and-swap on a job: run `f` only if the job is still at
    /// `expected_version`. Returns `None` when the job moved on meanwhile.
    pub async fn update_job_if_version<T>(
        &self,
        job_id: Uuid,
        expected_version: u64,
        f: impl FnOnce(&mut ControllerState) -> Result<T>,
    ) -> Result<Option<T>> {
        let (out, pending) = {
            let mut state = self.write().await?;
            let current = state.ledger.get(job_id)?.version;
            if current != expected_version {
                tracing::debug!(
                    job_id = %job_id,
                    expected_version,
                    current,
                    "Job changed since it was read, skipping update"
                );
                return Ok(None);
            }
            let out = f(&mut *state)?;
            (out, self.capture(&state))
        };
        self.persist(pending).await;
        Ok(Some(out))
    }

    fn capture(&self, state: &ControllerState) -> Option<(u64, Snapshot)> {
        self.snapshot.as_ref()?.capture(state)
    }

    async fn persist(&self, pending: Option<(u64, Snapshot)>) {
        if let (Some(writer), Some((seq, snapshot))) = (&self.snapshot, pending) {
            writer.write(seq, snapshot).await;
        }
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        Ok(self.read().await?.ledger.get(job_id)?.clone())
    }

    pub async fn get_agent(&self, agent_id: Uuid) -> Result<Agent> {
        Ok(self.read().await?.registry.get(agent_id)?.clone())
    }

    pub async fn jobs_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let guard = self.read().await?;
        Ok(guard
            .ledger
            .list(Some(state), 0, usize::MAX)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn agents_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>> {
        let guard = self.read().await?;
        Ok(guard.registry.with_status(status).into_iter().cloned().collect())
    }

    pub fn is_persistent(&self) -> bool {
        self.snapshot.is_some()
    }
}
