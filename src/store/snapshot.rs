//! JSON snapshot persistence for the controller state.
//!
//! Records are stored as individual JSON values so that one unreadable
//! record is skipped with a warning instead of failing the whole restore.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ControllerError, Result};
use crate::ledger::{IdempotencyRecord, Job, JobLedger};
use crate::registry::{Agent, AgentRegistry};
use crate::store::ControllerState;

const SNAPSHOT_FORMAT: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub format: u32,
    pub saved_at: DateTime<Utc>,
    pub assignment_seq: u64,
    pub agents: Vec<serde_json::Value>,
    pub jobs: Vec<serde_json::Value>,
    pub idempotency_keys: HashMap<String, IdempotencyRecord>,
}

impl Snapshot {
    pub fn capture(state: &ControllerState) -> Result<Self> {
        let agents = state
            .registry
            .agents()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let jobs = state
            .ledger
            .jobs()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            format: SNAPSHOT_FORMAT,
            saved_at: Utc::now(),
            assignment_seq: state.registry.assignment_seq(),
            agents,
            jobs,
            idempotency_keys: state.ledger.idempotency_keys().clone(),
        })
    }

    /// Rebuild controller state, skipping records that fail to parse and
    /// reconciling whatever references the skipped records leave dangling.
    pub fn restore(self, max_jobs: usize) -> ControllerState {
        let agents: Vec<Agent> = parse_records(self.agents, "agent");
        let jobs: Vec<Job> = parse_records(self.jobs, "job");
        tracing::info!(
            agents = agents.len(),
            jobs = jobs.len(),
            saved_at = %self.saved_at,
            "Restored controller state from snapshot"
        );

        let mut state = ControllerState {
            registry: AgentRegistry::restore(agents, self.assignment_seq),
            ledger: JobLedger::restore(jobs, self.idempotency_keys, max_jobs),
        };
        state.reconcile(Utc::now());
        state
    }

    /// Compact JSON encoding, as written to disk.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn parse_records<T: serde::de::DeserializeOwned>(
    records: Vec<serde_json::Value>,
    kind: &'static str,
) -> Vec<T> {
    records
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(kind, index, error = %e, "Skipping unreadable record in snapshot");
                None
            }
        })
        .collect()
}

/// Snapshot file on disk, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot if the file exists.
    pub async fn load(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            ControllerError::Persistence(format!("{}: {}", self.path.display(), e))
        })?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(ControllerError::Persistence(format!(
                "unsupported snapshot format {} in {}",
                snapshot.format,
                self.path.display()
            )));
        }
        Ok(Some(snapshot))
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.write_bytes(&snapshot.to_bytes()?).await
    }

    /// Write to a sibling temp file, then rename over the previous snapshot.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
