//! Durable file-backed job store.
//!
//! One JSON file per job under `<storage_root>/jobs/`, written atomically
//! (temp file + rename in the same directory) so a reader never observes a
//! partially-written record. The store is the durability boundary shared
//! across process restarts and across manager instances pointed at the
//! same storage root; the manager's in-memory queue is rebuilt from it at
//! startup.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::job::Job;

/// Persists and retrieves [`Job`] records from shared storage.
pub struct JobStore {
    jobs_dir: PathBuf,
}

impl JobStore {
    /// Open (and create if needed) the `jobs/` directory under `base_dir`.
    pub fn new(base_dir: &Path) -> Result<Self, StoreError> {
        let jobs_dir = base_dir.join("jobs");
        fs::create_dir_all(&jobs_dir)?;
        Ok(Self { jobs_dir })
    }

    /// Atomically write the full job record.
    ///
    /// Serializes to a `.tmp` sibling and renames over the final path, so
    /// concurrent readers (including other processes sharing the storage
    /// root) see either the old record or the new one, never a torn write.
    pub fn save(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.path_for(&job.id);
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(job)?;
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Load a record by id. `Ok(None)` when no record exists; a record
    /// that exists but fails to parse surfaces as [`StoreError::Corrupt`].
    pub fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let path = self.path_for(job_id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let job = serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
            id: job_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(job))
    }

    /// Remove a record. Idempotent: deleting an absent id succeeds.
    pub fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All valid records currently on disk, in lexicographic filename
    /// order. Corrupt or half-written files are skipped, not fatal.
    pub fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.jobs_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut jobs = Vec::with_capacity(paths.len());
        for path in paths {
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("skipping unreadable job record {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_slice::<Job>(&data) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!("skipping corrupt job record {}: {}", path.display(), e);
                }
            }
        }
        Ok(jobs)
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{job_id}.json"))
    }
}
