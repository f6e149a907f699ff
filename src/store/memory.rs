//! In-memory job store for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{Job, MovieAsset};

use super::{JobStore, StoreError};

/// In-memory `JobStore` implementation.
///
/// Used by sequencer and movie tests so they need neither a database nor
/// the external binaries. `set_fail_saves` makes every write fail, which
/// is how the critical/best-effort write policies are exercised.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    assets: Mutex<HashMap<(Uuid, String), MovieAsset>>,
    fail_saves: AtomicBool,
}

impl MemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every write operation returns an error.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            Err(StoreError::ConnectionFailed(
                "simulated write failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Inserts a job directly, bypassing the failure toggle.
    pub async fn seed_job(&self, job: Job) {
        self.jobs.lock().await.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.check_writable()?;
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn upsert_movie_asset(&self, job_id: Uuid, asset: &MovieAsset) -> Result<(), StoreError> {
        self.check_writable()?;
        self.assets
            .lock()
            .await
            .insert((job_id, asset.label.clone()), asset.clone());
        Ok(())
    }

    async fn find_movie_asset(
        &self,
        job_id: Uuid,
        label: &str,
    ) -> Result<Option<MovieAsset>, StoreError> {
        Ok(self
            .assets
            .lock()
            .await
            .get(&(job_id, label.to_string()))
            .cloned())
    }

    async fn list_movie_assets(&self, job_id: Uuid) -> Result<Vec<MovieAsset>, StoreError> {
        let assets = self.assets.lock().await;
        let mut matching: Vec<MovieAsset> = assets
            .iter()
            .filter(|((id, _), _)| *id == job_id)
            .map(|(_, asset)| asset.clone())
            .collect();
        matching.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(matching)
    }
}
