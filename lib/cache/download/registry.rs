//! Process-wide registry mapping cached objects to their download jobs.

use std::path::PathBuf;
use std::sync::Arc;

use scc::HashMap as ConcurrentHashMap;
use tracing::debug;

use crate::cache::download::job::{DownloadEnv, DownloadJob};
use crate::cache::file_info::CacheKey;
use crate::store::{Bucket, ObjectRecord, ObjectStore};

/// The shared job map. Jobs hold a `Weak` back-reference so they can sweep
/// their own entry when they terminate naturally.
pub(crate) struct JobTable<S: ObjectStore> {
    jobs: ConcurrentHashMap<String, Arc<DownloadJob<S>>>,
}

impl<S: ObjectStore> JobTable<S> {
    fn new() -> Self {
        Self {
            jobs: ConcurrentHashMap::new(),
        }
    }

    /// Remove `key` only while it still maps to this exact job, so a
    /// successor job under the same key is never swept by its predecessor.
    pub(crate) fn remove_exact(&self, key: &str, job: &Arc<DownloadJob<S>>) {
        let _ = self
            .jobs
            .remove_if(key, |current| Arc::ptr_eq(current, job));
    }
}

/// Registry of download jobs, bounded by the shared download semaphore.
pub struct JobRegistry<S: ObjectStore> {
    table: Arc<JobTable<S>>,
    env: Arc<DownloadEnv<S>>,
}

impl<S: ObjectStore> JobRegistry<S> {
    pub(crate) fn new(env: Arc<DownloadEnv<S>>) -> Self {
        Self {
            table: Arc::new(JobTable::new()),
            env,
        }
    }

    /// Return the job for `key`, constructing one if none exists. A job
    /// created past the download concurrency bound is still returned; its
    /// task queues on the shared semaphore once started.
    pub async fn create_if_not_exists(
        &self,
        bucket: &Bucket,
        object: &ObjectRecord,
        key: &CacheKey,
        dest: PathBuf,
    ) -> Arc<DownloadJob<S>> {
        use scc::hash_map::Entry;

        match self.table.jobs.entry_async(key.as_str().to_owned()).await {
            Entry::Occupied(occ) => Arc::clone(occ.get()),
            Entry::Vacant(vac) => {
                debug!(key = %key, generation = object.generation, "creating download job");
                let job = DownloadJob::new(
                    Arc::clone(&self.env),
                    bucket.clone(),
                    object.clone(),
                    key.clone(),
                    dest,
                    Arc::downgrade(&self.table),
                );
                let _ = vac.insert_entry(Arc::clone(&job));
                job
            }
        }
    }

    /// Look up the job for `key`, without side effects.
    pub async fn get(&self, key: &str) -> Option<Arc<DownloadJob<S>>> {
        self.table
            .jobs
            .read_async(key, |_, job| Arc::clone(job))
            .await
    }

    /// Invalidate the job for `key` (if any) and sweep its entry.
    ///
    /// The job is fetched first and invalidated outside the map shard: the
    /// invalidation joins the download task, and both the task's own
    /// termination path and the sweep below re-enter the map.
    pub async fn invalidate_and_remove(&self, key: &str) {
        let Some(job) = self.get(key).await else {
            return;
        };
        job.invalidate().await;
        self.table.remove_exact(key, &job);
    }

    /// Invalidate every job. Used at process shutdown.
    pub async fn destroy(&self) {
        // Closing the semaphore unblocks tasks still queued for a permit.
        self.env.permits.close();

        let mut jobs = Vec::new();
        self.table.jobs.scan(|key, job| {
            jobs.push((key.clone(), Arc::clone(job)));
        });
        for (key, job) in jobs {
            job.invalidate().await;
            self.table.remove_exact(&key, &job);
        }
    }
}
