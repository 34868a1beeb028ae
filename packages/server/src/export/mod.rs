//! Archive exports: spooled background jobs and synchronous quick streams.

pub mod archive;
pub mod filter;
pub mod jobs;
pub mod quick;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

pub use filter::ExportFilter;

/// Wakes idle export workers and holds the cancel tokens of running jobs.
#[derive(Default)]
pub struct ExportControl {
    running: DashMap<String, CancellationToken>,
    wake: Notify,
    /// Held by a worker while it claims a job.
    claim: Mutex<()>,
}

impl ExportControl {
    pub(crate) async fn claim_guard(&self) -> MutexGuard<'_, ()> {
        self.claim.lock().await
    }

    /// Tell a waiting worker that a job was queued.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    pub(crate) fn register(&self, job_id: &str, token: CancellationToken) {
        self.running.insert(job_id.to_string(), token);
    }

    pub(crate) fn unregister(&self, job_id: &str) {
        self.running.remove(job_id);
    }

    /// Signal a running job. Returns `false` if no worker is processing it.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.running.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
