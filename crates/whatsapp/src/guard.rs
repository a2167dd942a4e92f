use std::{future::Future, sync::Arc};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    futures::future::{BoxFuture, FutureExt, Shared},
    tracing::debug,
};

use crate::{
    branch::BranchId,
    error::{Error, Result},
};

type Attempt<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Deduplicates concurrent initializations per branch.
///
/// The first caller spawns the attempt; later callers attach to the same
/// shared future. Attempts run on their own task, so dropping a caller never
/// cancels one, and the entry is removed once the attempt resolves.
pub struct InitializationGuard<T> {
    inflight: Arc<DashMap<BranchId, Attempt<T>>>,
}

impl<T> Default for InitializationGuard<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }
}

impl<T> InitializationGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight attempt for `branch`, or start one with `start`.
    pub async fn run<F>(&self, branch: &BranchId, start: impl FnOnce() -> F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let attempt = match self.inflight.entry(branch.clone()) {
            Entry::Occupied(e) => {
                debug!(branch = %branch, "joining in-flight initialization");
                e.get().clone()
            },
            Entry::Vacant(v) => {
                let inflight = Arc::clone(&self.inflight);
                let key = branch.clone();
                let work = start();
                let task = tokio::spawn(async move {
                    let out = work.await;
                    inflight.remove(&key);
                    out
                });

                let aborted = branch.clone();
                let shared = async move {
                    task.await
                        .unwrap_or_else(|_| Err(Error::InitAborted(aborted)))
                }
                .boxed()
                .shared();
                v.insert(shared.clone());
                shared
            },
        };
        attempt.await
    }

    pub fn in_flight(&self, branch: &BranchId) -> bool {
        self.inflight.contains_key(branch)
    }

    /// Wait for the in-flight attempt for `branch`, if any, to resolve.
    pub async fn settled(&self, branch: &BranchId) {
        let attempt = self.inflight.get(branch).map(|a| a.clone());
        if let Some(attempt) = attempt {
            let _ = attempt.await;
        }
    }
}
