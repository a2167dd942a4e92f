use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    branch::BranchId, credentials::CredentialStore, supervisor::ConnectionSupervisor,
};

/// Reconnect every branch with persisted credentials.
///
/// Each branch is brought up on its own task; the call returns as soon as
/// they are scheduled. Outcomes and failures are only logged.
pub fn recover_all(
    supervisor: &Arc<ConnectionSupervisor>,
    store: &CredentialStore,
) -> Vec<BranchId> {
    let branches = match store.list() {
        Ok(branches) => branches,
        Err(e) => {
            warn!(root = %store.root().display(), error = %e, "cannot scan persisted sessions");
            return Vec::new();
        },
    };

    for branch in &branches {
        let supervisor = Arc::clone(supervisor);
        let branch = branch.clone();
        tokio::spawn(async move {
            match supervisor.ensure_connection(&branch).await {
                Ok(outcome) => info!(branch = %branch, ?outcome, "recovered session"),
                Err(e) => warn!(branch = %branch, error = %e, "session recovery failed"),
            }
        });
    }

    info!(count = branches.len(), "session recovery scheduled");
    branches
}
