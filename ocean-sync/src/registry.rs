//! Run Registry: at most one active resync per integration.
//!
//! Registering a run cancels whatever run was active for the same
//! integration. A finishing run clears its entry only if it still owns it,
//! so a superseded run can never unregister its successor.

use ocean_types::{IntegrationId, RunId};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
struct ActiveRun {
    run_id: RunId,
    token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct RunRegistry {
    active: Mutex<HashMap<IntegrationId, ActiveRun>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IntegrationId, ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `run_id` the active run and returns its cancellation token.
    /// The previously active run, if any, is cancelled and its id returned.
    pub fn register(&self, integration: &IntegrationId, run_id: RunId) -> (CancellationToken, Option<RunId>) {
        let token = CancellationToken::new();
        let previous = self.lock().insert(
            integration.clone(),
            ActiveRun {
                run_id,
                token: token.clone(),
            },
        );

        let superseded = previous.map(|prev| {
            prev.token.cancel();
            info!(
                integration = %integration,
                cancelled = %prev.run_id,
                run_id = %run_id,
                "superseding active resync"
            );
            prev.run_id
        });
        (token, superseded)
    }

    /// Registers `run_id` only if no run is active. Returns its token on
    /// success.
    pub fn try_become_active(&self, integration: &IntegrationId, run_id: RunId) -> Option<CancellationToken> {
        let mut active = self.lock();
        if active.contains_key(integration) {
            return None;
        }
        let token = CancellationToken::new();
        active.insert(
            integration.clone(),
            ActiveRun {
                run_id,
                token: token.clone(),
            },
        );
        Some(token)
    }

    /// Cancels the active run of `integration`, returning its id.
    pub fn cancel_if_active(&self, integration: &IntegrationId) -> Option<RunId> {
        let run = self.lock().remove(integration)?;
        run.token.cancel();
        Some(run.run_id)
    }

    /// Clears the entry of `integration` if `run_id` still owns it.
    pub fn complete(&self, integration: &IntegrationId, run_id: RunId) -> bool {
        let mut active = self.lock();
        match active.get(integration) {
            Some(run) if run.run_id == run_id => {
                active.remove(integration);
                true
            }
            _ => false,
        }
    }

    pub fn active_run(&self, integration: &IntegrationId) -> Option<RunId> {
        self.lock().get(integration).map(|run| run.run_id)
    }

    pub fn is_active(&self, integration: &IntegrationId, run_id: RunId) -> bool {
        self.active_run(integration) == Some(run_id)
    }
}
