use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::error::StateError;
use crate::scale::{ae_scale, random_stagger};
use crate::state::LocalState;

/// Base stagger after a catalog server comes back
const SYNC_STAGGER_INTV: Duration = Duration::from_secs(3);

/// Retry interval for a failed full sync
const SYNC_RETRY_INTV: Duration = Duration::from_secs(15);

impl LocalState {
    /// Long running anti-entropy loop between local state and the catalog.
    ///
    /// Runs a full sync (retrying until it succeeds), then pushes local
    /// changes as they are signalled until the scaled full-sync interval
    /// elapses, and starts over. Returns once `shutdown` is cancelled.
    pub async fn anti_entropy(&self, shutdown: CancellationToken) {
        'full_sync: loop {
            while let Err(e) = self.run_pass(LocalState::set_sync_state).await {
                tracing::error!("failed to sync remote state: {}", e);

                let members = self.inner.delegate.lan_members();
                let retry = SYNC_RETRY_INTV
                    .saturating_add(random_stagger(ae_scale(SYNC_RETRY_INTV, members)));
                tokio::select! {
                    _ = self.inner.server_up.notified() => {
                        // spread out the herd of agents reacting to the same leader
                        let stagger = random_stagger(ae_scale(SYNC_STAGGER_INTV, members));
                        tokio::select! {
                            _ = tokio::time::sleep(stagger) => {}
                            _ = shutdown.cancelled() => return,
                        }
                    }
                    _ = tokio::time::sleep(retry) => {}
                    _ = shutdown.cancelled() => return,
                }
            }

            // the diff may have found work even if nothing changed locally
            self.inner.change_made();

            let members = self.inner.delegate.lan_members();
            let interval = ae_scale(self.inner.config.ae_interval, members);
            let next_full_sync = tokio::time::sleep(interval.saturating_add(random_stagger(interval)));
            tokio::pin!(next_full_sync);

            loop {
                tokio::select! {
                    _ = &mut next_full_sync => continue 'full_sync,
                    _ = self.inner.trigger.notified() => {
                        if self.is_paused() {
                            continue;
                        }
                        if let Err(e) = self.run_pass(LocalState::sync_changes).await {
                            tracing::error!("failed to sync changes: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("Anti-entropy shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Runs a blocking diff or push pass off the async workers.
    async fn run_pass(&self, pass: fn(&LocalState) -> Result<(), StateError>) -> Result<(), StateError> {
        let state = self.clone();
        tokio::task::spawn_blocking(move || pass(&state)).await?
    }
}
