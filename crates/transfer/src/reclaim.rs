use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::session::SessionState;
use crate::{TransferEngine, TransferError};

/// Outcome of one reclamation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Stalled transfers saved as partial artifacts.
    pub persisted: Vec<String>,
    /// Stalled transfers dropped with their fragments.
    pub discarded: Vec<String>,
    /// Finished or persisted transfers dropped from memory. Their artifacts
    /// stay on disk and are restored on demand.
    pub evicted: Vec<String>,
    /// Transfers the sweep could not handle, with the error.
    pub failed: Vec<(String, String)>,
    /// Orphaned staging files removed.
    pub staging_removed: usize,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.persisted.is_empty()
            && self.discarded.is_empty()
            && self.evicted.is_empty()
            && self.failed.is_empty()
            && self.staging_removed == 0
    }
}

/// What the sweep decided for one session.
enum Verdict {
    Keep,
    Persist,
    Discard,
    Evict,
}

impl TransferEngine {
    /// Reclaims storage held by stalled transfers, judged against the
    /// current time.
    pub async fn trigger_reclamation(&self) -> ReclaimReport {
        self.reclaim_at(Utc::now()).await
    }

    /// Reclaims storage held by transfers with no activity within the
    /// staleness window before `now`.
    ///
    /// A stalled transfer with a known size and held bytes is persisted as a
    /// partial artifact; any other stalled transfer is discarded. Persisted
    /// records, and complete ones idle past the window, are evicted from
    /// memory while their files stay. Staging files older than the window
    /// are removed first, before any transfer lock is taken.
    pub async fn reclaim_at(&self, now: DateTime<Utc>) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        let Some(cutoff) = TimeDelta::from_std(self.config.staleness_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return report;
        };

        report.staging_removed = self.store.remove_stale_staging(cutoff).await;

        for id in self.registry.ids().await {
            match self.reclaim_one(&id, cutoff, now).await {
                Ok(Verdict::Keep) => {}
                Ok(Verdict::Persist) => report.persisted.push(id),
                Ok(Verdict::Discard) => report.discarded.push(id),
                Ok(Verdict::Evict) => report.evicted.push(id),
                Err(e) => {
                    warn!(transfer_id = %id, "reclamation failed: {e}");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if !report.is_empty() {
            info!(
                persisted = report.persisted.len(),
                discarded = report.discarded.len(),
                evicted = report.evicted.len(),
                staging_removed = report.staging_removed,
                failed = report.failed.len(),
                "reclamation sweep finished"
            );
        }
        report
    }

    async fn reclaim_one(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Verdict, TransferError> {
        let Some((handle, mut slot)) = self.registry.lock(id).await else {
            return Ok(Verdict::Keep);
        };

        let verdict = match &slot.state {
            Some(SessionState::Receiving(session)) if session.is_stale(cutoff) => {
                if session.total_size.is_some() && !session.fragments.is_empty() {
                    Verdict::Persist
                } else {
                    Verdict::Discard
                }
            }
            Some(SessionState::Receiving(_)) => Verdict::Keep,
            Some(SessionState::Complete(done)) if done.last_activity <= cutoff => Verdict::Evict,
            Some(SessionState::Complete(_)) => Verdict::Keep,
            Some(SessionState::PersistedIncomplete(_)) => Verdict::Evict,
            None => {
                // Left behind by a refused first chunk.
                self.registry.retire(id, &handle, &mut slot).await;
                return Ok(Verdict::Keep);
            }
        };

        match verdict {
            Verdict::Keep => {}
            Verdict::Persist => {
                self.persist_partial_locked(id, &mut slot, now).await?;
                self.registry.retire(id, &handle, &mut slot).await;
            }
            Verdict::Discard => {
                if let Some(SessionState::Receiving(session)) = &slot.state {
                    for path in session.fragment_paths() {
                        self.store.remove_blob(&path).await;
                    }
                }
                self.registry.retire(id, &handle, &mut slot).await;
                debug!(transfer_id = %id, "stalled transfer discarded");
            }
            Verdict::Evict => {
                self.registry.retire(id, &handle, &mut slot).await;
                debug!(transfer_id = %id, "transfer record evicted");
            }
        }
        Ok(verdict)
    }
}
