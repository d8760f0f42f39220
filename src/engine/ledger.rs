use std::collections::BTreeSet;

use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{OVERDUE_MARKED_TOTAL, SWEEP_DURATION_SECONDS};

use super::conflict::now_ms;
use super::lifecycle::{check_transition, rows_in};
use super::{Engine, EngineError, Txn};

/// What one overdue sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub overdue_rows: Vec<Ulid>,
    pub overdue_requests: Vec<Ulid>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.overdue_rows.is_empty() && self.overdue_requests.is_empty()
    }
}

struct Candidate {
    borrowed_id: Ulid,
    asset_id: Ulid,
    request_id: Ulid,
    version: u64,
}

fn check_return_time(at: Ms) -> Result<Ms, EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&at) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(at)
}

impl Engine {
    /// Return one ledger row. Closes an IN_USE/OVERDUE request when it was
    /// the last active row.
    pub async fn mark_returned(
        &self,
        borrowed_id: Ulid,
        returned_at: Option<Ms>,
    ) -> Result<BorrowInterval, EngineError> {
        let at = check_return_time(returned_at.unwrap_or_else(now_ms))?;
        let asset_id = self
            .asset_for_borrow(&borrowed_id)
            .ok_or(EngineError::NotFound(borrowed_id))?;
        let request_id = {
            let asset = self
                .get_asset(&asset_id)
                .ok_or(EngineError::NotFound(asset_id))?;
            let guard = asset.read().await;
            guard
                .index
                .get(borrowed_id)
                .map(|row| row.request_id)
                .ok_or(EngineError::NotFound(borrowed_id))?
        };

        let guard = self.lock_request(request_id).await?;
        let bound = guard.bound_units();
        let mut txn = Txn::with_request(guard);
        txn.assets = self
            .lock_assets(bound.iter().map(|u| u.asset_id).chain([asset_id]))
            .await?;

        let status = txn
            .assets
            .get(&asset_id)
            .and_then(|a| a.index.get(borrowed_id))
            .map(|row| row.status)
            .ok_or(EngineError::NotFound(borrowed_id))?;
        if !status.is_active() {
            return Err(EngineError::validation(format!(
                "borrowed asset {borrowed_id} is {}",
                status.as_str()
            )));
        }

        let others_active = rows_in(&txn, &bound, |s| s.is_active())
            .iter()
            .any(|u| u.borrowed_id != borrowed_id);
        // An uncollected (AM_APPROVED) request keeps its status.
        let request_status = match txn.request.as_ref().map(|r| r.status) {
            Some(from)
                if !others_active
                    && check_transition(from, RequestStatus::Returned).is_ok() =>
            {
                Some(RequestStatus::Returned)
            }
            _ => None,
        };

        let event = Event::BorrowReturned {
            id: borrowed_id,
            asset_id,
            request_id,
            at,
            request_status,
        };
        self.persist_and_apply(&mut txn, event).await?;
        if request_status.is_some() {
            tracing::info!("request {request_id}: last unit back, now RETURNED");
        }

        txn.assets
            .get(&asset_id)
            .and_then(|a| a.index.get(borrowed_id))
            .cloned()
            .ok_or(EngineError::NotFound(borrowed_id))
    }

    /// Return every active row of a request in one commit.
    pub async fn return_request(
        &self,
        request_id: Ulid,
        returned_at: Option<Ms>,
    ) -> Result<Vec<BoundUnit>, EngineError> {
        let at = check_return_time(returned_at.unwrap_or_else(now_ms))?;
        let guard = self.lock_request(request_id).await?;
        let from = guard.status;
        check_transition(from, RequestStatus::Returned).inspect_err(|_| {
            tracing::warn!("request {request_id}: cannot return from {from}");
        })?;
        let units = self.return_locked(guard, at).await?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => "RETURNED")
            .increment(1);
        Ok(units)
    }

    pub(super) async fn return_locked(
        &self,
        guard: OwnedRwLockWriteGuard<RequestState>,
        at: Ms,
    ) -> Result<Vec<BoundUnit>, EngineError> {
        let bound = guard.bound_units();
        let (id, from) = (guard.id, guard.status);
        let mut txn = Txn::with_request(guard);
        txn.assets = self.lock_assets(bound.iter().map(|u| u.asset_id)).await?;
        let active = rows_in(&txn, &bound, |s| s.is_active());
        let event = Event::RequestTransitioned {
            id,
            from,
            to: RequestStatus::Returned,
            actor_id: None,
            reason: None,
            at,
            units: active.clone(),
        };
        self.persist_and_apply(&mut txn, event).await?;
        Ok(active)
    }

    /// Mark every BORROWED/IN_USE row whose end has passed as OVERDUE, then
    /// move IN_USE requests holding an overdue row to OVERDUE.
    ///
    /// Candidates come from read snapshots; each row is then updated under
    /// its own asset lock after a version check. At most one lock is held at
    /// any time. Running it twice with the same `now` changes nothing the
    /// second time.
    pub async fn sweep_overdue(&self, now: Ms) -> Result<SweepOutcome, EngineError> {
        let started = std::time::Instant::now();
        let (candidates, mut requests) = self.collect_overdue(now).await;

        let mut outcome = SweepOutcome::default();
        for c in candidates {
            let Some(asset) = self.get_asset(&c.asset_id) else {
                continue;
            };
            let guard = asset.write_owned().await;
            let still_due = match guard.index.get(c.borrowed_id) {
                Some(row) if row.version == c.version => true,
                Some(row) => {
                    tracing::debug!(
                        "borrow {}: version moved {} -> {}, re-checking",
                        c.borrowed_id,
                        c.version,
                        row.version
                    );
                    matches!(row.status, BorrowStatus::Borrowed | BorrowStatus::InUse)
                        && row.span.end < now
                }
                None => false,
            };
            if !still_due {
                continue;
            }
            let mut txn = Txn::default();
            txn.assets.insert(c.asset_id, guard);
            self.persist_and_apply(
                &mut txn,
                Event::BorrowOverdue {
                    id: c.borrowed_id,
                    asset_id: c.asset_id,
                    request_id: c.request_id,
                },
            )
            .await?;
            metrics::counter!(OVERDUE_MARKED_TOTAL, "kind" => "borrow").increment(1);
            outcome.overdue_rows.push(c.borrowed_id);
            requests.insert(c.request_id);
        }

        for request_id in requests {
            let Ok(guard) = self.lock_request(request_id).await else {
                continue;
            };
            if guard.status != RequestStatus::InUse {
                continue;
            }
            let mut txn = Txn::with_request(guard);
            self.commit_transition(&mut txn, RequestStatus::Overdue, None, None, Vec::new())
                .await?;
            metrics::counter!(OVERDUE_MARKED_TOTAL, "kind" => "request").increment(1);
            outcome.overdue_requests.push(request_id);
        }

        metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if !outcome.is_empty() {
            tracing::info!(
                "overdue sweep: {} rows, {} requests",
                outcome.overdue_rows.len(),
                outcome.overdue_requests.len()
            );
        }
        Ok(outcome)
    }

    /// Snapshot pass: rows due for OVERDUE, plus requests that already hold
    /// an overdue row.
    async fn collect_overdue(&self, now: Ms) -> (Vec<Candidate>, BTreeSet<Ulid>) {
        let assets: Vec<_> = self.assets.iter().map(|e| e.value().clone()).collect();
        let mut candidates = Vec::new();
        let mut requests = BTreeSet::new();
        for asset in assets {
            let guard = asset.read().await;
            for row in guard.index.overdue_candidates(now) {
                candidates.push(Candidate {
                    borrowed_id: row.id,
                    asset_id: row.asset_id,
                    request_id: row.request_id,
                    version: row.version,
                });
            }
            requests.extend(
                guard
                    .index
                    .active()
                    .filter(|row| row.status == BorrowStatus::Overdue)
                    .map(|row| row.request_id),
            );
        }
        (candidates, requests)
    }
}
