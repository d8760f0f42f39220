use std::collections::{BTreeMap, HashMap, HashSet};

use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ALLOCATIONS_TOTAL, CONFLICTS_TOTAL};

use super::availability::{resolve_category, UnitView};
use super::conflict::check_unit_free;
use super::{Engine, EngineError, Txn};

fn record_conflict(err: &EngineError) {
    if matches!(err, EngineError::Conflict(_) | EngineError::AssetUnavailable(_)) {
        metrics::counter!(CONFLICTS_TOTAL).increment(1);
    }
}

impl Engine {
    /// Bind caller-chosen units to a request, one `(category, units)` line at
    /// a time.
    ///
    /// A line shorter than the category's open demand is skipped and reported;
    /// every other line commits together in one event. Any unit failing the
    /// re-check under lock fails the whole call with `Conflict`. The request
    /// moves to AM_APPROVED once every category is fully bound.
    pub async fn allocate(
        &self,
        request_id: Ulid,
        lines: Vec<(Ulid, Vec<Ulid>)>,
    ) -> Result<AllocationOutcome, EngineError> {
        let guard = self.lock_request(request_id).await?;
        if guard.status != RequestStatus::PendingAm {
            let from = guard.status;
            tracing::warn!("request {request_id}: allocation attempted in {from}");
            return Err(EngineError::IllegalTransition {
                from,
                to: RequestStatus::AmApproved,
            });
        }
        let specific = match guard.kind {
            RequestKind::Specific { asset_id } => Some(asset_id),
            RequestKind::Categories(_) => None,
        };
        let result = match specific {
            Some(asset_id) => match lines.as_slice() {
                [(category_id, units)] if units.as_slice() == [asset_id] => {
                    match self.category_of(asset_id).await {
                        Some(actual) if actual == *category_id => {
                            self.commit_specific(guard, None).await
                        }
                        _ => Err(EngineError::validation(format!(
                            "asset {asset_id} is not in category {category_id}"
                        ))),
                    }
                }
                _ => Err(EngineError::validation(format!(
                    "request is for asset {asset_id} only"
                ))),
            },
            None => self.commit_lines(guard, lines).await,
        };
        match &result {
            Ok(outcome) => {
                let label = if outcome.is_partial() { "partial" } else { "success" };
                metrics::counter!(ALLOCATIONS_TOTAL, "outcome" => label).increment(1);
            }
            Err(e) => {
                record_conflict(e);
                metrics::counter!(ALLOCATIONS_TOTAL, "outcome" => e.kind()).increment(1);
            }
        }
        result
    }

    /// Manager approval of a request in PENDING_AM. The unit choice is
    /// re-resolved here, under the committer's locks.
    pub(super) async fn approve_locked(
        &self,
        guard: OwnedRwLockWriteGuard<RequestState>,
        approver: Option<Ulid>,
    ) -> Result<AllocationOutcome, EngineError> {
        let result = if guard.kind.is_specific() {
            self.commit_specific(guard, approver)
                .await
                .map_err(|e| match e {
                    EngineError::Conflict(id) => EngineError::AssetUnavailable(id),
                    other => other,
                })
        } else {
            self.commit_resolved(guard, approver).await
        };
        if let Err(e) = &result {
            record_conflict(e);
        }
        result
    }

    async fn commit_specific(
        &self,
        guard: OwnedRwLockWriteGuard<RequestState>,
        approver: Option<Ulid>,
    ) -> Result<AllocationOutcome, EngineError> {
        let RequestKind::Specific { asset_id } = guard.kind else {
            return Err(EngineError::validation("not a specific-asset request"));
        };
        let span = guard.span;
        let mut txn = Txn::with_request(guard);
        txn.assets = self.lock_assets([asset_id]).await?;
        let asset = txn
            .assets
            .get(&asset_id)
            .ok_or(EngineError::NotFound(asset_id))?;
        check_unit_free(asset, &span)?;

        let line = AllocationLine {
            category_id: asset.category_id,
            units: vec![BoundUnit {
                borrowed_id: Ulid::new(),
                asset_id,
            }],
        };
        self.commit_allocation(&mut txn, vec![line], Vec::new(), RequestStatus::AmApproved, approver)
            .await
    }

    /// A unit's category never changes, so a read snapshot is enough.
    async fn category_of(&self, asset_id: Ulid) -> Option<Ulid> {
        let asset = self.get_asset(&asset_id)?;
        let category_id = asset.read().await.category_id;
        Some(category_id)
    }

    /// Category approval: every open category must be satisfiable right now
    /// or nothing is bound.
    async fn commit_resolved(
        &self,
        guard: OwnedRwLockWriteGuard<RequestState>,
        approver: Option<Ulid>,
    ) -> Result<AllocationOutcome, EngineError> {
        let open: Vec<CategoryDemand> = guard
            .open_demand()
            .into_iter()
            .filter(|d| d.quantity > 0)
            .collect();
        let span = guard.span;

        let mut members: Vec<(CategoryDemand, String, Vec<Ulid>)> = Vec::with_capacity(open.len());
        let mut total = 0usize;
        for demand in open {
            let (name, units) = self.category_snapshot(&demand.category_id)?;
            total += units.len();
            members.push((demand, name, units));
        }
        if total > MAX_ALLOCATION_UNITS {
            return Err(EngineError::LimitExceeded("too many units to lock"));
        }

        let mut txn = Txn::with_request(guard);
        txn.assets = self
            .lock_assets(members.iter().flat_map(|(_, _, units)| units.iter().copied()))
            .await?;

        let mut lines = Vec::with_capacity(members.len());
        for (demand, name, units) in &members {
            let views: Vec<UnitView> = units
                .iter()
                .filter_map(|id| txn.assets.get(id))
                .map(|a| UnitView::of(a, &span))
                .collect();
            let (resolved, _) = resolve_category(demand.category_id, name, &views, demand.quantity);
            if resolved.shortage > 0 {
                return Err(EngineError::QuantityNotMet {
                    category_id: demand.category_id,
                    required: demand.quantity,
                    selected: resolved.available_now,
                });
            }
            lines.push(AllocationLine {
                category_id: demand.category_id,
                units: resolved
                    .selected
                    .into_iter()
                    .map(|asset_id| BoundUnit {
                        borrowed_id: Ulid::new(),
                        asset_id,
                    })
                    .collect(),
            });
        }
        self.commit_allocation(&mut txn, lines, Vec::new(), RequestStatus::AmApproved, approver)
            .await
    }

    async fn commit_lines(
        &self,
        guard: OwnedRwLockWriteGuard<RequestState>,
        lines: Vec<(Ulid, Vec<Ulid>)>,
    ) -> Result<AllocationOutcome, EngineError> {
        if lines.is_empty() {
            return Err(EngineError::validation("no allocation lines"));
        }
        let unit_count: usize = lines.iter().map(|(_, u)| u.len()).sum();
        if unit_count > MAX_ALLOCATION_UNITS {
            return Err(EngineError::LimitExceeded("too many units in allocation"));
        }

        let open: HashMap<Ulid, u32> = guard
            .open_demand()
            .into_iter()
            .map(|d| (d.category_id, d.quantity))
            .collect();
        let mut seen_categories = HashSet::new();
        let mut seen_units = HashSet::new();
        let mut accepted: Vec<(Ulid, Vec<Ulid>)> = Vec::new();
        let mut skipped = Vec::new();
        for (category_id, units) in lines {
            let Some(&required) = open.get(&category_id) else {
                return Err(EngineError::validation(format!(
                    "category {category_id} is not part of this request"
                )));
            };
            if !seen_categories.insert(category_id) {
                return Err(EngineError::validation(format!(
                    "category {category_id} allocated twice"
                )));
            }
            if required == 0 {
                return Err(EngineError::validation(format!(
                    "category {category_id} is already fully allocated"
                )));
            }
            for unit in &units {
                if !seen_units.insert(*unit) {
                    return Err(EngineError::validation(format!("asset {unit} selected twice")));
                }
            }
            let selected = units.len() as u32;
            if selected > required {
                return Err(EngineError::validation(format!(
                    "category {category_id}: {selected} units selected, {required} required"
                )));
            }
            if selected < required {
                skipped.push(SkippedCategory {
                    category_id,
                    required,
                    selected,
                });
                continue;
            }
            accepted.push((category_id, units));
        }

        if accepted.is_empty() {
            // Nothing satisfiable; report the first short line.
            let first = &skipped[0];
            return Err(EngineError::QuantityNotMet {
                category_id: first.category_id,
                required: first.required,
                selected: first.selected,
            });
        }

        // Assets are never removed, so a unit unknown here stays unknown.
        for (_, units) in &accepted {
            if let Some(missing) = units.iter().find(|u| !self.assets.contains_key(*u)) {
                return Err(EngineError::Conflict(*missing));
            }
        }

        let span = guard.span;
        let mut txn = Txn::with_request(guard);
        txn.assets = self
            .lock_assets(accepted.iter().flat_map(|(_, u)| u.iter().copied()))
            .await?;

        let mut new_lines = Vec::with_capacity(accepted.len());
        for (category_id, units) in accepted {
            for unit in &units {
                let asset = txn.assets.get(unit).ok_or(EngineError::Conflict(*unit))?;
                if asset.category_id != category_id {
                    return Err(EngineError::Conflict(*unit));
                }
                check_unit_free(asset, &span)?;
            }
            new_lines.push(AllocationLine {
                category_id,
                units: units
                    .into_iter()
                    .map(|asset_id| BoundUnit {
                        borrowed_id: Ulid::new(),
                        asset_id,
                    })
                    .collect(),
            });
        }

        let newly_bound: BTreeMap<Ulid, u32> = new_lines
            .iter()
            .map(|l| (l.category_id, l.units.len() as u32))
            .collect();
        let complete = open
            .iter()
            .all(|(cat, needed)| newly_bound.get(cat).copied().unwrap_or(0) >= *needed);
        let status = if complete {
            RequestStatus::AmApproved
        } else {
            RequestStatus::PendingAm
        };
        self.commit_allocation(&mut txn, new_lines, skipped, status, None)
            .await
    }

    async fn commit_allocation(
        &self,
        txn: &mut Txn,
        lines: Vec<AllocationLine>,
        skipped: Vec<SkippedCategory>,
        status: RequestStatus,
        approver: Option<Ulid>,
    ) -> Result<AllocationOutcome, EngineError> {
        let Some(req) = txn.request.as_ref() else {
            return Err(EngineError::WalError("allocation without request lock".into()));
        };
        let request_id = req.id;
        let allocation_id = req.allocation.as_ref().map_or_else(Ulid::new, |a| a.id);
        let event = Event::UnitsAllocated {
            allocation_id,
            request_id,
            requester_id: req.requester_id,
            span: req.span,
            lines: lines.clone(),
            approver_id: approver,
            status,
        };
        self.persist_and_apply(txn, event).await?;

        let units: usize = lines.iter().map(|l| l.units.len()).sum();
        tracing::info!(
            "request {request_id}: bound {units} units, {} categories skipped, now {status}",
            skipped.len()
        );
        Ok(AllocationOutcome {
            allocation_id,
            request_id,
            allocated: lines,
            skipped,
            status,
        })
    }
}
