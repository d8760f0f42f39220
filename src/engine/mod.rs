mod allocation;
mod availability;
mod conflict;
mod error;
mod ledger;
mod lifecycle;
mod mutations;
mod queries;

pub use availability::{resolve_category, resolve_specific, UnitView};
pub use conflict::now_ms;
pub use error::EngineError;
pub use ledger::SweepOutcome;
pub use lifecycle::{check_transition, NewRequest, Transition};
pub use queries::{LedgerFilter, RequestFilter};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedAssetState = Arc<RwLock<AssetState>>;
pub type SharedRequestState = Arc<RwLock<RequestState>>;

/// Appends flushed by one fsync at most.
const MAX_GROUP_COMMIT: usize = 1024;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Whatever appends are queued when the task wakes are
/// buffered together and made durable by a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next {
            match cmd {
                WalCommand::Append { event, response } => {
                    batch.push((event, response));
                    if batch.len() >= MAX_GROUP_COMMIT {
                        commit_batch(&mut wal, &mut batch);
                    }
                }
                control => {
                    // Appends queued before a control command land first.
                    commit_batch(&mut wal, &mut batch);
                    handle_control(&mut wal, control);
                }
            }
            next = rx.try_recv().ok();
        }
        commit_batch(&mut wal, &mut batch);
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so stray buffered bytes don't leak
    // into the next batch.
    if let Err(e) = wal.flush_sync()
        && result.is_ok()
    {
        result = Err(e);
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            tracing::error!("append routed as a control command");
            let _ = response.send(Err(io::Error::other("misrouted WAL append")));
        }
    }
}

// ── Transactions ─────────────────────────────────────────

/// Write guards held for one commit: optionally the request, plus the asset
/// units it touches. Acquired request first, then assets ascending by id.
#[derive(Default)]
pub(super) struct Txn {
    pub(super) request: Option<OwnedRwLockWriteGuard<RequestState>>,
    pub(super) assets: BTreeMap<Ulid, OwnedRwLockWriteGuard<AssetState>>,
}

impl Txn {
    pub(super) fn with_request(request: OwnedRwLockWriteGuard<RequestState>) -> Self {
        Self {
            request: Some(request),
            assets: BTreeMap::new(),
        }
    }
}

pub struct Engine {
    pub(super) categories: DashMap<Ulid, CategoryState>,
    pub(super) assets: DashMap<Ulid, SharedAssetState>,
    pub(super) requests: DashMap<Ulid, SharedRequestState>,
    /// Ledger row id → asset id.
    pub(super) borrow_index: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared across append+apply; compaction takes it exclusively so
    /// its snapshot matches the log exactly.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
}

/// Units leave PREPARING/IN_USE once nothing holds them any more.
fn settle_unit_status(asset: &mut AssetState) {
    if matches!(asset.status, AssetStatus::Preparing | AssetStatus::InUse)
        && !asset.index.has_active()
    {
        asset.status = AssetStatus::Available;
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            categories: DashMap::new(),
            assets: DashMap::new(),
            requests: DashMap::new(),
            borrow_index: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
        };

        // Sole owner of every lock during replay, so try_write always succeeds.
        // Never block here: this can run inside an async context.
        for event in &events {
            let mut txn = Txn::default();
            if let Some(rid) = event.request_id()
                && let Some(rs) = engine.get_request(&rid)
            {
                let guard = rs
                    .try_write_owned()
                    .map_err(|_| io::Error::other("replay: contended request lock"))?;
                txn.request = Some(guard);
            }
            for aid in event.asset_ids() {
                if let Some(asset) = engine.get_asset(&aid) {
                    let guard = asset
                        .try_write_owned()
                        .map_err(|_| io::Error::other("replay: contended asset lock"))?;
                    txn.assets.insert(aid, guard);
                }
            }
            engine.apply_event(&mut txn, event);
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} categories, {} assets, {} requests",
                events.len(),
                engine.categories.len(),
                engine.assets.len(),
                engine.requests.len()
            );
        }

        Ok(engine)
    }

    pub fn get_asset(&self, id: &Ulid) -> Option<SharedAssetState> {
        self.assets.get(id).map(|e| e.value().clone())
    }

    pub fn get_request(&self, id: &Ulid) -> Option<SharedRequestState> {
        self.requests.get(id).map(|e| e.value().clone())
    }

    pub fn asset_for_borrow(&self, borrowed_id: &Ulid) -> Option<Ulid> {
        self.borrow_index.get(borrowed_id).map(|e| *e.value())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durably log `event`, apply it under the guards in `txn`, then publish it.
    pub(super) async fn persist_and_apply(
        &self,
        txn: &mut Txn,
        event: Event,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&event).await?;
        self.apply_event(txn, &event);
        self.notify.publish(&event);
        Ok(())
    }

    pub(super) async fn lock_request(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RequestState>, EngineError> {
        let rs = self.get_request(&id).ok_or(EngineError::NotFound(id))?;
        Ok(rs.write_owned().await)
    }

    /// Write-lock every listed unit in ascending id order.
    pub(super) async fn lock_assets(
        &self,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<BTreeMap<Ulid, OwnedRwLockWriteGuard<AssetState>>, EngineError> {
        let sorted: BTreeSet<Ulid> = ids.into_iter().collect();
        let mut shared = Vec::with_capacity(sorted.len());
        for id in sorted {
            shared.push((id, self.get_asset(&id).ok_or(EngineError::NotFound(id))?));
        }
        let mut guards = BTreeMap::new();
        for (id, asset) in shared {
            guards.insert(id, asset.write_owned().await);
        }
        Ok(guards)
    }

    /// Apply an event to in-memory state. The caller holds every lock the
    /// event touches (see `Event::request_id` / `Event::asset_ids`).
    fn apply_event(&self, txn: &mut Txn, event: &Event) {
        match event {
            Event::CategoryCreated {
                id,
                name,
                asset_type,
            } => {
                self.categories
                    .insert(*id, CategoryState::new(*id, name.clone(), asset_type.clone()));
            }
            Event::AssetCreated {
                id,
                category_id,
                code,
                asset_type,
            } => {
                let asset = AssetState::new(*id, *category_id, code.clone(), asset_type.clone());
                self.assets.insert(*id, Arc::new(RwLock::new(asset)));
                if let Some(mut cat) = self.categories.get_mut(category_id) {
                    cat.add_unit(code.clone(), *id);
                }
            }
            Event::AssetStatusChanged { id, status } => {
                if let Some(asset) = txn.assets.get_mut(id) {
                    asset.status = *status;
                }
            }
            Event::RequestSubmitted { request } | Event::RequestRestored { request } => {
                self.requests
                    .insert(request.id, Arc::new(RwLock::new(request.clone())));
            }
            Event::RequestTransitioned {
                to,
                actor_id,
                reason,
                at,
                units,
                ..
            } => {
                if let Some(req) = txn.request.as_mut() {
                    req.status = *to;
                    if actor_id.is_some() {
                        req.approver_id = *actor_id;
                    }
                    if matches!(to, RequestStatus::Rejected | RequestStatus::LeaderRejected) {
                        req.rejection_reason = reason.clone();
                    }
                }
                let row_status = match to {
                    RequestStatus::Rejected | RequestStatus::Cancelled => Some(BorrowStatus::Cancelled),
                    RequestStatus::InUse => Some(BorrowStatus::InUse),
                    RequestStatus::Returned => Some(BorrowStatus::Returned),
                    _ => None,
                };
                let Some(row_status) = row_status else { return };
                for unit in units {
                    let Some(asset) = txn.assets.get_mut(&unit.asset_id) else {
                        continue;
                    };
                    if row_status != BorrowStatus::InUse {
                        asset.index.release(unit.borrowed_id, row_status, Some(*at));
                    } else if let Some(row) = asset.index.get_mut(unit.borrowed_id)
                        // Collection leaves an already overdue row overdue.
                        && row.status != BorrowStatus::Overdue
                    {
                        row.status = row_status;
                        row.version += 1;
                    }
                    if row_status == BorrowStatus::InUse {
                        if asset.status.is_selectable() {
                            asset.status = AssetStatus::InUse;
                        }
                    } else {
                        settle_unit_status(asset);
                    }
                }
            }
            Event::UnitsAllocated {
                allocation_id,
                request_id,
                requester_id,
                span,
                lines,
                approver_id,
                status,
            } => {
                for line in lines {
                    for unit in &line.units {
                        if let Some(asset) = txn.assets.get_mut(&unit.asset_id) {
                            asset.index.insert(BorrowInterval {
                                id: unit.borrowed_id,
                                asset_id: unit.asset_id,
                                request_id: *request_id,
                                requester_id: *requester_id,
                                span: *span,
                                status: BorrowStatus::Borrowed,
                                returned_at: None,
                                version: 0,
                            });
                            asset.status = AssetStatus::Preparing;
                        }
                        self.borrow_index.insert(unit.borrowed_id, unit.asset_id);
                    }
                }
                if let Some(req) = txn.request.as_mut() {
                    let allocation = req.allocation.get_or_insert_with(|| Allocation {
                        id: *allocation_id,
                        request_id: *request_id,
                        lines: Vec::new(),
                    });
                    for line in lines {
                        match allocation
                            .lines
                            .iter_mut()
                            .find(|l| l.category_id == line.category_id)
                        {
                            Some(existing) => existing.units.extend(line.units.iter().cloned()),
                            None => allocation.lines.push(line.clone()),
                        }
                    }
                    req.status = *status;
                    if approver_id.is_some() {
                        req.approver_id = *approver_id;
                    }
                }
            }
            Event::BorrowReturned {
                id,
                asset_id,
                at,
                request_status,
                ..
            } => {
                if let Some(asset) = txn.assets.get_mut(asset_id) {
                    asset.index.release(*id, BorrowStatus::Returned, Some(*at));
                    settle_unit_status(asset);
                }
                if let (Some(req), Some(status)) = (txn.request.as_mut(), request_status) {
                    req.status = *status;
                }
            }
            Event::BorrowOverdue { id, asset_id, .. } => {
                if let Some(asset) = txn.assets.get_mut(asset_id) {
                    asset.index.set_status(*id, BorrowStatus::Overdue);
                }
            }
            Event::AssetRestored {
                id,
                category_id,
                code,
                asset_type,
                status,
                intervals,
            } => {
                let mut asset = AssetState::new(*id, *category_id, code.clone(), asset_type.clone());
                asset.status = *status;
                for row in intervals {
                    self.borrow_index.insert(row.id, *id);
                    asset.index.insert(row.clone());
                }
                self.assets.insert(*id, Arc::new(RwLock::new(asset)));
                if let Some(mut cat) = self.categories.get_mut(category_id) {
                    cat.add_unit(code.clone(), *id);
                }
            }
        }
    }
}
