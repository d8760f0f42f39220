use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Which ledger rows to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerFilter {
    All,
    Id(Ulid),
    Staff(Ulid),
    Asset(Ulid),
    Request(Ulid),
}

/// Request listing filter; every set field must match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub id: Option<Ulid>,
    pub status: Option<RequestStatus>,
    pub requester_id: Option<Ulid>,
    /// Leader inbox: requests raised from one department.
    pub department_id: Option<Ulid>,
}

impl RequestFilter {
    fn matches(&self, r: &RequestState) -> bool {
        self.id.is_none_or(|id| id == r.id)
            && self.status.is_none_or(|s| s == r.status)
            && self.requester_id.is_none_or(|u| u == r.requester_id)
            && self.department_id.is_none_or(|d| r.department_id == Some(d))
    }
}

fn sort_rows(rows: &mut [BorrowInterval]) {
    rows.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
}

impl Engine {
    pub fn list_categories(&self) -> Vec<CategoryInfo> {
        let mut out: Vec<CategoryInfo> = self
            .categories
            .iter()
            .map(|c| CategoryInfo {
                id: c.id,
                name: c.name.clone(),
                asset_type: c.asset_type.clone(),
                unit_count: c.units.len(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Units of one category in selection order, or every unit by code.
    pub async fn list_assets(&self, category_id: Option<Ulid>) -> Result<Vec<AssetInfo>, EngineError> {
        let ids: Vec<Ulid> = match category_id {
            Some(cid) => self.category_snapshot(&cid)?.1,
            None => self.assets.iter().map(|e| *e.key()).collect(),
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(asset) = self.get_asset(&id) else {
                continue;
            };
            let guard = asset.read().await;
            out.push(AssetInfo {
                id: guard.id,
                category_id: guard.category_id,
                code: guard.code.clone(),
                asset_type: guard.asset_type.clone(),
                status: guard.status,
            });
        }
        if category_id.is_none() {
            out.sort_by(|a, b| a.code.cmp(&b.code).then(a.id.cmp(&b.id)));
        }
        Ok(out)
    }

    pub async fn get_request_info(&self, id: Ulid) -> Result<RequestState, EngineError> {
        let rs = self.get_request(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.clone())
    }

    pub async fn list_requests(&self, filter: RequestFilter) -> Vec<RequestState> {
        if let Some(id) = filter.id {
            return match self.get_request_info(id).await {
                Ok(r) if filter.matches(&r) => vec![r],
                _ => Vec::new(),
            };
        }
        let all: Vec<_> = self.requests.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in all {
            let guard = rs.read().await;
            if filter.matches(&guard) {
                out.push(guard.clone());
            }
        }
        // ULIDs sort by creation time.
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn allocation_for(&self, request_id: Ulid) -> Result<Option<Allocation>, EngineError> {
        Ok(self.get_request_info(request_id).await?.allocation)
    }

    pub async fn borrowed_assets(&self, filter: LedgerFilter) -> Result<Vec<BorrowInterval>, EngineError> {
        let mut rows = match filter {
            LedgerFilter::Id(id) => {
                let asset_id = self.asset_for_borrow(&id).ok_or(EngineError::NotFound(id))?;
                let asset = self.get_asset(&asset_id).ok_or(EngineError::NotFound(asset_id))?;
                let guard = asset.read().await;
                let row = guard.index.get(id).cloned().ok_or(EngineError::NotFound(id))?;
                vec![row]
            }
            LedgerFilter::Asset(asset_id) => {
                let asset = self.get_asset(&asset_id).ok_or(EngineError::NotFound(asset_id))?;
                let guard = asset.read().await;
                guard.index.iter().cloned().collect()
            }
            LedgerFilter::Request(request_id) => {
                let bound = self.get_request_info(request_id).await?.bound_units();
                let mut rows = Vec::with_capacity(bound.len());
                for unit in bound {
                    if let Some(asset) = self.get_asset(&unit.asset_id) {
                        let guard = asset.read().await;
                        rows.extend(guard.index.get(unit.borrowed_id).cloned());
                    }
                }
                rows
            }
            LedgerFilter::Staff(staff_id) => {
                self.scan_rows(|row| row.requester_id == staff_id).await
            }
            LedgerFilter::All => self.scan_rows(|_| true).await,
        };
        sort_rows(&mut rows);
        Ok(rows)
    }

    /// Every ledger row of an asset, active and historical.
    pub async fn usage_history(&self, asset_id: Ulid) -> Result<Vec<BorrowInterval>, EngineError> {
        self.borrowed_assets(LedgerFilter::Asset(asset_id)).await
    }

    async fn scan_rows(&self, keep: impl Fn(&BorrowInterval) -> bool) -> Vec<BorrowInterval> {
        let assets: Vec<_> = self.assets.iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::new();
        for asset in assets {
            let guard = asset.read().await;
            rows.extend(guard.index.iter().filter(|r| keep(r)).cloned());
        }
        rows
    }
}
