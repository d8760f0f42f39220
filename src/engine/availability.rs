use ulid::Ulid;

use crate::model::*;

use super::conflict::validate_span;
use super::{Engine, EngineError};

/// What the resolver needs to know about one unit for one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitView {
    pub id: Ulid,
    pub category_id: Ulid,
    pub code: String,
    pub selectable: bool,
    /// `None` when the unit is free for the window.
    pub next_free: Option<Ms>,
}

impl UnitView {
    pub fn of(asset: &AssetState, window: &Span) -> Self {
        Self {
            id: asset.id,
            category_id: asset.category_id,
            code: asset.code.clone(),
            selectable: asset.status.is_selectable(),
            next_free: asset.index.next_free(window),
        }
    }

    fn is_free(&self) -> bool {
        self.selectable && self.next_free.is_none()
    }
}

/// Availability of `requested` units drawn from `units` (one category).
///
/// Free units are picked in `(code, id)` order so repeated checks return the
/// same candidates. On shortage, `next_available_at` is the moment the
/// shortage-th blocked unit frees up, i.e. when `requested` units would be
/// free together; unknown if too few units exist or the one needed is held
/// by an overdue borrow.
pub fn resolve_category(
    category_id: Ulid,
    category_name: &str,
    units: &[UnitView],
    requested: u32,
) -> (CategoryAvailability, Vec<AvailableAsset>) {
    let mut candidates: Vec<&UnitView> = units.iter().filter(|u| u.selectable).collect();
    candidates.sort_by(|a, b| a.code.cmp(&b.code).then(a.id.cmp(&b.id)));

    let free: Vec<&UnitView> = candidates.iter().copied().filter(|u| u.is_free()).collect();
    let available_now = free.len() as u32;
    let shortage = requested.saturating_sub(available_now);

    let next_available_at = if shortage == 0 {
        None
    } else {
        let mut blocked_until: Vec<Ms> = candidates.iter().filter_map(|u| u.next_free).collect();
        blocked_until.sort_unstable();
        blocked_until
            .get(shortage as usize - 1)
            .copied()
            .filter(|t| *t != Ms::MAX)
    };

    let selected = free
        .iter()
        .take(requested as usize)
        .map(|u| u.id)
        .collect();
    let available_assets = free
        .iter()
        .map(|u| AvailableAsset {
            asset_id: u.id,
            category_id: u.category_id,
            code: u.code.clone(),
        })
        .collect();

    (
        CategoryAvailability {
            category_id,
            category_name: category_name.to_string(),
            requested,
            available_now,
            shortage,
            next_available_at,
            selected,
        },
        available_assets,
    )
}

/// Availability of one named unit. `requested` is 0 once the unit is bound.
pub fn resolve_specific(
    unit: &UnitView,
    category_name: &str,
    requested: u32,
) -> (CategoryAvailability, Vec<AvailableAsset>) {
    let free = unit.is_free();
    let shortage = if free { 0 } else { requested };
    let next_available_at = if shortage > 0 && unit.selectable {
        unit.next_free.filter(|t| *t != Ms::MAX)
    } else {
        None
    };
    let available_assets = if free {
        vec![AvailableAsset {
            asset_id: unit.id,
            category_id: unit.category_id,
            code: unit.code.clone(),
        }]
    } else {
        Vec::new()
    };
    (
        CategoryAvailability {
            category_id: unit.category_id,
            category_name: category_name.to_string(),
            requested,
            available_now: u32::from(free),
            shortage,
            next_available_at,
            selected: if free && requested > 0 { vec![unit.id] } else { Vec::new() },
        },
        available_assets,
    )
}

impl Engine {
    /// Read-lock each unit briefly and take its view for `window`.
    pub(super) async fn unit_views(&self, ids: &[Ulid], window: &Span) -> Vec<UnitView> {
        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(asset) = self.get_asset(id) {
                let guard = asset.read().await;
                views.push(UnitView::of(&guard, window));
            }
        }
        views
    }

    pub(super) fn category_snapshot(&self, id: &Ulid) -> Result<(String, Vec<Ulid>), EngineError> {
        let cat = self.categories.get(id).ok_or(EngineError::NotFound(*id))?;
        Ok((cat.name.clone(), cat.unit_ids()))
    }

    /// Advisory availability for a request's open demand. Never reserves:
    /// the committer re-checks everything under its own locks.
    pub async fn check_availability(
        &self,
        request_id: Ulid,
    ) -> Result<AvailabilityResult, EngineError> {
        let request = {
            let rs = self
                .get_request(&request_id)
                .ok_or(EngineError::NotFound(request_id))?;
            rs.read().await.clone()
        };
        let window = validate_span(request.span.start, request.span.end)?;

        let mut categories = Vec::new();
        let mut available_assets = Vec::new();
        match &request.kind {
            RequestKind::Specific { asset_id } => {
                let views = self.unit_views(std::slice::from_ref(asset_id), &window).await;
                let view = views.first().ok_or(EngineError::NotFound(*asset_id))?;
                let name = self
                    .categories
                    .get(&view.category_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                let requested = u32::from(request.allocation.is_none());
                let (cat, assets) = resolve_specific(view, &name, requested);
                categories.push(cat);
                available_assets.extend(assets);
            }
            RequestKind::Categories(_) => {
                for demand in request.open_demand() {
                    let (name, unit_ids) = self.category_snapshot(&demand.category_id)?;
                    let views = self.unit_views(&unit_ids, &window).await;
                    let (cat, assets) =
                        resolve_category(demand.category_id, &name, &views, demand.quantity);
                    categories.push(cat);
                    available_assets.extend(assets);
                }
            }
        }

        let available = categories.iter().all(|c| c.shortage == 0);
        metrics::counter!(
            crate::observability::AVAILABILITY_CHECKS_TOTAL,
            "outcome" => if available { "available" } else { "shortage" }
        )
        .increment(1);
        Ok(AvailabilityResult {
            request_id,
            available,
            available_assets,
            categories,
        })
    }

    /// Ad-hoc check of `quantity` units of a category over `[start, end)`.
    pub async fn check_category_window(
        &self,
        category_id: Ulid,
        start: Ms,
        end: Ms,
        quantity: u32,
    ) -> Result<(CategoryAvailability, Vec<AvailableAsset>), EngineError> {
        let window = validate_span(start, end)?;
        let (name, unit_ids) = self.category_snapshot(&category_id)?;
        let views = self.unit_views(&unit_ids, &window).await;
        Ok(resolve_category(category_id, &name, &views, quantity))
    }
}
