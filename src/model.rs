use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::index::IntervalIndex;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Statuses ─────────────────────────────────────────────────────

/// Lifecycle status of a physical asset unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetStatus {
    Available,
    Preparing,
    InUse,
    Lost,
    Inactive,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Available => "AVAILABLE",
            AssetStatus::Preparing => "PREPARING",
            AssetStatus::InUse => "IN_USE",
            AssetStatus::Lost => "LOST",
            AssetStatus::Inactive => "INACTIVE",
        }
    }

    /// `BORROWED` and `RETURNED` are accepted as the client's spellings of
    /// `IN_USE` and `AVAILABLE`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AVAILABLE" | "RETURNED" => Some(AssetStatus::Available),
            "PREPARING" => Some(AssetStatus::Preparing),
            "IN_USE" | "BORROWED" => Some(AssetStatus::InUse),
            "LOST" => Some(AssetStatus::Lost),
            "INACTIVE" => Some(AssetStatus::Inactive),
            _ => None,
        }
    }

    /// LOST and INACTIVE units never take part in availability or allocation.
    pub fn is_selectable(&self) -> bool {
        !matches!(self, AssetStatus::Lost | AssetStatus::Inactive)
    }
}

/// Status of one ledger row (a borrow interval).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BorrowStatus {
    Borrowed,
    InUse,
    Overdue,
    Returned,
    Cancelled,
}

impl BorrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BorrowStatus::Borrowed => "BORROWED",
            BorrowStatus::InUse => "IN_USE",
            BorrowStatus::Overdue => "OVERDUE",
            BorrowStatus::Returned => "RETURNED",
            BorrowStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BORROWED" => Some(BorrowStatus::Borrowed),
            "IN_USE" => Some(BorrowStatus::InUse),
            "OVERDUE" => Some(BorrowStatus::Overdue),
            "RETURNED" => Some(BorrowStatus::Returned),
            "CANCELLED" => Some(BorrowStatus::Cancelled),
            _ => None,
        }
    }

    /// Active rows hold their unit and take part in overlap queries.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BorrowStatus::Borrowed | BorrowStatus::InUse | BorrowStatus::Overdue
        )
    }
}

/// Approval workflow status of an asset request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    PendingLeader,
    LeaderApproved,
    LeaderRejected,
    PendingAm,
    AmApproved,
    Rejected,
    Cancelled,
    InUse,
    Returned,
    Overdue,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::PendingLeader => "PENDING_LEADER",
            RequestStatus::LeaderApproved => "LEADER_APPROVED",
            RequestStatus::LeaderRejected => "LEADER_REJECTED",
            RequestStatus::PendingAm => "PENDING_AM",
            RequestStatus::AmApproved => "AM_APPROVED",
            RequestStatus::Rejected => "REJECTED",
            RequestStatus::Cancelled => "CANCELLED",
            RequestStatus::InUse => "IN_USE",
            RequestStatus::Returned => "RETURNED",
            RequestStatus::Overdue => "OVERDUE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING_LEADER" => Some(RequestStatus::PendingLeader),
            "LEADER_APPROVED" => Some(RequestStatus::LeaderApproved),
            "LEADER_REJECTED" => Some(RequestStatus::LeaderRejected),
            "PENDING_AM" => Some(RequestStatus::PendingAm),
            "AM_APPROVED" => Some(RequestStatus::AmApproved),
            "REJECTED" => Some(RequestStatus::Rejected),
            "CANCELLED" => Some(RequestStatus::Cancelled),
            "IN_USE" => Some(RequestStatus::InUse),
            "RETURNED" => Some(RequestStatus::Returned),
            "OVERDUE" => Some(RequestStatus::Overdue),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::LeaderRejected
                | RequestStatus::Rejected
                | RequestStatus::Cancelled
                | RequestStatus::Returned
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Inventory ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CategoryState {
    pub id: Ulid,
    pub name: String,
    pub asset_type: Option<String>,
    /// Member units in deterministic selection order, `(code, id)`.
    pub units: Vec<(String, Ulid)>,
}

impl CategoryState {
    pub fn new(id: Ulid, name: String, asset_type: Option<String>) -> Self {
        Self {
            id,
            name,
            asset_type,
            units: Vec::new(),
        }
    }

    pub fn add_unit(&mut self, code: String, id: Ulid) {
        let key = (code, id);
        if let Err(pos) = self.units.binary_search(&key) {
            self.units.insert(pos, key);
        }
    }

    pub fn unit_ids(&self) -> Vec<Ulid> {
        self.units.iter().map(|(_, id)| *id).collect()
    }
}

#[derive(Debug, Clone)]
pub struct AssetState {
    pub id: Ulid,
    pub category_id: Ulid,
    pub code: String,
    pub asset_type: Option<String>,
    pub status: AssetStatus,
    /// Every ledger row for this unit, active and historical.
    pub index: IntervalIndex,
}

impl AssetState {
    pub fn new(id: Ulid, category_id: Ulid, code: String, asset_type: Option<String>) -> Self {
        Self {
            id,
            category_id,
            code,
            asset_type,
            status: AssetStatus::Available,
            index: IntervalIndex::new(),
        }
    }
}

/// One ledger row: `asset_id` committed to `request_id` over `span`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowInterval {
    pub id: Ulid,
    pub asset_id: Ulid,
    pub request_id: Ulid,
    pub requester_id: Ulid,
    pub span: Span,
    pub status: BorrowStatus,
    pub returned_at: Option<Ms>,
    /// Bumped on every status change; used by the sweeper's optimistic update.
    pub version: u64,
}

impl BorrowInterval {
    /// An overdue row keeps its unit until it is returned, whatever its end time says.
    pub fn effective_end(&self) -> Ms {
        match self.status {
            BorrowStatus::Overdue => Ms::MAX,
            _ => self.span.end,
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryDemand {
    #[serde(alias = "categoryID")]
    pub category_id: Ulid,
    #[serde(alias = "requestedQuantity")]
    pub quantity: u32,
}

/// What a request asks for. Fixed at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Specific { asset_id: Ulid },
    Categories(Vec<CategoryDemand>),
}

impl RequestKind {
    pub fn is_specific(&self) -> bool {
        matches!(self, RequestKind::Specific { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundUnit {
    pub borrowed_id: Ulid,
    pub asset_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub category_id: Ulid,
    pub units: Vec<BoundUnit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub request_id: Ulid,
    pub lines: Vec<AllocationLine>,
}

impl Allocation {
    /// Units already bound for `category_id`.
    pub fn allocated_for(&self, category_id: Ulid) -> usize {
        self.lines
            .iter()
            .filter(|l| l.category_id == category_id)
            .map(|l| l.units.len())
            .sum()
    }

    pub fn units(&self) -> impl Iterator<Item = &BoundUnit> {
        self.lines.iter().flat_map(|l| l.units.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestState {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub project_id: Option<Ulid>,
    pub department_id: Option<Ulid>,
    pub description: Option<String>,
    pub kind: RequestKind,
    pub span: Span,
    pub status: RequestStatus,
    pub approver_id: Option<Ulid>,
    pub rejection_reason: Option<String>,
    pub allocation: Option<Allocation>,
}

impl RequestState {
    /// Open demand per category: requested quantity minus what is already bound.
    pub fn open_demand(&self) -> Vec<CategoryDemand> {
        match &self.kind {
            RequestKind::Specific { .. } => Vec::new(),
            RequestKind::Categories(demands) => demands
                .iter()
                .map(|d| {
                    let bound = self
                        .allocation
                        .as_ref()
                        .map_or(0, |a| a.allocated_for(d.category_id));
                    CategoryDemand {
                        category_id: d.category_id,
                        quantity: d.quantity.saturating_sub(bound as u32),
                    }
                })
                .collect(),
        }
    }

    pub fn bound_units(&self) -> Vec<BoundUnit> {
        self.allocation
            .as_ref()
            .map(|a| a.units().cloned().collect())
            .unwrap_or_default()
    }
}

// ── Events (WAL record format) ───────────────────────────────────

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CategoryCreated {
        id: Ulid,
        name: String,
        asset_type: Option<String>,
    },
    AssetCreated {
        id: Ulid,
        category_id: Ulid,
        code: String,
        asset_type: Option<String>,
    },
    AssetStatusChanged {
        id: Ulid,
        status: AssetStatus,
    },
    RequestSubmitted {
        request: RequestState,
    },
    /// Lifecycle transition. `units` are the ledger rows the transition acts on:
    /// revoked (REJECTED/CANCELLED), collected (IN_USE) or returned (RETURNED).
    RequestTransitioned {
        id: Ulid,
        from: RequestStatus,
        to: RequestStatus,
        actor_id: Option<Ulid>,
        reason: Option<String>,
        at: Ms,
        units: Vec<BoundUnit>,
    },
    UnitsAllocated {
        allocation_id: Ulid,
        request_id: Ulid,
        requester_id: Ulid,
        span: Span,
        lines: Vec<AllocationLine>,
        approver_id: Option<Ulid>,
        status: RequestStatus,
    },
    BorrowReturned {
        id: Ulid,
        asset_id: Ulid,
        request_id: Ulid,
        at: Ms,
        /// Set when this return closes the request.
        request_status: Option<RequestStatus>,
    },
    BorrowOverdue {
        id: Ulid,
        asset_id: Ulid,
        request_id: Ulid,
    },
    /// Compaction output: full unit state including its ledger history.
    AssetRestored {
        id: Ulid,
        category_id: Ulid,
        code: String,
        asset_type: Option<String>,
        status: AssetStatus,
        intervals: Vec<BorrowInterval>,
    },
    /// Compaction output: full request state.
    RequestRestored {
        request: RequestState,
    },
}

impl Event {
    /// The request this event locks, if any.
    pub fn request_id(&self) -> Option<Ulid> {
        match self {
            Event::RequestTransitioned { id, .. } => Some(*id),
            Event::UnitsAllocated { request_id, .. } | Event::BorrowReturned { request_id, .. } => {
                Some(*request_id)
            }
            Event::CategoryCreated { .. }
            | Event::AssetCreated { .. }
            | Event::AssetStatusChanged { .. }
            | Event::RequestSubmitted { .. }
            | Event::BorrowOverdue { .. }
            | Event::AssetRestored { .. }
            | Event::RequestRestored { .. } => None,
        }
    }

    /// Asset units this event locks, ascending.
    pub fn asset_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = match self {
            Event::AssetStatusChanged { id, .. } => vec![*id],
            Event::RequestTransitioned { units, .. } => units.iter().map(|u| u.asset_id).collect(),
            Event::UnitsAllocated { lines, .. } => lines
                .iter()
                .flat_map(|l| l.units.iter().map(|u| u.asset_id))
                .collect(),
            Event::BorrowReturned { asset_id, .. } | Event::BorrowOverdue { asset_id, .. } => {
                vec![*asset_id]
            }
            Event::CategoryCreated { .. }
            | Event::AssetCreated { .. }
            | Event::RequestSubmitted { .. }
            | Event::AssetRestored { .. }
            | Event::RequestRestored { .. } => Vec::new(),
        };
        ids.sort();
        ids.dedup();
        ids
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryInfo {
    pub id: Ulid,
    pub name: String,
    pub asset_type: Option<String>,
    pub unit_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetInfo {
    pub id: Ulid,
    pub category_id: Ulid,
    pub code: String,
    pub asset_type: Option<String>,
    pub status: AssetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableAsset {
    pub asset_id: Ulid,
    pub category_id: Ulid,
    pub code: String,
}

/// Availability of one category (or of the single unit of a specific request).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryAvailability {
    pub category_id: Ulid,
    pub category_name: String,
    pub requested: u32,
    pub available_now: u32,
    pub shortage: u32,
    /// When enough units are free at once; `None` if satisfied or unknown.
    pub next_available_at: Option<Ms>,
    /// Deterministic pick: the first `requested` free units by `(code, id)`.
    pub selected: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityResult {
    pub request_id: Ulid,
    pub available: bool,
    pub available_assets: Vec<AvailableAsset>,
    pub categories: Vec<CategoryAvailability>,
}

impl AvailabilityResult {
    pub fn shortages(&self) -> impl Iterator<Item = &CategoryAvailability> {
        self.categories.iter().filter(|c| c.shortage > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedCategory {
    pub category_id: Ulid,
    pub required: u32,
    pub selected: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub allocation_id: Ulid,
    pub request_id: Ulid,
    pub allocated: Vec<AllocationLine>,
    pub skipped: Vec<SkippedCategory>,
    pub status: RequestStatus,
}

impl AllocationOutcome {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back
        assert_eq!(a.duration_ms(), 100);
    }

    #[test]
    fn status_strings_round_trip_and_reject_unknown() {
        for s in [
            RequestStatus::PendingLeader,
            RequestStatus::LeaderApproved,
            RequestStatus::LeaderRejected,
            RequestStatus::PendingAm,
            RequestStatus::AmApproved,
            RequestStatus::Rejected,
            RequestStatus::Cancelled,
            RequestStatus::InUse,
            RequestStatus::Returned,
            RequestStatus::Overdue,
        ] {
            assert_eq!(RequestStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RequestStatus::parse("approved"), None);
        assert_eq!(BorrowStatus::parse("in_use"), Some(BorrowStatus::InUse));
        assert_eq!(BorrowStatus::parse("LENT"), None);
    }

    #[test]
    fn asset_status_accepts_client_synonyms() {
        assert_eq!(AssetStatus::parse("BORROWED"), Some(AssetStatus::InUse));
        assert_eq!(AssetStatus::parse("returned"), Some(AssetStatus::Available));
        assert!(!AssetStatus::Lost.is_selectable());
        assert!(!AssetStatus::Inactive.is_selectable());
        assert!(AssetStatus::Preparing.is_selectable());
    }

    #[test]
    fn category_units_ordered_by_code_then_id() {
        let mut c = CategoryState::new(Ulid::new(), "Laptop".into(), None);
        let (a, b, z) = (Ulid::new(), Ulid::new(), Ulid::new());
        c.add_unit("LAP-003".into(), z);
        c.add_unit("LAP-001".into(), b);
        c.add_unit("LAP-002".into(), a);
        c.add_unit("LAP-001".into(), b); // duplicate ignored
        assert_eq!(c.unit_ids(), vec![b, a, z]);
    }

    #[test]
    fn open_demand_subtracts_bound_units() {
        let cat = Ulid::new();
        let req = RequestState {
            id: Ulid::new(),
            requester_id: Ulid::new(),
            project_id: None,
            department_id: None,
            description: None,
            kind: RequestKind::Categories(vec![CategoryDemand { category_id: cat, quantity: 3 }]),
            span: Span::new(0, 100),
            status: RequestStatus::PendingAm,
            approver_id: None,
            rejection_reason: None,
            allocation: Some(Allocation {
                id: Ulid::new(),
                request_id: Ulid::new(),
                lines: vec![AllocationLine {
                    category_id: cat,
                    units: vec![BoundUnit { borrowed_id: Ulid::new(), asset_id: Ulid::new() }],
                }],
            }),
        };
        assert_eq!(req.open_demand(), vec![CategoryDemand { category_id: cat, quantity: 2 }]);
    }

    #[test]
    fn category_demand_parses_client_json() {
        let id = Ulid::new();
        let json = format!(r#"[{{"categoryID":"{id}","requestedQuantity":2}}]"#);
        let parsed: Vec<CategoryDemand> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, vec![CategoryDemand { category_id: id, quantity: 2 }]);
    }

    #[test]
    fn event_asset_ids_sorted_and_deduped() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let ev = Event::RequestTransitioned {
            id: Ulid::new(),
            from: RequestStatus::AmApproved,
            to: RequestStatus::Cancelled,
            actor_id: None,
            reason: None,
            at: 0,
            units: vec![
                BoundUnit { borrowed_id: Ulid::new(), asset_id: b },
                BoundUnit { borrowed_id: Ulid::new(), asset_id: a },
                BoundUnit { borrowed_id: Ulid::new(), asset_id: b },
            ],
        };
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ev.asset_ids(), expected);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AssetCreated {
            id: Ulid::new(),
            category_id: Ulid::new(),
            code: "LAP-001".into(),
            asset_type: Some("IT".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
