use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_span};
use super::{Engine, EngineError, Txn};

/// What a requested status change does to a request in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Status change only.
    Move(RequestStatus),
    /// Manager approval: binds units through the committer.
    Approve,
    /// Terminal rejection or cancellation; revokes any allocation.
    Revoke(RequestStatus),
    /// Assets collected: bound rows and units go IN_USE.
    Collect,
    /// Every active row is returned.
    Return,
}

/// The caller-driven transition table. OVERDUE is only ever entered by the
/// sweeper and is not reachable from here.
pub fn check_transition(
    from: RequestStatus,
    to: RequestStatus,
) -> Result<Transition, EngineError> {
    use RequestStatus::*;
    let t = match (from, to) {
        (PendingLeader, LeaderApproved) => Transition::Move(PendingAm),
        (PendingLeader, LeaderRejected) => Transition::Revoke(LeaderRejected),
        (PendingAm, AmApproved) => Transition::Approve,
        (PendingAm, Rejected) => Transition::Revoke(Rejected),
        (PendingLeader | PendingAm | AmApproved | InUse | Overdue, Cancelled) => {
            Transition::Revoke(Cancelled)
        }
        (AmApproved, InUse) => Transition::Collect,
        (InUse | Overdue, Returned) => Transition::Return,
        _ => return Err(EngineError::IllegalTransition { from, to }),
    };
    Ok(t)
}

/// Input of `submit_request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub project_id: Option<Ulid>,
    pub department_id: Option<Ulid>,
    pub description: Option<String>,
    pub kind: RequestKind,
    pub start: Ms,
    pub end: Ms,
    /// PENDING_LEADER when omitted.
    pub initial_status: Option<RequestStatus>,
}

impl Engine {
    pub async fn submit_request(&self, new: NewRequest) -> Result<RequestState, EngineError> {
        if self.requests.len() >= MAX_REQUESTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many requests"));
        }
        if self.requests.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        let span = validate_span(new.start, new.end)?;
        let status = match new.initial_status.unwrap_or(RequestStatus::PendingLeader) {
            s @ (RequestStatus::PendingLeader | RequestStatus::PendingAm) => s,
            other => {
                return Err(EngineError::validation(format!(
                    "a request cannot start as {other}"
                )));
            }
        };
        if let Some(d) = &new.description
            && d.len() > MAX_DESCRIPTION_LEN
        {
            return Err(EngineError::LimitExceeded("description too long"));
        }

        match &new.kind {
            RequestKind::Specific { asset_id } => {
                if !self.assets.contains_key(asset_id) {
                    return Err(EngineError::NotFound(*asset_id));
                }
            }
            RequestKind::Categories(demands) => {
                if demands.is_empty() {
                    return Err(EngineError::validation("request names no asset and no category"));
                }
                if demands.len() > MAX_CATEGORY_LINES {
                    return Err(EngineError::LimitExceeded("too many category lines"));
                }
                let mut seen = HashSet::new();
                for d in demands {
                    if d.quantity == 0 {
                        return Err(EngineError::validation(format!(
                            "quantity for category {} must be positive",
                            d.category_id
                        )));
                    }
                    if d.quantity > MAX_QUANTITY_PER_LINE {
                        return Err(EngineError::LimitExceeded("quantity too large"));
                    }
                    if !seen.insert(d.category_id) {
                        return Err(EngineError::validation(format!(
                            "category {} listed twice",
                            d.category_id
                        )));
                    }
                    if !self.categories.contains_key(&d.category_id) {
                        return Err(EngineError::NotFound(d.category_id));
                    }
                }
            }
        }

        let request = RequestState {
            id: new.id,
            requester_id: new.requester_id,
            project_id: new.project_id,
            department_id: new.department_id,
            description: new.description,
            kind: new.kind,
            span,
            status,
            approver_id: None,
            rejection_reason: None,
            allocation: None,
        };
        self.persist_and_apply(
            &mut Txn::default(),
            Event::RequestSubmitted {
                request: request.clone(),
            },
        )
        .await?;
        Ok(request)
    }

    /// Apply a caller-driven lifecycle transition. Returns the stored status
    /// afterwards (leader approval lands in PENDING_AM).
    pub async fn update_request_status(
        &self,
        request_id: Ulid,
        to: RequestStatus,
        actor_id: Option<Ulid>,
        reason: Option<String>,
    ) -> Result<RequestStatus, EngineError> {
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        if let Some(r) = &reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }

        let guard = self.lock_request(request_id).await?;
        let from = guard.status;
        let transition = check_transition(from, to).inspect_err(|_| {
            tracing::warn!("request {request_id}: rejected transition {from} -> {to}");
        })?;

        let result = match transition {
            Transition::Move(next) => {
                let mut txn = Txn::with_request(guard);
                self.commit_transition(&mut txn, next, actor_id, reason, Vec::new())
                    .await
                    .map(|()| next)
            }
            Transition::Approve => self
                .approve_locked(guard, actor_id)
                .await
                .map(|outcome| outcome.status),
            Transition::Revoke(next) => {
                if next == RequestStatus::Rejected && reason.is_none() {
                    return Err(EngineError::validation("rejection requires a reason"));
                }
                self.revoke_locked(guard, next, actor_id, reason)
                    .await
                    .map(|()| next)
            }
            Transition::Collect => self
                .collect_locked(guard, actor_id)
                .await
                .map(|()| RequestStatus::InUse),
            Transition::Return => self
                .return_locked(guard, now_ms())
                .await
                .map(|_| RequestStatus::Returned),
        };
        if let Ok(status) = &result {
            metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => status.as_str())
                .increment(1);
            tracing::info!("request {request_id}: {from} -> {status}");
        }
        result
    }

    /// Manager approval of a specific-asset request by `user_id`.
    pub async fn accept_booking(
        &self,
        request_id: Ulid,
        user_id: Ulid,
    ) -> Result<AllocationOutcome, EngineError> {
        let guard = self.lock_request(request_id).await?;
        if !guard.kind.is_specific() {
            return Err(EngineError::validation(
                "only specific-asset requests can be accepted as bookings",
            ));
        }
        if guard.status != RequestStatus::PendingAm {
            let from = guard.status;
            tracing::warn!("request {request_id}: cannot accept booking in {from}");
            return Err(EngineError::IllegalTransition {
                from,
                to: RequestStatus::AmApproved,
            });
        }
        let outcome = self.approve_locked(guard, Some(user_id)).await?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => outcome.status.as_str())
            .increment(1);
        Ok(outcome)
    }

    pub async fn cancel_request(
        &self,
        request_id: Ulid,
        actor_id: Option<Ulid>,
    ) -> Result<RequestStatus, EngineError> {
        self.update_request_status(request_id, RequestStatus::Cancelled, actor_id, None)
            .await
    }

    pub(super) async fn commit_transition(
        &self,
        txn: &mut Txn,
        to: RequestStatus,
        actor_id: Option<Ulid>,
        reason: Option<String>,
        units: Vec<BoundUnit>,
    ) -> Result<(), EngineError> {
        let Some(req) = txn.request.as_ref() else {
            return Err(EngineError::WalError("transition without request lock".into()));
        };
        let event = Event::RequestTransitioned {
            id: req.id,
            from: req.status,
            to,
            actor_id,
            reason,
            at: now_ms(),
            units,
        };
        self.persist_and_apply(txn, event).await
    }

    /// Cancel every still-active row of the request and move it to `to`.
    async fn revoke_locked(
        &self,
        guard: tokio::sync::OwnedRwLockWriteGuard<RequestState>,
        to: RequestStatus,
        actor_id: Option<Ulid>,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let bound = guard.bound_units();
        let mut txn = Txn::with_request(guard);
        txn.assets = self.lock_assets(bound.iter().map(|u| u.asset_id)).await?;
        let active = rows_in(&txn, &bound, |s| s.is_active());
        if !active.is_empty() {
            tracing::info!("revoking {} units", active.len());
        }
        self.commit_transition(&mut txn, to, actor_id, reason, active).await
    }

    async fn collect_locked(
        &self,
        guard: tokio::sync::OwnedRwLockWriteGuard<RequestState>,
        actor_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let bound = guard.bound_units();
        let mut txn = Txn::with_request(guard);
        txn.assets = self.lock_assets(bound.iter().map(|u| u.asset_id)).await?;
        let held = rows_in(&txn, &bound, |s| {
            matches!(s, BorrowStatus::Borrowed | BorrowStatus::Overdue)
        });
        self.commit_transition(&mut txn, RequestStatus::InUse, actor_id, None, held)
            .await
    }
}

/// The bound units whose ledger row currently satisfies `keep`.
pub(super) fn rows_in(
    txn: &Txn,
    bound: &[BoundUnit],
    keep: impl Fn(BorrowStatus) -> bool,
) -> Vec<BoundUnit> {
    bound
        .iter()
        .filter(|u| {
            txn.assets
                .get(&u.asset_id)
                .and_then(|a| a.index.get(u.borrowed_id))
                .is_some_and(|row| keep(row.status))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use RequestStatus::*;

    const ALL: [RequestStatus; 10] = [
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
    ];

    #[test]
    fn leader_approval_lands_in_pending_am() {
        assert_eq!(
            check_transition(PendingLeader, LeaderApproved).unwrap(),
            Transition::Move(PendingAm)
        );
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [LeaderRejected, Rejected, Cancelled, Returned] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(
                    matches!(check_transition(from, to), Err(EngineError::IllegalTransition { .. })),
                    "{from} -> {to} should be illegal"
                );
            }
        }
    }

    #[test]
    fn cancel_from_every_open_state() {
        // LEADER_APPROVED is an action, never a stored status.
        for from in [PendingLeader, PendingAm, AmApproved, InUse, Overdue] {
            assert!(!from.is_terminal());
            assert_eq!(
                check_transition(from, Cancelled).unwrap(),
                Transition::Revoke(Cancelled),
                "{from} -> CANCELLED"
            );
        }
    }

    #[test]
    fn overdue_not_caller_driven() {
        for from in ALL {
            assert!(check_transition(from, Overdue).is_err());
        }
    }

    #[test]
    fn skipping_the_leader_is_illegal() {
        assert!(check_transition(PendingLeader, AmApproved).is_err());
        assert!(check_transition(PendingLeader, InUse).is_err());
        assert!(check_transition(AmApproved, Returned).is_err());
    }

    #[test]
    fn return_from_in_use_or_overdue() {
        assert_eq!(check_transition(InUse, Returned).unwrap(), Transition::Return);
        assert_eq!(check_transition(Overdue, Returned).unwrap(), Transition::Return);
    }

    #[test]
    fn legal_transition_count() {
        let legal = ALL
            .iter()
            .flat_map(|f| ALL.iter().map(move |t| (*f, *t)))
            .filter(|(f, t)| check_transition(*f, *t).is_ok())
            .count();
        assert_eq!(legal, 12);
    }
}
