use ulid::Ulid;

use crate::model::{BorrowInterval, BorrowStatus, Ms, Span};

/// Per-unit interval list.
///
/// Rows still holding the unit (BORROWED/IN_USE/OVERDUE) live in `active`,
/// sorted by `span.start`. A unit is rarely committed to more than a handful
/// of overlapping requests, so a sorted `Vec` with a binary-searched right
/// bound beats a tree here. Released rows (RETURNED/CANCELLED) move to
/// `history`, which only the ledger reads.
#[derive(Debug, Clone, Default)]
pub struct IntervalIndex {
    active: Vec<BorrowInterval>,
    history: Vec<BorrowInterval>,
}

impl IntervalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, active and released.
    pub fn len(&self) -> usize {
        self.active.len() + self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.history.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Active rows in start order, then released rows in release order.
    pub fn iter(&self) -> impl Iterator<Item = &BorrowInterval> {
        self.active.iter().chain(self.history.iter())
    }

    pub fn active(&self) -> impl Iterator<Item = &BorrowInterval> {
        self.active.iter()
    }

    pub fn get(&self, id: Ulid) -> Option<&BorrowInterval> {
        self.iter().find(|i| i.id == id)
    }

    /// Mutable access to an active row. Released rows are frozen.
    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut BorrowInterval> {
        self.active.iter_mut().find(|i| i.id == id)
    }

    /// Insert keeping `active` sorted by span.start; released rows go
    /// straight to history.
    pub fn insert(&mut self, interval: BorrowInterval) {
        if !interval.status.is_active() {
            self.history.push(interval);
            return;
        }
        let pos = self
            .active
            .partition_point(|i| i.span.start <= interval.span.start);
        self.active.insert(pos, interval);
    }

    /// Move an active row to `status`, bumping its version. Returns false if
    /// no active row has this id.
    pub fn set_status(&mut self, id: Ulid, status: BorrowStatus) -> bool {
        match self.get_mut(id) {
            Some(row) => {
                row.status = status;
                row.version += 1;
                true
            }
            None => false,
        }
    }

    /// Take an active row out of the overlap set, closing it as RETURNED or
    /// CANCELLED. The row stays readable through `get` and `iter`.
    pub fn release(&mut self, id: Ulid, status: BorrowStatus, at: Option<Ms>) -> bool {
        debug_assert!(!status.is_active());
        let Some(pos) = self.active.iter().position(|i| i.id == id) else {
            return false;
        };
        let mut row = self.active.remove(pos);
        row.status = status;
        row.version += 1;
        if status == BorrowStatus::Returned {
            row.returned_at = at;
        }
        self.history.push(row);
        true
    }

    /// Active intervals intersecting `window`.
    pub fn overlapping(&self, window: &Span) -> impl Iterator<Item = &BorrowInterval> {
        // Everything at index >= right_bound starts at or after window.end.
        let right_bound = self.active.partition_point(|i| i.span.start < window.end);
        self.active[..right_bound]
            .iter()
            .filter(move |i| i.effective_end() > window.start)
    }

    pub fn overlaps(&self, window: &Span) -> Vec<BorrowInterval> {
        self.overlapping(window).cloned().collect()
    }

    pub fn is_free(&self, window: &Span) -> bool {
        self.overlapping(window).next().is_none()
    }

    /// Earliest moment the unit stops being blocked for `window`: the minimum
    /// effective end among overlapping intervals. `None` when already free.
    pub fn next_free(&self, window: &Span) -> Option<Ms> {
        self.overlapping(window).map(|i| i.effective_end()).min()
    }

    /// Active rows whose end has passed `now` and are not yet overdue.
    pub fn overdue_candidates(&self, now: Ms) -> impl Iterator<Item = &BorrowInterval> {
        self.active.iter().filter(move |i| {
            matches!(i.status, BorrowStatus::Borrowed | BorrowStatus::InUse) && i.span.end < now
        })
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// True if no two active intervals overlap and every row sits in the
    /// list its status belongs to.
    pub fn is_consistent(&self) -> bool {
        self.active.iter().all(|i| i.status.is_active())
            && self.history.iter().all(|i| !i.status.is_active())
            && self
                .active
                .windows(2)
                .all(|w| w[0].effective_end() <= w[1].span.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(start: Ms, end: Ms, status: BorrowStatus) -> BorrowInterval {
        BorrowInterval {
            id: Ulid::new(),
            asset_id: Ulid::new(),
            request_id: Ulid::new(),
            requester_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            returned_at: None,
            version: 0,
        }
    }

    #[test]
    fn insert_keeps_start_order() {
        let mut idx = IntervalIndex::new();
        idx.insert(row(300, 400, BorrowStatus::Borrowed));
        idx.insert(row(100, 200, BorrowStatus::Borrowed));
        idx.insert(row(200, 300, BorrowStatus::InUse));
        let starts: Vec<Ms> = idx.iter().map(|i| i.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut idx = IntervalIndex::new();
        idx.insert(row(100, 200, BorrowStatus::Borrowed));
        idx.insert(row(450, 600, BorrowStatus::Borrowed));
        idx.insert(row(1000, 1100, BorrowStatus::Borrowed));
        let hits = idx.overlaps(&Span::new(500, 800));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn abutting_interval_does_not_overlap() {
        let mut idx = IntervalIndex::new();
        idx.insert(row(100, 200, BorrowStatus::InUse));
        assert!(idx.is_free(&Span::new(200, 300)));
        assert!(idx.is_free(&Span::new(0, 100)));
        assert!(!idx.is_free(&Span::new(199, 300)));
    }

    #[test]
    fn historical_rows_ignored() {
        let mut idx = IntervalIndex::new();
        idx.insert(row(100, 200, BorrowStatus::Returned));
        idx.insert(row(100, 200, BorrowStatus::Cancelled));
        assert!(idx.is_free(&Span::new(0, 1000)));
        assert_eq!(idx.next_free(&Span::new(0, 1000)), None);
        assert_eq!((idx.len(), idx.active_len()), (2, 0));
    }

    #[test]
    fn next_free_is_min_end_of_overlaps() {
        let mut idx = IntervalIndex::new();
        idx.insert(row(100, 500, BorrowStatus::Borrowed));
        idx.insert(row(600, 700, BorrowStatus::Borrowed));
        assert_eq!(idx.next_free(&Span::new(400, 650)), Some(500));
        assert_eq!(idx.next_free(&Span::new(650, 900)), Some(700));
        assert_eq!(idx.next_free(&Span::new(700, 900)), None);
    }

    #[test]
    fn overdue_row_blocks_until_returned() {
        let mut idx = IntervalIndex::new();
        let r = row(100, 200, BorrowStatus::Overdue);
        idx.insert(r);
        assert!(!idx.is_free(&Span::new(5_000, 6_000)));
        assert_eq!(idx.next_free(&Span::new(5_000, 6_000)), Some(Ms::MAX));
    }

    #[test]
    fn set_status_bumps_version() {
        let mut idx = IntervalIndex::new();
        let r = row(100, 200, BorrowStatus::Borrowed);
        let id = r.id;
        idx.insert(r);
        assert!(idx.set_status(id, BorrowStatus::Overdue));
        assert_eq!(idx.get(id).unwrap().version, 1);
        assert!(!idx.set_status(Ulid::new(), BorrowStatus::Overdue));
    }

    #[test]
    fn overdue_candidates_strictly_past_end() {
        let mut idx = IntervalIndex::new();
        idx.insert(row(100, 200, BorrowStatus::InUse));
        idx.insert(row(100, 300, BorrowStatus::Borrowed));
        idx.insert(row(100, 150, BorrowStatus::Returned));
        let ids: Vec<Ms> = idx.overdue_candidates(200).map(|i| i.span.end).collect();
        assert!(ids.is_empty()); // end == now is not yet overdue
        let ids: Vec<Ms> = idx.overdue_candidates(250).map(|i| i.span.end).collect();
        assert_eq!(ids, vec![200]);
    }

    #[test]
    fn released_row_leaves_overlap_set_but_stays_readable() {
        let mut idx = IntervalIndex::new();
        let r = row(100, 200, BorrowStatus::InUse);
        let id = r.id;
        idx.insert(r);
        idx.insert(row(300, 400, BorrowStatus::Borrowed));
        assert!(!idx.is_free(&Span::new(150, 160)));

        assert!(idx.release(id, BorrowStatus::Returned, Some(180)));
        assert!(idx.is_free(&Span::new(150, 160)));
        assert_eq!(idx.active_len(), 1);
        assert_eq!(idx.len(), 2);
        let back = idx.get(id).unwrap();
        assert_eq!((back.status, back.returned_at, back.version), (BorrowStatus::Returned, Some(180), 1));
        assert!(idx.get_mut(id).is_none());
        assert!(!idx.release(id, BorrowStatus::Cancelled, None));
        assert!(idx.is_consistent());
    }

    #[test]
    fn released_rows_do_not_count_as_active() {
        let mut idx = IntervalIndex::new();
        for i in 0..1_000 {
            let r = row(i * 10, i * 10 + 5, BorrowStatus::Borrowed);
            let id = r.id;
            idx.insert(r);
            idx.release(id, BorrowStatus::Returned, Some(i * 10 + 5));
        }
        assert!(!idx.has_active());
        assert_eq!(idx.active_len(), 0);
        assert_eq!(idx.len(), 1_000);
        assert_eq!(idx.overdue_candidates(Ms::MAX).count(), 0);
    }

    #[test]
    fn consistency_check_detects_overlap() {
        let mut idx = IntervalIndex::new();
        idx.insert(row(100, 200, BorrowStatus::Borrowed));
        idx.insert(row(200, 300, BorrowStatus::InUse));
        idx.insert(row(150, 250, BorrowStatus::Cancelled));
        assert!(idx.is_consistent());
        assert_eq!(idx.active_len(), 2);
        idx.insert(row(250, 350, BorrowStatus::Borrowed));
        assert!(!idx.is_consistent());
    }
}
