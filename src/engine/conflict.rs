use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Reject empty/inverted windows and anything outside the supported range.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidWindow { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(Span::new(start, end))
}

/// Commit-time re-check for one unit: it must be selectable, have room for
/// another active row, and hold no active interval overlapping `span`.
pub(crate) fn check_unit_free(asset: &AssetState, span: &Span) -> Result<(), EngineError> {
    if !asset.status.is_selectable() {
        return Err(EngineError::Conflict(asset.id));
    }
    if asset.index.active_len() >= MAX_INTERVALS_PER_ASSET {
        return Err(EngineError::LimitExceeded("too many active bookings on asset"));
    }
    if let Some(blocking) = asset.index.overlapping(span).next() {
        tracing::debug!(
            "asset {} blocked by {} over [{}, {})",
            asset.id,
            blocking.id,
            blocking.span.start,
            blocking.span.end
        );
        return Err(EngineError::Conflict(asset.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn zero_length_window_rejected() {
        assert!(matches!(
            validate_span(1000, 1000),
            Err(EngineError::InvalidWindow { start: 1000, end: 1000 })
        ));
        assert!(matches!(
            validate_span(2000, 1000),
            Err(EngineError::InvalidWindow { .. })
        ));
        assert_eq!(validate_span(1000, 1001).unwrap(), Span::new(1000, 1001));
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(matches!(
            validate_span(-5, 10),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_span(0, MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn lost_unit_never_free() {
        let mut asset = AssetState::new(Ulid::new(), Ulid::new(), "X-1".into(), None);
        asset.status = AssetStatus::Lost;
        assert!(matches!(
            check_unit_free(&asset, &Span::new(0, 10)),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn abutting_booking_is_free() {
        let mut asset = AssetState::new(Ulid::new(), Ulid::new(), "X-1".into(), None);
        asset.index.insert(BorrowInterval {
            id: Ulid::new(),
            asset_id: asset.id,
            request_id: Ulid::new(),
            requester_id: Ulid::new(),
            span: Span::new(0, 100),
            status: BorrowStatus::Borrowed,
            returned_at: None,
            version: 0,
        });
        assert!(check_unit_free(&asset, &Span::new(100, 200)).is_ok());
        assert!(check_unit_free(&asset, &Span::new(99, 200)).is_err());
    }

    fn row_at(asset: &AssetState, start: Ms, status: BorrowStatus) -> BorrowInterval {
        BorrowInterval {
            id: Ulid::new(),
            asset_id: asset.id,
            request_id: Ulid::new(),
            requester_id: Ulid::new(),
            span: Span::new(start, start + 10),
            status,
            returned_at: None,
            version: 0,
        }
    }

    #[test]
    fn long_history_does_not_exhaust_the_unit() {
        let mut asset = AssetState::new(Ulid::new(), Ulid::new(), "X-1".into(), None);
        for i in 0..MAX_INTERVALS_PER_ASSET as Ms {
            let status = if i % 2 == 0 { BorrowStatus::Returned } else { BorrowStatus::Cancelled };
            asset.index.insert(row_at(&asset, i * 10, status));
        }
        assert_eq!(asset.index.len(), MAX_INTERVALS_PER_ASSET);
        assert!(check_unit_free(&asset, &Span::new(0, 100)).is_ok());
    }

    #[test]
    fn active_rows_are_capped() {
        let mut asset = AssetState::new(Ulid::new(), Ulid::new(), "X-1".into(), None);
        for i in 0..MAX_INTERVALS_PER_ASSET as Ms {
            asset.index.insert(row_at(&asset, i * 10, BorrowStatus::Borrowed));
        }
        let past_the_end = MAX_INTERVALS_PER_ASSET as Ms * 10;
        assert!(matches!(
            check_unit_free(&asset, &Span::new(past_the_end, past_the_end + 10)),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
