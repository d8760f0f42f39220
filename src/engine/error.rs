use ulid::Ulid;

use crate::model::{Ms, RequestStatus};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidWindow {
        start: Ms,
        end: Ms,
    },
    Validation(String),
    /// A selected unit is already committed over the window. Re-check and retry.
    Conflict(Ulid),
    QuantityNotMet {
        category_id: Ulid,
        required: u32,
        selected: u32,
    },
    /// Approval-time re-check of a specific unit failed.
    AssetUnavailable(Ulid),
    IllegalTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidWindow { .. } => "invalid_window",
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::QuantityNotMet { .. } => "quantity_not_met",
            EngineError::AssetUnavailable(_) => "asset_unavailable",
            EngineError::IllegalTransition { .. } => "illegal_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidWindow { start, end } => {
                write!(f, "invalid window [{start}, {end}): end must be after start")
            }
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Conflict(id) => {
                write!(f, "conflict: asset {id} is already committed in this window")
            }
            EngineError::QuantityNotMet {
                category_id,
                required,
                selected,
            } => write!(
                f,
                "quantity not met for category {category_id}: required {required}, selected {selected}"
            ),
            EngineError::AssetUnavailable(id) => write!(f, "asset unavailable: {id}"),
            EngineError::IllegalTransition { from, to } => {
                write!(f, "illegal transition: {from} -> {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
