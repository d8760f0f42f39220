use std::time::Duration;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Txn, WalCommand};

/// Attempts at a consistent compaction snapshot before giving up for now.
const COMPACT_ATTEMPTS: usize = 8;

fn check_label(value: &Option<String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    if let Some(v) = value
        && v.len() > max
    {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    pub async fn create_category(
        &self,
        id: Ulid,
        name: String,
        asset_type: Option<String>,
    ) -> Result<(), EngineError> {
        if self.categories.len() >= MAX_CATEGORIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many categories"));
        }
        if name.trim().is_empty() {
            return Err(EngineError::validation("category name is empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("category name too long"));
        }
        check_label(&asset_type, MAX_NAME_LEN, "asset type too long")?;
        if self.categories.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::CategoryCreated {
            id,
            name,
            asset_type,
        };
        self.persist_and_apply(&mut Txn::default(), event).await
    }

    pub async fn create_asset(
        &self,
        id: Ulid,
        category_id: Ulid,
        code: String,
        asset_type: Option<String>,
    ) -> Result<(), EngineError> {
        if self.assets.len() >= MAX_ASSETS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many assets"));
        }
        if code.trim().is_empty() {
            return Err(EngineError::validation("asset code is empty"));
        }
        if code.len() > MAX_CODE_LEN {
            return Err(EngineError::LimitExceeded("asset code too long"));
        }
        check_label(&asset_type, MAX_NAME_LEN, "asset type too long")?;
        if self.assets.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.categories.contains_key(&category_id) {
            return Err(EngineError::NotFound(category_id));
        }

        let event = Event::AssetCreated {
            id,
            category_id,
            code,
            asset_type,
        };
        self.persist_and_apply(&mut Txn::default(), event).await
    }

    /// Explicit unit status change: loss, retirement, reactivation.
    ///
    /// PREPARING and IN_USE belong to the allocation flow and are refused
    /// here. A unit that still holds active rows cannot go back to AVAILABLE.
    pub async fn set_asset_status(&self, id: Ulid, status: AssetStatus) -> Result<(), EngineError> {
        if matches!(status, AssetStatus::Preparing | AssetStatus::InUse) {
            return Err(EngineError::validation(format!(
                "{} is set by allocation and collection only",
                status.as_str()
            )));
        }
        let mut txn = Txn {
            request: None,
            assets: self.lock_assets([id]).await?,
        };
        let asset = txn.assets.get(&id).ok_or(EngineError::NotFound(id))?;
        if asset.status == status {
            return Ok(());
        }
        if status == AssetStatus::Available && asset.index.has_active() {
            return Err(EngineError::validation(format!(
                "asset {id} is still committed to a request"
            )));
        }
        tracing::info!("asset {id}: {} -> {}", asset.status.as_str(), status.as_str());
        self.persist_and_apply(&mut txn, Event::AssetStatusChanged { id, status })
            .await
    }

    /// Rewrite the log as restore events describing the current state.
    /// Returns `false` when writers kept the state busy and nothing was done.
    pub async fn compact_wal(&self) -> Result<bool, EngineError> {
        for attempt in 0..COMPACT_ATTEMPTS {
            let gate = self.commit_gate.write().await;
            let Some(events) = self.snapshot_events() else {
                drop(gate);
                tokio::time::sleep(Duration::from_millis(5 << attempt)).await;
                continue;
            };
            let count = events.len();

            let (tx, rx) = oneshot::channel();
            self.wal_tx
                .send(WalCommand::Compact {
                    events,
                    response: tx,
                })
                .await
                .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
            rx.await
                .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
                .map_err(|e| EngineError::WalError(e.to_string()))?;
            drop(gate);

            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            tracing::info!("compacted WAL to {count} events");
            return Ok(true);
        }
        tracing::debug!("compaction skipped: state busy");
        Ok(false)
    }

    /// Restore events for the whole tenant, or `None` if some entity is
    /// locked right now.
    fn snapshot_events(&self) -> Option<Vec<Event>> {
        let mut events = Vec::with_capacity(
            self.categories.len() + self.assets.len() + self.requests.len(),
        );
        for cat in self.categories.iter() {
            events.push(Event::CategoryCreated {
                id: cat.id,
                name: cat.name.clone(),
                asset_type: cat.asset_type.clone(),
            });
        }
        for entry in self.assets.iter() {
            let asset = entry.value().try_read().ok()?;
            events.push(Event::AssetRestored {
                id: asset.id,
                category_id: asset.category_id,
                code: asset.code.clone(),
                asset_type: asset.asset_type.clone(),
                status: asset.status,
                intervals: asset.index.iter().cloned().collect(),
            });
        }
        for entry in self.requests.iter() {
            let request = entry.value().try_read().ok()?;
            events.push(Event::RequestRestored {
                request: request.clone(),
            });
        }
        Some(events)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
