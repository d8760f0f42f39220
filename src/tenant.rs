use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::Engine;
use crate::limits::{MAX_TENANT_NAME_LEN, MAX_TENANTS};
use crate::notify::NotifyHub;
use crate::observability::TENANTS_ACTIVE;
use crate::sweeper;

/// One engine per depot. The depot is the database name a client connects
/// with; each gets its own log file under `data_dir` plus its own sweeper
/// and compactor tasks.
pub struct TenantManager {
    depots: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    sweep_interval: Duration,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, sweep_interval: Duration) -> Self {
        Self {
            depots: DashMap::new(),
            data_dir,
            compact_threshold,
            sweep_interval,
        }
    }

    /// The depot's engine, opened (and its log replayed) on first use.
    pub fn get_or_create(&self, depot: &str) -> io::Result<Arc<Engine>> {
        if let Some(found) = self.depots.get(depot) {
            return Ok(Arc::clone(found.value()));
        }
        let wal_path = wal_path_for(&self.data_dir, depot)?;
        if self.depots.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        let engine = match self.depots.entry(depot.to_string()) {
            // Lost a race with another first connection.
            Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
                tokio::spawn(sweeper::run_sweeper(engine.clone(), self.sweep_interval));
                tokio::spawn(sweeper::run_compactor(engine.clone(), self.compact_threshold));
                slot.insert(engine.clone());
                engine
            }
        };
        let open = self.depots.len();
        metrics::gauge!(TENANTS_ACTIVE).set(open as f64);
        tracing::info!("depot {depot:?} opened ({open} open)");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.depots.len()
    }
}

/// Log file for a depot. Only alphanumerics, `_` and `-` survive so the
/// file always lands directly inside `data_dir`.
fn wal_path_for(data_dir: &Path, depot: &str) -> io::Result<PathBuf> {
    if depot.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let stem: String = depot
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    if stem.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("tenant name {depot:?} has no usable characters"),
        ));
    }
    Ok(data_dir.join(format!("{stem}.wal")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LedgerFilter;
    use ulid::Ulid;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("qm_test_tenant").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: &Path) -> TenantManager {
        TenantManager::new(dir.to_path_buf(), 1000, Duration::from_secs(120))
    }

    #[tokio::test]
    async fn depots_do_not_share_inventory() {
        let tm = manager(&scratch("isolation"));
        let north = tm.get_or_create("north").unwrap();
        let south = tm.get_or_create("south").unwrap();

        // Same ids on both sides.
        let (cat, unit) = (Ulid::new(), Ulid::new());
        for depot in [&north, &south] {
            depot.create_category(cat, "Laptop".into(), None).await.unwrap();
        }
        north.create_asset(unit, cat, "LAP-001".into(), None).await.unwrap();

        assert_eq!(north.list_assets(Some(cat)).await.unwrap().len(), 1);
        assert!(south.list_assets(Some(cat)).await.unwrap().is_empty());
        assert!(south.borrowed_assets(LedgerFilter::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_file_appears_on_first_connection() {
        let dir = scratch("lazy");
        let tm = manager(&dir);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

        tm.get_or_create("warehouse").unwrap();
        assert!(dir.join("warehouse.wal").exists());
        assert_eq!(tm.tenant_count(), 1);

        let again = tm.get_or_create("warehouse").unwrap();
        assert!(Arc::ptr_eq(&again, &tm.get_or_create("warehouse").unwrap()));
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn reopened_depot_replays_its_log() {
        let dir = scratch("restart");
        let cat = Ulid::new();
        {
            let depot = manager(&dir).get_or_create("av_room").unwrap();
            depot
                .create_category(cat, "Camera".into(), Some("AV".into()))
                .await
                .unwrap();
        }
        let depot = manager(&dir).get_or_create("av_room").unwrap();
        let cats = depot.list_categories();
        assert_eq!(cats.len(), 1);
        assert_eq!((cats[0].id, cats[0].asset_type.as_deref()), (cat, Some("AV")));
    }

    #[test]
    fn depot_names_cannot_escape_data_dir() {
        let root = Path::new("/srv/qm");
        assert_eq!(
            wal_path_for(root, "../../etc/passwd").unwrap(),
            root.join("etcpasswd.wal")
        );
        assert_eq!(wal_path_for(root, "it-dept_2").unwrap(), root.join("it-dept_2.wal"));
        assert!(wal_path_for(root, "../..").is_err());

        let long = "d".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = wal_path_for(root, &long).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[tokio::test]
    async fn depot_count_is_capped() {
        let tm = manager(&scratch("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("depot{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
