use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::config::EngineSettings;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Per-tenant engines, created on first use. Each tenant gets its own
/// Engine, WAL, promotion scheduler and compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: EngineSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: EngineSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
        }
    }

    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        let safe_name = sanitize(tenant);
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Holding the entry keeps two first connections from opening the
        // same WAL twice.
        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(
                    wal_path,
                    Arc::new(NotifyHub::new()),
                    self.settings.clone(),
                )?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reaper::run_reaper(
            engine.clone(),
            self.settings.sweep_interval,
        ));
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
        ));

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened tenant {tenant}");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

/// Strip anything that could escape the data directory.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JoinOutcome;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotline_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(name: &str) -> (TenantManager, PathBuf) {
        let dir = test_data_dir(name);
        (TenantManager::new(dir.clone(), EngineSettings::default()), dir)
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let (tm, _) = manager("isolation");
        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        let rid = Ulid::new();
        eng_a.create_resource(rid, None, 1).await.unwrap();
        eng_b.create_resource(rid, None, 1).await.unwrap();

        eng_a.join(rid, "alice").await.unwrap();

        // Same resource id, separate ledgers
        assert_eq!(eng_a.ledger(rid).await.unwrap().available(), 0);
        assert_eq!(eng_b.ledger(rid).await.unwrap().available(), 1);
        assert_eq!(eng_b.join(rid, "bob").await.unwrap(), JoinOutcome::Joined);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let (tm, dir) = manager("lazy");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        assert!(tm.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(tm.len(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let (tm, _) = manager("same_eng");
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let (tm, dir) = manager("sanitize");

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let (tm, _) = manager("name_too_long");
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_survives_reopen() {
        let (tm, dir) = manager("reopen");
        let rid = Ulid::new();
        {
            let eng = tm.get_or_create("db").unwrap();
            eng.create_resource(rid, Some("court".into()), 2).await.unwrap();
            eng.join(rid, "alice").await.unwrap();
        }

        let tm2 = TenantManager::new(dir, EngineSettings::default());
        let eng = tm2.get_or_create("db").unwrap();
        let info = eng.resource_info(rid).await.unwrap();
        assert_eq!(info.name.as_deref(), Some("court"));
        assert_eq!(info.ledger.confirmed, 1);
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let (tm, _) = manager("count_limit");
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
