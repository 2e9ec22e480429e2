use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

type TenantSlot = Arc<OnceCell<Arc<Engine>>>;

/// Per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = database name from the pgwire connection.
///
/// The map only hands out slots; WAL replay runs inside the slot's
/// `OnceCell`, outside any map shard lock.
pub struct TenantManager {
    engines: DashMap<String, TenantSlot>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Tenant names become WAL file names verbatim, so only characters that
/// are safe in a path component are accepted. Rewriting a name instead
/// would let two tenants land on one file.
fn validate_tenant_name(tenant: &str) -> io::Result<()> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    if tenant.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    if let Some(bad) = tenant
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid character {bad:?} in tenant name"),
        ));
    }
    Ok(())
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub async fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let ready = self
            .engines
            .get(tenant)
            .and_then(|slot| slot.value().get().cloned());
        if let Some(engine) = ready {
            return Ok(engine);
        }
        validate_tenant_name(tenant)?;

        // Concurrent openers share the slot; exactly one of them replays.
        let slot = self.slot(tenant)?;
        let engine = slot
            .get_or_try_init(|| self.open_engine(tenant))
            .await?
            .clone();

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenant_count() as f64);
        Ok(engine)
    }

    fn slot(&self, tenant: &str) -> io::Result<TenantSlot> {
        if let Some(slot) = self.engines.get(tenant) {
            return Ok(slot.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }
        Ok(self.engines.entry(tenant.to_string()).or_default().value().clone())
    }

    async fn open_engine(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{tenant}.wal"));
        let engine = tokio::task::spawn_blocking(move || {
            Engine::new(wal_path, Arc::new(NotifyHub::new()))
        })
        .await
        .map_err(io::Error::other)??;
        let engine = Arc::new(engine);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!(tenant, "tenant opened");
        Ok(engine)
    }

    /// Tenants whose engine has finished opening.
    pub fn tenant_count(&self) -> usize {
        self.engines.iter().filter(|slot| slot.value().initialized()).count()
    }
}
