//! Configuration store and hot reload
//!
//! Holds the active service settings and tenant set as one immutable
//! snapshot behind an atomic pointer. Sessions take a snapshot per
//! transaction, so a reload completing mid-transaction never mixes old
//! and new configuration within one resolution-to-delivery path.

use arc_swap::ArcSwap;
use smtprelay_common::config::{
    load_service_config, load_tenant_dir, Delivery, ServiceConfig, Tenant,
};
use smtprelay_common::RelayError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// One consistent configuration snapshot
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub service: ServiceConfig,
    pub tenants: Vec<Tenant>,
}

impl LoadedConfig {
    /// Cross-document validation, applied to the set as a unit.
    pub fn validate(&self) -> Result<(), RelayError> {
        for tenant in &self.tenants {
            tenant.validate()?;
            if let Delivery::Smtp(smtp) = &tenant.delivery {
                if self.service.relay_server(&smtp.smtp_server).is_none() {
                    return Err(RelayError::Config(format!(
                        "tenant {} references unknown smtpServer: {}",
                        tenant.name, smtp.smtp_server
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether any tenant restricts by IP range. When none does, the
    /// connect-time tenant-set-wide IP gate is skipped entirely.
    pub fn any_tenant_ip_ranges(&self) -> bool {
        self.tenants.iter().any(|t| !t.routing.ip_ranges.is_empty())
    }
}

/// Source of truth read by every session, swapped whole on reload
#[derive(Debug)]
pub struct ConfigStore {
    service_path: PathBuf,
    tenants_dir: PathBuf,
    current: ArcSwap<LoadedConfig>,
}

impl ConfigStore {
    /// Load the initial configuration from `config.json` and
    /// `tenants.d/` under `root`.
    pub fn open(root: &Path) -> Result<Self, RelayError> {
        let service_path = root.join("config.json");
        let tenants_dir = root.join("tenants.d");
        let initial = Self::load(&service_path, &tenants_dir)?;
        info!(
            tenants = initial.tenants.len(),
            port = initial.service.effective_port(),
            "configuration loaded"
        );
        Ok(Self {
            service_path,
            tenants_dir,
            current: ArcSwap::from_pointee(initial),
        })
    }

    /// Current snapshot; cheap, lock-free, taken once per transaction.
    pub fn snapshot(&self) -> Arc<LoadedConfig> {
        self.current.load_full()
    }

    /// Re-read and re-validate the full configuration, then swap it in
    /// as a unit. A failing reload leaves the active snapshot
    /// untouched and reports the error. Safe to call at any time,
    /// including concurrently with active sessions.
    pub fn reload(&self) -> Result<Arc<LoadedConfig>, RelayError> {
        let fresh = Self::load(&self.service_path, &self.tenants_dir)?;
        let names: Vec<&str> = fresh.tenants.iter().map(|t| t.name.as_str()).collect();
        info!(count = names.len(), tenants = ?names, "tenants reloaded");
        let fresh = Arc::new(fresh);
        self.current.store(fresh.clone());
        Ok(fresh)
    }

    fn load(service_path: &Path, tenants_dir: &Path) -> Result<LoadedConfig, RelayError> {
        let service = load_service_config(service_path)?;
        let tenants = load_tenant_dir(tenants_dir)?;
        let loaded = LoadedConfig { service, tenants };
        loaded.validate()?;
        Ok(loaded)
    }
}

/// Trigger handle for the reload listener; the administrative layer
/// holds one and fires it after any tenant or service mutation
#[derive(Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<()>,
}

impl ReloadHandle {
    /// Request a reload. Coalesces with an already-pending request.
    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Spawn the task that serves reload requests for `store`.
pub fn spawn_reload_listener(store: Arc<ConfigStore>) -> ReloadHandle {
    let (tx, mut rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            if let Err(e) = store.reload() {
                error!(error = %e, "configuration reload failed, keeping active config");
            }
        }
    });
    ReloadHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, content: &str) {
        fs::write(path, content).unwrap();
    }

    fn scratch_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("smtprelay-store-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(root.join("tenants.d")).unwrap();
        root
    }

    const SERVICE: &str = r#"{
        "listenPort": 2525,
        "hostName": "relay.test",
        "smtpServers": [
            { "naam": "upstream", "adres": "127.0.0.1", "poort": 2526 }
        ]
    }"#;

    const TENANT: &str = r#"{
        "name": "acme",
        "routing": { "senderDomains": ["acme.example"] },
        "delivery": { "method": "smtp", "smtp": { "smtpServer": "upstream" } }
    }"#;

    #[test]
    fn test_open_and_snapshot() {
        let root = scratch_root();
        write(&root.join("config.json"), SERVICE);
        write(&root.join("tenants.d/acme.json"), TENANT);

        let store = ConfigStore::open(&root).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.service.effective_port(), 2525);
        assert_eq!(snapshot.tenants.len(), 1);
        assert!(!snapshot.any_tenant_ip_ranges());

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_failed_reload_keeps_active_config() {
        let root = scratch_root();
        write(&root.join("config.json"), SERVICE);
        write(&root.join("tenants.d/acme.json"), TENANT);

        let store = ConfigStore::open(&root).unwrap();
        let before = store.snapshot();

        write(&root.join("tenants.d/acme.json"), "{ not json");
        assert!(store.reload().is_err());

        let after = store.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.tenants.len(), 1);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_reload_swaps_whole_snapshot() {
        let root = scratch_root();
        write(&root.join("config.json"), SERVICE);
        write(&root.join("tenants.d/acme.json"), TENANT);

        let store = ConfigStore::open(&root).unwrap();
        let before = store.snapshot();

        write(
            &root.join("tenants.d/beta.json"),
            r#"{
                "name": "beta",
                "routing": { "senderDomains": ["beta.example"], "priority": 5 },
                "delivery": { "method": "smtp", "smtp": { "smtpServer": "upstream" } }
            }"#,
        );
        store.reload().unwrap();

        let after = store.snapshot();
        assert_eq!(after.tenants.len(), 2);
        // The snapshot taken before the reload is untouched.
        assert_eq!(before.tenants.len(), 1);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_unknown_relay_reference_rejected() {
        let root = scratch_root();
        write(&root.join("config.json"), r#"{ "smtpServers": [] }"#);
        write(&root.join("tenants.d/acme.json"), TENANT);

        let err = ConfigStore::open(&root).unwrap_err();
        assert!(err.to_string().contains("unknown smtpServer"));

        let _ = fs::remove_dir_all(root);
    }
}
