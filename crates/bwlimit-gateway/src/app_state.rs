//! Shared application state.
//!
//! Built once at startup and handed to every handler; nothing here is a
//! process-wide global.

use std::collections::HashSet;
use std::sync::Arc;

use bwlimit_core::error::Result;

use crate::bandwidth::{BulkOutcome, GatewayManager};
use crate::config::GatewayConfig;
use crate::obs::metrics::GatewayMetrics;
use crate::policy::{NoAliases, PolicyStore};
use crate::session::{ContextDiscovery, SessionDirectory};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cfg: GatewayConfig,
    directory: Arc<SessionDirectory>,
    manager: Arc<GatewayManager>,
    metrics: Arc<GatewayMetrics>,
    bypass_users: HashSet<String>,
}

impl AppState {
    /// Build application state. Fails if the policy file exists but cannot
    /// be read or parsed.
    pub fn new(cfg: GatewayConfig) -> Result<Self> {
        let metrics = Arc::new(GatewayMetrics::default());
        let directory = Arc::new(SessionDirectory::new());

        // No session is live yet, so alias keys all start unresolved.
        let policy = Arc::new(PolicyStore::open(
            &cfg.shaping.policy_path,
            cfg.shaping.initial_default_limit,
            &NoAliases,
        )?);
        let manager = Arc::new(GatewayManager::new(
            policy,
            ContextDiscovery,
            cfg.shaping.check_interval(),
            Arc::clone(&metrics),
        ));
        let bypass_users = cfg.shaping.bypass_users.iter().cloned().collect();

        Ok(Self {
            inner: Arc::new(AppStateInner {
                cfg,
                directory,
                manager,
                metrics,
                bypass_users,
            }),
        })
    }

    pub fn cfg(&self) -> &GatewayConfig {
        &self.inner.cfg
    }

    pub fn directory(&self) -> Arc<SessionDirectory> {
        Arc::clone(&self.inner.directory)
    }

    pub fn manager(&self) -> Arc<GatewayManager> {
        Arc::clone(&self.inner.manager)
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        self.inner.manager.policy()
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn is_bypass(&self, alias: Option<&str>) -> bool {
        alias.is_some_and(|a| self.inner.bypass_users.contains(a))
    }

    pub fn is_draining(&self) -> bool {
        self.inner.metrics.is_draining()
    }

    /// Stop admitting sessions and remove every shaping stage.
    pub fn begin_shutdown(&self) {
        self.inner.metrics.set_draining();
        self.inner.manager.shutdown();
    }

    /// Re-read the policy file (aliases resolved against live sessions) and
    /// retune every active connection.
    pub fn reload_policy(&self) -> Result<BulkOutcome> {
        self.inner.manager.reload(self.inner.directory.as_ref())
    }

    /// Gauges computed at scrape time.
    pub fn metrics_extra(&self) -> Vec<(&'static str, u64)> {
        vec![(
            "bwlimit_shaped_connections",
            self.inner.manager.installed_count() as u64,
        )]
    }
}
