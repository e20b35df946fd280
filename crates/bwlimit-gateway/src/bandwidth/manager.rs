//! Bandwidth manager.
//!
//! Bookkeeping (`stages`, `active`) lives in `DashMap`s and is visible to
//! every caller as soon as an operation returns. The pipeline effect of an
//! operation is marshalled onto the connection's own context and lands
//! shortly after.
//!
//! Invariant: at most one stage entry per `ConnectionId`; `install` replaces.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use bwlimit_core::error::{BwError, Result};
use bwlimit_core::{BandwidthLimit, TrafficCounter};

use crate::obs::metrics::GatewayMetrics;
use crate::pipeline::{AttachablePipeline, ConnectionDiscovery, OutboundStage};
use crate::policy::{AliasResolver, PolicyStore};
use crate::session::{ConnectionId, ContextDiscovery};

/// Pipeline slot name of the shaping stage.
pub const STAGE_NAME: &str = "bandwidth_limiter";

/// Manager wired to live connection contexts.
pub type GatewayManager = BandwidthManager<ContextDiscovery>;

struct StageEntry {
    pipeline: Arc<dyn AttachablePipeline>,
    counter: Arc<TrafficCounter>,
    limit: BandwidthLimit,
}

struct ActiveConn<H> {
    handle: H,
    bypass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapingStatus {
    Limited,
    Bypassed,
    NotInstalled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub conn_id: ConnectionId,
    /// Limit held by the installed stage, else the effective policy limit.
    pub limit_bps: u64,
    pub current_rate_bps: Option<u64>,
    pub utilization_pct: Option<f64>,
    pub current_read_rate_bps: Option<u64>,
    /// Wire bytes written through the current stage (`None` without one).
    pub total_written_bytes: Option<u64>,
    pub total_read_bytes: Option<u64>,
    pub status: ShapingStatus,
}

/// Result of a bulk reconfigure. One failure never aborts the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub reconfigured: usize,
    pub failed: Vec<ConnectionId>,
}

pub struct BandwidthManager<D: ConnectionDiscovery> {
    policy: Arc<PolicyStore>,
    discovery: D,
    stages: DashMap<ConnectionId, StageEntry>,
    active: DashMap<ConnectionId, ActiveConn<D::Handle>>,
    check_interval: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl<D: ConnectionDiscovery> BandwidthManager<D> {
    pub fn new(
        policy: Arc<PolicyStore>,
        discovery: D,
        check_interval: Duration,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            policy,
            discovery,
            stages: DashMap::new(),
            active: DashMap::new(),
            check_interval,
            metrics,
        }
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    // ---- lifecycle ----

    /// A connection is up. Bypassed connections are tracked but never shaped.
    pub fn on_connection_established(
        &self,
        id: ConnectionId,
        handle: D::Handle,
        bypass: bool,
    ) -> Result<()> {
        self.active.insert(
            id,
            ActiveConn {
                handle: handle.clone(),
                bypass,
            },
        );
        if bypass {
            tracing::info!(conn_id = %id, "connection bypasses shaping");
            return Ok(());
        }
        self.install(id, &handle)
    }

    pub fn on_connection_closed(&self, id: &ConnectionId) {
        self.active.remove(id);
        self.uninstall(id);
    }

    pub fn is_active(&self, id: &ConnectionId) -> bool {
        self.active.contains_key(id)
    }

    // ---- stage management ----

    /// Attach a fresh stage at the effective limit, replacing any existing one.
    /// On failure nothing is recorded.
    pub fn install(&self, id: ConnectionId, handle: &D::Handle) -> Result<()> {
        let result = self.try_install(id, handle);
        let label = if result.is_ok() { "ok" } else { "unavailable" };
        self.metrics.stage_installs.inc(&[("result", label)]);
        if let Err(e) = &result {
            tracing::warn!(conn_id = %id, error = %e, "stage install failed");
        }
        result
    }

    fn try_install(&self, id: ConnectionId, handle: &D::Handle) -> Result<()> {
        let pipeline = self.discovery.resolve_outbound(handle).ok_or_else(|| {
            BwError::ConnectionUnavailable(format!("no outbound path for connection {id}"))
        })?;

        let limit = self.policy.effective(&id);
        let stage = OutboundStage::new(
            limit.bytes_per_sec(),
            0,
            self.check_interval,
            tokio::time::Instant::now().into_std(),
        )?;
        let counter = stage.counter();
        pipeline.insert_stage(STAGE_NAME, stage)?;

        let key = pipeline.pipeline_key();
        let previous = self.stages.insert(
            id,
            StageEntry {
                pipeline,
                counter,
                limit,
            },
        );
        match previous {
            Some(old) if old.pipeline.pipeline_key() != key => {
                let _ = old.pipeline.remove_stage(STAGE_NAME);
                tracing::info!(conn_id = %id, limit_bps = limit.bytes_per_sec(), "stage moved to new pipeline");
            }
            Some(_) => {
                tracing::info!(conn_id = %id, limit_bps = limit.bytes_per_sec(), "stage replaced");
            }
            None => {
                tracing::info!(conn_id = %id, limit_bps = limit.bytes_per_sec(), "stage installed");
            }
        }
        Ok(())
    }

    /// Detach and forget the stage. Detach errors are ignored: the pipeline
    /// is already gone. Returns whether a stage existed.
    pub fn uninstall(&self, id: &ConnectionId) -> bool {
        let Some((_, entry)) = self.stages.remove(id) else {
            return false;
        };
        if let Err(e) = entry.pipeline.remove_stage(STAGE_NAME) {
            tracing::debug!(conn_id = %id, error = %e, "stage detach skipped");
        }
        self.metrics.stage_uninstalls.inc(&[]);
        tracing::info!(conn_id = %id, "stage uninstalled");
        true
    }

    /// Push the effective limit into the live stage, or install one if the
    /// connection is active but has none.
    pub fn reconfigure(&self, id: &ConnectionId) -> Result<()> {
        let limit = self.policy.effective(id);
        let pipeline = self.stages.get_mut(id).map(|mut e| {
            e.limit = limit;
            Arc::clone(&e.pipeline)
        });

        let Some(pipeline) = pipeline else {
            return self.heal(id);
        };

        let pushed = pipeline
            .set_write_limit(STAGE_NAME, limit.bytes_per_sec())
            .and_then(|_| pipeline.set_read_limit(STAGE_NAME, 0));
        match pushed {
            Ok(()) => {
                self.metrics.reconfigures.inc(&[("result", "ok")]);
                tracing::debug!(conn_id = %id, limit_bps = limit.bytes_per_sec(), "stage reconfigured");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(conn_id = %id, error = %e, "stage reconfigure failed, reinstalling");
                self.stages.remove(id);
                self.heal(id)
            }
        }
    }

    fn heal(&self, id: &ConnectionId) -> Result<()> {
        let target = self
            .active
            .get(id)
            .map(|a| (a.handle.clone(), a.bypass));
        let result = match target {
            Some((_, true)) => return Ok(()),
            Some((handle, false)) => self.install(*id, &handle).and_then(|_| {
                // The connection may have closed while the stage was attached.
                if self.active.contains_key(id) {
                    return Ok(());
                }
                self.uninstall(id);
                Err(BwError::ConnectionUnavailable(format!(
                    "connection {id} closed during reinstall"
                )))
            }),
            None => Err(BwError::ConnectionUnavailable(format!(
                "connection {id} is not active"
            ))),
        };
        let label = if result.is_ok() { "healed" } else { "failed" };
        self.metrics.reconfigures.inc(&[("result", label)]);
        result
    }

    // ---- lookups ----

    pub fn effective_limit(&self, id: &ConnectionId) -> BandwidthLimit {
        self.policy.effective(id)
    }

    /// Last-window write rate in bytes/s. `None` without a stage or before
    /// its first window completes.
    pub fn current_rate(&self, id: &ConnectionId) -> Option<u64> {
        self.stages.get(id).and_then(|e| e.counter.current_write_rate())
    }

    /// Limit the installed stage was last given.
    pub fn configured_limit(&self, id: &ConnectionId) -> Option<BandwidthLimit> {
        self.stages.get(id).map(|e| e.limit)
    }

    pub fn is_installed(&self, id: &ConnectionId) -> bool {
        self.stages.contains_key(id)
    }

    pub fn installed_count(&self) -> usize {
        self.stages.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn info(&self, id: &ConnectionId) -> ConnectionInfo {
        let configured = self.configured_limit(id);
        let limit = configured.unwrap_or_else(|| self.effective_limit(id));
        let counter = self.stages.get(id).map(|e| Arc::clone(&e.counter));
        let rate = counter.as_ref().and_then(|c| c.current_write_rate());
        let status = if configured.is_some() {
            ShapingStatus::Limited
        } else if self.active.get(id).map(|a| a.bypass).unwrap_or(false) {
            ShapingStatus::Bypassed
        } else {
            ShapingStatus::NotInstalled
        };
        ConnectionInfo {
            conn_id: *id,
            limit_bps: limit.bytes_per_sec(),
            current_rate_bps: rate,
            utilization_pct: rate.map(|r| r as f64 * 100.0 / limit.bytes_per_sec() as f64),
            current_read_rate_bps: counter.as_ref().and_then(|c| c.current_read_rate()),
            total_written_bytes: counter.as_ref().map(|c| c.cumulative_written()),
            total_read_bytes: counter.as_ref().map(|c| c.cumulative_read()),
            status,
        }
    }

    /// Every active connection, ordered by id.
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut ids = self.active_ids();
        ids.sort();
        ids.iter().map(|id| self.info(id)).collect()
    }

    fn active_ids(&self) -> Vec<ConnectionId> {
        self.active.iter().map(|r| *r.key()).collect()
    }

    // ---- policy mutations ----

    /// Store (and persist) an override; retune the connection if active.
    ///
    /// A persistence failure keeps the in-memory override and is returned
    /// after the live stage has been updated.
    pub fn set_override(&self, id: ConnectionId, limit: BandwidthLimit) -> Result<()> {
        let persisted = self.policy.set(id, limit);
        self.note_persist(&persisted);
        tracing::info!(conn_id = %id, limit_bps = limit.bytes_per_sec(), "override set");
        if self.is_active(&id) {
            self.reconfigure(&id)?;
        }
        persisted
    }

    /// Remove an override. `Ok(false)` if there was none.
    pub fn clear_override(&self, id: &ConnectionId) -> Result<bool> {
        let removed = self.policy.remove(id);
        self.note_persist(&removed);
        if matches!(removed, Ok(false)) {
            return Ok(false);
        }
        tracing::info!(conn_id = %id, "override cleared");
        if self.is_active(id) {
            self.reconfigure(id)?;
        }
        removed.map(|_| true)
    }

    /// Store (and persist) the default, then retune every active connection.
    pub fn set_default(&self, limit: BandwidthLimit) -> Result<BulkOutcome> {
        let persisted = self.policy.set_default(limit);
        self.note_persist(&persisted);
        tracing::info!(limit_bps = limit.bytes_per_sec(), "default limit set");
        let outcome = self.reconfigure_all();
        persisted.map(|_| outcome)
    }

    /// Re-read the policy from disk, then retune every active connection.
    pub fn reload(&self, resolver: &dyn AliasResolver) -> Result<BulkOutcome> {
        self.policy.reload(resolver)?;
        Ok(self.reconfigure_all())
    }

    fn reconfigure_all(&self) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for id in self.active_ids() {
            match self.reconfigure(&id) {
                Ok(()) => outcome.reconfigured += 1,
                Err(e) => {
                    tracing::warn!(conn_id = %id, error = %e, "bulk reconfigure skipped connection");
                    outcome.failed.push(id);
                }
            }
        }
        outcome
    }

    fn note_persist<T>(&self, r: &Result<T>) {
        if let Err(BwError::Persistence(_)) = r {
            self.metrics.policy_persist_failures.inc(&[]);
        }
    }

    /// Uninstall everything and forget all connections. Safe to call twice.
    pub fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.stages.iter().map(|r| *r.key()).collect();
        let n = ids.len();
        for id in &ids {
            self.uninstall(id);
        }
        self.active.clear();
        if n > 0 {
            tracing::info!(uninstalled = n, "bandwidth manager shut down");
        }
    }
}
