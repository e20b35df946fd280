//! Per-connection context.
//!
//! Each connection gets one task that owns its [`OutboundPipeline`] and the
//! socket's write half. Everything else talks to it through a
//! [`ContextHandle`], so pipeline state is only ever touched from that task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use bwlimit_core::error::{BwError, Result};

use crate::obs::metrics::GatewayMetrics;
use crate::pipeline::{
    AttachablePipeline, ConnectionDiscovery, Delivery, OutboundPipeline, OutboundStage,
};
use crate::session::ConnectionId;

static NEXT_PIPELINE_KEY: AtomicU64 = AtomicU64::new(1);

fn now_std() -> std::time::Instant {
    Instant::now().into_std()
}

/// Work marshalled onto a connection context.
#[derive(Debug)]
pub enum ContextCommand {
    Write(Message),
    RecordRead(u64),
    InsertStage { name: String, stage: OutboundStage },
    RemoveStage { name: String },
    SetWriteLimit { name: String, limit: u64 },
    SetReadLimit { name: String, limit: u64 },
    Describe(oneshot::Sender<Vec<String>>),
    /// `(write_limit, read_limit)` of a named stage.
    StageLimits {
        name: String,
        reply: oneshot::Sender<Option<(u64, u64)>>,
    },
    Close,
}

/// Cloneable handle on a connection context.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    conn_id: ConnectionId,
    key: u64,
    tx: mpsc::UnboundedSender<ContextCommand>,
}

impl ContextHandle {
    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, cmd: ContextCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| {
            BwError::ConnectionUnavailable(format!("connection {} is closed", self.conn_id))
        })
    }

    /// Queue an outbound frame at the head of the pipeline.
    pub fn write(&self, msg: Message) -> Result<()> {
        self.send(ContextCommand::Write(msg))
    }

    pub fn record_read(&self, len: u64) -> Result<()> {
        self.send(ContextCommand::RecordRead(len))
    }

    /// Ask the context to stop. Queued frames are dropped.
    pub fn close(&self) {
        let _ = self.send(ContextCommand::Close);
    }

    /// Current slot names, in pipeline order.
    pub async fn stage_names(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(ContextCommand::Describe(tx))?;
        rx.await.map_err(|_| {
            BwError::ConnectionUnavailable(format!("connection {} is closed", self.conn_id))
        })
    }

    pub async fn stage_limits(&self, name: &str) -> Result<Option<(u64, u64)>> {
        let (tx, rx) = oneshot::channel();
        self.send(ContextCommand::StageLimits {
            name: name.to_string(),
            reply: tx,
        })?;
        rx.await.map_err(|_| {
            BwError::ConnectionUnavailable(format!("connection {} is closed", self.conn_id))
        })
    }
}

impl AttachablePipeline for ContextHandle {
    fn insert_stage(&self, name: &str, stage: OutboundStage) -> Result<()> {
        self.send(ContextCommand::InsertStage {
            name: name.to_string(),
            stage,
        })
    }

    fn remove_stage(&self, name: &str) -> Result<()> {
        self.send(ContextCommand::RemoveStage {
            name: name.to_string(),
        })
    }

    fn set_write_limit(&self, name: &str, limit: u64) -> Result<()> {
        self.send(ContextCommand::SetWriteLimit {
            name: name.to_string(),
            limit,
        })
    }

    fn set_read_limit(&self, name: &str, limit: u64) -> Result<()> {
        self.send(ContextCommand::SetReadLimit {
            name: name.to_string(),
            limit,
        })
    }

    fn pipeline_key(&self) -> u64 {
        self.key
    }
}

/// Resolves live context handles. A handle whose context has exited has no
/// pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextDiscovery;

impl ConnectionDiscovery for ContextDiscovery {
    type Handle = ContextHandle;

    fn resolve_outbound(&self, handle: &ContextHandle) -> Option<Arc<dyn AttachablePipeline>> {
        if handle.is_closed() {
            return None;
        }
        Some(Arc::new(handle.clone()))
    }
}

/// Where frames go once they leave the pipeline.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, msg: Message) -> Result<()>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_frame(&mut self, msg: Message) -> Result<()> {
        self.send(msg)
            .await
            .map_err(|e| BwError::ConnectionUnavailable(format!("socket write failed: {e}")))
    }
}

#[async_trait]
impl FrameSink for mpsc::Sender<Message> {
    async fn send_frame(&mut self, msg: Message) -> Result<()> {
        self.send(msg)
            .await
            .map_err(|_| BwError::ConnectionUnavailable("frame receiver dropped".into()))
    }
}

async fn wait_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(Instant::from_std(at)).await,
        None => std::future::pending::<()>().await,
    }
}

pub struct ConnectionContext<S> {
    conn_id: ConnectionId,
    pipeline: OutboundPipeline,
    sink: S,
    metrics: Arc<GatewayMetrics>,
}

impl<S: FrameSink + 'static> ConnectionContext<S> {
    pub fn new(conn_id: ConnectionId, sink: S, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            conn_id,
            pipeline: OutboundPipeline::with_encoder(),
            sink,
            metrics,
        }
    }

    /// Start the context task.
    pub fn spawn(self) -> (ContextHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ContextHandle {
            conn_id: self.conn_id,
            key: NEXT_PIPELINE_KEY.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        let conn_id = self.conn_id;
        let join = tokio::spawn(async move {
            if let Err(e) = self.run(rx).await {
                tracing::debug!(%conn_id, error = %e, "connection context stopped");
            }
        });
        (handle, join)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ContextCommand>) -> Result<()> {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    if !self.apply(cmd).await? {
                        break;
                    }
                }
                _ = wait_until(self.pipeline.next_tick()) => {
                    let out = self.pipeline.tick(now_std());
                    self.deliver(out).await?;
                }
            }
        }
        Ok(())
    }

    /// Apply one command. `Ok(false)` stops the context.
    async fn apply(&mut self, cmd: ContextCommand) -> Result<bool> {
        let now = now_std();
        match cmd {
            ContextCommand::Write(msg) => {
                let out = self.pipeline.write(msg, now);
                self.deliver(out).await?;
            }
            ContextCommand::RecordRead(len) => {
                // Accounting only: read limits stay 0, so the pause is never enforced.
                let _ = self.pipeline.record_read(len, now);
            }
            ContextCommand::InsertStage { name, stage } => {
                let out = self.pipeline.insert_stage(&name, stage, now);
                tracing::debug!(conn_id = %self.conn_id, stage = %name, "stage attached");
                self.deliver(out).await?;
            }
            ContextCommand::RemoveStage { name } => {
                if let Some(out) = self.pipeline.remove_stage(&name, now) {
                    tracing::debug!(conn_id = %self.conn_id, stage = %name, "stage detached");
                    self.deliver(out).await?;
                }
            }
            ContextCommand::SetWriteLimit { name, limit } => {
                if let Some(stage) = self.pipeline.stage_mut(&name) {
                    stage.set_write_limit(limit);
                }
            }
            ContextCommand::SetReadLimit { name, limit } => {
                if let Some(stage) = self.pipeline.stage_mut(&name) {
                    stage.set_read_limit(limit);
                }
            }
            ContextCommand::Describe(reply) => {
                let _ = reply.send(self.pipeline.names());
            }
            ContextCommand::StageLimits { name, reply } => {
                let limits = self
                    .pipeline
                    .stage_mut(&name)
                    .map(|s| (s.write_limit(), s.read_limit()));
                let _ = reply.send(limits);
            }
            ContextCommand::Close => return Ok(false),
        }
        Ok(true)
    }

    async fn deliver(&mut self, out: Delivery) -> Result<()> {
        if out.delayed > 0 {
            self.metrics
                .writes
                .add(&[("path", "delayed")], out.delayed as u64);
        }
        for waited in out.waits {
            self.metrics.write_delay.observe(&[], waited);
        }
        for msg in out.ready {
            self.metrics.writes.inc(&[("path", "forwarded")]);
            self.sink.send_frame(msg).await?;
        }
        Ok(())
    }
}
