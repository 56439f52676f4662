//! The mediating server.
//!
//! Stateless with respect to task history: everything durable lives in the
//! pending store, the ack ledger and the event-bus streams. This module
//! wires the registry, dispatcher, stream writers and HTTP surface
//! together and runs the heartbeat-timeout sweep.

pub mod dispatch;
pub mod http;
pub mod pending;
pub mod pipeline;
pub mod registry;
pub mod seen;
pub mod stats;
pub mod store;
pub mod streams;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use opsfabric_core::bus::{EventBus, KvStore, MemoryBus, MemoryKv};
use opsfabric_core::config::Config;
use opsfabric_core::error::Result;
use opsfabric_core::protocol::SystemMetrics;

use dispatch::Dispatcher;
use pending::PendingStore;
use registry::{AgentRecord, Registry};
use stats::StatsAggregator;
use streams::{LogStreamWriter, ResultStreamWriter, StatusRecord, StatusStreamWriter};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

pub struct ServerState {
    pub cfg: Config,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub log_writer: Arc<LogStreamWriter>,
    pub result_writer: Arc<ResultStreamWriter>,
    pub status_writer: Arc<StatusStreamWriter>,
    pub stats: Arc<StatsAggregator>,
}

impl ServerState {
    /// Builds the full state. Without a configured redis the store and bus
    /// run in memory: delivery still works, durability across a server
    /// restart does not.
    pub async fn build(cfg: Config) -> Arc<ServerState> {
        let (kv, bus): (Arc<dyn KvStore>, Arc<dyn EventBus>) = if cfg.pending.redis_url.is_empty() {
            warn!("no redis configured, pending store and event bus run memory-only");
            (Arc::new(MemoryKv::new()), Arc::new(MemoryBus::new()))
        } else {
            match store::connect(&cfg.pending.redis_url).await {
                Ok((kv, bus)) => (Arc::new(kv), Arc::new(bus)),
                Err(e) => {
                    warn!(error = %e, "redis unavailable, falling back to memory-only mode");
                    (Arc::new(MemoryKv::new()), Arc::new(MemoryBus::new()))
                }
            }
        };

        let registry = Arc::new(Registry::new(
            Arc::clone(&kv),
            cfg.server.max_connections,
            cfg.server.task_queue_size,
            Duration::from_secs(cfg.server.heartbeat_timeout_sec),
        ));
        let pending = Arc::new(PendingStore::new(
            Arc::clone(&kv),
            Duration::from_secs(cfg.pending.op_timeout_sec),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            cfg.pending.max_retries,
        ));

        let log_writer = Arc::new(LogStreamWriter::new(
            Arc::clone(&bus),
            cfg.streams.log_key.clone(),
        ));
        let result_writer = Arc::new(ResultStreamWriter::new(
            Arc::clone(&bus),
            cfg.streams.result_key.clone(),
            cfg.streams.result_maxlen,
        ));
        let status_writer = Arc::new(StatusStreamWriter::new(
            Arc::clone(&bus),
            cfg.streams.status_key.clone(),
        ));
        let stats = Arc::new(StatsAggregator::new(
            Arc::clone(&bus),
            cfg.streams.task_stats_key.clone(),
            Duration::from_secs(cfg.streams.stats_push_interval_sec),
        ));

        Arc::new(ServerState {
            cfg,
            registry,
            dispatcher,
            log_writer,
            result_writer,
            status_writer,
            stats,
        })
    }

    /// One status record for an agent, flattened for the bus.
    pub async fn push_status(
        &self,
        record: &Arc<AgentRecord>,
        status: &str,
        event: Option<&str>,
        metrics: Option<SystemMetrics>,
    ) {
        let system = record.system().unwrap_or_default();
        let status_record = StatusRecord {
            agent_id: record.id.clone(),
            agent_name: record.name(),
            host_id: record.host_id,
            status: status.to_string(),
            last_heartbeat_ms: record.last_heartbeat().timestamp_millis(),
            hostname: system.hostname,
            os: system.os,
            arch: system.arch,
            event: event.map(str::to_string),
            metrics,
        };
        if let Err(e) = self.status_writer.push_status(status_record).await {
            warn!(agent_id = %record.id, error = %e, "status push failed");
        }
    }

    /// Heartbeat-timeout sweep: each expired registration gets exactly one
    /// offline record, then is removed.
    pub async fn sweep_inactive(&self) {
        for record in self.registry.cleanup_inactive() {
            self.push_status(&record, "offline", Some("heartbeat_timeout"), None)
                .await;
            self.stats.on_agent_disconnect(&record.id).await;
        }
    }
}

/// Runs the server until the token fires.
pub async fn run(cfg: Config, cancel: CancellationToken) -> Result<()> {
    let state = ServerState::build(cfg).await;

    {
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => state.sweep_inactive().await,
                }
            }
        });
    }

    let addr = format!("{}:{}", state.cfg.server.host, state.cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(opsfabric_core::FabricError::Io)?;
    info!(addr, "server listening");

    let app = http::router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| opsfabric_core::FabricError::internal(format!("server: {e}")))?;

    info!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsfabric_core::protocol::RegisterRequest;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_sweep_emits_one_offline_record_per_agent() {
        let mut cfg = Config::default();
        cfg.server.heartbeat_timeout_sec = 0;
        let state = ServerState::build(cfg).await;

        state
            .registry
            .register(&RegisterRequest {
                name: "host-a".into(),
                token: String::new(),
                labels: HashMap::new(),
                system: None,
                host_id: 1,
            })
            .unwrap();

        // Timeout of zero makes the record immediately stale.
        state.sweep_inactive().await;
        state.sweep_inactive().await;
        assert_eq!(state.registry.count(), 0);
    }
}
