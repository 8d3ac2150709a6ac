// SPDX-License-Identifier: Apache-2.0

//! Server assembly: wires the coarse clock, executor, compressor
//! registry, entry point, TCP transport, and admin endpoint together from
//! the loaded configuration.

use crate::thread_task::{ThreadLocalTaskHandle, spawn_thread_local_task};
use finchdb_admin::StatusSource;
use finchdb_clock::CoarseClock;
use finchdb_config::{ExecutorMode, ServerConfig};
use finchdb_executor::adaptive::{AdaptiveOptions, AdaptiveServiceExecutor};
use finchdb_executor::reactor::Reactor;
use finchdb_executor::synchronous::{SynchronousOptions, SynchronousServiceExecutor};
use finchdb_executor::{ServiceExecutor, TransportMode};
use finchdb_transport::compress::CompressionManager;
use finchdb_transport::message::{Message, OpCode};
use finchdb_transport::session::Session;
use finchdb_transport::state_machine::HandlerResponse;
use finchdb_transport::tcp::TcpTransportLayer;
use finchdb_transport::{CompressorRegistry, RequestHandler, ServiceEntryPoint};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const CLOCK_GRANULARITY: Duration = Duration::from_millis(10);

/// Errors fatal to server startup or shutdown.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    /// The configuration was unusable.
    #[error("configuration error: {0}")]
    Config(#[from] finchdb_config::Error),

    /// The transport layer failed to come up.
    #[error("transport error: {0}")]
    Transport(#[from] finchdb_transport::Error),

    /// The executor failed to start or drain.
    #[error("executor error: {0}")]
    Executor(#[from] finchdb_executor::Error),

    /// The admin endpoint's hosting thread could not be spawned.
    #[error("failed to start admin endpoint thread: {0}")]
    AdminSpawn(std::io::Error),

    /// A shutdown grace period expired with work still alive.
    #[error("shutdown did not drain all sessions or workers in time")]
    DirtyShutdown,
}

/// The built-in request handler: answers JSON handshakes (including
/// compression negotiation) and acknowledges everything else. Real
/// command dispatch plugs in at this seam.
fn default_handler() -> Arc<dyn RequestHandler> {
    Arc::new(
        |_session: &dyn Session,
         compression: &mut CompressionManager,
         request: &Message|
         -> Result<HandlerResponse, finchdb_transport::Error> {
            let mut reply = serde_json::Map::new();
            let _ = reply.insert("ok".to_string(), serde_json::Value::from(1));
            if let Ok(doc) = serde_json::from_slice::<serde_json::Value>(request.body()) {
                if let Some(agreed) = compression.server_negotiate_document(&doc) {
                    let _ = reply.insert("compression".to_string(), agreed);
                }
            }
            let body = serde_json::to_vec(&serde_json::Value::Object(reply)).map_err(|e| {
                finchdb_transport::Error::Handler {
                    message: e.to_string(),
                }
            })?;
            let reply = Message::new(0, request.header().request_id, OpCode::Msg as i32, &body)?;
            Ok(HandlerResponse::Reply(reply))
        },
    )
}

/// Status document source backed by the live components.
struct ServerStatus {
    executor: Arc<ServiceExecutor>,
    entry_point: Arc<ServiceEntryPoint>,
    registry: Arc<CompressorRegistry>,
}

impl StatusSource for ServerStatus {
    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "serviceExecutorTaskStats": self.executor.stats(),
            "connections": serde_json::to_value(self.entry_point.session_stats())
                .unwrap_or(serde_json::Value::Null),
            "compression": self.registry.append_stats(),
        })
    }
}

/// The assembled server.
pub struct Server {
    // Held for its background thread; the executors read it through the
    // reactor.
    _coarse_clock: Arc<CoarseClock>,
    executor: Arc<ServiceExecutor>,
    entry_point: Arc<ServiceEntryPoint>,
    transport: TcpTransportLayer,
    admin: Option<ThreadLocalTaskHandle<(), finchdb_admin::Error>>,
}

impl Server {
    /// Builds and starts every component.
    pub fn start(config: &ServerConfig) -> Result<Self, ServerError> {
        let coarse_clock = Arc::new(CoarseClock::new(CLOCK_GRANULARITY));

        let registry = Arc::new(CompressorRegistry::with_enabled(
            &config.net.compression.compressor_names(),
        )?);

        let (executor, reactor) = match config.executor.mode {
            ExecutorMode::Synchronous => {
                let executor = SynchronousServiceExecutor::new(SynchronousOptions {
                    recursion_limit: config.executor.synchronous.recursion_limit,
                });
                executor.start()?;
                (Arc::new(ServiceExecutor::Synchronous(executor)), None)
            }
            ExecutorMode::Adaptive => {
                let adaptive = &config.executor.adaptive;
                let reactor = Reactor::with_clock(coarse_clock.clone());
                let executor = AdaptiveServiceExecutor::new(
                    reactor.clone(),
                    AdaptiveOptions {
                        reserved_threads: adaptive.effective_reserved_threads(),
                        worker_run_time: adaptive.worker_run_time,
                        run_time_jitter_pct: adaptive.run_time_jitter_pct,
                        stuck_thread_timeout: adaptive.stuck_thread_timeout,
                        max_queue_latency: adaptive.max_queue_latency,
                        idle_pct_threshold: adaptive.idle_pct_threshold,
                        recursion_limit: adaptive.recursion_limit,
                    },
                );
                executor.start()?;
                (Arc::new(ServiceExecutor::Adaptive(executor)), Some(reactor))
            }
        };
        tracing::info!(
            mode = ?config.executor.mode,
            compressors = ?config.net.compression.compressor_names(),
            max_connections = config.net.max_connections,
            "service executor started"
        );

        let entry_point = Arc::new(ServiceEntryPoint::new(
            executor.clone(),
            default_handler(),
            registry.clone(),
            config.net.max_connections,
        ));

        let bind_address: SocketAddr = config
            .net
            .bind_address
            .parse()
            .map_err(|_| finchdb_config::Error::Invalid {
                field: "net.bind_address",
                reason: format!("`{}` is not a socket address", config.net.bind_address),
            })?;
        let mode = match config.executor.mode {
            ExecutorMode::Synchronous => TransportMode::Synchronous,
            ExecutorMode::Adaptive => TransportMode::Asynchronous,
        };
        let transport = TcpTransportLayer::new(bind_address, mode, reactor, entry_point.clone());
        transport.setup()?;
        transport.start()?;

        let admin = if config.admin.enabled {
            let admin_config = config.admin.clone();
            let status_source: Arc<dyn StatusSource> = Arc::new(ServerStatus {
                executor: executor.clone(),
                entry_point: entry_point.clone(),
                registry,
            });
            let handle = spawn_thread_local_task("http-admin", move |cancel| {
                finchdb_admin::run(admin_config, status_source, cancel)
            })
            .map_err(ServerError::AdminSpawn)?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            _coarse_clock: coarse_clock,
            executor,
            entry_point,
            transport,
            admin,
        })
    }

    /// Stops accepting, drains sessions and workers, and tears the admin
    /// endpoint down. Returns `DirtyShutdown` when a grace period
    /// expires with work still alive.
    pub fn shutdown(self) -> Result<(), ServerError> {
        tracing::info!("shutting down");
        self.transport.shutdown();

        let sessions_drained = self.entry_point.shutdown(SHUTDOWN_GRACE);
        let executor_result = self.executor.shutdown(SHUTDOWN_GRACE);

        if let Some(admin) = self.admin {
            match admin.shutdown_and_join() {
                Some(Ok(())) | None => {}
                Some(Err(error)) => tracing::warn!(%error, "admin endpoint exited with error"),
            }
        }

        match (&sessions_drained, &executor_result) {
            (true, Ok(())) => {
                tracing::info!("shutdown complete");
                Ok(())
            }
            _ => {
                if let Err(error) = &executor_result {
                    tracing::error!(%error, "executor failed to drain");
                }
                Err(ServerError::DirtyShutdown)
            }
        }
    }
}
