//! The privileged VPN service
//!
//! Accepts any number of local clients, executes their commands against the
//! single connection supervisor and broadcasts every resulting event to all of
//! them. When the last client disconnects an active tunnel is torn down.

pub mod events;
pub mod log_bridge;
pub mod registry;
pub mod routes;
pub mod supervisor;

pub use events::EventSink;
pub use log_bridge::{LogBridge, ServiceLogLayer};
pub use registry::{ClientConnection, ClientRegistry};
pub use supervisor::{Supervisor, SupervisorSettings};

use crate::config::ServiceConfig;
use crate::ipc::codec::JsonCodec;
use crate::ipc::message::{ClientMessage, ErrorCode, ServiceMessage};
use crate::platform::{self, PlatformError, RoutingManager};
use crate::transport::{self, BoxedStream, Listener};
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const SERVICE_NAME: &str = "Moshi Connect Service";

/// Back-off after a failed accept so a persistent error does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Failed to bind {address}: {source}")]
    Bind { address: String, source: io::Error },
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

struct Shared {
    supervisor: Arc<Supervisor>,
    registry: Arc<ClientRegistry>,
    running: AtomicBool,
    shutdown: CancellationToken,
    max_frame_bytes: usize,
}

pub struct Service {
    shared: Arc<Shared>,
    address: String,
    log_bridge: Option<LogBridge>,
    accept_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
}

impl Service {
    /// Bind the channel and start serving with the platform route manager.
    pub async fn start(
        config: &ServiceConfig,
        log_bridge: Option<LogBridge>,
    ) -> Result<Self, ServiceError> {
        let routing: Arc<dyn RoutingManager> = Arc::from(platform::get_routing_manager()?);
        Self::start_with_routing(config, routing, log_bridge).await
    }

    pub async fn start_with_routing(
        config: &ServiceConfig,
        routing: Arc<dyn RoutingManager>,
        log_bridge: Option<LogBridge>,
    ) -> Result<Self, ServiceError> {
        let address = config.address();
        let listener = transport::bind(&address).map_err(|source| ServiceError::Bind {
            address: address.clone(),
            source,
        })?;

        let (events, mut queue) = EventSink::channel();
        let supervisor = Arc::new(Supervisor::new(
            SupervisorSettings::from(config),
            events.clone(),
            routing,
        ));

        let on_empty = Arc::clone(&supervisor);
        let registry = Arc::new(ClientRegistry::new(move || {
            info!("Last client disconnected, checking for active VPN connections");
            on_empty.disconnect_if_active();
        }));

        let dispatch_registry = Arc::clone(&registry);
        let dispatch_task = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                dispatch_registry.broadcast(message).await;
            }
        });

        if let Some(bridge) = &log_bridge {
            bridge.attach(events);
        }

        let shared = Arc::new(Shared {
            supervisor,
            registry,
            running: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            max_frame_bytes: config.max_frame_bytes,
        });
        let accept_task = tokio::spawn(Arc::clone(&shared).accept_loop(listener));

        info!("{} started on {}", SERVICE_NAME, address);
        Ok(Self {
            shared,
            address,
            log_bridge,
            accept_task,
            dispatch_task,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.shared.supervisor
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Stop accepting, drop every client, stop any active tunnel and release
    /// the channel address.
    pub async fn stop(self) {
        info!("Stopping {}", SERVICE_NAME);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.shutdown.cancel();
        if let Some(bridge) = &self.log_bridge {
            bridge.detach();
        }
        self.shared.registry.close_all();

        if let Err(e) = self.accept_task.await {
            error!("Accept loop failed: {}", e);
        }
        self.shared.supervisor.shutdown().await;
        self.dispatch_task.abort();
        info!("{} stopped", SERVICE_NAME);
    }
}

impl Shared {
    async fn accept_loop(self: Arc<Self>, mut listener: Box<dyn Listener>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(stream) => {
                    tokio::spawn(Arc::clone(&self).serve_client(stream));
                }
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
        debug!("Accept loop finished on {}", listener.address());
    }

    async fn serve_client(self: Arc<Self>, stream: BoxedStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader =
            FramedRead::new(read_half, JsonCodec::<ClientMessage>::with_max_frame(self.max_frame_bytes));
        let writer =
            FramedWrite::new(write_half, JsonCodec::<ServiceMessage>::with_max_frame(self.max_frame_bytes));
        let client = self.registry.register(writer);
        let id = client.id();
        info!("New client connected: {}", id);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = client.closed().cancelled() => break,
                next = reader.next() => next,
            };
            match next {
                Some(Ok(message)) => self.handle_message(&client, message).await,
                Some(Err(e)) if e.is_malformed() => {
                    warn!("Malformed message from client {}: {}", id, e);
                    self.registry
                        .send_to(
                            &client,
                            ServiceMessage::error(
                                "Malformed message",
                                ErrorCode::MalformedMessage,
                                Some(e.to_string()),
                            ),
                        )
                        .await;
                    break;
                }
                Some(Err(e)) => {
                    debug!("Error receiving from client {}: {}", id, e);
                    break;
                }
                None => break,
            }
        }

        self.registry.unregister(id);
        info!("Client disconnected: {}", id);
    }

    async fn handle_message(&self, client: &ClientConnection, message: ClientMessage) {
        debug!("Client {} sent {}", client.id(), message.kind());
        match message {
            ClientMessage::Connect { profile, cookie } => {
                if cookie.is_empty() || profile.url.is_empty() {
                    warn!("Connect request from client {} is missing profile or cookie", client.id());
                    self.registry
                        .send_to(
                            client,
                            ServiceMessage::error(
                                "Missing profile or cookie",
                                ErrorCode::UnknownError,
                                None,
                            ),
                        )
                        .await;
                    return;
                }
                self.supervisor.connect(profile, cookie);
            }
            ClientMessage::Disconnect => self.supervisor.disconnect(),
            ClientMessage::QueryStatus => self.supervisor.query_status(),
        }
    }
}
