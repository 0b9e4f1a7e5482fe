//! Connected clients and broadcast delivery
//!
//! Each client owns the write half of its stream behind its own lock, so
//! concurrent sends to the same client are serialized while different clients
//! are written in parallel. A client whose send fails is dropped without
//! affecting delivery to the others.
//!
//! Nothing logged from this module is forwarded to clients (see
//! `log_bridge`), otherwise a failing delivery would generate more deliveries.

use crate::ipc::codec::{CodecError, JsonCodec};
use crate::ipc::message::ServiceMessage;
use crate::transport::BoxedStream;
use futures::SinkExt;
use futures::future::join_all;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::WriteHalf;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A client that stops reading must not stall broadcasts forever.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub type ClientId = u64;
pub type ClientWriter = FramedWrite<WriteHalf<BoxedStream>, JsonCodec<ServiceMessage>>;

pub struct ClientConnection {
    id: ClientId,
    writer: tokio::sync::Mutex<ClientWriter>,
    closed: CancellationToken,
}

impl ClientConnection {
    fn new(id: ClientId, writer: ClientWriter) -> Self {
        Self {
            id,
            writer: tokio::sync::Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Cancelled once the connection is closed; receive loops select on it.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send one message. Fails instead of waiting if the connection is
    /// closed while the send is in flight.
    pub async fn send(&self, message: ServiceMessage) -> Result<(), CodecError> {
        if self.is_closed() {
            return Err(closed_error());
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            result = tokio::time::timeout(SEND_TIMEOUT, async {
                let mut writer = self.writer.lock().await;
                writer.send(message).await
            }) => match result {
                Ok(sent) => sent,
                Err(_) => Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "send timed out",
                ))),
            },
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

fn closed_error() -> CodecError {
    CodecError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "client connection closed",
    ))
}

type LastClientCallback = Box<dyn Fn() + Send + Sync>;

pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Arc<ClientConnection>>>,
    next_id: AtomicU64,
    on_last_client: LastClientCallback,
}

impl ClientRegistry {
    /// `on_last_client` runs each time membership drops from one to zero.
    pub fn new<F>(on_last_client: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            on_last_client: Box::new(on_last_client),
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, Arc<ClientConnection>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, writer: ClientWriter) -> Arc<ClientConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(ClientConnection::new(id, writer));
        self.clients().insert(id, Arc::clone(&client));
        debug!("Registered client {}", id);
        client
    }

    /// Remove and close a client. Returns false if it was already gone.
    pub fn unregister(&self, id: ClientId) -> bool {
        let (removed, now_empty) = {
            let mut clients = self.clients();
            let removed = clients.remove(&id);
            let now_empty = removed.is_some() && clients.is_empty();
            (removed, now_empty)
        };

        let Some(client) = removed else {
            return false;
        };
        client.close();
        debug!("Unregistered client {}", id);

        if now_empty {
            (self.on_last_client)();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }

    /// Deliver to every registered client, dropping the ones that fail.
    pub async fn broadcast(&self, message: ServiceMessage) {
        let targets: Vec<Arc<ClientConnection>> = self.clients().values().cloned().collect();
        if targets.is_empty() {
            return;
        }

        let results = join_all(targets.iter().map(|client| client.send(message.clone()))).await;

        for (client, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    suppress_broadcast = true,
                    "Error sending to client {}: {}", client.id(), e
                );
                self.unregister(client.id());
            }
        }
    }

    /// Deliver to a single client, dropping it if the send fails.
    pub async fn send_to(&self, client: &ClientConnection, message: ServiceMessage) -> bool {
        match client.send(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    suppress_broadcast = true,
                    "Error sending to client {}: {}", client.id(), e
                );
                self.unregister(client.id());
                false
            }
        }
    }

    /// Close every client without firing the last-client callback.
    pub fn close_all(&self) {
        let drained: Vec<Arc<ClientConnection>> = self.clients().drain().map(|(_, c)| c).collect();
        for client in drained {
            client.close();
        }
    }
}
