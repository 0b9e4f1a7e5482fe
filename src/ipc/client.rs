//! Client side of the service channel
//!
//! A [`ServiceClient`] keeps at most one connection to the service, hands
//! every incoming message to a [`VpnStatusCallback`] and reports link loss.
//! Connection attempts fail quietly so a UI can poll until the service shows
//! up; see [`ServiceClient::spawn_reconnect`].

use super::codec::{CodecError, JsonCodec};
use super::message::{
    ClientMessage, ErrorCode, LogLevel, LogStream, ServiceMessage, StatusData, VpnStatus,
};
use crate::profile::VpnProfile;
use crate::transport::{self, BoxedStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Not connected to the VPN service")]
    NotConnected,
    #[error("Failed to send to the VPN service: {0}")]
    Send(#[from] CodecError),
    #[error("Timed out sending to the VPN service")]
    Timeout,
}

/// A service that stops reading must not block commands forever.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives everything the service reports. Called from the receive task.
pub trait VpnStatusCallback: Send + Sync {
    fn on_status_message(&self, status: VpnStatus, message: &str, data: &StatusData);
    fn on_command_output(&self, line: &str, stream: LogStream, process_name: &str);
    fn on_service_log(&self, level: LogLevel, message: &str, logger_name: &str);
    fn on_error(&self, error_message: &str, error_code: ErrorCode, details: Option<&str>);

    /// Link to the service came up or went away.
    fn on_service_connection(&self, _connected: bool) {}
}

type Reader = FramedRead<ReadHalf<BoxedStream>, JsonCodec<ServiceMessage>>;
type Writer = FramedWrite<WriteHalf<BoxedStream>, JsonCodec<ClientMessage>>;

struct Link {
    id: u64,
    writer: Writer,
    cancel: CancellationToken,
}

pub struct ServiceClient {
    address: String,
    callback: Arc<dyn VpnStatusCallback>,
    link: tokio::sync::Mutex<Option<Link>>,
    connected: AtomicBool,
    next_link: AtomicU64,
    send_timeout: Duration,
    shutdown: CancellationToken,
}

impl ServiceClient {
    pub fn new(address: impl Into<String>, callback: Arc<dyn VpnStatusCallback>) -> Arc<Self> {
        Self::with_send_timeout(address, callback, SEND_TIMEOUT)
    }

    /// Like [`new`](Self::new), with a custom bound on each command write.
    pub fn with_send_timeout(
        address: impl Into<String>,
        callback: Arc<dyn VpnStatusCallback>,
        send_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            callback,
            link: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            next_link: AtomicU64::new(1),
            send_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_service_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect if not already connected. Returns whether a link is up.
    pub async fn connect_to_service(self: &Arc<Self>) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let mut link = self.link.lock().await;
        if link.is_some() {
            return true;
        }

        let stream = match transport::connect(&self.address).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Service not reachable at {}: {}", self.address, e);
                return false;
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        *link = Some(Link {
            id,
            writer: FramedWrite::new(write_half, JsonCodec::new()),
            cancel: cancel.clone(),
        });
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to background service at {}", self.address);
        self.callback.on_service_connection(true);

        let reader = FramedRead::new(read_half, JsonCodec::new());
        tokio::spawn(Arc::clone(self).receive_loop(id, reader, cancel));
        true
    }

    async fn receive_loop(self: Arc<Self>, id: u64, mut reader: Reader, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = reader.next() => next,
            };
            match next {
                Some(Ok(message)) => self.deliver(message),
                Some(Err(e)) => {
                    error!("Error receiving from service: {}", e);
                    break;
                }
                None => break,
            }
        }
        self.drop_link(Some(id)).await;
    }

    fn deliver(&self, message: ServiceMessage) {
        match message {
            ServiceMessage::StatusMessage {
                status,
                message,
                data,
            } => self.callback.on_status_message(status, &message, &data),
            ServiceMessage::CommandOutput {
                line,
                stream,
                process_name,
            } => self.callback.on_command_output(&line, stream, &process_name),
            ServiceMessage::ServiceLog {
                level,
                message,
                logger_name,
            } => self.callback.on_service_log(level, &message, &logger_name),
            ServiceMessage::Error {
                error_message,
                error_code,
                details,
            } => self
                .callback
                .on_error(&error_message, error_code, details.as_deref()),
        }
    }

    /// Tear down the current link (or only link `id`) and report the loss.
    async fn drop_link(&self, id: Option<u64>) {
        let mut link = self.link.lock().await;
        if id.is_some_and(|id| link.as_ref().is_none_or(|l| l.id != id)) {
            return;
        }
        let Some(old) = link.take() else {
            return;
        };
        old.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
        warn!("Disconnected from background service");
        self.callback.on_service_connection(false);
    }

    pub async fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        let mut link = self.link.lock().await;
        let Some(current) = link.as_mut() else {
            warn!("Not connected to background service");
            return Err(ClientError::NotConnected);
        };
        let result = tokio::time::timeout(self.send_timeout, current.writer.send(message)).await;
        let error = match result {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => ClientError::from(e),
            Err(_) => ClientError::Timeout,
        };
        error!("Error sending to service: {}", error);
        drop(link);
        self.drop_link(None).await;
        Err(error)
    }

    async fn send_or_report(&self, message: ClientMessage, action: &str) -> bool {
        match self.send(message).await {
            Ok(()) => true,
            Err(e) => {
                debug!("{} request not delivered: {}", action, e);
                self.callback.on_error(
                    &format!("Failed to send {} request to VPN service", action),
                    ErrorCode::NetworkError,
                    Some("IPC communication failed"),
                );
                false
            }
        }
    }

    pub async fn connect(&self, profile: VpnProfile, cookie: impl Into<String>) -> bool {
        let message = ClientMessage::Connect {
            profile,
            cookie: cookie.into(),
        };
        self.send_or_report(message, "connect").await
    }

    pub async fn disconnect(&self) -> bool {
        self.send_or_report(ClientMessage::Disconnect, "disconnect").await
    }

    pub async fn query_status(&self) -> bool {
        self.send_or_report(ClientMessage::QueryStatus, "status").await
    }

    /// Retry [`connect_to_service`](Self::connect_to_service) every `period`
    /// until [`shutdown`](Self::shutdown).
    pub fn spawn_reconnect(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                this.connect_to_service().await;
            }
        })
    }

    /// Close the link and stop reconnecting.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.drop_link(None).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Recorded {
        Status(VpnStatus, String, StatusData),
        Output(String),
        Log(LogLevel, String),
        Error(ErrorCode, String),
        Connection(bool),
    }

    #[derive(Default)]
    pub struct RecordingCallback {
        events: Mutex<Vec<Recorded>>,
        notify: Notify,
    }

    impl RecordingCallback {
        fn push(&self, event: Recorded) {
            self.events.lock().unwrap().push(event);
            self.notify.notify_waiters();
        }

        pub fn snapshot(&self) -> Vec<Recorded> {
            self.events.lock().unwrap().clone()
        }

        /// First recorded event matching `pred`, waiting up to `timeout`.
        pub async fn wait_for(&self, timeout: Duration, pred: impl Fn(&Recorded) -> bool) -> Recorded {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let notified = self.notify.notified();
                if let Some(found) = self.snapshot().into_iter().find(|e| pred(e)) {
                    return found;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    panic!("no matching event, got {:?}", self.snapshot());
                }
            }
        }
    }

    impl VpnStatusCallback for RecordingCallback {
        fn on_status_message(&self, status: VpnStatus, message: &str, data: &StatusData) {
            self.push(Recorded::Status(status, message.to_string(), data.clone()));
        }

        fn on_command_output(&self, line: &str, _stream: LogStream, _process_name: &str) {
            self.push(Recorded::Output(line.to_string()));
        }

        fn on_service_log(&self, level: LogLevel, message: &str, _logger_name: &str) {
            self.push(Recorded::Log(level, message.to_string()));
        }

        fn on_error(&self, error_message: &str, error_code: ErrorCode, _details: Option<&str>) {
            self.push(Recorded::Error(error_code, error_message.to_string()));
        }

        fn on_service_connection(&self, connected: bool) {
            self.push(Recorded::Connection(connected));
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::testing::{Recorded, RecordingCallback};
    use super::*;
    use crate::transport::Listener;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    type ServerSide = tokio_util::codec::Framed<BoxedStream, JsonCodec<ServiceMessage>>;

    fn socket_address(dir: &TempDir) -> String {
        dir.path().join("client.sock").to_string_lossy().into_owned()
    }

    async fn accept(listener: &mut Box<dyn Listener>) -> ServerSide {
        let stream = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        tokio_util::codec::Framed::new(stream, JsonCodec::new())
    }

    fn connections(callback: &RecordingCallback) -> Vec<bool> {
        callback
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Connection(up) => Some(up),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_quietly() {
        let dir = TempDir::new().unwrap();
        let callback = Arc::new(RecordingCallback::default());
        let client = ServiceClient::new(socket_address(&dir), callback.clone());

        assert!(!client.connect_to_service().await);
        assert!(!client.is_service_connected());
        assert!(callback.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_link_reports_network_error() {
        let dir = TempDir::new().unwrap();
        let callback = Arc::new(RecordingCallback::default());
        let client = ServiceClient::new(socket_address(&dir), callback.clone());

        assert!(!client.query_status().await);
        assert!(matches!(
            client.send(ClientMessage::Disconnect).await,
            Err(ClientError::NotConnected)
        ));
        assert_eq!(
            callback.snapshot(),
            [Recorded::Error(
                ErrorCode::NetworkError,
                "Failed to send status request to VPN service".into()
            )]
        );
    }

    #[tokio::test]
    async fn test_messages_dispatched_and_requests_delivered() {
        let dir = TempDir::new().unwrap();
        let mut listener = transport::bind(&socket_address(&dir)).unwrap();
        let callback = Arc::new(RecordingCallback::default());
        let client = ServiceClient::new(socket_address(&dir), callback.clone());

        assert!(client.connect_to_service().await);
        let mut server = accept(&mut listener).await;

        assert!(client.query_status().await);
        let mut requests = tokio_util::codec::FramedRead::new(
            server.get_mut(),
            JsonCodec::<ClientMessage>::new(),
        );
        let request = tokio::time::timeout(WAIT, requests.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(request, ClientMessage::QueryStatus);
        drop(requests);

        server
            .send(ServiceMessage::CommandOutput {
                line: "POST https://vpn.example.com/".into(),
                stream: LogStream::Stdout,
                process_name: "openconnect".into(),
            })
            .await
            .unwrap();
        server
            .send(ServiceMessage::error("boom", ErrorCode::AuthenticationFailed, None))
            .await
            .unwrap();

        callback
            .wait_for(WAIT, |e| matches!(e, Recorded::Error(..)))
            .await;
        assert_eq!(
            callback.snapshot(),
            [
                Recorded::Connection(true),
                Recorded::Output("POST https://vpn.example.com/".into()),
                Recorded::Error(ErrorCode::AuthenticationFailed, "boom".into()),
            ]
        );

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_link_loss_notified_once_and_reconnect_works() {
        let dir = TempDir::new().unwrap();
        let mut listener = transport::bind(&socket_address(&dir)).unwrap();
        let callback = Arc::new(RecordingCallback::default());
        let client = ServiceClient::new(socket_address(&dir), callback.clone());

        assert!(client.connect_to_service().await);
        // already connected: no new link, no duplicate notification
        assert!(client.connect_to_service().await);
        let server = accept(&mut listener).await;
        drop(server);

        callback
            .wait_for(WAIT, |e| *e == Recorded::Connection(false))
            .await;
        assert!(!client.is_service_connected());

        let reconnect = client.spawn_reconnect(Duration::from_millis(20));
        let _server = accept(&mut listener).await;
        let deadline = tokio::time::Instant::now() + WAIT;
        while !client.is_service_connected() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        client.shutdown().await;
        tokio::time::timeout(WAIT, reconnect).await.unwrap().unwrap();
        assert_eq!(connections(&callback), [true, false, true, false]);
    }

    #[tokio::test]
    async fn test_stalled_service_does_not_block_commands() {
        let dir = TempDir::new().unwrap();
        let mut listener = transport::bind(&socket_address(&dir)).unwrap();
        let callback = Arc::new(RecordingCallback::default());
        let client = ServiceClient::with_send_timeout(
            socket_address(&dir),
            callback.clone(),
            Duration::from_millis(200),
        );

        assert!(client.connect_to_service().await);
        // accepted but never read, so the socket buffer fills up
        let _server = accept(&mut listener).await;
        let cookie = "x".repeat(512 * 1024);

        let profile = VpnProfile::new("corp", "vpn.example.com");

        let mut attempts = 0;
        while tokio::time::timeout(WAIT, client.connect(profile.clone(), cookie.clone()))
            .await
            .expect("command blocked on a stalled service")
        {
            attempts += 1;
            assert!(attempts < 20, "writes never stalled");
        }

        assert!(!client.is_service_connected());
        assert_eq!(connections(&callback), [true, false]);
        assert!(callback.snapshot().contains(&Recorded::Error(
            ErrorCode::NetworkError,
            "Failed to send connect request to VPN service".into()
        )));
    }
}
