//! Outbound event queue
//!
//! The supervisor and the log bridge never talk to sockets directly. They push
//! `ServiceMessage`s into an unbounded queue and a single dispatcher task
//! broadcasts them in order. Pushing never blocks, so it is safe under the
//! supervisor's state lock.

use crate::ipc::message::{ErrorCode, LogStream, ServiceMessage, StatusData, VpnStatus};
use crate::openconnect::process::PROCESS_NAME;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ServiceMessage>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServiceMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message. Dropped silently once the dispatcher is gone; this
    /// must not log, since log records are themselves routed through here.
    pub fn send(&self, message: ServiceMessage) {
        let _ = self.tx.send(message);
    }

    pub fn status(&self, status: VpnStatus, message: impl Into<String>, data: StatusData) {
        self.send(ServiceMessage::status(status, message, data));
    }

    pub fn error(&self, message: impl Into<String>, code: ErrorCode, details: Option<String>) {
        self.send(ServiceMessage::error(message, code, details));
    }

    pub fn command_output(&self, line: &str, stream: LogStream) {
        self.send(ServiceMessage::CommandOutput {
            line: line.to_string(),
            stream,
            process_name: PROCESS_NAME.to_string(),
        });
    }
}
