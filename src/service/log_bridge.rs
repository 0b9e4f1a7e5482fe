//! Tracing layer that forwards service log records to connected clients.
//!
//! Only events whose target lives under the service module are forwarded.
//! Events from the delivery path (the client registry) and events carrying
//! `suppress_broadcast = true` stay local, as does anything logged while a
//! record is already being forwarded on the same thread.

use super::events::EventSink;
use crate::ipc::message::{LogLevel, ServiceMessage};
use std::cell::Cell;
use std::fmt::{self, Write as _};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer};

pub const SUPPRESS_BROADCAST_FIELD: &str = "suppress_broadcast";

const FORWARDED_TARGET_PREFIX: &str = "moshi_connect::service";
const DELIVERY_TARGET_PREFIX: &str = "moshi_connect::service::registry";

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

type SharedSink = Arc<RwLock<Option<EventSink>>>;

/// Owner side of the bridge: build the layer before the service exists, then
/// attach the service's event sink once it is running.
#[derive(Clone, Default)]
pub struct LogBridge {
    sink: SharedSink,
}

impl LogBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(&self) -> ServiceLogLayer {
        ServiceLogLayer {
            sink: Arc::clone(&self.sink),
        }
    }

    pub fn attach(&self, sink: EventSink) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn detach(&self) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_attached(&self) -> bool {
        self.sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

pub struct ServiceLogLayer {
    sink: SharedSink,
}

fn is_forwarded_target(target: &str) -> bool {
    target.starts_with(FORWARDED_TARGET_PREFIX) && !target.starts_with(DELIVERY_TARGET_PREFIX)
}

impl<S> Layer<S> for ServiceLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !is_forwarded_target(metadata.target()) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        if visitor.suppressed {
            return;
        }

        FORWARDING.with(|forwarding| {
            if forwarding.replace(true) {
                return;
            }
            if let Ok(guard) = self.sink.read()
                && let Some(sink) = guard.as_ref()
            {
                sink.send(ServiceMessage::ServiceLog {
                    level: LogLevel::from(metadata.level()),
                    message: visitor.finish(),
                    logger_name: metadata.target().to_string(),
                });
            }
            forwarding.set(false);
        });
    }
}

/// Collects the message plus any extra fields as ` key=value` suffixes.
#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: String,
    suppressed: bool,
}

impl RecordVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for RecordVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == SUPPRESS_BROADCAST_FIELD {
            self.suppressed = value;
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
