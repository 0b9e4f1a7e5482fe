//! OpenConnect output classification
//!
//! Each output stream of the child gets one reader task. Every line is handed
//! to an ordered list of independent consumers: one republishes the raw line
//! to clients, another looks for the tunnel-device attach message.

use regex::{Captures, Regex};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Matches e.g. `Using Wintun device 'corp.vpn', index 7` and the TAP/tun
/// variants. The device type is any word-with-hyphens token.
pub const DEVICE_ATTACH_PATTERN: &str =
    r"Using (?P<devicename>[\w-]+) device '(?P<name>[^']+)', index (?P<index>\d+)";

static DEVICE_ATTACH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(DEVICE_ATTACH_PATTERN).expect("device attach pattern is valid")
});

/// Receives lines from a process stream.
pub trait LineConsumer: Send + Sync {
    fn consume(&self, line: &str);
}

impl<F> LineConsumer for F
where
    F: Fn(&str) + Send + Sync,
{
    fn consume(&self, line: &str) {
        self(line)
    }
}

/// Fans a single line out to several consumers, in order.
///
/// A consumer that panics is reported and skipped; the remaining consumers
/// still see the line.
#[derive(Clone, Default)]
pub struct Demultiplexer {
    consumers: Vec<Arc<dyn LineConsumer>>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, consumer: impl LineConsumer + 'static) -> Self {
        self.consumers.push(Arc::new(consumer));
        self
    }

    pub fn push(&mut self, consumer: Arc<dyn LineConsumer>) {
        self.consumers.push(consumer);
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

impl LineConsumer for Demultiplexer {
    fn consume(&self, line: &str) {
        for (i, consumer) in self.consumers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| consumer.consume(line))).is_err() {
                error!("Line consumer {} panicked; continuing with the rest", i);
            }
        }
    }
}

/// Applies a regular expression to each line and dispatches on match.
pub struct PatternMatcher<F> {
    pattern: Regex,
    on_match: F,
}

impl<F> PatternMatcher<F>
where
    F: Fn(&str, &Captures<'_>) + Send + Sync,
{
    pub fn new(pattern: Regex, on_match: F) -> Self {
        Self { pattern, on_match }
    }
}

impl<F> LineConsumer for PatternMatcher<F>
where
    F: Fn(&str, &Captures<'_>) + Send + Sync,
{
    fn consume(&self, line: &str) {
        if let Some(captures) = self.pattern.captures(line) {
            (self.on_match)(line, &captures);
        }
    }
}

/// Virtual interface reported by OpenConnect once the tunnel is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDevice {
    /// Driver/device type token, e.g. `Wintun`, `TAP-Windows`, `tun`
    pub device_type: String,
    /// Interface name, e.g. `corp.vpn`
    pub name: String,
    /// OS interface index, kept as reported
    pub index: String,
}

impl TunnelDevice {
    fn from_captures(captures: &Captures<'_>) -> Option<Self> {
        Some(Self {
            device_type: captures.name("devicename")?.as_str().to_string(),
            name: captures.name("name")?.as_str().to_string(),
            index: captures.name("index")?.as_str().to_string(),
        })
    }

    /// Extract the device from an attach line, if the line is one.
    pub fn parse_line(line: &str) -> Option<Self> {
        DEVICE_ATTACH_RE
            .captures(line)
            .and_then(|c| Self::from_captures(&c))
    }
}

/// Consumer that reports the tunnel device when the attach line shows up.
pub fn device_attach_matcher<F>(on_attach: F) -> impl LineConsumer
where
    F: Fn(TunnelDevice) + Send + Sync,
{
    PatternMatcher::new(DEVICE_ATTACH_RE.clone(), move |_line, captures| {
        if let Some(device) = TunnelDevice::from_captures(captures) {
            on_attach(device);
        }
    })
}

/// Consecutive read failures after which a stream is given up on.
const MAX_READ_ERRORS: u32 = 5;

/// Read `stream` line by line until end-of-stream or `stop`, feeding each
/// line (trailing whitespace trimmed) to `consumer`.
///
/// Output is not guaranteed to be UTF-8. Invalid sequences are replaced and
/// reading continues; the pipe must stay open while the child writes to it.
pub fn spawn_line_reader<R>(
    stream: R,
    stream_name: &'static str,
    consumer: Arc<dyn LineConsumer>,
    stop: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        let mut errors = 0;
        loop {
            buf.clear();
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = reader.read_until(b'\n', &mut buf) => next,
            };
            match next {
                Ok(0) => break,
                Ok(_) => {
                    errors = 0;
                    let line = String::from_utf8_lossy(&buf);
                    consumer.consume(line.trim_end());
                }
                Err(e) => {
                    errors += 1;
                    if errors >= MAX_READ_ERRORS {
                        error!("Giving up on {} after repeated read errors: {}", stream_name, e);
                        break;
                    }
                    warn!("Error reading from {}: {}", stream_name, e);
                }
            }
        }
        debug!("{} reader finished", stream_name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_parse_wintun_line() {
        let device = TunnelDevice::parse_line("Using Wintun device 'corp.vpn', index 7").unwrap();
        assert_eq!(device.device_type, "Wintun");
        assert_eq!(device.name, "corp.vpn");
        assert_eq!(device.index, "7");
    }

    #[test]
    fn test_parse_tap_windows_line() {
        let device =
            TunnelDevice::parse_line("Using TAP-Windows device 'Local Area Connection', index 16")
                .unwrap();
        assert_eq!(device.device_type, "TAP-Windows");
        assert_eq!(device.name, "Local Area Connection");
        assert_eq!(device.index, "16");
    }

    #[test]
    fn test_parse_other_variants() {
        let device = TunnelDevice::parse_line("Using tun device 'tun0', index 5").unwrap();
        assert_eq!(device.device_type, "tun");
        assert_eq!(device.name, "tun0");

        let device =
            TunnelDevice::parse_line("Using Wintun device 'VPN-Connection_123', index 42").unwrap();
        assert_eq!(device.name, "VPN-Connection_123");
        assert_eq!(device.index, "42");
    }

    #[test]
    fn test_wrong_verb_not_matched() {
        assert!(TunnelDevice::parse_line("Connected to Wintun device 'x', index 1").is_none());
        assert!(TunnelDevice::parse_line("Using Wintun device 'x', index ").is_none());
        assert!(TunnelDevice::parse_line("Got CONNECT response: HTTP/1.1 200 OK").is_none());
    }

    #[test]
    fn test_demultiplexer_keeps_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = seen.clone();
        let b = seen.clone();
        let demux = Demultiplexer::new()
            .with(move |line: &str| a.lock().unwrap().push(format!("a:{}", line)))
            .with(move |line: &str| b.lock().unwrap().push(format!("b:{}", line)));

        demux.consume("one");
        demux.consume("two");

        assert_eq!(*seen.lock().unwrap(), vec!["a:one", "b:one", "a:two", "b:two"]);
    }

    #[test]
    fn test_demultiplexer_survives_panicking_consumer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let demux = Demultiplexer::new()
            .with(|line: &str| {
                if !line.is_empty() {
                    panic!("consumer failure");
                }
            })
            .with(move |line: &str| sink.lock().unwrap().push(line.to_string()));

        demux.consume("still delivered");
        demux.consume("and again");

        assert_eq!(*seen.lock().unwrap(), vec!["still delivered", "and again"]);
    }

    #[test]
    fn test_device_attach_matcher() {
        let found = Arc::new(Mutex::new(None));
        let slot = found.clone();
        let matcher = device_attach_matcher(move |device| *slot.lock().unwrap() = Some(device));

        matcher.consume("POST https://vpn.example.com/");
        assert!(found.lock().unwrap().is_none());

        matcher.consume("Using Wintun device 'corp.vpn', index 7");
        assert_eq!(found.lock().unwrap().as_ref().unwrap().index, "7");
    }

    #[tokio::test]
    async fn test_line_reader_delivers_until_eof() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer: Arc<dyn LineConsumer> =
            Arc::new(move |line: &str| sink.lock().unwrap().push(line.to_string()));

        let input: &[u8] = b"first line  \r\nsecond\nlast without newline";
        let handle = spawn_line_reader(input, "stdout", consumer, CancellationToken::new());
        handle.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first line", "second", "last without newline"]
        );
    }

    #[tokio::test]
    async fn test_line_reader_survives_non_utf8_output() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let found = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let slot = found.clone();
        let consumer: Arc<dyn LineConsumer> = Arc::new(
            Demultiplexer::new()
                .with(move |line: &str| sink.lock().unwrap().push(line.to_string()))
                .with(device_attach_matcher(move |device| {
                    *slot.lock().unwrap() = Some(device)
                })),
        );

        let input: &[u8] = b"Verbindung zu Ger\xe4t\r\nUsing Wintun device 'corp.vpn', index 7\n";
        let handle = spawn_line_reader(input, "stdout", consumer, CancellationToken::new());
        handle.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], "Verbindung zu Ger\u{FFFD}t");
        assert_eq!(found.lock().unwrap().as_ref().unwrap().name, "corp.vpn");
    }

    #[tokio::test]
    async fn test_line_reader_stops_on_signal() {
        let (reader, _writer) = tokio::io::duplex(64);
        let stop = CancellationToken::new();
        let consumer: Arc<dyn LineConsumer> = Arc::new(|_: &str| {});
        let handle = spawn_line_reader(reader, "stderr", consumer, stop.clone());

        stop.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("reader should stop promptly")
            .unwrap();
    }
}
