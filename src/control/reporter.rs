use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::Serialize;

/// Outward report types, serialized as the payload's `type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Balance,
    ActiveOrders,
    Status,
    Orderbooks,
    Trades,
    Positions,
    Signals,
    NewOrders,
    Error,
    Pong,
}

#[derive(Serialize)]
struct Payload<'a, T: Serialize + ?Sized> {
    #[serde(rename = "type")]
    kind: ReportKind,
    data: &'a T,
    exchange: &'a str,
    nonce: u64,
}

/// Random 10-digit payload nonce
pub fn nonce() -> u64 {
    rand::thread_rng().gen_range(1_000_000_000..10_000_000_000)
}

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes one JSON object per line to the upstream channel (stdout)
///
/// Cloned freely; writes from the reader and the worker never interleave
/// within a line.
#[derive(Clone)]
pub struct Reporter {
    exchange: String,
    sink: Sink,
}

impl Reporter {
    pub fn new(exchange: &str, sink: impl Write + Send + 'static) -> Self {
        Self {
            exchange: exchange.to_string(),
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub fn stdout(exchange: &str) -> Self {
        Self::new(exchange, io::stdout())
    }

    /// Reporter writing into memory, plus a handle to read what it wrote
    pub fn capture(exchange: &str) -> (Self, ReportCapture) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let reporter = Self::new(
            exchange,
            SharedBuffer {
                inner: buffer.clone(),
            },
        );
        (reporter, ReportCapture { buffer })
    }

    /// Emit one report. Write failures are logged, never raised.
    pub fn report<T: Serialize + ?Sized>(&self, kind: ReportKind, data: &T) {
        let payload = Payload {
            kind,
            data,
            exchange: &self.exchange,
            nonce: nonce(),
        };

        let mut line = match serde_json::to_vec(&payload) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(?kind, error = %e, "failed to serialize report");
                return;
            }
        };
        line.push(b'\n');

        let written = match self.sink.lock() {
            Ok(mut sink) => sink.write_all(&line).and_then(|_| sink.flush()),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        };
        if let Err(e) = written {
            tracing::error!(?kind, error = %e, "failed to write report");
        }
    }

    /// Report a human-readable error message
    pub fn error(&self, message: &str) {
        self.report(ReportKind::Error, message);
    }
}

struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read side of [`Reporter::capture`]
#[derive(Clone)]
pub struct ReportCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl ReportCapture {
    /// Every report written so far, parsed
    pub fn reports(&self) -> Vec<serde_json::Value> {
        let bytes = match self.buffer.lock() {
            Ok(buffer) => buffer.clone(),
            Err(_) => return Vec::new(),
        };
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Reports whose `type` is `kind`, in write order
    pub fn of_kind(&self, kind: &str) -> Vec<serde_json::Value> {
        self.reports()
            .into_iter()
            .filter(|r| r["type"] == kind)
            .collect()
    }
}
