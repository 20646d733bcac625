use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use serde::de::Error as _;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use super::reporter::{ReportKind, Reporter};
use super::shutdown::{ShutdownHandle, ShutdownReason};
use crate::error::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn is_on(self) -> bool {
        self == Toggle::On
    }
}

/// Control message from the upstream sender
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Per-market on/off, keyed by pair id (`ETH_BTC`)
    Markets(BTreeMap<String, Toggle>),
    Pause,
    Ping(serde_json::Value),
    Shutdown,
}

#[derive(Deserialize)]
struct RawCommand {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl Command {
    /// Parse one line of `{"type": ..., "data": ...}`
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let malformed = |source| CommandError::Malformed {
            line: line.to_string(),
            source,
        };

        let raw: RawCommand = serde_json::from_str(line).map_err(malformed)?;
        match raw.kind.as_str() {
            "markets" => {
                let toggles: BTreeMap<String, Toggle> =
                    serde_json::from_value(raw.data).map_err(malformed)?;
                Ok(Command::Markets(
                    toggles
                        .into_iter()
                        .map(|(pair, toggle)| (pair.to_uppercase(), toggle))
                        .collect(),
                ))
            }
            "pause" => Ok(Command::Pause),
            "ping" => Ok(Command::Ping(raw.data)),
            "shutdown" => Ok(Command::Shutdown),
            other => Err(malformed(serde_json::Error::custom(format!(
                "unknown command type {:?}",
                other
            )))),
        }
    }
}

/// Reader task: one line at a time, each bounded by `timeout`
///
/// `ping` is answered here and `shutdown` raises the flag directly; every
/// other command goes onto the queue, waiting while it is full. Ends on
/// shutdown, on timeout (raising `InputTimeout`) or at end of input
/// (raising `InputClosed`).
pub async fn read_commands<R>(
    input: R,
    queue: mpsc::Sender<Command>,
    reporter: Reporter,
    shutdown: ShutdownHandle,
    timeout: Duration,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            next = tokio::time::timeout(timeout, lines.next_line()) => next,
        };

        let line = match next {
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs_f64(), "no command received in time");
                shutdown.trigger(ShutdownReason::InputTimeout);
                break;
            }
            Ok(Ok(None)) => {
                tracing::info!("command input closed");
                shutdown.trigger(ShutdownReason::InputClosed);
                break;
            }
            // Undecodable line; its bytes are already consumed
            Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(error = %e, "dropping undecodable command line");
                reporter.error(&format!("malformed command input: {}", e));
                continue;
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to read command input");
                reporter.error(&format!("failed to read command input: {}", e));
                shutdown.trigger(ShutdownReason::InputClosed);
                break;
            }
            Ok(Ok(Some(line))) => line,
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match Command::parse(line) {
            Ok(Command::Ping(data)) => reporter.report(ReportKind::Pong, &data),
            Ok(Command::Shutdown) => {
                shutdown.trigger(ShutdownReason::Requested);
                break;
            }
            Ok(command) => {
                tracing::debug!(?command, "command queued");
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    sent = queue.send(command) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed command");
                reporter.error(&e.to_string());
            }
        }
    }

    tracing::debug!("command reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn test_parse_markets() {
        let command = Command::parse(r#"{"type":"markets","data":{"eth_btc":"off","XRP_BTC":"on"}}"#)
            .unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("ETH_BTC".to_string(), Toggle::Off);
        expected.insert("XRP_BTC".to_string(), Toggle::On);
        assert_eq!(command, Command::Markets(expected));
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse(r#"{"type":"pause"}"#).unwrap(), Command::Pause);
        assert_eq!(Command::parse(r#"{"type":"shutdown"}"#).unwrap(), Command::Shutdown);
        assert_eq!(
            Command::parse(r#"{"type":"ping","data":"x"}"#).unwrap(),
            Command::Ping(json!("x"))
        );
        assert_eq!(
            Command::parse(r#"{"type":"ping"}"#).unwrap(),
            Command::Ping(serde_json::Value::Null)
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Command::parse("not json").is_err());
        assert!(Command::parse(r#"{"type":"dance"}"#).is_err());
        assert!(Command::parse(r#"{"type":"markets","data":{"ETH_BTC":"maybe"}}"#).is_err());
        assert!(Command::parse(r#"{"data":1}"#).is_err());
    }

    #[tokio::test]
    async fn test_ping_bypasses_queue() {
        let input = tokio_test::io::Builder::new()
            .read(b"{\"type\":\"ping\",\"data\":\"x\"}\n")
            .build();
        let (tx, mut rx) = mpsc::channel(10);
        let (reporter, capture) = Reporter::capture("paper");
        let shutdown = ShutdownHandle::new();

        read_commands(
            BufReader::new(input),
            tx,
            reporter,
            shutdown.clone(),
            Duration::from_secs(1),
        )
        .await;

        let pongs = capture.of_kind("pong");
        assert_eq!(pongs.len(), 1);
        assert_eq!(pongs[0]["data"], "x");
        assert!(rx.try_recv().is_err());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::InputClosed));
    }

    #[tokio::test]
    async fn test_commands_queued_in_order_and_garbage_reported() {
        let input = tokio_test::io::Builder::new()
            .read(b"{\"type\":\"pause\"}\n")
            .read(b"garbage\n\n")
            .read(b"{\"type\":\"markets\",\"data\":{\"ETH_BTC\":\"on\"}}\n")
            .build();
        let (tx, mut rx) = mpsc::channel(10);
        let (reporter, capture) = Reporter::capture("paper");

        read_commands(
            BufReader::new(input),
            tx,
            reporter,
            ShutdownHandle::new(),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(rx.recv().await, Some(Command::Pause));
        assert!(matches!(rx.recv().await, Some(Command::Markets(_))));
        assert_eq!(capture.of_kind("error").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_dropped_not_fatal() {
        let input: &[u8] = b"\xff\xfe garbage\n{\"type\":\"pause\"}\n";
        let (tx, mut rx) = mpsc::channel(10);
        let (reporter, capture) = Reporter::capture("paper");
        let shutdown = ShutdownHandle::new();

        read_commands(
            BufReader::new(input),
            tx,
            reporter,
            shutdown.clone(),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(rx.recv().await, Some(Command::Pause));
        let errors = capture.of_kind("error");
        assert_eq!(errors.len(), 1);
        assert!(errors[0]["data"].as_str().unwrap().contains("malformed"));
        // Reader ran on to end of input rather than stopping at the bad line
        assert_eq!(shutdown.reason(), Some(ShutdownReason::InputClosed));
    }

    #[tokio::test]
    async fn test_timeout_triggers_shutdown() {
        let input = tokio_test::io::Builder::new()
            .wait(Duration::from_secs(5))
            .build();
        let (tx, _rx) = mpsc::channel(10);
        let (reporter, _capture) = Reporter::capture("paper");
        let shutdown = ShutdownHandle::new();

        read_commands(
            BufReader::new(input),
            tx,
            reporter,
            shutdown.clone(),
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(shutdown.reason(), Some(ShutdownReason::InputTimeout));
    }

    #[tokio::test]
    async fn test_shutdown_command_stops_reader() {
        let input = tokio_test::io::Builder::new()
            .read(b"{\"type\":\"shutdown\"}\n")
            .build();
        let (tx, _rx) = mpsc::channel(10);
        let (reporter, _capture) = Reporter::capture("paper");
        let shutdown = ShutdownHandle::new();

        read_commands(
            BufReader::new(input),
            tx,
            reporter,
            shutdown.clone(),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(shutdown.reason(), Some(ShutdownReason::Requested));
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_shutdown() {
        let input = tokio_test::io::Builder::new()
            .read(b"{\"type\":\"pause\"}\n{\"type\":\"pause\"}\n")
            .wait(Duration::from_secs(5))
            .build();
        let (tx, mut rx) = mpsc::channel(1);
        let (reporter, _capture) = Reporter::capture("paper");
        let shutdown = ShutdownHandle::new();

        let reader = tokio::spawn(read_commands(
            BufReader::new(input),
            tx,
            reporter,
            shutdown.clone(),
            Duration::from_secs(10),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        shutdown.trigger(ShutdownReason::Interrupted);
        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(rx.recv().await, Some(Command::Pause));
    }
}
