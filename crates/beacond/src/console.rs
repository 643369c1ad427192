//! Operator console - the producer side of the hub.
//!
//! Reads operator lines, parses them with [`beacon_protocol::parse`], and
//! submits the resulting messages to the publish queue. Rejections are
//! written back to the operator; they never reach the queue.
//!
//! Standard input is read on a dedicated OS thread
//! ([`spawn_stdin_reader`]) so that a read blocked on the terminal never
//! holds up runtime shutdown.

use std::io::{self, BufRead, Write};
use std::str;
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use beacon_core::{CannedMessages, Message};
use beacon_protocol::{parse, Command};

use crate::broadcast::Publisher;

/// Prompt printed when the console starts
pub const PROMPT: &str = "input: ";

/// Lines buffered between the stdin thread and the console task
const LINE_BUFFER: usize = 16;

/// Why the console stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The operator typed `exit`
    ExitCommand,

    /// The input stream ended or failed
    EndOfInput,

    /// The publish queue was closed underneath the console
    QueueClosed,
}

/// Interactive command loop.
pub struct Console<W> {
    table: Arc<CannedMessages>,
    publisher: Publisher,
    out: W,
}

impl<W: Write + Send> Console<W> {
    pub fn new(table: Arc<CannedMessages>, publisher: Publisher, out: W) -> Self {
        Self {
            table,
            publisher,
            out,
        }
    }

    /// Processes lines until `exit`, end of input, or a closed queue.
    pub async fn run(mut self, mut lines: mpsc::Receiver<String>) -> ConsoleExit {
        self.say(PROMPT);

        while let Some(line) = lines.recv().await {
            if let Some(exit) = self.execute(&line).await {
                return exit;
            }
        }

        info!("Operator input closed");
        ConsoleExit::EndOfInput
    }

    /// Executes a single line. Returns `Some` when the console should stop.
    pub async fn execute(&mut self, line: &str) -> Option<ConsoleExit> {
        let command = match parse(line) {
            Ok(command) => command,
            Err(e) => {
                self.say_line(&e.to_string());
                return None;
            }
        };

        match command {
            Command::Exit => {
                info!("Exit requested by operator");
                Some(ConsoleExit::ExitCommand)
            }
            Command::ListKeys => {
                let keys = self.table.keys().join(", ");
                self.say_line(&format!("available keys: [{keys}]"));
                None
            }
            Command::Broadcast(text) => self.submit_all(vec![Message::text(text)]).await,
            Command::Canned(keys) => match self.table.resolve(&keys) {
                Ok(messages) => self.submit_all(messages).await,
                Err(unknown) => {
                    debug!(unknown = ?unknown.unknown, "Rejected canned message keys");
                    self.say_line(&unknown.to_string());
                    None
                }
            },
        }
    }

    async fn submit_all(&mut self, messages: Vec<Message>) -> Option<ConsoleExit> {
        for message in messages {
            if self.publisher.submit(message).await.is_err() {
                warn!("Publish queue closed, console stopping");
                self.say_line("hub is shutting down, message not sent");
                return Some(ConsoleExit::QueueClosed);
            }
        }
        None
    }

    fn say(&mut self, text: &str) {
        let result = self
            .out
            .write_all(text.as_bytes())
            .and_then(|()| self.out.flush());
        if let Err(e) = result {
            debug!(error = %e, "Failed to write to operator output");
        }
    }

    fn say_line(&mut self, text: &str) {
        self.say(&format!("{text}\n"));
    }
}

/// Reads standard input lines on a dedicated thread.
///
/// The returned channel closes at end of input or on a read error.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(LINE_BUFFER);

    let spawned = thread::Builder::new()
        .name("beacon-stdin".to_string())
        .spawn(move || forward_lines(io::stdin().lock(), &tx));

    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start operator input thread");
    }

    rx
}

/// Sends each line of `reader` to `tx` until end of input, a read error,
/// or a closed channel.
///
/// Invalid UTF-8 is replaced rather than ending the input.
fn forward_lines<R: BufRead>(mut reader: R, tx: &mpsc::Sender<String>) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Failed to read operator input");
                break;
            }
        }

        if buf.ends_with(b"\n") {
            buf.pop();
            if buf.ends_with(b"\r") {
                buf.pop();
            }
        }

        let line = match str::from_utf8(&buf) {
            Ok(line) => line.to_string(),
            Err(_) => {
                warn!("Operator input is not valid UTF-8, replacing invalid bytes");
                String::from_utf8_lossy(&buf).into_owned()
            }
        };

        if tx.blocking_send(line).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::spawn_broadcast_loop;
    use crate::hub::{Hub, HubSettings};

    fn table() -> Arc<CannedMessages> {
        Arc::new(
            CannedMessages::from_entries([
                ("alerts", r#"{"level":"high"}"#),
                ("status", r#"{"ok":true}"#),
            ])
            .unwrap(),
        )
    }

    fn hub() -> Hub {
        Hub::new(HubSettings {
            subscriber_buffer: 64,
            ..HubSettings::default()
        })
    }

    fn output(out: &[u8]) -> String {
        String::from_utf8_lossy(out).into_owned()
    }

    #[tokio::test]
    async fn test_literal_line_is_broadcast() {
        let hub = hub();
        let mut sub = hub.subscribe().unwrap();
        let handle = spawn_broadcast_loop(hub, 8);
        let mut console = Console::new(table(), handle.publisher(), Vec::new());

        assert_eq!(console.execute("Hello World").await, None);
        assert_eq!(sub.recv().await.unwrap().as_str(), "Hello World");
    }

    #[tokio::test]
    async fn test_canned_keys_broadcast_in_order() {
        let hub = hub();
        let mut sub = hub.subscribe().unwrap();
        let handle = spawn_broadcast_loop(hub, 8);
        let mut console = Console::new(table(), handle.publisher(), Vec::new());

        console.execute("json status ALERTS").await;
        assert_eq!(sub.recv().await.unwrap().as_str(), r#"{"ok":true}"#);
        assert_eq!(sub.recv().await.unwrap().as_str(), r#"{"level":"high"}"#);
    }

    #[tokio::test]
    async fn test_unknown_key_rejects_whole_command() {
        let hub = hub();
        let handle = spawn_broadcast_loop(hub, 8);
        let mut out = Vec::new();
        {
            let mut console = Console::new(table(), handle.publisher(), &mut out);
            assert_eq!(console.execute("json alerts missing-file").await, None);
            assert_eq!(console.execute("exit").await, Some(ConsoleExit::ExitCommand));
        }

        handle.close();
        let stats = handle.drained().await;
        assert_eq!(stats.processed, 0);

        let text = output(&out);
        assert!(text.contains("missing-file"));
        assert!(text.contains("alerts, status"));
    }

    #[tokio::test]
    async fn test_empty_and_incomplete_commands_are_reported() {
        let handle = spawn_broadcast_loop(hub(), 8);
        let mut out = Vec::new();
        {
            let mut console = Console::new(table(), handle.publisher(), &mut out);
            console.execute("   ").await;
            console.execute("json").await;
            console.execute("keys").await;
        }

        handle.close();
        assert_eq!(handle.drained().await.processed, 0);

        let text = output(&out);
        assert!(text.contains("input a valid command"));
        assert!(text.contains("at least one canned message key"));
        assert!(text.contains("available keys: [alerts, status]"));
    }

    #[tokio::test]
    async fn test_run_stops_at_end_of_input() {
        let handle = spawn_broadcast_loop(hub(), 8);
        let (tx, rx) = mpsc::channel(4);
        tx.send("first".to_string()).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        let exit = Console::new(table(), handle.publisher(), &mut out)
            .run(rx)
            .await;

        assert_eq!(exit, ConsoleExit::EndOfInput);
        assert!(output(&out).starts_with(PROMPT));

        handle.close();
        assert_eq!(handle.drained().await.processed, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_exit_command() {
        let handle = spawn_broadcast_loop(hub(), 8);
        let (tx, rx) = mpsc::channel(4);
        tx.send("exit".to_string()).await.unwrap();
        tx.send("never sent".to_string()).await.unwrap();

        let exit = Console::new(table(), handle.publisher(), Vec::new())
            .run(rx)
            .await;
        assert_eq!(exit, ConsoleExit::ExitCommand);

        handle.close();
        assert_eq!(handle.drained().await.processed, 0);
    }

    #[test]
    fn test_invalid_utf8_line_does_not_end_input() {
        let input: &[u8] = b"hello\n\xff oops\r\nstill here\n";
        let (tx, mut rx) = mpsc::channel(8);

        forward_lines(input, &tx);
        drop(tx);

        let mut lines = Vec::new();
        while let Some(line) = rx.blocking_recv() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["hello", "\u{FFFD} oops", "still here"]);
    }

    #[test]
    fn test_last_line_without_newline_is_forwarded() {
        let (tx, mut rx) = mpsc::channel(8);
        forward_lines(&b"exit"[..], &tx);
        drop(tx);

        assert_eq!(rx.blocking_recv().as_deref(), Some("exit"));
        assert_eq!(rx.blocking_recv(), None);
    }

    #[tokio::test]
    async fn test_closed_queue_stops_console() {
        let handle = spawn_broadcast_loop(hub(), 8);
        let publisher = handle.publisher();
        handle.close();
        handle.drained().await;

        let mut console = Console::new(table(), publisher, Vec::new());
        assert_eq!(
            console.execute("too late").await,
            Some(ConsoleExit::QueueClosed)
        );
    }
}
