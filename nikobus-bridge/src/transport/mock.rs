//! Scriptable in-memory transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::BusTransport;
use crate::error::{BridgeError, Result};

/// Replies pushed into the read side whenever a sent line starts with
/// `prefix`.
#[derive(Debug, Clone)]
struct ReplyRule {
    prefix: String,
    replies: Vec<String>,
    /// `None` keeps the rule forever.
    remaining: Option<usize>,
}

/// A [`BusTransport`] that records sent lines and replays scripted input.
pub struct MockTransport {
    sent: Mutex<Vec<String>>,
    rules: Mutex<Vec<ReplyRule>>,
    incoming_tx: mpsc::UnboundedSender<String>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    pending_read_errors: Mutex<VecDeque<String>>,
    failing_sends: AtomicUsize,
    open: AtomicBool,
    closed: CancellationToken,
}

impl MockTransport {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            pending_read_errors: Mutex::new(VecDeque::new()),
            failing_sends: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a line for the reader.
    pub fn push_incoming(&self, line: impl Into<String>) {
        let _ = self.incoming_tx.send(line.into());
    }

    /// Answer every sent line starting with `prefix` with `replies`.
    pub fn reply_to(&self, prefix: impl Into<String>, replies: Vec<String>) {
        self.rules.lock().push(ReplyRule {
            prefix: prefix.into(),
            replies,
            remaining: None,
        });
    }

    /// Like [`reply_to`](Self::reply_to) but only for the next `times` matches.
    pub fn reply_to_times(&self, prefix: impl Into<String>, replies: Vec<String>, times: usize) {
        self.rules.lock().push(ReplyRule {
            prefix: prefix.into(),
            replies,
            remaining: Some(times),
        });
    }

    /// Make the next `count` sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Make the next read fail with a read error.
    pub fn fail_next_read(&self, reason: impl Into<String>) {
        self.pending_read_errors.lock().push_back(reason.into());
    }

    /// Lines successfully sent so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Sent lines starting with `prefix`.
    pub fn sent_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Forward every incoming line to a channel, standing in for the
    /// listener when testing the command worker alone.
    pub fn spawn_pump(self: Arc<Self>) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(line) = self.read().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn apply_rules(&self, line: &str) {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if !line.starts_with(&rule.prefix) || rule.remaining == Some(0) {
                continue;
            }
            for reply in &rule.replies {
                let _ = self.incoming_tx.send(reply.clone());
            }
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            break;
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for MockTransport {
    async fn send(&self, line: &str) -> Result<()> {
        if !self.is_open() {
            return Err(BridgeError::Closed);
        }
        let failing = self.failing_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_sends.store(failing - 1, Ordering::SeqCst);
            return Err(BridgeError::Send(format!("scripted failure sending {}", line)));
        }
        self.sent.lock().push(line.to_string());
        self.apply_rules(line);
        Ok(())
    }

    async fn read(&self) -> Result<String> {
        if let Some(reason) = self.pending_read_errors.lock().pop_front() {
            return Err(BridgeError::Read(reason));
        }
        let mut rx = self.incoming_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(BridgeError::Closed),
            line = rx.recv() => line.ok_or(BridgeError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies() {
        let transport = MockTransport::new();
        transport.reply_to_times("$1012", vec!["$0512".into(), "$1C0747".into()], 1);

        transport.send("$10120747ABCDEF").await.unwrap();
        transport.send("$10120747ABCDEF").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), "$0512");
        assert_eq!(transport.read().await.unwrap(), "$1C0747");
        assert_eq!(transport.sent().len(), 2);

        transport.push_incoming("#E1");
        assert_eq!(transport.read().await.unwrap(), "#E1");
    }

    #[tokio::test]
    async fn test_close_wakes_reader() {
        let transport = Arc::new(MockTransport::new());
        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.read().await })
        };
        transport.close().await.unwrap();
        assert!(matches!(reader.await.unwrap(), Err(BridgeError::Closed)));
    }
}
