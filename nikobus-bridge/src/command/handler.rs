//! The command worker: one command at a time, ack+answer wait with retries.

use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::{Command, CommandConfig, CommandResult, ResponseHandler};
use crate::error::{BridgeError, Result};
use crate::transport::BusTransport;

/// Drains the command queue. Owns the listener's response queue exclusively.
pub struct CommandWorker {
    transport: Arc<dyn BusTransport>,
    responses: mpsc::UnboundedReceiver<String>,
    config: CommandConfig,
    cancel: CancellationToken,
}

impl CommandWorker {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        responses: mpsc::UnboundedReceiver<String>,
        config: CommandConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            responses,
            config,
            cancel,
        }
    }

    /// Run until cancelled or every handler is dropped.
    pub async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        info!("Command worker started");
        let cancel = self.cancel.clone();

        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(command) => command,
                    None => break,
                },
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.execute(&command.frame, command.response.as_ref()) => Some(result),
            };

            match outcome {
                Some(result) => {
                    if let Err(e) = &result {
                        warn!("Command {} failed: {}", command.frame, e);
                    }
                    command.finish(result);
                }
                None => {
                    debug!("Command {} cancelled in flight", command.frame);
                    command.finish(Err(BridgeError::Cancelled));
                    break;
                }
            }

            if !self.config.command_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep(self.config.command_delay) => {}
                }
            }
        }

        queue.close();
        let mut dropped = 0usize;
        while let Ok(command) = queue.try_recv() {
            command.finish(Err(BridgeError::Cancelled));
            dropped += 1;
        }
        info!("Command worker stopped ({} queued commands cancelled)", dropped);
    }

    async fn execute(&mut self, frame: &str, response: Option<&ResponseHandler>) -> CommandResult {
        match response {
            None => {
                debug!("-> {}", frame);
                self.transport.send(frame).await.map(|_| None)
            }
            Some(handler) => self.send_and_wait(frame, handler).await.map(Some),
        }
    }

    async fn send_and_wait(&mut self, frame: &str, handler: &ResponseHandler) -> Result<String> {
        let ack = handler.ack_signal();
        let answer = handler.answer_signal();
        let attempts = self.config.max_attempts.max(1);
        self.drain_stale();

        let mut last_error = None;
        for attempt in 1..=attempts {
            debug!(
                "-> {} (attempt {}/{}, awaiting {} and {})",
                frame, attempt, attempts, ack, answer
            );
            if let Err(e) = self.transport.send(frame).await {
                if !e.is_transient() {
                    return Err(e);
                }
                warn!("Sending {} failed (attempt {}/{}): {}", frame, attempt, attempts, e);
                last_error = Some(e);
                continue;
            }

            match self.wait_for_signals(&ack, &answer, handler.answer_len).await {
                Ok(Some(state)) => {
                    debug!("{} answered with state {}", handler.address, state);
                    return Ok(state);
                }
                Ok(None) => {
                    debug!(
                        "No {} + {} within {:?} (attempt {}/{})",
                        ack, answer, self.config.ack_wait_timeout, attempt, attempts
                    );
                    last_error = None;
                }
                Err(e) if e.is_transient() => {
                    warn!("Reading answer to {} failed: {}", frame, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(BridgeError::Timeout { attempts }))
    }

    /// Read the response queue until both signals have been seen or the ack
    /// wait elapses. `Ok(None)` means the wait timed out.
    async fn wait_for_signals(
        &mut self,
        ack: &str,
        answer: &str,
        answer_len: usize,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + self.config.ack_wait_timeout;
        let mut ack_seen = false;
        let mut state = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = self.config.read_timeout.min(deadline - now);
            let line = match timeout(wait, self.responses.recv()).await {
                Err(_) => continue,
                Ok(None) => return Err(BridgeError::Closed),
                Ok(Some(line)) => line,
            };
            trace!("Response queue: {}", line);

            if !ack_seen && line.contains(ack) {
                ack_seen = true;
            }
            if state.is_none() {
                state = extract_state(&line, answer, answer_len);
            }
            if ack_seen && state.is_some() {
                return Ok(state);
            }
        }
    }

    /// Drop responses to earlier commands.
    fn drain_stale(&mut self) {
        while let Ok(line) = self.responses.try_recv() {
            trace!("Dropping stale response {}", line);
        }
    }
}

/// State following `answer` and its status byte.
pub fn extract_state(line: &str, answer: &str, answer_len: usize) -> Option<String> {
    let start = line.find(answer)? + answer.len() + 2;
    line.get(start..start + answer_len)
        .filter(|state| state.chars().all(|c| c.is_ascii_hexdigit()))
        .map(|state| state.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandHandler;
    use crate::transport::MockTransport;
    use nikobus_protocol::{make_command, make_raw_command, FunctionCode, ModuleAddress};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn fast_config(max_attempts: u32) -> CommandConfig {
        CommandConfig {
            max_attempts,
            ack_wait_timeout: Duration::from_millis(60),
            read_timeout: Duration::from_millis(20),
            command_delay: Duration::ZERO,
        }
    }

    fn spawn_worker(
        transport: Arc<MockTransport>,
        config: CommandConfig,
    ) -> (CommandHandler, tokio::task::JoinHandle<()>) {
        let responses = transport.clone().spawn_pump();
        CommandHandler::spawn(transport, responses, config, CancellationToken::new())
    }

    fn get_frame() -> String {
        make_command(0x12, "4707", None).unwrap()
    }

    fn get_response() -> ResponseHandler {
        ResponseHandler::new(FunctionCode::GetGroup1, ModuleAddress::new("4707").unwrap())
    }

    #[test]
    fn test_extract_state() {
        let answer = make_raw_command("074700FF0000000000").unwrap();
        assert_eq!(
            extract_state(&format!("$0512{}", answer), "$1C0747", 12).as_deref(),
            Some("FF0000000000")
        );
        assert_eq!(extract_state("$1C0747", "$1C0747", 12), None);
        assert_eq!(extract_state("$1C9105...", "$1C0747", 12), None);
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let transport = Arc::new(MockTransport::new());
        let (handler, _task) = spawn_worker(transport.clone(), fast_config(3));

        let result = handler.queue_command(Command::new("#L0")).await.unwrap();
        assert_eq!(result, None);
        assert_eq!(transport.sent(), vec!["#L0".to_string()]);
    }

    #[tokio::test]
    async fn test_ack_and_answer_in_separate_lines() {
        let transport = Arc::new(MockTransport::new());
        let answer = make_raw_command("0747001200FF000000").unwrap();
        transport.reply_to("$10120747", vec!["$0512".into(), answer]);
        let (handler, _task) = spawn_worker(transport.clone(), fast_config(3));

        let state = handler
            .queue_command(Command::with_response(get_frame(), get_response()))
            .await
            .unwrap();
        assert_eq!(state.as_deref(), Some("1200FF000000"));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_exactly_max_attempts() {
        let transport = Arc::new(MockTransport::new());
        let (handler, _task) = spawn_worker(transport.clone(), fast_config(3));

        let err = handler
            .queue_command(Command::with_response(get_frame(), get_response()))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { attempts: 3 }));
        assert_eq!(transport.sent(), vec![get_frame(); 3]);
    }

    #[tokio::test]
    async fn test_ack_without_answer_times_out() {
        let transport = Arc::new(MockTransport::new());
        transport.reply_to("$10120747", vec!["$0512".into()]);
        let (handler, _task) = spawn_worker(transport.clone(), fast_config(2));

        let err = handler
            .queue_command(Command::with_response(get_frame(), get_response()))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { attempts: 2 }));
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_send_errors_are_retried() {
        let transport = Arc::new(MockTransport::new());
        let answer = make_raw_command("074700000000000000").unwrap();
        transport.reply_to("$10120747", vec![format!("$0512{}", answer)]);
        transport.fail_next_sends(2);
        let (handler, _task) = spawn_worker(transport.clone(), fast_config(3));

        let state = handler
            .queue_command(Command::with_response(get_frame(), get_response()))
            .await
            .unwrap();
        assert_eq!(state.as_deref(), Some("000000000000"));
    }

    #[tokio::test]
    async fn test_last_send_error_is_propagated() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_sends(3);
        let (handler, _task) = spawn_worker(transport.clone(), fast_config(3));

        let err = handler
            .queue_command(Command::with_response(get_frame(), get_response()))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Send(_)));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stale_answer_is_not_used() {
        let transport = Arc::new(MockTransport::new());
        let answer = make_raw_command("074700FFFFFFFFFFFF").unwrap();
        transport.push_incoming(format!("$0512{}", answer));
        let (handler, _task) = spawn_worker(transport.clone(), fast_config(1));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = handler
            .queue_command(Command::with_response(get_frame(), get_response()))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { attempts: 1 }));
    }

    #[tokio::test]
    async fn test_commands_are_serialized() {
        let transport = Arc::new(MockTransport::new());
        let (handler, _task) = spawn_worker(transport.clone(), fast_config(2));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = order.clone();
            handler.enqueue(
                Command::with_response(get_frame(), get_response())
                    .on_complete(move |ok| order.lock().push(("get", ok))),
            )
        };
        let second = {
            let order = order.clone();
            handler.enqueue(Command::new("#L0").on_complete(move |ok| order.lock().push(("lamp", ok))))
        };

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(transport.sent(), vec![get_frame(), get_frame(), "#L0".to_string()]);
        assert_eq!(*order.lock(), vec![("get", false), ("lamp", true)]);
    }

    #[tokio::test]
    async fn test_cancellation_resolves_every_command() {
        let transport = Arc::new(MockTransport::new());
        let mut config = fast_config(3);
        config.ack_wait_timeout = Duration::from_secs(30);
        let (handler, task) = spawn_worker(transport.clone(), config);
        let completions = Arc::new(Mutex::new(Vec::new()));

        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let completions = completions.clone();
                handler.enqueue(
                    Command::with_response(get_frame(), get_response())
                        .on_complete(move |ok| completions.lock().push(ok)),
                )
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handler.stop();

        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(BridgeError::Cancelled)));
        }
        task.await.unwrap();
        assert_eq!(*completions.lock(), vec![false, false, false]);

        let late = handler.queue_command(Command::new("#L0")).await;
        assert!(matches!(late, Err(BridgeError::Cancelled)));
        assert!(handler.is_stopped());
    }
}
