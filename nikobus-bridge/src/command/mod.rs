//! Command queue and output control.
//!
//! Every frame sent to the bus goes through one worker task, so no two
//! commands are ever in flight at the same time:
//!
//! 1. [`CommandHandler`] pushes a [`Command`] onto the queue
//! 2. the worker sends it and, when a [`ResponseHandler`] is attached,
//!    waits for the ack and answer signals (with retries)
//! 3. the result goes back on a oneshot channel, the completion callback
//!    runs, and the worker sleeps `command_delay` before the next command

pub mod handler;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use nikobus_protocol::hex;
use nikobus_protocol::{
    make_command, parse_frame, FunctionCode, Group, ModuleAddress, CHANNELS_PER_GROUP,
    GROUP_WRITE_MARKER, STATE_HEX_LEN,
};

use crate::error::{BridgeError, Result};
use crate::transport::BusTransport;

pub use handler::CommandWorker;

/// Attempts per command before giving up.
pub const MAX_ATTEMPTS: u32 = 3;

/// Command handler configuration.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub max_attempts: u32,
    /// Total wait for ack and answer after each send.
    pub ack_wait_timeout: Duration,
    /// Bound on each individual read from the response queue.
    pub read_timeout: Duration,
    /// Pause between two commands.
    pub command_delay: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            ack_wait_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(500),
            command_delay: Duration::from_millis(300),
        }
    }
}

/// What the worker waits for after sending a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHandler {
    pub function: FunctionCode,
    /// Module (or controller) the command is addressed to.
    pub address: ModuleAddress,
    /// Hex digits of state following the answer signal's status byte.
    pub answer_len: usize,
}

impl ResponseHandler {
    pub fn new(function: FunctionCode, address: ModuleAddress) -> Self {
        Self {
            function,
            address,
            answer_len: STATE_HEX_LEN,
        }
    }

    /// Derive function and address from an outgoing frame.
    pub fn for_frame(frame: &str) -> Result<Self> {
        let parsed = parse_frame(frame)?;
        let function = parsed
            .function()
            .ok_or_else(|| BridgeError::Data(format!("frame without function: {}", frame)))?;
        let address = parsed
            .address()
            .ok_or_else(|| BridgeError::Data(format!("frame without address: {}", frame)))?;
        Ok(Self::new(
            FunctionCode::try_from(function)?,
            ModuleAddress::new(&address)?,
        ))
    }

    pub fn ack_signal(&self) -> String {
        self.function.ack_signal()
    }

    pub fn answer_signal(&self) -> String {
        self.function.answer_signal(&self.address.swapped())
    }
}

/// Callback run once a command has finished; `true` on success.
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Outcome delivered to the submitter: the answer state, if one was awaited.
pub type CommandResult = Result<Option<String>>;

/// One frame queued for the bus.
pub struct Command {
    pub frame: String,
    pub response: Option<ResponseHandler>,
    pub on_complete: Option<CompletionCallback>,
    reply: Option<oneshot::Sender<CommandResult>>,
}

impl Command {
    /// Fire-and-forget frame.
    pub fn new(frame: impl Into<String>) -> Self {
        Self {
            frame: frame.into(),
            response: None,
            on_complete: None,
            reply: None,
        }
    }

    /// Frame that must be acknowledged and answered.
    pub fn with_response(frame: impl Into<String>, response: ResponseHandler) -> Self {
        Self {
            response: Some(response),
            ..Self::new(frame)
        }
    }

    pub fn on_complete(mut self, callback: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Deliver the result and run the completion callback.
    pub(crate) fn finish(self, result: CommandResult) {
        let success = result.is_ok();
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
        if let Some(callback) = self.on_complete {
            callback(success);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("frame", &self.frame)
            .field("response", &self.response)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Cloneable front end of the command worker.
#[derive(Clone)]
pub struct CommandHandler {
    queue: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl CommandHandler {
    /// Spawn the worker. `responses` is the listener's response queue.
    pub fn spawn(
        transport: Arc<dyn BusTransport>,
        responses: mpsc::UnboundedReceiver<String>,
        config: CommandConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let worker = CommandWorker::new(transport, responses, config, cancel.clone());
        let task = tokio::spawn(worker.run(queue_rx));
        (
            Self {
                queue: queue_tx,
                cancel,
            },
            task,
        )
    }

    /// Queue a command and return the receiver of its result.
    pub fn enqueue(&self, mut command: Command) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        command.reply = Some(tx);
        if self.cancel.is_cancelled() {
            command.finish(Err(BridgeError::Cancelled));
            return rx;
        }
        if let Err(mpsc::error::SendError(command)) = self.queue.send(command) {
            command.finish(Err(BridgeError::Cancelled));
        }
        rx
    }

    /// Queue a command and wait for its result.
    pub async fn queue_command(&self, command: Command) -> CommandResult {
        self.enqueue(command)
            .await
            .unwrap_or(Err(BridgeError::Cancelled))
    }

    /// Send `frame`; with `expect_ack_and_answer` wait for both signals and
    /// return the answer state.
    pub async fn send_command(
        &self,
        frame: impl Into<String>,
        expect_ack_and_answer: bool,
    ) -> CommandResult {
        let frame = frame.into();
        let command = if expect_ack_and_answer {
            let response = ResponseHandler::for_frame(&frame)?;
            Command::with_response(frame, response)
        } else {
            Command::new(frame)
        };
        self.queue_command(command).await
    }

    /// Read the 6 channel bytes of one group, as 12 hex digits.
    pub async fn get_output_state(&self, address: &ModuleAddress, group: Group) -> Result<String> {
        let function = group.get_function();
        let frame = make_command(function.code(), address.as_str(), None)?;
        let response = ResponseHandler::new(function, address.clone());
        let command = Command::with_response(frame, response);
        let state = self.queue_command(command).await?;
        state.ok_or_else(|| BridgeError::Data(format!("no state returned by {}", address)))
    }

    /// Set one channel (1-12) to `value`, keeping the rest of its group.
    pub async fn set_output_state(
        &self,
        address: &ModuleAddress,
        channel: u8,
        value: u8,
    ) -> Result<()> {
        let group = Group::of_channel(channel)
            .ok_or_else(|| BridgeError::Data(format!("channel {} out of range", channel)))?;
        let slot = group
            .slot(channel)
            .ok_or_else(|| BridgeError::Data(format!("channel {} out of range", channel)))?;

        let current = self.get_output_state(address, group).await?;
        let mut bytes = hex::decode(&current)?;
        if bytes.len() != CHANNELS_PER_GROUP as usize {
            return Err(BridgeError::Data(format!(
                "unexpected state {:?} from {}",
                current, address
            )));
        }
        bytes[slot] = value;
        debug!(
            "Module {} channel {}: {} -> {}",
            address,
            channel,
            current,
            hex::encode(&bytes)
        );
        self.write_group(address, group, &bytes).await
    }

    /// Write all channels of a module: 6 values for group 1 only, 12 for
    /// both groups.
    pub async fn set_output_states_for_module(
        &self,
        address: &ModuleAddress,
        channel_states: &[u8],
    ) -> Result<()> {
        let per_group = CHANNELS_PER_GROUP as usize;
        let count = channel_states.len();
        if count == 0 || count % per_group != 0 || count > 2 * per_group {
            return Err(BridgeError::Data(format!(
                "expected 6 or 12 channel states, got {}",
                count
            )));
        }
        for (index, states) in channel_states.chunks(per_group).enumerate() {
            let group = if index == 0 { Group::One } else { Group::Two };
            self.write_group(address, group, states).await?;
        }
        Ok(())
    }

    async fn write_group(
        &self,
        address: &ModuleAddress,
        group: Group,
        states: &[u8],
    ) -> Result<()> {
        let function = group.set_function();
        let args = format!("{}{}", hex::encode(states), GROUP_WRITE_MARKER);
        let frame = make_command(function.code(), address.as_str(), Some(&args))?;
        let response = ResponseHandler::new(function, address.clone());
        let command = Command::with_response(frame, response);
        self.queue_command(command).await.map(|_| ())
    }

    /// Stop the worker; queued and in-flight commands fail with `Cancelled`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
