//! Task API
//!
//! A task is the application protocol that takes over the encrypted channel
//! once the peer handshake is done. The signaling core drives the task: it
//! initializes the selected task with the peer's negotiation data, notifies
//! it when the handshake completes, forwards inbound task messages and
//! closes it on teardown.

use rmpv::Value;
use tokio::sync::mpsc;

use crate::error::{CloseCode, ConnectionError, SaltlinkError};
use crate::protocol::messages::TaskMessage;

/// A post-handshake protocol negotiated between the peers
pub trait Task: Send {
    /// Unique task name as advertised during the peer handshake
    fn name(&self) -> &str;

    /// Message types this task handles once the channel is taken over
    fn supported_message_types(&self) -> &[&str];

    /// Negotiation data sent to the peer alongside the task name
    fn data(&self) -> Option<Value>;

    /// Called with the peer's negotiation data when this task is selected
    fn init(&mut self, data: &Value) -> Result<(), SaltlinkError>;

    /// Called once the peer handshake is complete and the channel is live
    fn on_peer_handshake_done(&mut self, handle: SignalingHandle);

    /// Called for every inbound message of a supported type
    fn on_task_message(&mut self, message: TaskMessage);

    /// Called after handover when a signaling payload must travel over the
    /// task's own channel
    fn send_signaling_message(&mut self, payload: &[u8]);

    /// Called when the connection is being torn down
    fn close(&mut self, reason: CloseCode);
}

/// Requests a task issues back into the signaling core
#[derive(Debug)]
pub enum TaskCommand {
    /// Encrypt and send a task message to the peer
    SendMessage(TaskMessage),
    /// Send an `application` message to the peer
    SendApplication(Value),
    /// Announce the completed handover to a task-provided channel
    Handover,
    /// Close the connection
    Close(CloseCode),
}

/// Handle given to the selected task for sending through the channel
///
/// Commands are executed on the signaling serialization domain; the handle
/// itself is cheap to clone and may be moved to other threads.
#[derive(Debug, Clone)]
pub struct SignalingHandle {
    sender: mpsc::UnboundedSender<TaskCommand>,
}

impl SignalingHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<TaskCommand>) -> Self {
        Self { sender }
    }

    /// Send a task message to the peer
    pub fn send_message(&self, message: TaskMessage) -> Result<(), SaltlinkError> {
        self.command(TaskCommand::SendMessage(message))
    }

    /// Send an `application` message to the peer
    pub fn send_application(&self, data: Value) -> Result<(), SaltlinkError> {
        self.command(TaskCommand::SendApplication(data))
    }

    /// Announce that the task's channel is up and the WebSocket may close
    pub fn handover(&self) -> Result<(), SaltlinkError> {
        self.command(TaskCommand::Handover)
    }

    /// Close the connection with the given code
    pub fn close(&self, reason: CloseCode) -> Result<(), SaltlinkError> {
        self.command(TaskCommand::Close(reason))
    }

    fn command(&self, command: TaskCommand) -> Result<(), SaltlinkError> {
        self.sender
            .send(command)
            .map_err(|_| ConnectionError::NotOpen.into())
    }
}
