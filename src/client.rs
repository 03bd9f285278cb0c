//! WebSocket transport glue
//!
//! Owns the WebSocket connection and the event loop around the signaling
//! state machine:
//! - connects with timeout and optional linear backoff
//! - serializes all ingress into the state machine
//! - executes the actions the machine returns (replies, closes, events)
//! - drives the keepalive ping timer
//! - drains task commands issued through [`SignalingHandle`]s

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionSettings;
use crate::error::{ConnectionError, Result};
use crate::events::EventRegistry;
use crate::protocol::signaling::{HandleAction, Signaling};
use crate::task::{SignalingHandle, TaskCommand};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A signaling connection to a SaltyRTC server
pub struct SignalingClient {
    signaling: Signaling,
    settings: ConnectionSettings,
    events: EventRegistry,
    ws: Option<WsStream>,
    task_tx: mpsc::UnboundedSender<TaskCommand>,
    task_rx: mpsc::UnboundedReceiver<TaskCommand>,
}

impl SignalingClient {
    pub fn new(signaling: Signaling, settings: ConnectionSettings) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        Self {
            signaling,
            settings,
            events: EventRegistry::new(),
            ws: None,
            task_tx,
            task_rx,
        }
    }

    pub fn signaling(&self) -> &Signaling {
        &self.signaling
    }

    pub fn events_mut(&mut self) -> &mut EventRegistry {
        &mut self.events
    }

    /// A handle for sending through the channel from application code
    pub fn handle(&self) -> SignalingHandle {
        SignalingHandle::new(self.task_tx.clone())
    }

    fn build_request(&self) -> Result<Request> {
        let url = format!(
            "wss://{}:{}/{}",
            self.settings.host,
            self.settings.port,
            self.signaling.websocket_path()
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(crate::SUBPROTOCOL),
        );
        Ok(request)
    }

    /// Connect to the server, honoring the configured timeout and retry
    /// policy.
    pub async fn connect(&mut self) -> Result<()> {
        info!(
            "Connecting to {}:{} as {}",
            self.settings.host,
            self.settings.port,
            self.signaling.role()
        );
        let actions = self.signaling.on_connecting();
        self.emit_events(actions);

        let mut attempt = 0u32;
        let ws = loop {
            attempt += 1;
            debug!("Connection attempt {}", attempt);
            let request = self.build_request()?;

            match timeout(self.settings.connect_timeout, connect_async(request)).await {
                Ok(Ok((ws, _response))) => break ws,
                Ok(Err(e)) => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    if attempt >= self.settings.connect_attempts_max {
                        let actions = self.signaling.on_connect_error();
                        self.emit_events(actions);
                        return Err(ConnectionError::Connect(e.to_string()).into());
                    }
                }
                Err(_) => {
                    warn!("Connection attempt {} timed out", attempt);
                    if attempt >= self.settings.connect_attempts_max {
                        let actions = self.signaling.on_connect_error();
                        self.emit_events(actions);
                        return Err(ConnectionError::Timeout {
                            millis: self.settings.connect_timeout.as_millis() as u64,
                        }
                        .into());
                    }
                }
            }

            if self.settings.connect_linear_backoff {
                tokio::time::sleep(self.settings.connect_timeout * attempt).await;
            }
        };

        info!("WebSocket connection open");
        self.ws = Some(ws);
        let actions = self.signaling.on_transport_open();
        self.emit_events(actions);
        Ok(())
    }

    /// Run the event loop until the connection ends.
    ///
    /// Returns once the WebSocket leg is finished; after a handover the
    /// signaling state is still `Task` and the task's channel carries on.
    pub async fn run(&mut self) -> Result<()> {
        let mut ws = self.ws.take().ok_or(ConnectionError::NotOpen)?;
        let signaling = &mut self.signaling;
        let events = &mut self.events;
        let task_rx = &mut self.task_rx;
        let task_tx = &self.task_tx;

        let mut ping = interval(self.settings.ping_interval);
        // The first tick fires immediately; consume it
        ping.tick().await;
        let mut closing = false;

        loop {
            tokio::select! {
                message = ws.next() => match message {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let actions = signaling.handle_binary(&data);
                        closing |= execute(&mut ws, events, signaling, task_tx, actions).await?;
                    }
                    Some(Ok(WsMessage::Text(_))) => {
                        let actions = signaling.handle_text_frame();
                        closing |= execute(&mut ws, events, signaling, task_tx, actions).await?;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        let actions = signaling.handle_transport_close(code);
                        execute(&mut ws, events, signaling, task_tx, actions).await?;
                        break;
                    }
                    Some(Ok(_)) => {
                        // Pings are answered by tungstenite, pongs ignored
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        let actions = signaling.handle_transport_close(Some(1006));
                        execute(&mut ws, events, signaling, task_tx, actions).await?;
                        return Err(ConnectionError::Connect(e.to_string()).into());
                    }
                    None => {
                        let actions = signaling.handle_transport_close(None);
                        execute(&mut ws, events, signaling, task_tx, actions).await?;
                        break;
                    }
                },
                command = task_rx.recv() => {
                    if let Some(command) = command {
                        let actions = command_actions(signaling, command);
                        closing |= execute(&mut ws, events, signaling, task_tx, actions).await?;
                    }
                }
                _ = ping.tick() => {
                    if !closing {
                        debug!("Sending ping");
                        ws.send(WsMessage::Ping(Vec::new()))
                            .await
                            .map_err(|e| ConnectionError::Send(e.to_string()))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Close the connection before or instead of running the event loop
    pub async fn disconnect(&mut self) -> Result<()> {
        let actions = self.signaling.disconnect();
        for action in actions {
            match action {
                HandleAction::Close(code) => {
                    if let Some(ws) = self.ws.as_mut() {
                        let frame = CloseFrame {
                            code: WsCloseCode::from(code.as_u16()),
                            reason: "".into(),
                        };
                        let _ = ws.close(Some(frame)).await;
                    }
                }
                HandleAction::Event(event) => self.events.emit(&event),
                _ => {}
            }
        }
        Ok(())
    }

    /// Emit event actions outside the running loop (no transport available)
    fn emit_events(&mut self, actions: Vec<HandleAction>) {
        for action in actions {
            if let HandleAction::Event(event) = action {
                self.events.emit(&event);
            }
        }
    }
}

/// Translate a task command into actions, never failing the loop
fn command_actions(signaling: &mut Signaling, command: TaskCommand) -> Vec<HandleAction> {
    match command {
        TaskCommand::SendMessage(message) => match signaling.encode_task_message(&message) {
            Ok(bbox) => vec![HandleAction::Reply(bbox)],
            Err(e) => {
                error!("Could not send task message: {}", e);
                vec![]
            }
        },
        TaskCommand::SendApplication(data) => match signaling.encode_application(data) {
            Ok(bbox) => vec![HandleAction::Reply(bbox)],
            Err(e) => {
                error!("Could not send application message: {}", e);
                vec![]
            }
        },
        TaskCommand::Handover => match signaling.initiate_handover() {
            Ok(actions) => actions,
            Err(e) => {
                error!("Could not initiate handover: {}", e);
                vec![]
            }
        },
        TaskCommand::Close(code) => signaling.close_with(code),
    }
}

/// Execute the actions produced by the state machine.
///
/// Returns `true` once a close frame has been sent, so the caller can stop
/// feeding the socket.
async fn execute(
    ws: &mut WsStream,
    events: &mut EventRegistry,
    signaling: &mut Signaling,
    task_tx: &mpsc::UnboundedSender<TaskCommand>,
    actions: Vec<HandleAction>,
) -> Result<bool> {
    let mut closed = false;
    for action in actions {
        match action {
            HandleAction::Reply(bbox) => {
                ws.send(WsMessage::Binary(bbox.into_bytes()))
                    .await
                    .map_err(|e| ConnectionError::Send(e.to_string()))?;
            }
            HandleAction::Close(code) => {
                debug!("Closing WebSocket ({})", code);
                let frame = CloseFrame {
                    code: WsCloseCode::from(code.as_u16()),
                    reason: "".into(),
                };
                // The closing handshake completes when the server answers
                let _ = ws.close(Some(frame)).await;
                closed = true;
            }
            HandleAction::Event(event) => events.emit(&event),
            HandleAction::HandshakeDone => {
                if let Some(task) = signaling.task_mut() {
                    task.on_peer_handshake_done(SignalingHandle::new(task_tx.clone()));
                }
            }
        }
    }
    Ok(closed)
}
