//! Public face of the studio link.
//!
//! [`ProtocolClient`] owns a [`ConnectionSupervisor`], runs its reconnect loop on
//! the Tokio runtime and turns inbound frames into [`ClientEvent`]s on a single
//! consumer queue. Outbound sends are at-most-once: a transport failure tears
//! the connection down, schedules a reconnect and drops the message.

use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace, warn};

use crate::config::LinkConfig;
use crate::protocol::{
    BinaryStudioInfoEncoder, ClientOpCode, InboundMessage, Keybind, Message, StudioInfo,
    StudioInfoEncoder,
};
use crate::supervisor::{ConnectionSupervisor, LinkState, MessageHandler};
use crate::{LinkError, Result};

/// Decoded request from the studio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Keybind(Keybind),
    /// New timeline path, or `None` to clear it.
    PathChanged(Option<String>),
}

impl From<InboundMessage> for ClientEvent {
    fn from(message: InboundMessage) -> Self {
        match message {
            InboundMessage::KeybindTriggered(keybind) => ClientEvent::Keybind(keybind),
            InboundMessage::SendPath(path) => ClientEvent::PathChanged(path),
        }
    }
}

/// Decodes frames and pushes them onto the event queue.
struct EventDispatcher {
    events: mpsc::UnboundedSender<ClientEvent>,
}

#[async_trait::async_trait]
impl MessageHandler for EventDispatcher {
    async fn handle(&self, message: Message) -> Result<()> {
        let event = ClientEvent::from(InboundMessage::decode(message.opcode, &message.payload)?);
        trace!("Dispatching {:?}", event);
        self.events
            .send(event)
            .map_err(|_| LinkError::invalid_state("dispatch event", "the event queue is closed"))
    }
}

/// Studio link client.
pub struct ProtocolClient {
    supervisor: Arc<ConnectionSupervisor>,
    dispatcher: Arc<EventDispatcher>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    runtime: Option<Handle>,
    encoder: Box<dyn StudioInfoEncoder>,
}

impl ProtocolClient {
    /// Create a client that spawns onto the ambient Tokio runtime.
    pub fn new(config: LinkConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            supervisor: Arc::new(ConnectionSupervisor::new(config)),
            dispatcher: Arc::new(EventDispatcher { events: tx }),
            events: Mutex::new(Some(rx)),
            task: Mutex::new(None),
            runtime: None,
            encoder: Box::new(BinaryStudioInfoEncoder),
        }
    }

    /// Spawn onto `handle` instead of the ambient runtime; for hosts that call
    /// in from threads Tokio doesn't own.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Replace the `SetStudioInfo` encoder.
    pub fn with_encoder(mut self, encoder: impl StudioInfoEncoder) -> Self {
        self.encoder = Box::new(encoder);
        self
    }

    /// Start the reconnect loop. Returns immediately; calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.supervisor.is_cancelled() {
            return Err(LinkError::invalid_state("start the studio link", "cancelled"));
        }

        let mut task = self
            .task
            .lock()
            .map_err(|_| LinkError::invalid_state("start the studio link", "poisoned"))?;
        if task.is_some() {
            debug!("Studio link already started");
            return Ok(());
        }

        let handle = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| {
                LinkError::invalid_state("start the studio link", "outside a Tokio runtime")
            })?,
        };

        info!("Starting studio link to {}", self.supervisor.config().address);
        let supervisor = Arc::clone(&self.supervisor);
        let dispatcher = Arc::clone(&self.dispatcher);
        *task = Some(handle.spawn(supervisor.run(dispatcher)));
        Ok(())
    }

    /// Tear down the current connection and reconnect.
    ///
    /// Must not be called after [`cancel`](Self::cancel).
    pub fn restart(&self) -> Result<()> {
        if self.supervisor.is_cancelled() {
            return Err(LinkError::invalid_state("restart the studio link", "cancelled"));
        }
        let started = self.task.lock().map(|task| task.is_some()).unwrap_or(false);
        if !started {
            return self.start();
        }
        info!("Restarting studio link");
        self.supervisor.restart();
        Ok(())
    }

    /// Stop reconnecting and abort in-flight I/O.
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    /// Send `CloseConnection` if connected, then cancel.
    pub async fn close(&self) {
        if self.is_connected() {
            if let Err(e) = self.send(ClientOpCode::CloseConnection, &[]).await {
                warn!("Failed to notify studio of shutdown: {}", e);
            }
        }
        self.cancel();
    }

    /// Wait for the reconnect loop to exit after [`cancel`](Self::cancel).
    pub async fn join(&self) {
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Studio link task failed: {}", e);
            }
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.supervisor.is_cancelled()
    }

    /// Started, socket open and handshake sent.
    pub fn is_connected(&self) -> bool {
        let started = self.task.lock().map(|task| task.is_some()).unwrap_or(false);
        started && self.supervisor.is_connected()
    }

    pub fn state(&self) -> LinkState {
        self.supervisor.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.supervisor.watch_state()
    }

    /// Wait until the link reaches `state`.
    pub async fn wait_for_state(&self, state: LinkState) -> Result<()> {
        let mut rx = self.supervisor.watch_state();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::invalid_state("wait for link state", "the supervisor is gone"))
    }

    /// Take the inbound event stream. Only the first call returns it.
    pub fn take_events(&self) -> Option<impl Stream<Item = ClientEvent> + Send + Unpin + 'static> {
        self.events
            .lock()
            .ok()
            .and_then(|mut events| events.take())
            .map(UnboundedReceiverStream::new)
    }

    /// Send one message.
    ///
    /// Fails with [`LinkError::NotConnected`] when there is no live connection.
    /// A transport failure restarts the connection and drops the message
    /// without reporting an error.
    pub async fn send(&self, opcode: ClientOpCode, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }

        match self.supervisor.send(opcode.into(), payload).await {
            Ok(()) => Ok(()),
            Err(LinkError::NotConnected) => Err(LinkError::NotConnected),
            // Only this connection was torn down; the link itself lives on.
            Err(LinkError::Cancelled) if !self.supervisor.is_cancelled() => {
                debug!("Connection replaced mid-send, dropping {:?}", opcode);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                // The supervisor has already torn that connection down.
                error!("I/O error talking to studio, reconnecting: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send UTF-8 text.
    pub async fn send_str(&self, opcode: ClientOpCode, text: &str) -> Result<()> {
        self.send(opcode, text.as_bytes()).await
    }

    /// Encode and send a `SetStudioInfo` record.
    pub async fn send_studio_info(&self, info: &StudioInfo) -> Result<()> {
        let payload = self.encoder.encode(info);
        self.send(ClientOpCode::SetStudioInfo, &payload).await
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        debug!("Dropping studio link client");
        self.supervisor.cancel();
    }
}
