//! Reconnect loop that keeps one framed connection to the studio alive.
//!
//! The supervisor owns the only [`TcpChannel`]. Each attempt connects, sends
//! `EstablishConnection`, publishes the channel and then runs the receive loop
//! until the socket fails. Failures back off for a constant interval and try
//! again, forever, until the supervisor is cancelled.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> ...
//!                                    \
//!                                     +-> Cancelled (only via cancel())
//! ```

use std::sync::{Arc, RwLock};

use tokio::net::TcpStream;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::TcpChannel;
use crate::config::LinkConfig;
use crate::protocol::{ClientOpCode, Message};
use crate::{LinkError, Result};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Socket open and handshake sent.
    Connected,
    /// Terminal; no further reconnects.
    Cancelled,
}

/// Receiver of decoded frames from the receive loop.
///
/// An error returned here is logged and the loop keeps reading.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Owner of the single live connection and its reconnect loop.
pub struct ConnectionSupervisor {
    config: LinkConfig,

    /// Current channel, present only after the handshake went out.
    current: RwLock<Option<Arc<TcpChannel>>>,

    /// Global, one-shot cancellation.
    cancel: CancellationToken,

    /// Wakes a pending backoff when a restart is requested. Only waiters
    /// registered at notify time are woken, so no permit outlives a backoff.
    wake: Notify,

    state: watch::Sender<LinkState>,
}

impl ConnectionSupervisor {
    pub fn new(config: LinkConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            current: RwLock::new(None),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            state,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Whether a handshaken channel is currently installed.
    pub fn is_connected(&self) -> bool {
        self.current_channel().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send one frame over the current connection.
    ///
    /// A transport failure tears down the connection it happened on (and only
    /// that one), so the loop reconnects.
    pub async fn send(&self, opcode: u8, payload: &[u8]) -> Result<()> {
        let channel = self.current_channel().ok_or(LinkError::NotConnected)?;
        let result = channel.send(opcode, payload).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                self.tear_down(&channel);
            }
        }
        result
    }

    /// Drop the current connection and make the loop reconnect immediately.
    pub fn restart(&self) {
        match self.current_channel() {
            Some(channel) => {
                debug!("Restart requested, tearing down current connection");
                self.tear_down(&channel);
            }
            None => {
                // Connecting or backing off; state already says so.
                debug!("Restart requested while disconnected, skipping backoff");
                self.wake.notify_waiters();
            }
        }
    }

    /// Stop reconnecting and abort in-flight I/O. Idempotent.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("Cancelling studio link");
        }
        self.cancel.cancel();
    }

    /// Run the reconnect loop until cancelled.
    pub async fn run<H>(self: Arc<Self>, handler: Arc<H>)
    where
        H: MessageHandler + ?Sized,
    {
        info!("Connection supervisor started");
        let mut attempts = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.dispose();
            attempts += 1;
            self.publish(LinkState::Connecting);
            info!("Connecting to studio at {} (attempt {})", self.config.address, attempts);

            let failure = match self.connect().await {
                Ok(channel) => {
                    info!("Connected to studio at {}", self.config.address);
                    attempts = 0;
                    let failure = self.receive_loop(&channel, handler.as_ref()).await;
                    self.tear_down(&channel);
                    failure
                }
                Err(e) => e,
            };

            if failure.is_cancelled() {
                if self.cancel.is_cancelled() {
                    break;
                }
                // Only this connection was cancelled: an explicit restart.
                continue;
            }

            let retry = self.config.retry_interval();
            error!("Studio link failed, retrying in {:?}: {}", retry, failure);
            self.publish(LinkState::Disconnected);

            let woken = self.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = woken => debug!("Backoff interrupted by restart"),
                _ = tokio::time::sleep(retry) => {}
            }
        }

        self.dispose();
        self.publish(LinkState::Cancelled);
        info!("Connection supervisor stopped");
    }

    /// Open a socket and send the handshake before exposing the channel.
    async fn connect(&self) -> Result<Arc<TcpChannel>> {
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(LinkError::Cancelled),
            stream = TcpStream::connect(self.config.address) => {
                stream.map_err(|e| LinkError::transport("connect", e))?
            }
        };

        let channel = Arc::new(TcpChannel::from_tcp(
            stream,
            self.cancel.child_token(),
            self.config.max_payload_len,
        ));
        channel.send(ClientOpCode::EstablishConnection.into(), &[]).await?;

        self.install(Arc::clone(&channel));
        Ok(channel)
    }

    /// Read and dispatch until the channel fails; returns the failure.
    async fn receive_loop<H>(&self, channel: &TcpChannel, handler: &H) -> LinkError
    where
        H: MessageHandler + ?Sized,
    {
        loop {
            let message = match channel.receive().await {
                Ok(message) => message,
                Err(e) => return e,
            };

            let opcode = message.opcode;
            if let Err(e) = handler.handle(message).await {
                warn!("Failed to handle message (opcode {}): {}", opcode, e);
            }
        }
    }

    fn current_channel(&self) -> Option<Arc<TcpChannel>> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    fn install(&self, channel: Arc<TcpChannel>) {
        if let Ok(mut guard) = self.current.write() {
            *guard = Some(channel);
        }
        self.publish(LinkState::Connected);
    }

    fn take_channel(&self) -> Option<Arc<TcpChannel>> {
        self.current.write().ok().and_then(|mut guard| guard.take())
    }

    /// Uninstall `channel` if it is still current, then abort its I/O.
    ///
    /// `Disconnected` is published while the slot is empty and before the
    /// cancel, so the loop cannot install and announce a replacement first.
    fn tear_down(&self, channel: &Arc<TcpChannel>) {
        let removed = match self.current.write() {
            Ok(mut guard) if guard.as_ref().is_some_and(|c| Arc::ptr_eq(c, channel)) => {
                guard.take().is_some()
            }
            _ => false,
        };
        if removed {
            self.publish(LinkState::Disconnected);
        }
        channel.cancel_token().cancel();
    }

    fn dispose(&self) {
        if let Some(channel) = self.take_channel() {
            channel.cancel_token().cancel();
        }
    }

    fn publish(&self, state: LinkState) {
        if *self.state.borrow() == LinkState::Cancelled {
            return;
        }
        if self.state.send_replace(state) != state {
            debug!("Link state -> {:?}", state);
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
