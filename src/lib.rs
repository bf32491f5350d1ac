//! Self-healing studio link and frame-exact input playback for tool-assisted runs.
//!
//! A game-side runtime plays back a scripted input timeline one frame at a time
//! while an external editing studio drives it over TCP.
//!
//! # Features
//!
//! - **Studio Link**: length-prefixed binary frames over TCP with automatic
//!   reconnection and cooperative cancellation
//! - **Playback**: deterministic per-frame input injection with breakpoint speed
//!   lookahead and scene-reset side effects
//! - **Control**: start/stop, pause/resume and single-frame advance from studio
//!   keybinds
//!
//! # Quick Start
//!
//! See `demos/headless_player.rs` for a complete host loop.
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use taslink::{LinkConfig, TasLink};
//!
//! #[tokio::main]
//! async fn main() -> taslink::Result<()> {
//!     let client = TasLink::connect(LinkConfig::default())?;
//!     let mut events = client.take_events().expect("events are taken once");
//!
//!     while let Some(event) = events.next().await {
//!         println!("Studio sent {:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
pub mod protocol;
pub mod timeline;

// Studio link
pub mod channel;
pub mod client;
pub mod supervisor;

// Playback
pub mod controller;
pub mod scheduler;

// Core exports
pub use config::{LinkConfig, PlaybackConfig};
pub use error::*;
pub use protocol::{ClientOpCode, InboundMessage, Keybind, Message, ServerOpCode, StudioInfo};

// Main API exports
pub use client::{ClientEvent, ProtocolClient};
pub use controller::{AdvanceState, Controller, HostBridge};
pub use scheduler::{InputSink, PlaybackEvent, PlaybackScheduler, PlaybackState, TargetRate, TickClock};
pub use supervisor::LinkState;
pub use timeline::{InputSet, ScriptTimeline, SideEffect, Timeline, TimelineLine, TimelineParser};

use std::sync::Arc;

/// Entry point for studio links.
///
/// # Example
///
/// ```rust,no_run
/// use taslink::{LinkConfig, TasLink};
///
/// # #[tokio::main]
/// # async fn main() -> taslink::Result<()> {
/// let client = TasLink::connect(LinkConfig::default().with_port(34730))?;
/// client.wait_for_state(taslink::LinkState::Connected).await?;
/// # Ok(())
/// # }
/// ```
pub struct TasLink;

impl TasLink {
    /// Validate `config`, then create a client and start its reconnect loop on
    /// the ambient Tokio runtime.
    ///
    /// Returns as soon as the loop is spawned; the studio does not need to be
    /// listening yet.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - No Tokio runtime is running
    pub fn connect(config: LinkConfig) -> Result<Arc<ProtocolClient>> {
        config.validate()?;
        let client = Arc::new(ProtocolClient::new(config));
        client.start()?;
        Ok(client)
    }

    /// Like [`connect`](Self::connect), spawning onto `runtime` instead.
    pub fn connect_on(
        config: LinkConfig,
        runtime: tokio::runtime::Handle,
    ) -> Result<Arc<ProtocolClient>> {
        config.validate()?;
        let client = Arc::new(ProtocolClient::new(config).with_runtime(runtime));
        client.start()?;
        Ok(client)
    }
}
