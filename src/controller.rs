//! Glue between the studio link and the playback scheduler.
//!
//! Studio requests ([`ClientEvent`]s) become scheduler commands; scheduler
//! progress becomes `SetStudioInfo` messages. The host calls
//! [`Controller::before_update`] and [`Controller::late_update`] from its frame
//! loop, while studio events arrive from the link's task, so all mutable state
//! lives behind one mutex.
//!
//! Outbound messages go through a single relay task so they reach the studio in
//! the order they were produced. Messages produced while disconnected are
//! dropped, not queued.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::client::{ClientEvent, ProtocolClient};
use crate::protocol::{ClientOpCode, Keybind, StudioInfo};
use crate::scheduler::{InputSink, PlaybackEvent, PlaybackScheduler, PlaybackState, TickClock};
use crate::timeline::{Timeline, TimelineParser};
use crate::{LinkError, Result};

/// Host-side effects the controller cannot perform itself.
pub trait HostBridge: Send {
    /// Freeze or unfreeze game time.
    fn set_paused(&mut self, paused: bool);

    /// Move the player back to the scene's fixed reference point.
    fn scene_reset(&mut self, target: &str);

    /// Diagnostic text shown in the studio (player coordinates, for instance).
    fn diagnostic(&self) -> Option<String>;
}

/// Single-frame advance progress, stepped by [`Controller::late_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvanceState {
    /// Resume on the next late update.
    Queued,
    /// One frame is playing; pause on the next late update.
    Advancing,
    Idle,
}

#[derive(Debug)]
enum Outbound {
    StudioInfo(StudioInfo),
    InfoString(String),
}

struct ControllerState<C, I, H> {
    scheduler: PlaybackScheduler<C, I>,
    host: H,
    tas_running: bool,
    path: Option<PathBuf>,
    paused: bool,
    advance: AdvanceState,
}

/// Drives a [`PlaybackScheduler`] from studio requests and host frame callbacks.
pub struct Controller<C, I, H, P> {
    state: Mutex<ControllerState<C, I, H>>,
    client: Arc<ProtocolClient>,
    parser: P,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl<C, I, H, P> Controller<C, I, H, P>
where
    C: TickClock,
    I: InputSink,
    H: HostBridge,
    P: TimelineParser,
{
    /// Create a controller and spawn its outbound relay on `runtime`.
    pub fn new(
        scheduler: PlaybackScheduler<C, I>,
        host: H,
        parser: P,
        client: Arc<ProtocolClient>,
        runtime: &Handle,
    ) -> Self {
        let (outbound, rx) = mpsc::unbounded_channel();
        runtime.spawn(relay(Arc::clone(&client), rx));

        Self {
            state: Mutex::new(ControllerState {
                scheduler,
                host,
                tas_running: false,
                path: None,
                paused: false,
                advance: AdvanceState::Idle,
            }),
            client,
            parser,
            outbound,
        }
    }

    pub fn client(&self) -> &Arc<ProtocolClient> {
        &self.client
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.lock().scheduler.state()
    }

    pub fn active_frame(&self) -> u64 {
        self.lock().scheduler.active_frame()
    }

    pub fn is_tas_running(&self) -> bool {
        self.lock().tas_running
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn advance_state(&self) -> AdvanceState {
        self.lock().advance
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    /// Apply studio events until the stream ends.
    pub async fn run_events<S>(&self, mut events: S)
    where
        S: Stream<Item = ClientEvent> + Unpin,
    {
        while let Some(event) = events.next().await {
            self.on_event(event);
        }
        debug!("Studio event stream ended");
    }

    pub fn on_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Keybind(keybind) => self.on_keybind(keybind),
            ClientEvent::PathChanged(path) => self.on_path_changed(path.map(PathBuf::from)),
        }
    }

    pub fn on_keybind(&self, keybind: Keybind) {
        info!("Got keybind {}", keybind);
        match keybind {
            Keybind::StartStop => self.restart_tas(),
            Keybind::FrameAdvance => self.advance(),
            Keybind::PauseResume => self.pause_resume(),
            Keybind::ToggleHitboxes => {}
        }
    }

    /// Load a new timeline, or clear it with `None`.
    ///
    /// A file that fails to load or parse is logged and leaves the previous
    /// path and timeline in place.
    pub fn on_path_changed(&self, path: Option<PathBuf>) {
        let Some(path) = path else {
            let mut state = self.lock();
            state.path = None;
            state.scheduler.set_timeline(None);
            state.tas_running = false;
            info!("Unset path");
            return;
        };

        info!("Got path {}", path.display());
        match self.load(&path) {
            Ok(timeline) => {
                let mut state = self.lock();
                state.scheduler.set_timeline(Some(timeline));
                state.path = Some(path);
            }
            Err(e) => error!("Failed to parse TAS file {}: {}", path.display(), e),
        }
    }

    /// Start playback from the top, or stop it if it is running.
    pub fn restart_tas(&self) {
        let mut state = self.lock();
        if state.tas_running {
            info!("Stop");
            state.tas_running = false;
            if state.scheduler.is_running() {
                let _ = state.scheduler.stop();
            }
            resume(&mut state);
        } else if let Some(path) = state.path.clone() {
            // Reload so edits made since the path was sent are played.
            match self.load(&path) {
                Ok(timeline) => state.scheduler.set_timeline(Some(timeline)),
                Err(e) => error!("Failed to reload TAS file {}: {}", path.display(), e),
            }
            if state.scheduler.is_running() {
                let _ = state.scheduler.stop();
            }
            match state.scheduler.start() {
                Ok(()) => {
                    info!("Start");
                    state.tas_running = true;
                }
                Err(e) => error!("Failed to start TAS: {}", e),
            }
        } else {
            error!("Can't start TAS without knowing the path");
        }
        drop(state);

        self.queue(Outbound::StudioInfo(StudioInfo::invalid()));
    }

    pub fn pause_resume(&self) {
        let mut state = self.lock();
        if state.paused {
            resume(&mut state);
        } else {
            pause(&mut state);
        }
    }

    /// Pause, then play exactly one frame over the next two late updates.
    pub fn advance(&self) {
        info!("Advancing");
        let mut state = self.lock();
        pause(&mut state);
        state.advance = AdvanceState::Queued;
    }

    /// Per-frame hook before the host processes input: runs one scheduler tick.
    pub fn before_update(&self) {
        let mut state = self.lock();
        let events = state.scheduler.tick();
        if events.is_empty() {
            return;
        }

        for event in events {
            match event {
                PlaybackEvent::Advance { source_line, frame_in_line, .. } => {
                    let active_frame = state.scheduler.active_frame();
                    self.queue(Outbound::StudioInfo(StudioInfo::progress(
                        source_line,
                        frame_in_line,
                        active_frame,
                    )));
                }
                PlaybackEvent::BreakpointHit { speed, last } => {
                    debug!("Breakpoint hit (speed {}, last {})", speed, last);
                }
                PlaybackEvent::SceneReset { target } => state.host.scene_reset(&target),
                PlaybackEvent::Finished => {
                    state.tas_running = false;
                    self.queue(Outbound::StudioInfo(StudioInfo::invalid()));
                }
            }
        }
    }

    /// Per-frame hook after the host's update: steps frame advance and
    /// reports host diagnostics.
    pub fn late_update(&self) {
        let mut state = self.lock();
        match state.advance {
            AdvanceState::Queued => {
                resume(&mut state);
                state.advance = AdvanceState::Advancing;
            }
            AdvanceState::Advancing => {
                pause(&mut state);
                state.advance = AdvanceState::Idle;
            }
            AdvanceState::Idle => {}
        }

        if self.client.is_connected() {
            if let Some(text) = state.host.diagnostic() {
                self.queue(Outbound::InfoString(text));
            }
        }
    }

    /// Notify the studio and shut the link down.
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock();
            if state.scheduler.is_running() {
                let _ = state.scheduler.stop();
            }
        }
        self.client.close().await;
    }

    fn load(&self, path: &Path) -> Result<Arc<dyn Timeline>> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LinkError::timeline(format!("reading {}", path.display()), e.to_string()))?;
        self.parser.parse(&text)
    }

    fn queue(&self, message: Outbound) {
        if self.outbound.send(message).is_err() {
            debug!("Outbound relay has stopped, dropping message");
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState<C, I, H>> {
        // A panic inside a host callback must not wedge playback for good.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn pause<C: TickClock, I: InputSink, H: HostBridge>(state: &mut ControllerState<C, I, H>) {
    if state.paused {
        return;
    }
    if state.scheduler.is_running() {
        let _ = state.scheduler.stop();
    }
    info!("Pause");
    state.paused = true;
    state.host.set_paused(true);
}

fn resume<C: TickClock, I: InputSink, H: HostBridge>(state: &mut ControllerState<C, I, H>) {
    if !state.paused {
        return;
    }
    if state.tas_running && !state.scheduler.is_running() {
        if let Err(e) = state.scheduler.resume() {
            error!("Failed to resume TAS: {}", e);
        }
    }
    info!("Resume");
    state.host.set_paused(false);
    state.paused = false;
}

/// Forward outbound messages in order while connected.
async fn relay(client: Arc<ProtocolClient>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(message) = rx.recv().await {
        if !client.is_connected() {
            trace!("Not connected, dropping {:?}", message);
            continue;
        }
        let result = match &message {
            Outbound::StudioInfo(info) => client.send_studio_info(info).await,
            Outbound::InfoString(text) => client.send_str(ClientOpCode::SetInfoString, text).await,
        };
        if let Err(e) = result {
            if client.is_cancelled() {
                break;
            }
            debug!("Dropped outbound message: {}", e);
        }
    }
    debug!("Outbound relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, PlaybackConfig};
    use crate::scheduler::TargetRate;
    use crate::timeline::{InputSet, ScriptTimeline, SideEffect, TimelineLine};

    #[derive(Default)]
    struct NullClock;

    impl TickClock for NullClock {
        fn arm(&mut self, _rate: TargetRate) {}
        fn disarm(&mut self) {}
    }

    #[derive(Default)]
    struct NullSink;

    impl InputSink for NullSink {
        fn apply(&mut self, _input: &InputSet) {}
        fn release_all(&mut self) {}
    }

    #[derive(Default, Clone)]
    struct RecordingHost {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl HostBridge for RecordingHost {
        fn set_paused(&mut self, paused: bool) {
            self.log.lock().unwrap().push(format!("paused={paused}"));
        }

        fn scene_reset(&mut self, target: &str) {
            self.log.lock().unwrap().push(format!("reset={target}"));
        }

        fn diagnostic(&self) -> Option<String> {
            Some("(0.0, 0.0)".to_string())
        }
    }

    /// One line per non-empty text line: `frames[,key...]`; `!call` adds a scene reset.
    struct CsvParser;

    impl TimelineParser for CsvParser {
        fn parse(&self, text: &str) -> Result<Arc<dyn Timeline>> {
            let mut lines = Vec::new();
            for (number, raw) in text.lines().enumerate() {
                let raw = raw.trim();
                if raw.is_empty() {
                    continue;
                }
                let (raw, call) = match raw.strip_suffix("!call") {
                    Some(rest) => (rest.trim_end_matches(','), true),
                    None => (raw, false),
                };
                let mut parts = raw.split(',');
                let frames = parts
                    .next()
                    .and_then(|f| f.trim().parse().ok())
                    .ok_or_else(|| LinkError::timeline("parse", format!("bad line {number}")))?;
                let mut line = TimelineLine::new(frames, InputSet::from_keys(parts.map(str::trim)))
                    .at_source_line(number);
                if call {
                    line = line.with_effect(SideEffect::Call { target: "spawn".into() });
                }
                lines.push(line);
            }
            Ok(Arc::new(ScriptTimeline::new(lines)?))
        }
    }

    type TestController = Controller<NullClock, NullSink, RecordingHost, CsvParser>;

    fn controller() -> (TestController, RecordingHost) {
        let host = RecordingHost::default();
        let scheduler = PlaybackScheduler::new(PlaybackConfig::default(), NullClock, NullSink);
        let client = Arc::new(ProtocolClient::new(LinkConfig::default()));
        let controller =
            Controller::new(scheduler, host.clone(), CsvParser, client, &Handle::current());
        (controller, host)
    }

    fn write_script(name: &str, text: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("taslink-{}-{}.tas", std::process::id(), name));
        std::fs::write(&path, text).unwrap();
        path
    }

    #[tokio::test]
    async fn start_stop_toggles_playback() {
        let (controller, _host) = controller();
        controller.on_path_changed(Some(write_script("toggle", "2,R\n1,J\n")));

        controller.on_keybind(Keybind::StartStop);
        assert!(controller.is_tas_running());
        assert_eq!(controller.playback_state(), PlaybackState::Running);
        assert_eq!(controller.active_frame(), 0);

        controller.before_update();
        assert_eq!(controller.active_frame(), 1);

        controller.on_keybind(Keybind::StartStop);
        assert!(!controller.is_tas_running());
        assert_eq!(controller.playback_state(), PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn start_without_path_is_refused() {
        let (controller, _host) = controller();
        controller.on_keybind(Keybind::StartStop);
        assert!(!controller.is_tas_running());
        assert_eq!(controller.playback_state(), PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn unreadable_path_keeps_previous_timeline() {
        let (controller, _host) = controller();
        let good = write_script("keep", "1,R\n");
        controller.on_path_changed(Some(good.clone()));
        controller.on_path_changed(Some(PathBuf::from("/nonexistent/taslink/run.tas")));
        assert_eq!(controller.path(), Some(good));

        controller.on_path_changed(None);
        assert_eq!(controller.path(), None);
    }

    #[tokio::test]
    async fn finishing_clears_running_flag() {
        let (controller, _host) = controller();
        controller.on_path_changed(Some(write_script("finish", "2,R\n")));
        controller.on_keybind(Keybind::StartStop);

        for _ in 0..3 {
            controller.before_update();
        }
        assert!(!controller.is_tas_running());
        assert_eq!(controller.playback_state(), PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn frame_advance_plays_exactly_one_frame() {
        let (controller, host) = controller();
        controller.on_path_changed(Some(write_script("advance", "10,R\n")));
        controller.on_keybind(Keybind::StartStop);
        controller.before_update();
        assert_eq!(controller.active_frame(), 1);

        controller.on_keybind(Keybind::FrameAdvance);
        assert!(controller.is_paused());
        assert_eq!(controller.advance_state(), AdvanceState::Queued);
        controller.before_update();
        assert_eq!(controller.active_frame(), 1);

        controller.late_update();
        assert_eq!(controller.advance_state(), AdvanceState::Advancing);
        controller.before_update();
        assert_eq!(controller.active_frame(), 2);

        controller.late_update();
        assert_eq!(controller.advance_state(), AdvanceState::Idle);
        assert!(controller.is_paused());
        controller.before_update();
        assert_eq!(controller.active_frame(), 2);

        let log = host.log.lock().unwrap().clone();
        assert_eq!(log, vec!["paused=true", "paused=false", "paused=true"]);
    }

    #[tokio::test]
    async fn pause_resume_keeps_position() {
        let (controller, _host) = controller();
        controller.on_path_changed(Some(write_script("pause", "10,R\n")));
        controller.on_keybind(Keybind::StartStop);
        controller.before_update();

        controller.on_keybind(Keybind::PauseResume);
        assert_eq!(controller.playback_state(), PlaybackState::Stopped);
        controller.on_keybind(Keybind::PauseResume);
        assert_eq!(controller.playback_state(), PlaybackState::Running);
        assert_eq!(controller.active_frame(), 1);
    }

    #[tokio::test]
    async fn call_lines_reset_the_scene() {
        let (controller, host) = controller();
        controller.on_path_changed(Some(write_script("call", "1,R,!call\n")));
        controller.on_keybind(Keybind::StartStop);
        controller.before_update();

        assert_eq!(host.log.lock().unwrap().as_slice(), ["reset=spawn"]);
    }

    #[tokio::test]
    async fn hitbox_toggle_is_ignored() {
        let (controller, host) = controller();
        controller.on_keybind(Keybind::ToggleHitboxes);
        assert!(host.log.lock().unwrap().is_empty());
        assert!(!controller.is_tas_running());
    }
}
