//! End-to-end tests: a fake studio on a loopback socket driving a controller.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taslink::channel::TcpChannel;
use taslink::protocol::BinaryStudioInfoEncoder;
use taslink::{
    ClientOpCode, Controller, HostBridge, InputSet, InputSink, LinkConfig, LinkError, LinkState,
    Message, PlaybackConfig, PlaybackScheduler, PlaybackState, ProtocolClient, ScriptTimeline,
    ServerOpCode, SideEffect, StudioInfo, TargetRate, TasLink, TickClock, Timeline, TimelineLine,
    TimelineParser,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct SharedClock(Arc<Mutex<Option<TargetRate>>>);

impl TickClock for SharedClock {
    fn arm(&mut self, rate: TargetRate) {
        *self.0.lock().unwrap() = Some(rate);
    }

    fn disarm(&mut self) {
        *self.0.lock().unwrap() = None;
    }
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<InputSet>>>);

impl InputSink for SharedSink {
    fn apply(&mut self, input: &InputSet) {
        self.0.lock().unwrap().push(input.clone());
    }

    fn release_all(&mut self) {
        self.0.lock().unwrap().push(InputSet::released());
    }
}

/// Reports a diagnostic string once, when one has been queued.
#[derive(Clone, Default)]
struct ScriptedHost {
    diagnostic: Arc<Mutex<Option<String>>>,
}

impl HostBridge for ScriptedHost {
    fn set_paused(&mut self, _paused: bool) {}
    fn scene_reset(&mut self, _target: &str) {}
    fn diagnostic(&self) -> Option<String> {
        self.diagnostic.lock().unwrap().take()
    }
}

/// `frames keys... [*speed]` per line.
struct WordParser;

impl TimelineParser for WordParser {
    fn parse(&self, text: &str) -> taslink::Result<Arc<dyn Timeline>> {
        let mut lines = Vec::new();
        for (number, raw) in text.lines().enumerate() {
            let mut words = raw.split_whitespace();
            let Some(first) = words.next() else { continue };
            let frames = first
                .parse()
                .map_err(|_| LinkError::timeline("parse", format!("bad frame count on {number}")))?;
            let mut keys = Vec::new();
            let mut effects = Vec::new();
            for word in words {
                match word.strip_prefix('*') {
                    Some(speed) => effects.push(SideEffect::Breakpoint {
                        speed: speed.parse().map_err(|_| LinkError::timeline("parse", "bad speed"))?,
                    }),
                    None => keys.push(word),
                }
            }
            let mut line = TimelineLine::new(frames, InputSet::from_keys(keys)).at_source_line(number);
            for effect in effects {
                line = line.with_effect(effect);
            }
            lines.push(line);
        }
        Ok(Arc::new(ScriptTimeline::new(lines)?))
    }
}

type TestController = Controller<SharedClock, SharedSink, ScriptedHost, WordParser>;

struct Harness {
    controller: Arc<TestController>,
    client: Arc<ProtocolClient>,
    studio: TcpChannel,
    listener: TcpListener,
    clock: SharedClock,
    sink: SharedSink,
    host: ScriptedHost,
}

async fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = LinkConfig::default()
        .with_address(listener.local_addr().unwrap())
        .with_retry_interval(Duration::from_millis(50));
    let client = TasLink::connect(config).unwrap();
    let studio = accept(&listener).await;

    let clock = SharedClock::default();
    let sink = SharedSink::default();
    let host = ScriptedHost::default();
    let scheduler = PlaybackScheduler::new(PlaybackConfig::default(), clock.clone(), sink.clone());
    let controller = Arc::new(Controller::new(
        scheduler,
        host.clone(),
        WordParser,
        Arc::clone(&client),
        &tokio::runtime::Handle::current(),
    ));

    let events = client.take_events().unwrap();
    let runner = Arc::clone(&controller);
    tokio::spawn(async move { runner.run_events(events).await });

    client.wait_for_state(LinkState::Connected).await.unwrap();
    Harness { controller, client, studio, listener, clock, sink, host }
}

async fn accept(listener: &TcpListener) -> TcpChannel {
    let (socket, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("client never connected")
        .unwrap();
    let studio = TcpChannel::from_tcp(socket, CancellationToken::new(), 1 << 20);
    let handshake = receive(&studio).await;
    assert_eq!(handshake, Message::empty(ClientOpCode::EstablishConnection));
    studio
}

async fn receive(studio: &TcpChannel) -> Message {
    tokio::time::timeout(Duration::from_secs(2), studio.receive())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
}

async fn receive_info(studio: &TcpChannel) -> StudioInfo {
    let message = receive(studio).await;
    assert_eq!(message.opcode, u8::from(ClientOpCode::SetStudioInfo));
    BinaryStudioInfoEncoder.decode(&message.payload).unwrap()
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn write_script(name: &str, text: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("taslink-it-{}-{}.tas", std::process::id(), name));
    std::fs::write(&path, text).unwrap();
    path
}

#[tokio::test]
async fn studio_starts_playback_and_sees_progress() {
    let h = harness().await;
    let path = write_script("progress", "2 R *2\n1 R J\n");

    h.studio
        .send(ServerOpCode::SendPath.into(), path.to_str().unwrap().as_bytes())
        .await
        .unwrap();
    eventually("path", || h.controller.path().is_some()).await;

    h.studio.send(ServerOpCode::KeybindTriggered.into(), &[0]).await.unwrap();
    eventually("playback start", || h.controller.is_tas_running()).await;
    assert_eq!(h.controller.playback_state(), PlaybackState::Running);
    assert_eq!(h.controller.active_frame(), 0);
    assert_eq!(*h.clock.0.lock().unwrap(), Some(TargetRate::Fixed(100.0)));
    assert!(receive_info(&h.studio).await.is_invalid());

    h.controller.before_update();
    let info = receive_info(&h.studio).await;
    assert_eq!(info.current_line, 0);
    assert_eq!(info.current_line_suffix, "1");
    assert_eq!(info.current_frame_in_tas, 1);

    h.controller.before_update();
    h.controller.before_update();
    assert_eq!(receive_info(&h.studio).await.current_line_suffix, "2");
    let info = receive_info(&h.studio).await;
    assert_eq!((info.current_line, info.current_frame_in_tas), (1, 3));

    // Tick past the end.
    h.controller.before_update();
    assert!(receive_info(&h.studio).await.is_invalid());
    assert!(!h.controller.is_tas_running());
    assert_eq!(*h.clock.0.lock().unwrap(), None);

    let applied = h.sink.0.lock().unwrap().clone();
    assert_eq!(applied.len(), 4);
    assert!(applied[2].contains("J"));
    assert!(applied[3].is_empty());

    h.controller.shutdown().await;
    h.client.join().await;
    assert_eq!(h.client.state(), LinkState::Cancelled);
}

#[tokio::test]
async fn studio_restart_reconnects_with_handshake() {
    let h = harness().await;
    let path = write_script("reconnect", "100 L\n");
    h.studio
        .send(ServerOpCode::SendPath.into(), path.to_str().unwrap().as_bytes())
        .await
        .unwrap();
    eventually("path", || h.controller.path().is_some()).await;

    drop(h.studio);
    let studio = accept(&h.listener).await;
    h.client.wait_for_state(LinkState::Connected).await.unwrap();

    // Playback state survives the reconnect; the new connection carries keybinds.
    studio.send(ServerOpCode::KeybindTriggered.into(), &[0]).await.unwrap();
    eventually("playback start", || h.controller.is_tas_running()).await;
    assert!(receive_info(&studio).await.is_invalid());

    studio.send(ServerOpCode::KeybindTriggered.into(), &[0]).await.unwrap();
    eventually("playback stop", || !h.controller.is_tas_running()).await;
    assert!(receive_info(&studio).await.is_invalid());

    h.controller.shutdown().await;
    let closing = receive(&studio).await;
    assert_eq!(closing, Message::empty(ClientOpCode::CloseConnection));
}

#[tokio::test]
async fn malformed_frames_do_not_drop_the_link() {
    let h = harness().await;

    h.studio.send(ServerOpCode::KeybindTriggered.into(), &[9]).await.unwrap();
    h.studio.send(ServerOpCode::KeybindTriggered.into(), &[]).await.unwrap();
    h.studio.send(0xee, b"??").await.unwrap();

    // A start without a path is refused but still reports the idle state.
    h.studio.send(ServerOpCode::KeybindTriggered.into(), &[0]).await.unwrap();
    assert!(receive_info(&h.studio).await.is_invalid());
    assert!(!h.controller.is_tas_running());
    assert!(h.client.is_connected());

    h.client.cancel();
    h.client.join().await;
    assert_eq!(h.client.state(), LinkState::Cancelled);
}

#[tokio::test]
async fn dropped_link_during_playback_resumes_progress() {
    let h = harness().await;
    let path = write_script("outage", "100 L\n");
    h.studio
        .send(ServerOpCode::SendPath.into(), path.to_str().unwrap().as_bytes())
        .await
        .unwrap();
    eventually("path", || h.controller.path().is_some()).await;
    h.studio.send(ServerOpCode::KeybindTriggered.into(), &[0]).await.unwrap();
    eventually("playback start", || h.controller.is_tas_running()).await;
    assert!(receive_info(&h.studio).await.is_invalid());

    h.controller.before_update();
    h.controller.before_update();
    assert_eq!(receive_info(&h.studio).await.current_frame_in_tas, 1);
    assert_eq!(receive_info(&h.studio).await.current_frame_in_tas, 2);

    // Playback keeps ticking against local state while the link is down.
    drop(h.studio);
    for _ in 0..3 {
        h.controller.before_update();
    }

    let studio = accept(&h.listener).await;
    h.client.wait_for_state(LinkState::Connected).await.unwrap();
    assert!(h.controller.is_tas_running());

    h.controller.before_update();
    let latest = i32::try_from(h.controller.active_frame()).unwrap();
    assert_eq!(latest, 6);
    loop {
        let info = receive_info(&studio).await;
        assert!(!info.is_invalid());
        assert_eq!(info.current_line, 0);
        if info.current_frame_in_tas == latest {
            break;
        }
        assert!(info.current_frame_in_tas < latest);
    }

    h.controller.shutdown().await;
}

#[tokio::test]
async fn telemetry_resumes_after_restart_cuts_off_a_send() {
    let h = harness().await;

    // A diagnostic far larger than the socket buffers stalls the relay while the
    // studio isn't reading.
    *h.host.diagnostic.lock().unwrap() = Some("x".repeat(32 << 20));
    h.controller.late_update();
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.client.restart().unwrap();
    let studio = accept(&h.listener).await;
    h.client.wait_for_state(LinkState::Connected).await.unwrap();

    h.controller.on_keybind(taslink::Keybind::StartStop);
    assert!(receive_info(&studio).await.is_invalid());

    drop(h.studio);
    h.controller.shutdown().await;
}
