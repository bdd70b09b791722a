use crossbeam_channel::{unbounded, Receiver, Sender};
use myy_pipeline::core::{PlayerConfig, VideoFrame};
use myy_pipeline::player::{
    AudioOutput, Collaborators, FrameLease, MediaBackend, SimulatedAudioOutput, SyntheticBackend, VideoSink,
};
use myy_pipeline::{Player, PlayerListener, PlayerState};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
enum Event {
    State(PlayerState),
    Progress(i64, i64),
}

struct Recorder {
    tx: Sender<Event>,
}

impl PlayerListener for Recorder {
    fn on_player_state(&self, state: &PlayerState) {
        let _ = self.tx.send(Event::State(state.clone()));
    }

    fn on_progress(&self, progress_ms: i64, duration_ms: i64) {
        let _ = self.tx.send(Event::Progress(progress_ms, duration_ms));
    }
}

/// 记录每一帧的 (pts, forced)
struct RecordingSink {
    tx: Sender<(i64, bool)>,
}

impl VideoSink for RecordingSink {
    fn present(&self, frame: FrameLease<VideoFrame>, forced: bool) {
        let _ = self.tx.send((frame.pts, forced));
        frame.finish(true);
    }
}

struct Harness {
    player: Player,
    events: Receiver<Event>,
    frames: Receiver<(i64, bool)>,
}

impl Harness {
    fn new() -> Self {
        let (frame_tx, frames) = unbounded();
        let collaborators = Collaborators {
            backend_factory: Arc::new(|| Arc::new(SyntheticBackend::default()) as Arc<dyn MediaBackend>),
            video_sink: Arc::new(RecordingSink { tx: frame_tx }),
            audio_output_factory: Arc::new(|| {
                Arc::new(SimulatedAudioOutput::new(4).expect("simulated audio")) as Arc<dyn AudioOutput>
            }),
            subtitle_sink: None,
        };
        let player = Player::new(PlayerConfig::default(), collaborators).unwrap();
        let (tx, events) = unbounded();
        player.set_listener(Arc::new(Recorder { tx }));
        Self { player, events, frames }
    }

    /// 等到指定状态，途中收到的进度一并返回
    fn wait_state(&self, name: &str, timeout: Duration) -> (PlayerState, Vec<i64>) {
        let deadline = Instant::now() + timeout;
        let mut progress = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(Event::State(state)) if state.name() == name => return (state, progress),
                Ok(Event::State(_)) => {}
                Ok(Event::Progress(p, _)) => progress.push(p),
                Err(_) => panic!("等待 {} 超时，当前状态 {}", name, self.player.state()),
            }
        }
    }

    fn drain_frames(&self) -> Vec<(i64, bool)> {
        self.frames.try_iter().collect()
    }
}

#[test]
fn test_play_to_end_with_monotonic_progress() {
    let h = Harness::new();
    h.player.prepare("synthetic:duration=800").unwrap();
    h.wait_state("Prepared", Duration::from_secs(2));
    h.player.play().unwrap();

    let (_, progress) = h.wait_state("PlayEnd", Duration::from_secs(5));
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert!(progress.iter().all(|p| (0..=800).contains(p)));
    assert_eq!(h.player.progress(), 800);

    // PlayEnd 只通知一次
    std::thread::sleep(Duration::from_millis(300));
    let again = h
        .events
        .try_iter()
        .filter(|e| matches!(e, Event::State(PlayerState::PlayEnd(_))))
        .count();
    assert_eq!(again, 0);

    let frames = h.drain_frames();
    assert!(frames.len() > 5);
    assert!(frames.iter().all(|(pts, _)| (0..800).contains(pts)));
    h.player.release().unwrap();
}

#[test]
fn test_seek_while_playing_continues_from_target() {
    let h = Harness::new();
    h.player.prepare("synthetic:duration=6000").unwrap();
    h.player.play().unwrap();
    h.wait_state("Playing", Duration::from_secs(2));
    std::thread::sleep(Duration::from_millis(200));

    h.player.seek_to(5000).unwrap();
    assert_eq!(h.player.state().name(), "Seeking");
    h.wait_state("Playing", Duration::from_secs(3));
    assert!(h.player.progress() >= 5000);

    let (_, progress) = h.wait_state("PlayEnd", Duration::from_secs(5));
    assert!(progress.iter().all(|p| (5000..=6000).contains(p)), "{:?}", progress);
    h.player.release().unwrap();
}

#[test]
fn test_seek_while_paused_renders_one_preview_frame() {
    let h = Harness::new();
    h.player.prepare("synthetic:duration=3000").unwrap();
    h.player.play().unwrap();
    h.wait_state("Playing", Duration::from_secs(2));
    std::thread::sleep(Duration::from_millis(200));
    h.player.pause().unwrap();
    h.wait_state("Paused", Duration::from_secs(2));
    std::thread::sleep(Duration::from_millis(100));
    h.drain_frames();

    h.player.seek_to(2000).unwrap();
    h.wait_state("Paused", Duration::from_secs(3));
    std::thread::sleep(Duration::from_millis(500));

    let frames = h.drain_frames();
    assert_eq!(frames, vec![(2000, true)]);
    assert_eq!(h.player.progress(), 2000);
    h.player.release().unwrap();
}

#[test]
fn test_failed_seek_restores_prior_state() {
    let h = Harness::new();
    h.player.prepare("synthetic:duration=2000,fail_seek=1").unwrap();
    h.player.play().unwrap();
    h.player.pause().unwrap();
    h.wait_state("Paused", Duration::from_secs(2));

    h.player.seek_to(1000).unwrap();
    h.wait_state("Seeking", Duration::from_secs(2));
    h.wait_state("Paused", Duration::from_secs(3));
    assert!(h.player.progress() < 1000);
    h.player.release().unwrap();
}

#[test]
fn test_release_during_seek() {
    let h = Harness::new();
    h.player.prepare("synthetic:duration=4000").unwrap();
    h.player.play().unwrap();
    h.player.seek_to(3000).unwrap();
    h.player.release().unwrap();

    assert_eq!(h.player.state(), PlayerState::Released);
    assert_eq!(h.player.buffer_status(), Default::default());
    assert!(h.player.play().is_err());
    assert!(h.player.release().is_err());
}

#[test]
fn test_audio_only_reaches_play_end() {
    let h = Harness::new();
    h.player.prepare("synthetic:duration=600,video=0").unwrap();
    let (state, _) = h.wait_state("Prepared", Duration::from_secs(2));
    assert!(!state.media_info().unwrap().has_video());
    h.player.play().unwrap();

    h.wait_state("PlayEnd", Duration::from_secs(4));
    assert_eq!(h.player.progress(), 600);
    assert!(h.drain_frames().is_empty());
    h.player.release().unwrap();
}

#[test]
fn test_cover_art_is_shown_while_audio_plays() {
    let h = Harness::new();
    h.player.prepare("synthetic:duration=600,cover=1").unwrap();
    let (state, _) = h.wait_state("Prepared", Duration::from_secs(2));
    assert!(state.media_info().unwrap().video.as_ref().unwrap().is_attachment);
    h.player.play().unwrap();

    h.wait_state("PlayEnd", Duration::from_secs(4));
    let frames = h.drain_frames();
    assert!(!frames.is_empty());
    assert!(frames.iter().all(|(pts, _)| *pts == 0));
    h.player.release().unwrap();
}

#[test]
fn test_replay_after_end_starts_from_zero() {
    let h = Harness::new();
    h.player.prepare("synthetic:duration=400").unwrap();
    h.player.play().unwrap();
    h.wait_state("PlayEnd", Duration::from_secs(4));

    h.player.play().unwrap();
    h.wait_state("Seeking", Duration::from_secs(2));
    h.wait_state("Playing", Duration::from_secs(3));
    assert!(h.player.progress() < 400);
    h.wait_state("PlayEnd", Duration::from_secs(4));
    h.player.release().unwrap();
}
