use crate::core::{AudioFrame, MediaKind, PlayerConfig, Result, SyncClocks, SyncConfig, SyncMaster};
use crate::player::buffer_queue::{AudioFrameQueue, FrameLease, PacketQueue, QueueEvent};
use crate::player::events::PipelineEvents;
use crate::player::looper::Looper;
use crate::player::sink::AudioOutput;
use crate::player::sync::{FrameTiming, RendererState};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AudioMessage {
    Render,
    /// 设备归还了一帧（播放完或被丢弃）
    Consumed {
        pts: i64,
        duration: i64,
        serial: u64,
        played: bool,
    },
}

#[derive(Default)]
struct AudioSession {
    eof_pending: Option<u64>,
    written: u64,
    write_failures: u64,
}

/// 音频渲染阶段
///
/// 把帧交给音频设备，设备里最多同时排队 `audio_max_queued_buffers` 帧。
/// 设备每播完一帧就回调一次，音频时钟在回调里更新为该帧的结束时间。
pub struct AudioRenderer {
    state: Mutex<RendererState>,
    session: Mutex<AudioSession>,
    in_flight: Arc<AtomicUsize>,
    rendered: AtomicU64,
    dropped: AtomicU64,
    frame_queue: Arc<AudioFrameQueue>,
    packet_queue: Arc<PacketQueue>,
    clocks: Arc<SyncClocks>,
    output: Arc<dyn AudioOutput>,
    events: PipelineEvents,
    sync: SyncConfig,
    max_queued: usize,
    write_retries: u32,
    retry_sleep: Duration,
    looper: Looper<AudioMessage>,
}

impl AudioRenderer {
    pub fn new(
        frame_queue: Arc<AudioFrameQueue>,
        packet_queue: Arc<PacketQueue>,
        clocks: Arc<SyncClocks>,
        output: Arc<dyn AudioOutput>,
        events: PipelineEvents,
        config: &PlayerConfig,
    ) -> Result<Arc<Self>> {
        let (looper, mailbox) = Looper::new("audio-renderer");
        let renderer = Arc::new(Self {
            state: Mutex::new(RendererState::NotInit),
            session: Mutex::new(AudioSession::default()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            rendered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            frame_queue,
            packet_queue,
            clocks,
            output,
            events,
            sync: config.sync.clone(),
            max_queued: config.audio_max_queued_buffers.max(1),
            write_retries: config.audio_write_retries,
            retry_sleep: config.audio_write_retry_sleep(),
            looper,
        });

        let weak = Arc::downgrade(&renderer);
        renderer.looper.spawn(mailbox, move |msg| {
            if let Some(renderer) = weak.upgrade() {
                renderer.handle_message(msg);
            }
        })?;

        let weak = Arc::downgrade(&renderer);
        renderer.frame_queue.add_listener(Arc::new(move |event| {
            if event == QueueEvent::NewReadable {
                if let Some(renderer) = weak.upgrade() {
                    if renderer.transition(RendererState::WaitingReadableFrameBuffer, RendererState::Playing) {
                        renderer.request_render();
                    }
                }
            }
        }));
        Ok(renderer)
    }

    pub fn state(&self) -> RendererState {
        *self.state.lock()
    }

    fn transition(&self, from: RendererState, to: RendererState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    pub fn rendered_frames(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 投递一轮渲染；会取消尚未执行的延迟渲染
    pub fn request_render(&self) {
        self.looper.post_replacing(AudioMessage::Render);
    }

    pub fn start(&self) {
        self.transition(RendererState::NotInit, RendererState::Paused);
    }

    pub fn play(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                RendererState::NotInit | RendererState::Paused => *state = RendererState::Playing,
                _ => return,
            }
        }
        self.output.play();
        info!("{} 🔊 音频渲染开始", log_ctx());
        self.request_render();
    }

    pub fn pause(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                RendererState::NotInit
                | RendererState::Playing
                | RendererState::WaitingReadableFrameBuffer => *state = RendererState::Paused,
                _ => return,
            }
        }
        self.output.pause();
        self.looper.remove_messages(AudioMessage::Render);
        debug!("{} ⏸ 音频渲染暂停", log_ctx());
    }

    /// seek 开始：丢弃设备里尚未播放的帧
    pub fn on_seek_begin(&self) {
        self.output.flush();
    }

    /// seek 成功后离开 EOF
    pub fn on_seek(&self) {
        self.transition(RendererState::Eof, RendererState::Paused);
        self.session.lock().eof_pending = None;
    }

    pub fn set_volume(&self, volume: f32) {
        self.output.set_volume(volume);
    }

    pub fn release(&self) {
        *self.state.lock() = RendererState::Released;
        self.looper.quit();
        let session = self.session.lock();
        info!(
            "{} 🛑 音频渲染退出（写入 {} 帧，播放 {} 帧，丢弃 {} 帧，写入失败 {} 次）",
            log_ctx(),
            session.written,
            self.rendered_frames(),
            self.dropped_frames(),
            session.write_failures
        );
    }

    fn handle_message(&self, msg: AudioMessage) {
        match msg {
            AudioMessage::Render => self.render_loop(),
            AudioMessage::Consumed {
                pts,
                duration,
                serial,
                played,
            } => self.on_consumed(pts, duration, serial, played),
        }
    }

    fn recycle_head(&self) {
        if let Some(buffer) = self.frame_queue.dequeue_readable() {
            self.frame_queue.enqueue_writable(buffer);
        }
    }

    /// 非主时钟时，整帧都落在主时钟之前的帧直接丢弃
    fn is_late(&self, next: &FrameTiming) -> bool {
        if self.clocks.master() == SyncMaster::Audio {
            return false;
        }
        let Some(master_now) = self.clocks.master_time() else {
            return false;
        };
        ((next.pts + next.duration) as f64) + self.sync.min_threshold_ms < master_now
    }

    fn render_loop(&self) {
        loop {
            if self.state() != RendererState::Playing {
                return;
            }
            // 设备排满时等 Consumed 回调再继续
            if self.in_flight.load(Ordering::Acquire) >= self.max_queued {
                return;
            }

            let Some((next, is_eof)) = self
                .frame_queue
                .peek_readable(|f| (FrameTiming::of(f), f.is_eof))
            else {
                if self.transition(RendererState::Playing, RendererState::WaitingReadableFrameBuffer)
                    && self.frame_queue.readable_len() > 0
                    && self.transition(RendererState::WaitingReadableFrameBuffer, RendererState::Playing)
                {
                    continue;
                }
                return;
            };
            let serial = self.packet_queue.serial();
            if next.serial != serial {
                self.recycle_head();
                continue;
            }
            if is_eof {
                self.recycle_head();
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    self.finish_eof(serial);
                } else {
                    self.session.lock().eof_pending = Some(serial);
                }
                return;
            }
            if self.is_late(&next) {
                self.recycle_head();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("{} ⏭️ 丢弃落后的音频帧 pts={}ms（累计 {}）", log_ctx(), next.pts, dropped);
                continue;
            }

            let Some(buffer) = self.frame_queue.dequeue_readable() else {
                continue;
            };
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            let in_flight = self.in_flight.clone();
            let handle = self.looper.handle();
            let lease = FrameLease::new(
                buffer,
                self.frame_queue.clone(),
                Box::new(move |frame: &AudioFrame, played| {
                    in_flight.fetch_sub(1, Ordering::AcqRel);
                    handle.post(AudioMessage::Consumed {
                        pts: frame.pts,
                        duration: frame.duration,
                        serial: frame.serial,
                        played,
                    });
                }),
            );
            self.write(lease);
        }
    }

    /// 写入设备，设备忙时按配置重试；最终失败则丢弃这一帧
    fn write(&self, lease: FrameLease<AudioFrame>) {
        let mut lease = lease;
        for attempt in 0..=self.write_retries {
            match self.output.enqueue(lease) {
                Ok(()) => {
                    self.session.lock().written += 1;
                    return;
                }
                Err(back) => {
                    lease = back;
                    if attempt < self.write_retries {
                        thread::sleep(self.retry_sleep);
                    }
                }
            }
        }
        let failures = {
            let mut session = self.session.lock();
            session.write_failures += 1;
            session.write_failures
        };
        warn!(
            "{} ⚠️ 音频设备写入失败，丢弃 pts={}ms（第 {} 次）",
            log_ctx(),
            lease.pts,
            failures
        );
        drop(lease);
    }

    fn on_consumed(&self, pts: i64, duration: i64, serial: u64, played: bool) {
        if played && serial == self.packet_queue.serial() {
            self.clocks.audio.set((pts + duration) as f64, serial);
            match self.clocks.master() {
                SyncMaster::External => self.clocks.external.sync_to(&self.clocks.audio, self.sync.nosync_threshold_ms),
                _ => self
                    .clocks
                    .external
                    .sync_to(self.clocks.master_clock(), self.sync.nosync_threshold_ms),
            }
            let count = self.rendered.fetch_add(1, Ordering::Relaxed) + 1;
            if count <= 3 || count % 500 == 0 {
                debug!("{} 🔈 播放第 {} 个音频帧 pts={}ms", log_ctx(), count, pts);
            }
            self.events.frame_rendered(MediaKind::Audio, pts, serial);
        }

        if self.in_flight.load(Ordering::Acquire) == 0 {
            let pending = self.session.lock().eof_pending.take();
            if let Some(serial) = pending {
                if self.finish_eof(serial) {
                    return;
                }
            }
        }
        if self.state() == RendererState::Playing {
            self.render_loop();
        }
    }

    /// 进入 EOF；`serial` 已被 seek 淘汰时忽略，返回是否进入
    fn finish_eof(&self, serial: u64) -> bool {
        {
            let mut state = self.state.lock();
            if matches!(*state, RendererState::Released | RendererState::Eof) {
                return false;
            }
            let current = self.packet_queue.serial();
            if serial != current {
                debug!("{} 🗑️ 忽略过期的音频 EOF（serial {}，当前 {}）", log_ctx(), serial, current);
                return false;
            }
            *state = RendererState::Eof;
        }
        info!("{} 🔚 音频渲染到达 EOF（serial {}）", log_ctx(), serial);
        self.events.renderer_eof(MediaKind::Audio, serial);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SampleFormat;
    use crate::player::audio_output::SimulatedAudioOutput;
    use crate::player::buffer_queue::{BufferItem, BufferQueue, QueueCapacity};
    use crate::player::events::PlayerEvent;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Instant;

    struct Fixture {
        renderer: Arc<AudioRenderer>,
        frames: Arc<AudioFrameQueue>,
        packets: Arc<PacketQueue>,
        clocks: Arc<SyncClocks>,
        events: Receiver<PlayerEvent>,
    }

    fn fixture() -> Fixture {
        let frames: Arc<AudioFrameQueue> = Arc::new(BufferQueue::new("audio-frames", QueueCapacity::Fixed(16)));
        let packets: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("audio-packets", QueueCapacity::Unbounded));
        let clocks = Arc::new(SyncClocks::new(SyncMaster::Audio));
        clocks.set_paused(false);
        clocks.audio.init_clock(Some(packets.serial_handle()));
        let output = Arc::new(SimulatedAudioOutput::new(4).unwrap());
        output.open(48_000, 2, SampleFormat::F32).unwrap();
        let (tx, events) = unbounded();
        let renderer = AudioRenderer::new(
            frames.clone(),
            packets.clone(),
            clocks.clone(),
            output,
            PipelineEvents::new(7, Arc::new(move |ev| {
                let _ = tx.send(ev);
            })),
            &PlayerConfig::default(),
        )
        .unwrap();
        renderer.start();
        Fixture {
            renderer,
            frames,
            packets,
            clocks,
            events,
        }
    }

    fn push_frame(frames: &AudioFrameQueue, pts: i64, serial: u64, eof: bool) {
        let mut buf = frames.dequeue_writable().unwrap();
        buf.pts = pts;
        buf.duration = 20;
        buf.sample_rate = 48_000;
        buf.channels = 2;
        buf.pcm.resize(960 * 2 * 4, 0);
        buf.set_serial(serial);
        buf.set_eof(eof);
        frames.enqueue_readable(buf);
    }

    fn collect_until_eof(events: &Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut seen = Vec::new();
        while let Ok(ev) = events.recv_timeout(Duration::from_secs(1)) {
            let done = matches!(ev, PlayerEvent::RendererEof { .. });
            seen.push(ev);
            if done {
                break;
            }
        }
        seen
    }

    #[test]
    fn test_plays_in_order_then_eof() {
        let f = fixture();
        for i in 0..5 {
            push_frame(&f.frames, i * 20, 0, false);
        }
        push_frame(&f.frames, 0, 0, true);
        let started = Instant::now();
        f.renderer.play();

        let seen = collect_until_eof(&f.events);
        let rendered: Vec<i64> = seen
            .iter()
            .filter_map(|ev| match ev {
                PlayerEvent::FrameRendered { kind: MediaKind::Audio, pts, .. } => Some(*pts),
                _ => None,
            })
            .collect();
        assert_eq!(rendered, vec![0, 20, 40, 60, 80]);
        assert_eq!(
            seen.last(),
            Some(&PlayerEvent::RendererEof {
                generation: 7,
                kind: MediaKind::Audio,
                serial: 0
            })
        );
        // 5 帧 × 20ms 按实时播放
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(f.renderer.state(), RendererState::Eof);
        let clock = f.clocks.audio.get().unwrap();
        assert!(clock >= 100.0, "clock {}", clock);
        f.renderer.release();
    }

    #[test]
    fn test_pause_stops_consumption() {
        let f = fixture();
        for i in 0..10 {
            push_frame(&f.frames, i * 20, 0, false);
        }
        f.renderer.play();
        assert!(matches!(
            f.events.recv_timeout(Duration::from_secs(1)),
            Ok(PlayerEvent::FrameRendered { pts: 0, .. })
        ));
        f.renderer.pause();
        // 设备暂停后不再有帧播完
        thread::sleep(Duration::from_millis(30));
        while f.events.try_recv().is_ok() {}
        assert!(f.events.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(f.renderer.state(), RendererState::Paused);
        f.renderer.release();
    }

    #[test]
    fn test_flush_on_seek_skips_stale_frames() {
        let f = fixture();
        for i in 0..4 {
            push_frame(&f.frames, i * 20, 0, false);
        }
        f.renderer.on_seek_begin();
        f.packets.flush_readable_buffer();
        push_frame(&f.frames, 3000, 1, false);
        push_frame(&f.frames, 0, 1, true);
        f.renderer.play();

        let seen = collect_until_eof(&f.events);
        assert_eq!(
            seen,
            vec![
                PlayerEvent::FrameRendered {
                    generation: 7,
                    kind: MediaKind::Audio,
                    pts: 3000,
                    serial: 1
                },
                PlayerEvent::RendererEof {
                    generation: 7,
                    kind: MediaKind::Audio,
                    serial: 1
                },
            ]
        );
        f.renderer.on_seek();
        assert_eq!(f.renderer.state(), RendererState::Paused);
        f.renderer.release();
    }

    #[test]
    fn test_eof_from_before_seek_is_ignored() {
        let f = fixture();
        // 设备回报旧 serial 的最后一帧时，seek 已经冲刷了队列
        f.renderer.session.lock().eof_pending = Some(0);
        f.packets.flush_readable_buffer();
        f.renderer.on_consumed(80, 20, 0, true);

        assert_ne!(f.renderer.state(), RendererState::Eof);
        assert!(f
            .events
            .try_iter()
            .all(|ev| !matches!(ev, PlayerEvent::RendererEof { .. })));
        f.renderer.release();
    }
}
