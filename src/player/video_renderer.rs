use crate::core::{MediaKind, Result, SyncClocks, SyncConfig, SyncMaster, VideoFrame};
use crate::player::buffer_queue::{Buffer, FrameLease, PacketQueue, QueueEvent, VideoFrameQueue};
use crate::player::events::PipelineEvents;
use crate::player::looper::Looper;
use crate::player::sink::VideoSink;
use crate::player::sync::{compute_target_delay, frame_duration, ms_to_duration, FrameTiming, RendererState};
use log::{debug, info};
use parking_lot::Mutex;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoMessage {
    Render,
    ForceRender,
    PresentFinished,
}

#[derive(Default)]
struct VideoTiming {
    /// 最近一次呈现（或因落后丢弃）的帧
    last: Option<FrameTiming>,
    /// 上一帧开始显示的时刻
    frame_timer: Option<Instant>,
    /// 已消费 EOF 帧，等 sink 归还所有帧后再上报
    eof_pending: Option<u64>,
}

/// 视频渲染阶段
///
/// 按帧定时器决定何时把下一帧交给 VideoSink：
/// 延迟 = 上一帧时长，再按视频时钟与主时钟的偏差修正。太早就延迟投递自己，
/// 落后时丢弃已经过期的帧（视频为主时钟时不丢）。
pub struct VideoRenderer {
    state: Mutex<RendererState>,
    timing: Mutex<VideoTiming>,
    force_pending: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    rendered: AtomicU64,
    dropped: AtomicU64,
    frame_queue: Arc<VideoFrameQueue>,
    /// 当前 serial 的来源
    packet_queue: Arc<PacketQueue>,
    clocks: Arc<SyncClocks>,
    sink: Arc<dyn VideoSink>,
    events: PipelineEvents,
    sync: SyncConfig,
    looper: Looper<VideoMessage>,
}

impl VideoRenderer {
    pub fn new(
        frame_queue: Arc<VideoFrameQueue>,
        packet_queue: Arc<PacketQueue>,
        clocks: Arc<SyncClocks>,
        sink: Arc<dyn VideoSink>,
        events: PipelineEvents,
        sync: SyncConfig,
    ) -> Result<Arc<Self>> {
        let (looper, mailbox) = Looper::new("video-renderer");
        let renderer = Arc::new(Self {
            state: Mutex::new(RendererState::NotInit),
            timing: Mutex::new(VideoTiming::default()),
            force_pending: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            rendered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            frame_queue,
            packet_queue,
            clocks,
            sink,
            events,
            sync,
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
                    renderer.on_frame_available();
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
        self.looper.post_replacing(VideoMessage::Render);
    }

    /// 进入暂停态，等待 play 或强制刷新
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
        self.force_pending.store(false, Ordering::Release);
        self.timing.lock().frame_timer = None;
        info!("{} ▶️ 视频渲染开始", log_ctx());
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
        self.looper.remove_messages(VideoMessage::Render);
        debug!("{} ⏸ 视频渲染暂停", log_ctx());
    }

    /// seek 成功后离开 EOF
    pub fn on_seek(&self) {
        self.transition(RendererState::Eof, RendererState::Paused);
        self.timing.lock().eof_pending = None;
    }

    /// 暂停状态下刷新一帧（当前 serial 的第一帧）
    pub fn force_render(&self) {
        self.force_pending.store(true, Ordering::Release);
        self.looper.post_replacing(VideoMessage::ForceRender);
    }

    pub fn release(&self) {
        *self.state.lock() = RendererState::Released;
        self.looper.quit();
        info!(
            "{} 🛑 视频渲染退出（呈现 {} 帧，丢弃 {} 帧）",
            log_ctx(),
            self.rendered_frames(),
            self.dropped_frames()
        );
    }

    fn on_frame_available(&self) {
        match self.state() {
            RendererState::WaitingReadableFrameBuffer => {
                if self.transition(RendererState::WaitingReadableFrameBuffer, RendererState::Playing) {
                    self.request_render();
                }
            }
            RendererState::Paused | RendererState::NotInit => {
                if self.force_pending.load(Ordering::Acquire) {
                    self.looper.post_replacing(VideoMessage::ForceRender);
                }
            }
            _ => {}
        }
    }

    fn handle_message(&self, msg: VideoMessage) {
        match msg {
            VideoMessage::Render => self.render_loop(),
            VideoMessage::ForceRender => self.force_render_once(),
            VideoMessage::PresentFinished => {
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    let pending = self.timing.lock().eof_pending.take();
                    if let Some(serial) = pending {
                        self.finish_eof(serial);
                    }
                }
            }
        }
    }

    /// 视频时钟 − 主时钟；视频自己是主时钟或任一时钟无效时为 None
    fn master_diff(&self) -> Option<f64> {
        if self.clocks.master() == SyncMaster::Video {
            return None;
        }
        let video = self.clocks.video.get()?;
        let master = self.clocks.master_time()?;
        Some(video - master)
    }

    fn peek_head(&self, index: usize) -> Option<(FrameTiming, bool)> {
        self.frame_queue
            .peek_readable_at(index, |f| (FrameTiming::of(f), f.is_eof))
    }

    fn recycle_head(&self) {
        if let Some(buffer) = self.frame_queue.dequeue_readable() {
            self.frame_queue.enqueue_writable(buffer);
        }
    }

    fn render_loop(&self) {
        loop {
            if self.state() != RendererState::Playing {
                return;
            }

            // ========== 步骤1: 看队头 ==========
            let Some((next, is_eof)) = self.peek_head(0) else {
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
                // seek 之前解出的帧
                self.recycle_head();
                continue;
            }
            if is_eof {
                self.recycle_head();
                self.reach_eof(serial);
                return;
            }

            // ========== 步骤2: 计算显示时刻 ==========
            let now = Instant::now();
            let mut timing = self.timing.lock();
            let frame_timer = match (timing.frame_timer, timing.last) {
                (Some(timer), Some(last)) if last.serial == next.serial => timer,
                _ => now,
            };
            let last_duration = frame_duration(timing.last.as_ref(), &next, &self.sync);
            let delay = compute_target_delay(last_duration, self.master_diff(), &self.sync);
            let due = frame_timer + ms_to_duration(delay);
            if now < due {
                timing.frame_timer = Some(frame_timer);
                drop(timing);
                let wait = (due - now).min(self.sync.refresh_interval());
                self.looper.post_delayed_replacing(VideoMessage::Render, wait);
                return;
            }
            // 定时器落后太多时直接对齐到当前时间
            let timer = if now.duration_since(due) > ms_to_duration(self.sync.max_threshold_ms) {
                now
            } else {
                due
            };
            timing.frame_timer = Some(timer);
            timing.last = Some(next);
            drop(timing);

            // ========== 步骤3: 呈现 ==========
            let Some(buffer) = self.frame_queue.dequeue_readable() else {
                continue;
            };
            self.present(buffer, false);
            self.drop_late_frames(serial);
        }
    }

    fn force_render_once(&self) {
        if !self.force_pending.load(Ordering::Acquire) {
            return;
        }
        if !matches!(self.state(), RendererState::Paused | RendererState::NotInit) {
            // 正在播放，正常渲染会处理
            self.force_pending.store(false, Ordering::Release);
            return;
        }
        loop {
            let Some((next, is_eof)) = self.peek_head(0) else {
                // 等新帧到达后由监听器重新投递
                return;
            };
            if next.serial != self.packet_queue.serial() {
                self.recycle_head();
                continue;
            }
            self.force_pending.store(false, Ordering::Release);
            if is_eof {
                return;
            }
            let Some(buffer) = self.frame_queue.dequeue_readable() else {
                return;
            };
            {
                let mut timing = self.timing.lock();
                timing.last = Some(next);
                timing.frame_timer = None;
            }
            debug!("{} 🖼️ 强制刷新一帧 pts={}ms", log_ctx(), next.pts);
            self.present(buffer, true);
            return;
        }
    }

    fn present(&self, buffer: Buffer<VideoFrame>, forced: bool) {
        let (pts, serial) = (buffer.pts, buffer.serial);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let in_flight = self.in_flight.clone();
        let handle = self.looper.handle();
        let lease = FrameLease::new(
            buffer,
            self.frame_queue.clone(),
            Box::new(move |_, _| {
                in_flight.fetch_sub(1, Ordering::AcqRel);
                handle.post_replacing(VideoMessage::PresentFinished);
            }),
        );

        self.clocks.video.set(pts as f64, serial);
        match self.clocks.master() {
            SyncMaster::External => self.clocks.external.sync_to(&self.clocks.video, self.sync.nosync_threshold_ms),
            _ => self
                .clocks
                .external
                .sync_to(self.clocks.master_clock(), self.sync.nosync_threshold_ms),
        }

        let count = self.rendered.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 3 || count % 250 == 0 {
            debug!("{} 🎬 呈现第 {} 帧 pts={}ms", log_ctx(), count, pts);
        }
        self.events.frame_rendered(MediaKind::Video, pts, serial);
        self.sink.present(lease, forced);
    }

    /// 主时钟已经越过的帧直接丢弃（至少保留队列中的最后一帧）
    fn drop_late_frames(&self, serial: u64) {
        if self.clocks.master() == SyncMaster::Video {
            return;
        }
        let Some(master_now) = self.clocks.master_time() else {
            return;
        };
        loop {
            let (Some((first, first_eof)), Some((second, second_eof))) =
                (self.peek_head(0), self.peek_head(1))
            else {
                return;
            };
            if first_eof || second_eof || first.serial != serial || second.serial != serial {
                return;
            }
            let shown_for = frame_duration(Some(&first), &second, &self.sync);
            if first.pts as f64 + shown_for >= master_now {
                return;
            }
            self.recycle_head();
            self.timing.lock().last = Some(first);
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                "{} ⏭️ 丢弃过期帧 pts={}ms（主时钟 {:.0}ms，累计丢弃 {}）",
                log_ctx(),
                first.pts,
                master_now,
                dropped
            );
        }
    }

    fn reach_eof(&self, serial: u64) {
        if self.in_flight.load(Ordering::Acquire) == 0 {
            self.finish_eof(serial);
        } else {
            self.timing.lock().eof_pending = Some(serial);
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
                debug!("{} 🗑️ 忽略过期的视频 EOF（serial {}，当前 {}）", log_ctx(), serial, current);
                return false;
            }
            *state = RendererState::Eof;
        }
        info!("{} 🔚 视频渲染到达 EOF（serial {}）", log_ctx(), serial);
        self.events.renderer_eof(MediaKind::Video, serial);
        true
    }
}
