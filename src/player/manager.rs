use crate::core::{
    AudioFrame, BufferStatus, MediaInfo, MediaKind, PlayerConfig, PlayerError, PlayerState, Result, SyncClocks,
    SyncMaster, VideoFrame,
};
use crate::player::audio_renderer::AudioRenderer;
use crate::player::backend::{BackendFactory, MediaBackend};
use crate::player::buffer_queue::{BufferQueue, PacketQueue, QueueCapacity};
use crate::player::decoder::{AudioFrameDecoder, VideoFrameDecoder};
use crate::player::events::{PipelineEvents, PlayerEvent};
use crate::player::looper::Looper;
use crate::player::packet_reader::PacketReader;
use crate::player::sink::{AudioOutput, AudioOutputFactory, SubtitleSink, VideoSink};
use crate::player::video_renderer::VideoRenderer;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::{Arc, Weak};
use std::thread;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 播放器状态与进度的监听者
///
/// 所有回调都在播放器事件线程上按顺序执行，回调时不持有播放器内部的锁，
/// 可以在回调里再调用播放器的方法。
pub trait PlayerListener: Send + Sync {
    fn on_player_state(&self, state: &PlayerState);

    fn on_progress(&self, _progress_ms: i64, _duration_ms: i64) {}
}

/// 播放器依赖的外部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub backend_factory: BackendFactory,
    pub video_sink: Arc<dyn VideoSink>,
    pub audio_output_factory: AudioOutputFactory,
    pub subtitle_sink: Option<Arc<dyn SubtitleSink>>,
}

// ========== 管线 ==========

struct VideoStage {
    packets: Arc<PacketQueue>,
    frames: Arc<BufferQueue<VideoFrame>>,
    decoder: Arc<VideoFrameDecoder>,
    renderer: Arc<VideoRenderer>,
}

struct AudioStage {
    packets: Arc<PacketQueue>,
    frames: Arc<BufferQueue<AudioFrame>>,
    decoder: Arc<AudioFrameDecoder>,
    renderer: Arc<AudioRenderer>,
    output: Arc<dyn AudioOutput>,
}

/// 一次 prepare 对应的完整管线：读包 → 解码 → 渲染
///
/// 重新 prepare 时整条管线释放后重建，旧管线迟到的事件按代次丢弃。
pub struct Pipeline {
    info: MediaInfo,
    backend: Arc<dyn MediaBackend>,
    clocks: Arc<SyncClocks>,
    reader: Arc<PacketReader>,
    video: Option<VideoStage>,
    audio: Option<AudioStage>,
}

impl Pipeline {
    pub fn build(
        info: MediaInfo,
        backend: Arc<dyn MediaBackend>,
        collaborators: &Collaborators,
        config: &PlayerConfig,
        events: PipelineEvents,
    ) -> Result<Self> {
        let master = SyncMaster::resolve(config.sync_master, info.has_audio(), info.has_video());
        let clocks = Arc::new(SyncClocks::new(master));
        let packet_capacity = QueueCapacity::from(config.packet_queue_capacity);
        info!("{} 🔧 构建管线: 主时钟 {:?}", log_ctx(), master);

        // ========== 步骤1: 视频 ==========
        let video = match &info.video {
            Some(stream) => {
                let packets: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("video-packets", packet_capacity));
                let frames = Arc::new(BufferQueue::new(
                    "video-frames",
                    QueueCapacity::Fixed(config.video_frame_queue_capacity),
                ));
                clocks.video.init_clock(Some(packets.serial_handle()));
                let decoder = VideoFrameDecoder::new(backend.clone(), packets.clone(), frames.clone())?;
                let renderer = VideoRenderer::new(
                    frames.clone(),
                    packets.clone(),
                    clocks.clone(),
                    collaborators.video_sink.clone(),
                    events.clone(),
                    config.sync.clone(),
                )?;
                debug!(
                    "{} 🎞️ 视频流 #{}: {} {}x{} {:.2}fps{}",
                    log_ctx(),
                    stream.stream_index,
                    stream.codec,
                    stream.width,
                    stream.height,
                    stream.fps,
                    if stream.is_attachment { "（封面）" } else { "" }
                );
                Some(VideoStage {
                    packets,
                    frames,
                    decoder,
                    renderer,
                })
            }
            None => None,
        };

        // ========== 步骤2: 音频 ==========
        let audio = match &info.audio {
            Some(stream) => {
                let output = (collaborators.audio_output_factory)();
                let stage = Self::build_audio(&output, &backend, &clocks, config, &events, packet_capacity)
                    .and_then(|(packets, frames, decoder, renderer)| {
                        output.open(stream.sample_rate, stream.channels, stream.format)?;
                        Ok(AudioStage {
                            packets,
                            frames,
                            decoder,
                            renderer,
                            output: output.clone(),
                        })
                    });
                match stage {
                    Ok(stage) => Some(stage),
                    Err(e) => {
                        output.release();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        // ========== 步骤3: 读包 ==========
        let reader = PacketReader::new(
            backend.clone(),
            video.as_ref().map(|v| v.packets.clone()),
            audio.as_ref().map(|a| a.packets.clone()),
            info.video.as_ref().map_or(false, |v| v.is_attachment),
            collaborators.subtitle_sink.clone(),
            events,
            config,
        );
        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                if let Some(audio) = &audio {
                    audio.output.release();
                }
                return Err(e);
            }
        };

        Ok(Self {
            info,
            backend,
            clocks,
            reader,
            video,
            audio,
        })
    }

    #[allow(clippy::type_complexity)]
    fn build_audio(
        output: &Arc<dyn AudioOutput>,
        backend: &Arc<dyn MediaBackend>,
        clocks: &Arc<SyncClocks>,
        config: &PlayerConfig,
        events: &PipelineEvents,
        packet_capacity: QueueCapacity,
    ) -> Result<(
        Arc<PacketQueue>,
        Arc<BufferQueue<AudioFrame>>,
        Arc<AudioFrameDecoder>,
        Arc<AudioRenderer>,
    )> {
        let packets: Arc<PacketQueue> = Arc::new(BufferQueue::for_packets("audio-packets", packet_capacity));
        let frames = Arc::new(BufferQueue::new(
            "audio-frames",
            QueueCapacity::Fixed(config.audio_frame_queue_capacity),
        ));
        clocks.audio.init_clock(Some(packets.serial_handle()));
        let decoder = AudioFrameDecoder::new(backend.clone(), packets.clone(), frames.clone())?;
        let renderer = AudioRenderer::new(
            frames.clone(),
            packets.clone(),
            clocks.clone(),
            output.clone(),
            events.clone(),
            config,
        )?;
        Ok((packets, frames, decoder, renderer))
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.info
    }

    pub fn clocks(&self) -> &SyncClocks {
        &self.clocks
    }

    /// 启动所有工作线程；渲染端停在暂停态
    pub fn start(&self) {
        if let Some(video) = &self.video {
            video.renderer.start();
            video.decoder.start();
        }
        if let Some(audio) = &self.audio {
            audio.renderer.start();
            audio.decoder.start();
        }
        self.reader.start();
    }

    pub fn play(&self) {
        self.clocks.set_paused(false);
        if let Some(audio) = &self.audio {
            audio.renderer.play();
        }
        if let Some(video) = &self.video {
            video.renderer.play();
        }
    }

    pub fn pause(&self) {
        if let Some(video) = &self.video {
            video.renderer.pause();
        }
        if let Some(audio) = &self.audio {
            audio.renderer.pause();
        }
        self.clocks.set_paused(true);
    }

    /// 停止：暂停并丢弃音频设备里的缓冲
    pub fn stop(&self) {
        self.pause();
        if let Some(audio) = &self.audio {
            audio.renderer.on_seek_begin();
        }
    }

    pub fn begin_seek(&self, target_ms: i64, seek_id: u64) {
        self.stop();
        self.reader.request_seek(target_ms, seek_id);
    }

    /// seek 成功：渲染端离开 EOF，等待 play 或强制刷新
    pub fn complete_seek(&self) {
        if let Some(video) = &self.video {
            video.renderer.on_seek();
        }
        if let Some(audio) = &self.audio {
            audio.renderer.on_seek();
        }
    }

    pub fn force_render(&self) {
        if let Some(video) = &self.video {
            video.renderer.force_render();
        }
    }

    pub fn set_volume(&self, volume: f32) {
        if let Some(audio) = &self.audio {
            audio.renderer.set_volume(volume);
        }
    }

    pub fn buffer_status(&self) -> BufferStatus {
        let mut status = BufferStatus::default();
        if let Some(video) = &self.video {
            status.video_packets = video.packets.readable_len();
            status.video_packet_duration = video.packets.total_duration();
            status.packet_bytes += video.packets.total_bytes();
            status.video_frames = video.frames.readable_len();
            status.allocated_video_frames = video.frames.allocated();
            status.rendered_video_frames = video.renderer.rendered_frames();
            status.dropped_video_frames = video.renderer.dropped_frames();
        }
        if let Some(audio) = &self.audio {
            status.audio_packets = audio.packets.readable_len();
            status.audio_packet_duration = audio.packets.total_duration();
            status.packet_bytes += audio.packets.total_bytes();
            status.audio_frames = audio.frames.readable_len();
            status.allocated_audio_frames = audio.frames.allocated();
        }
        status
    }

    /// 按 渲染 → 音频设备 → 解码 → 读包 → 后端 → 队列 的顺序释放
    pub fn release(&self) {
        info!("{} 🧹 释放管线: {}", log_ctx(), self.info.source);
        if let Some(video) = &self.video {
            video.renderer.release();
        }
        if let Some(audio) = &self.audio {
            audio.renderer.release();
            audio.output.flush();
            audio.output.release();
        }
        if let Some(video) = &self.video {
            video.decoder.release();
        }
        if let Some(audio) = &self.audio {
            audio.decoder.release();
        }
        self.reader.release();
        self.backend.release();

        if let Some(video) = &self.video {
            video.packets.release();
            video.frames.release();
        }
        if let Some(audio) = &self.audio {
            audio.packets.release();
            audio.frames.release();
        }
    }
}

// ========== 播放器 ==========

#[derive(Debug, Clone, Copy)]
struct PendingSeek {
    id: u64,
    target_ms: i64,
    /// Stopped/PlayEnd 上的 play()：seek 到 0 后直接播放
    play_after: bool,
}

struct PlayerCore {
    state: PlayerState,
    pipeline: Option<Arc<Pipeline>>,
    generation: u64,
    /// 最近一次成功 seek 之后的 serial，更早的事件不再计入
    accepted_serial: u64,
    pending_seek: Option<PendingSeek>,
    eof_kinds: Vec<MediaKind>,
    progress: i64,
    next_seek_id: u64,
}

impl PlayerCore {
    fn illegal(&self, op: &'static str) -> PlayerError {
        PlayerError::IllegalState {
            op,
            state: self.state.to_string(),
        }
    }

    fn pipeline(&self, op: &'static str) -> Result<Arc<Pipeline>> {
        self.pipeline.clone().ok_or_else(|| self.illegal(op))
    }

    fn duration(&self) -> i64 {
        self.state.media_info().map_or(0, |info| info.duration)
    }

    /// 所有活跃的流都已到达 EOF
    fn all_streams_ended(&self) -> bool {
        let Some(info) = self.state.media_info() else {
            return false;
        };
        let kinds = info.active_kinds();
        !kinds.is_empty() && kinds.iter().all(|kind| self.eof_kinds.contains(kind))
    }

    /// 决定进度的流：有音频用音频，否则用视频
    fn progress_kind(&self) -> Option<MediaKind> {
        let info = self.state.media_info()?;
        if info.has_audio() {
            Some(MediaKind::Audio)
        } else if info.has_video() {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

struct PlayerInner {
    config: PlayerConfig,
    collaborators: Collaborators,
    /// 串行化所有公开操作和事件处理中的状态切换
    op_lock: Mutex<()>,
    core: Mutex<PlayerCore>,
    listener: Mutex<Option<Arc<dyn PlayerListener>>>,
    volume: Mutex<f32>,
    events: Looper<PlayerEvent>,
}

/// 播放器：状态机 + 管线的拥有者
///
/// 公开方法同步返回 `Ok(())`/`Err(_)`；非法状态下调用返回 `PlayerError::IllegalState`，
/// 不会改变状态。状态通知通过 [`PlayerListener`] 在事件线程上按顺序送达。
pub struct Player {
    inner: Arc<PlayerInner>,
}

impl Player {
    pub fn new(config: PlayerConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        info!("{} 🎮 创建播放器...", log_ctx());
        let (events, mailbox) = Looper::new("player-events");
        let inner = Arc::new(PlayerInner {
            config,
            collaborators,
            op_lock: Mutex::new(()),
            core: Mutex::new(PlayerCore {
                state: PlayerState::NoInit,
                pipeline: None,
                generation: 0,
                accepted_serial: 0,
                pending_seek: None,
                eof_kinds: Vec::new(),
                progress: 0,
                next_seek_id: 1,
            }),
            listener: Mutex::new(None),
            volume: Mutex::new(1.0),
            events,
        });

        let weak: Weak<PlayerInner> = Arc::downgrade(&inner);
        inner.events.spawn(mailbox, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        })?;
        info!("{} ✅ 播放器创建完成", log_ctx());
        Ok(Self { inner })
    }

    pub fn set_listener(&self, listener: Arc<dyn PlayerListener>) {
        *self.inner.listener.lock() = Some(listener);
    }

    pub fn state(&self) -> PlayerState {
        self.inner.core.lock().state.clone()
    }

    /// 当前播放进度（毫秒）
    pub fn progress(&self) -> i64 {
        self.inner.core.lock().progress
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.inner.core.lock().state.media_info().cloned()
    }

    pub fn buffer_status(&self) -> BufferStatus {
        let pipeline = self.inner.core.lock().pipeline.clone();
        pipeline.map(|p| p.buffer_status()).unwrap_or_default()
    }

    /// 音量（0.0 ~ 1.0）
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        *self.inner.volume.lock() = volume;
        let pipeline = self.inner.core.lock().pipeline.clone();
        if let Some(pipeline) = pipeline {
            pipeline.set_volume(volume);
        }
    }

    /// 打开媒体并构建管线
    ///
    /// 已经加载过媒体时先完整释放旧管线再重建；失败进入 Error 状态。
    pub fn prepare(&self, source: &str) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock();
        info!("{} 📂 prepare: {}", log_ctx(), source);

        // ========== 步骤1: 拆掉旧管线 ==========
        let (old, generation) = {
            let mut core = inner.core.lock();
            if core.state.is_released() {
                return Err(PlayerError::Released);
            }
            core.generation += 1;
            core.accepted_serial = 0;
            core.pending_seek = None;
            core.eof_kinds.clear();
            core.progress = 0;
            (core.pipeline.take(), core.generation)
        };
        if let Some(old) = old {
            old.release();
        }

        // ========== 步骤2: 打开后端并构建新管线 ==========
        let backend = (inner.collaborators.backend_factory)();
        let built = backend.prepare(source).and_then(|info| {
            if !info.has_audio() && !info.has_video() {
                return Err(PlayerError::NoPlayableStream(source.to_string()));
            }
            let handle = inner.events.handle();
            let events = PipelineEvents::new(
                generation,
                Arc::new(move |event| {
                    handle.post(event);
                }),
            );
            Pipeline::build(info, backend.clone(), &inner.collaborators, &inner.config, events)
        });

        let pipeline = match built {
            Ok(pipeline) => Arc::new(pipeline),
            Err(e) => {
                error!("{} ❌ prepare 失败: {}", log_ctx(), e);
                backend.release();
                let state = PlayerState::Error(e.to_string());
                inner.core.lock().state = state.clone();
                inner.notify(state);
                return Err(e);
            }
        };

        // ========== 步骤3: 启动 ==========
        pipeline.start();
        pipeline.set_volume(*inner.volume.lock());
        if inner.config.render_first_frame_on_prepare {
            pipeline.force_render();
        }
        let info = pipeline.media_info().clone();
        info!(
            "{} ✅ prepare 完成: {} {}ms 视频={} 音频={}",
            log_ctx(),
            info.format_name,
            info.duration,
            info.has_video(),
            info.has_audio()
        );
        let state = PlayerState::Prepared(info);
        {
            let mut core = inner.core.lock();
            core.pipeline = Some(pipeline);
            core.state = state.clone();
        }
        inner.notify(state);
        Ok(())
    }

    pub fn play(&self) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock();
        let mut core = inner.core.lock();
        let state = match core.state.clone() {
            PlayerState::Prepared(info) | PlayerState::Paused(info) => {
                core.pipeline("play")?.play();
                if core.all_streams_ended() {
                    core.progress = info.duration;
                    PlayerState::PlayEnd(info)
                } else {
                    PlayerState::Playing(info)
                }
            }
            PlayerState::Stopped(_) | PlayerState::PlayEnd(_) => {
                info!("{} 🔁 从头播放", log_ctx());
                inner.start_seek(&mut core, 0, true)?
            }
            _ => return Err(core.illegal("play")),
        };
        core.state = state.clone();
        drop(core);
        info!("{} ▶️ {}", log_ctx(), state);
        inner.notify(state);
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock();
        let mut core = inner.core.lock();
        let PlayerState::Playing(info) = &core.state else {
            return Err(core.illegal("pause"));
        };
        let state = PlayerState::Paused(info.clone());
        core.pipeline("pause")?.pause();
        core.state = state.clone();
        drop(core);
        info!("{} ⏸ 暂停", log_ctx());
        inner.notify(state);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock();
        let mut core = inner.core.lock();
        let info = match &core.state {
            PlayerState::Playing(info) | PlayerState::Paused(info) => info.clone(),
            _ => return Err(core.illegal("stop")),
        };
        core.pipeline("stop")?.stop();
        let state = PlayerState::Stopped(info);
        core.state = state.clone();
        drop(core);
        info!("{} ⏹ 停止", log_ctx());
        inner.notify(state);
        Ok(())
    }

    /// Seek 到指定位置（毫秒，超出范围时截断到 [0, 时长]）
    ///
    /// 立即进入 Seeking；结果在事件线程上处理，通过监听器通知。
    pub fn seek_to(&self, position_ms: i64) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock();
        let mut core = inner.core.lock();
        let state = inner.start_seek(&mut core, position_ms, false)?;
        core.state = state.clone();
        drop(core);
        inner.notify(state);
        Ok(())
    }

    /// 释放播放器；之后所有调用都会失败
    pub fn release(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let _op = inner.op_lock.lock();
            let pipeline = {
                let mut core = inner.core.lock();
                if core.state.is_released() {
                    return Err(PlayerError::Released);
                }
                core.state = PlayerState::Released;
                core.generation += 1;
                core.pending_seek = None;
                core.pipeline.take()
            };
            if let Some(pipeline) = pipeline {
                pipeline.release();
            }
        }
        info!("{} 🛑 播放器已释放", log_ctx());
        inner.notify(PlayerState::Released);
        // 等已投递的通知送达后退出事件线程
        inner.events.quit_safely();
        Ok(())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if !self.inner.core.lock().state.is_released() {
            let _ = self.release();
        }
    }
}

impl PlayerInner {
    fn notify(&self, state: PlayerState) {
        self.events.post(PlayerEvent::NotifyState(state));
    }

    fn listener(&self) -> Option<Arc<dyn PlayerListener>> {
        self.listener.lock().clone()
    }

    /// 进入 Seeking 并把请求交给读包线程；返回新状态
    fn start_seek(&self, core: &mut PlayerCore, position_ms: i64, play_after: bool) -> Result<PlayerState> {
        let (prior, play_after) = match &core.state {
            PlayerState::Playing(_)
            | PlayerState::Paused(_)
            | PlayerState::Prepared(_)
            | PlayerState::Stopped(_)
            | PlayerState::PlayEnd(_) => (core.state.clone(), play_after),
            // 连续 seek：沿用第一次 seek 前的状态
            PlayerState::Seeking { prior, .. } => (
                prior.as_ref().clone(),
                play_after || core.pending_seek.map_or(false, |p| p.play_after),
            ),
            _ => return Err(core.illegal("seek_to")),
        };
        let pipeline = core.pipeline("seek_to")?;
        let target_ms = position_ms.clamp(0, core.duration().max(0));
        let id = core.next_seek_id;
        core.next_seek_id += 1;
        core.pending_seek = Some(PendingSeek {
            id,
            target_ms,
            play_after,
        });
        info!("{} ⏩ Seek #{} → {}ms（{}）", log_ctx(), id, target_ms, prior.name());
        pipeline.begin_seek(target_ms, id);
        Ok(PlayerState::Seeking {
            prior: Box::new(prior),
            target_ms,
        })
    }

    fn handle_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::NotifyState(state) => {
                if let Some(listener) = self.listener() {
                    listener.on_player_state(&state);
                }
            }
            PlayerEvent::SeekFinished {
                generation,
                seek_id,
                target_ms,
                success,
                serial,
            } => self.on_seek_finished(generation, seek_id, target_ms, success, serial),
            PlayerEvent::RendererEof { generation, kind, serial } => self.on_renderer_eof(generation, kind, serial),
            PlayerEvent::FrameRendered {
                generation,
                kind,
                pts,
                serial,
            } => self.on_frame_rendered(generation, kind, pts, serial),
        }
    }

    fn on_seek_finished(&self, generation: u64, seek_id: u64, target_ms: i64, success: bool, serial: u64) {
        let (state, progress, duration) = {
            let _op = self.op_lock.lock();
            let mut core = self.core.lock();
            if generation != core.generation {
                return;
            }
            let Some(pending) = core.pending_seek.filter(|p| p.id == seek_id) else {
                debug!("{} 🗑️ 忽略过期的 seek 结果 #{}", log_ctx(), seek_id);
                return;
            };
            let PlayerState::Seeking { prior, .. } = core.state.clone() else {
                return;
            };
            let Some(pipeline) = core.pipeline.clone() else {
                return;
            };
            core.pending_seek = None;

            if success {
                core.accepted_serial = serial;
                core.eof_kinds.clear();
                core.progress = pending.target_ms;
                pipeline.complete_seek();
                let Some(info) = prior.media_info().cloned() else {
                    return;
                };
                core.state = if pending.play_after || matches!(*prior, PlayerState::Playing(_)) {
                    pipeline.play();
                    PlayerState::Playing(info)
                } else {
                    pipeline.force_render();
                    PlayerState::Paused(info)
                };
                info!("{} ✅ Seek #{} 完成: {}ms → {}", log_ctx(), seek_id, target_ms, core.state);
            } else {
                if matches!(*prior, PlayerState::Playing(_)) {
                    pipeline.play();
                }
                core.state = *prior;
                warn!("{} ❌ Seek #{} 失败，恢复到 {}", log_ctx(), seek_id, core.state);
            }
            (core.state.clone(), core.progress, core.duration())
        };

        if let Some(listener) = self.listener() {
            listener.on_player_state(&state);
            if success {
                listener.on_progress(progress, duration);
            }
        }
    }

    fn on_renderer_eof(&self, generation: u64, kind: MediaKind, serial: u64) {
        let (state, progress) = {
            let _op = self.op_lock.lock();
            let mut core = self.core.lock();
            if generation != core.generation || serial < core.accepted_serial {
                return;
            }
            if !core.eof_kinds.contains(&kind) {
                core.eof_kinds.push(kind);
            }
            debug!("{} 🔚 {} 渲染结束（{:?}）", log_ctx(), kind, core.eof_kinds);
            let PlayerState::Playing(info) = &core.state else {
                return;
            };
            if !core.all_streams_ended() {
                return;
            }
            let info = info.clone();
            core.progress = info.duration;
            core.state = PlayerState::PlayEnd(info);
            info!("{} 🏁 播放结束", log_ctx());
            (core.state.clone(), core.progress)
        };

        if let Some(listener) = self.listener() {
            listener.on_progress(progress, progress);
            listener.on_player_state(&state);
        }
    }

    fn on_frame_rendered(&self, generation: u64, kind: MediaKind, pts: i64, serial: u64) {
        let (progress, duration) = {
            let mut core = self.core.lock();
            if generation != core.generation
                || serial < core.accepted_serial
                || core.progress_kind() != Some(kind)
                || !matches!(core.state, PlayerState::Playing(_) | PlayerState::Paused(_))
            {
                return;
            }
            let duration = core.duration();
            let progress = pts.clamp(0, duration.max(0)).max(core.progress);
            if progress == core.progress {
                return;
            }
            core.progress = progress;
            (progress, duration)
        };
        if let Some(listener) = self.listener() {
            listener.on_progress(progress, duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::audio_output::SimulatedAudioOutput;
    use crate::player::sink::NullVideoSink;
    use crate::player::synthetic::SyntheticBackend;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::time::Duration;

    struct StateRecorder {
        tx: Sender<PlayerState>,
    }

    impl PlayerListener for StateRecorder {
        fn on_player_state(&self, state: &PlayerState) {
            let _ = self.tx.send(state.clone());
        }
    }

    fn collaborators() -> Collaborators {
        Collaborators {
            backend_factory: Arc::new(|| Arc::new(SyntheticBackend::default()) as Arc<dyn MediaBackend>),
            video_sink: Arc::new(NullVideoSink::default()),
            audio_output_factory: Arc::new(|| {
                Arc::new(SimulatedAudioOutput::new(4).expect("simulated audio")) as Arc<dyn AudioOutput>
            }),
            subtitle_sink: None,
        }
    }

    fn player() -> (Player, Receiver<PlayerState>) {
        let player = Player::new(PlayerConfig::default(), collaborators()).unwrap();
        let (tx, rx) = unbounded();
        player.set_listener(Arc::new(StateRecorder { tx }));
        (player, rx)
    }

    fn wait_state(rx: &Receiver<PlayerState>, name: &str) -> PlayerState {
        loop {
            let state = rx.recv_timeout(Duration::from_secs(3)).unwrap();
            if state.name() == name {
                return state;
            }
        }
    }

    #[test]
    fn test_illegal_calls_fail_without_changing_state() {
        let (player, _rx) = player();
        assert!(matches!(player.play(), Err(PlayerError::IllegalState { op: "play", .. })));
        assert!(player.pause().is_err());
        assert!(player.seek_to(100).is_err());
        assert_eq!(player.state(), PlayerState::NoInit);

        player.prepare("synthetic:duration=1000").unwrap();
        assert!(player.pause().is_err());
        assert!(player.stop().is_err());
        assert_eq!(player.state().name(), "Prepared");
        player.release().unwrap();
    }

    #[test]
    fn test_prepare_failure_enters_error() {
        let (player, rx) = player();
        let err = player.prepare("synthetic:fail_prepare=1").unwrap_err();
        assert!(matches!(err, PlayerError::OpenError(_)), "{:?}", err);
        assert!(matches!(wait_state(&rx, "Error"), PlayerState::Error(_)));

        // 出错后可以重新 prepare
        player.prepare("synthetic:duration=500").unwrap();
        wait_state(&rx, "Prepared");
        player.release().unwrap();
    }

    #[test]
    fn test_prepare_without_streams_fails() {
        let (player, _rx) = player();
        let err = player.prepare("synthetic:video=0,audio=0").unwrap_err();
        assert!(matches!(err, PlayerError::NoPlayableStream(_)));
        assert_eq!(player.state().name(), "Error");
        player.release().unwrap();
    }

    #[test]
    fn test_reprepare_replaces_pipeline() {
        let (player, rx) = player();
        player.prepare("synthetic:duration=2000").unwrap();
        player.play().unwrap();
        wait_state(&rx, "Playing");
        player.prepare("synthetic:duration=800,video=0").unwrap();
        let state = wait_state(&rx, "Prepared");
        let info = state.media_info().unwrap();
        assert_eq!(info.duration, 800);
        assert!(!info.has_video());
        assert_eq!(player.progress(), 0);
        player.release().unwrap();
    }

    #[test]
    fn test_release_is_terminal() {
        let (player, rx) = player();
        player.prepare("synthetic:duration=1000").unwrap();
        player.release().unwrap();
        wait_state(&rx, "Released");
        assert!(matches!(player.release(), Err(PlayerError::Released)));
        assert!(matches!(player.prepare("synthetic:"), Err(PlayerError::Released)));
        assert!(player.play().is_err());
        assert_eq!(player.buffer_status(), BufferStatus::default());
    }

    #[test]
    fn test_release_during_seek_recycles_every_buffer() {
        let (player, rx) = player();
        player.prepare("synthetic:duration=4000").unwrap();
        player.play().unwrap();
        wait_state(&rx, "Playing");
        player.seek_to(3000).unwrap();

        let pipeline = player.inner.core.lock().pipeline.clone().unwrap();
        player.release().unwrap();
        assert_eq!(player.state(), PlayerState::Released);

        let video = pipeline.video.as_ref().unwrap();
        let audio = pipeline.audio.as_ref().unwrap();
        let queues = [
            ("video-packets", video.packets.readable_len(), video.packets.allocated()),
            ("video-frames", video.frames.readable_len(), video.frames.allocated()),
            ("audio-packets", audio.packets.readable_len(), audio.packets.allocated()),
            ("audio-frames", audio.frames.readable_len(), audio.frames.allocated()),
        ];
        for (name, readable, allocated) in queues {
            assert_eq!((readable, allocated), (0, 0), "{}", name);
        }
    }
}
