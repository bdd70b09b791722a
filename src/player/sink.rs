use crate::core::{AudioFrame, Packet, Result, SampleFormat, VideoFrame};
use crate::player::buffer_queue::FrameLease;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 视频呈现端
///
/// 收到的帧在呈现完成（或放弃）时必须 `finish`/drop，恰好一次；
/// 在此之前帧缓冲不会被解码器复用。
pub trait VideoSink: Send + Sync {
    /// `forced` 为 true 表示暂停状态下的强制刷新（seek 后的预览帧）
    fn present(&self, frame: FrameLease<VideoFrame>, forced: bool);
}

/// 音频输出设备
pub trait AudioOutput: Send + Sync {
    fn open(&self, sample_rate: u32, channels: u16, format: SampleFormat) -> Result<()>;

    /// 提交一帧；设备忙时原样退回
    fn enqueue(&self, frame: FrameLease<AudioFrame>) -> std::result::Result<(), FrameLease<AudioFrame>>;

    /// 已提交但尚未播放完的帧数
    fn queued_count(&self) -> usize;

    fn play(&self);

    fn pause(&self);

    /// 丢弃所有已提交的帧（以"未播放"完成它们）
    fn flush(&self);

    fn release(&self);

    fn set_volume(&self, _volume: f32) {}
}

/// 每次 prepare 创建一个新的音频输出
pub type AudioOutputFactory = Arc<dyn Fn() -> Arc<dyn AudioOutput> + Send + Sync>;

/// 字幕包接收端（管线只负责转发原始包）
pub trait SubtitleSink: Send + Sync {
    fn on_subtitle_packet(&self, packet: &Packet);

    /// seek 成功后调用
    fn on_flush(&self) {}
}

/// 丢弃所有画面的 sink（无界面运行）
#[derive(Default)]
pub struct NullVideoSink {
    presented: AtomicU64,
}

impl NullVideoSink {
    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }
}

impl VideoSink for NullVideoSink {
    fn present(&self, frame: FrameLease<VideoFrame>, forced: bool) {
        let count = self.presented.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 3 || count % 100 == 0 {
            debug!(
                "🖼️ 呈现视频帧 #{}: pts={}ms {}x{} forced={}",
                count, frame.pts, frame.width, frame.height, forced
            );
        }
        frame.finish(true);
    }
}
