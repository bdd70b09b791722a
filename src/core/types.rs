use serde::{Deserialize, Serialize};
use std::fmt;

/// 管线中的媒体流类型（只有音频和视频两路走完整管线）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 像素布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PixelLayout {
    /// 平面 YUV（Y、U、V 三个平面）
    #[default]
    Yuv420p,
    /// 半平面 YUV（Y 平面 + UV 交错平面）
    Nv12,
    /// 打包 RGBA
    Rgba,
}

impl PixelLayout {
    /// 该布局的平面数量
    pub fn plane_count(&self) -> usize {
        match self {
            PixelLayout::Yuv420p => 3,
            PixelLayout::Nv12 => 2,
            PixelLayout::Rgba => 1,
        }
    }

    /// 第 `plane` 个平面的 (行字节数, 行数)
    pub fn plane_size(&self, plane: usize, width: u32, height: u32) -> (usize, usize) {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
        match (self, plane) {
            (PixelLayout::Yuv420p, 0) | (PixelLayout::Nv12, 0) => (w, h),
            (PixelLayout::Yuv420p, _) => (cw, ch),
            (PixelLayout::Nv12, _) => (cw * 2, ch),
            (PixelLayout::Rgba, _) => (w * 4, h),
        }
    }
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleFormat {
    #[default]
    F32,
    I16,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::I16 => 2,
        }
    }
}

/// 图像平面
#[derive(Debug, Clone, Default)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

/// 不透明纹理句柄（硬件解码路径由外部协作方解释）
pub type TextureHandle = u64;

/// 压缩数据包
///
/// 由 PacketReader 从后端读出后放入 PacketQueue，解码器消费后归还写池。
/// 同一时刻只归属于一个队列（或正在被某个工作线程持有）。
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: i64,           // 显示时间戳（毫秒）
    pub duration: i64,      // 包持续时间（毫秒）
    pub serial: u64,        // 所属的读取代次（每次 seek 递增）
    pub is_eof: bool,       // EOF 标记包（无数据）
    pub is_key: bool,
    pub raw_pts: Option<i64>, // 后端私有：流时间基下的原始 pts
    pub raw_dts: Option<i64>, // 后端私有：流时间基下的原始 dts
    pub data: Vec<u8>,
}

impl Packet {
    /// 数据大小（字节）
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 视频帧数据
///
/// 同时支持 CPU 平面数据和不透明纹理句柄两种载荷；
/// 帧对象被队列复用，平面缓冲只清空不释放。
#[derive(Debug, Clone, Default)]
pub struct VideoFrame {
    pub pts: i64,           // 显示时间戳（毫秒）
    pub duration: i64,      // 帧持续时间（毫秒）
    pub serial: u64,
    pub is_eof: bool,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub planes: Vec<Plane>,
    pub texture: Option<TextureHandle>,
}

impl VideoFrame {
    /// 按布局和尺寸准备平面缓冲（复用已有容量），返回可写平面
    pub fn prepare_planes(&mut self, layout: PixelLayout, width: u32, height: u32) -> &mut [Plane] {
        self.layout = layout;
        self.width = width;
        self.height = height;
        self.texture = None;
        let count = layout.plane_count();
        self.planes.resize_with(count, Plane::default);
        self.planes.truncate(count);
        for (index, plane) in self.planes.iter_mut().enumerate() {
            let (row_bytes, rows) = layout.plane_size(index, width, height);
            plane.stride = row_bytes;
            plane.data.clear();
            plane.data.resize(row_bytes * rows, 0);
        }
        &mut self.planes
    }

    /// 载荷字节数（纹理帧为 0）
    pub fn payload_bytes(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }
}

/// 音频帧数据（PCM 交错存储）
#[derive(Debug, Clone, Default)]
pub struct AudioFrame {
    pub pts: i64,           // 显示时间戳（毫秒）
    pub duration: i64,      // 帧持续时间（毫秒）
    pub serial: u64,
    pub is_eof: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub pcm: Vec<u8>,
}

impl AudioFrame {
    /// 每声道采样数
    pub fn samples_per_channel(&self) -> usize {
        let frame_bytes = self.channels as usize * self.format.bytes_per_sample();
        if frame_bytes == 0 {
            0
        } else {
            self.pcm.len() / frame_bytes
        }
    }
}

/// 视频流信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStreamInfo {
    pub stream_index: usize,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub layout: PixelLayout,
    /// 附加图片（封面）：整条流只有一个包
    pub is_attachment: bool,
}

/// 音频流信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub stream_index: usize,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
}

/// 媒体信息（每次 prepare 成功后生成的不可变快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub source: String,
    pub format_name: String,
    pub duration: i64,          // 总时长（毫秒）
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
    pub has_subtitle: bool,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// 需要走完整管线的流
    pub fn active_kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.has_audio() {
            kinds.push(MediaKind::Audio);
        }
        if self.has_video() {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// 播放器状态
///
/// 任意时刻只有一个当前状态；代表"已加载文件"的状态都携带 MediaInfo。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    NoInit,
    Prepared(MediaInfo),
    Playing(MediaInfo),
    Paused(MediaInfo),
    Stopped(MediaInfo),
    Seeking {
        prior: Box<PlayerState>,
        target_ms: i64,
    },
    PlayEnd(MediaInfo),
    Error(String),
    Released,
}

impl PlayerState {
    pub fn name(&self) -> &'static str {
        match self {
            PlayerState::NoInit => "NoInit",
            PlayerState::Prepared(_) => "Prepared",
            PlayerState::Playing(_) => "Playing",
            PlayerState::Paused(_) => "Paused",
            PlayerState::Stopped(_) => "Stopped",
            PlayerState::Seeking { .. } => "Seeking",
            PlayerState::PlayEnd(_) => "PlayEnd",
            PlayerState::Error(_) => "Error",
            PlayerState::Released => "Released",
        }
    }

    /// 当前加载的媒体信息（Seeking 时取 seek 之前的状态）
    pub fn media_info(&self) -> Option<&MediaInfo> {
        match self {
            PlayerState::Prepared(info)
            | PlayerState::Playing(info)
            | PlayerState::Paused(info)
            | PlayerState::Stopped(info)
            | PlayerState::PlayEnd(info) => Some(info),
            PlayerState::Seeking { prior, .. } => prior.media_info(),
            PlayerState::NoInit | PlayerState::Error(_) | PlayerState::Released => None,
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self, PlayerState::Released)
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerState::Seeking { prior, target_ms } => {
                write!(f, "Seeking({} → {}ms)", prior.name(), target_ms)
            }
            PlayerState::Error(msg) => write!(f, "Error({})", msg),
            other => f.write_str(other.name()),
        }
    }
}

/// 缓冲状态信息（用于监控和调试）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferStatus {
    /// 视频数据包队列长度
    pub video_packets: usize,

    /// 音频数据包队列长度
    pub audio_packets: usize,

    /// 视频/音频数据包队列累计时长（毫秒）
    pub video_packet_duration: i64,
    pub audio_packet_duration: i64,

    /// 两个数据包队列累计字节数
    pub packet_bytes: usize,

    /// 视频帧队列长度
    pub video_frames: usize,

    /// 音频帧队列长度
    pub audio_frames: usize,

    /// 已分配的帧缓冲数量
    pub allocated_video_frames: usize,
    pub allocated_audio_frames: usize,

    /// 已渲染 / 因落后被丢弃的视频帧
    pub rendered_video_frames: u64,
    pub dropped_video_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_planes_reuses_capacity() {
        let mut frame = VideoFrame::default();
        frame.prepare_planes(PixelLayout::Yuv420p, 16, 8);
        assert_eq!(frame.planes.len(), 3);
        assert_eq!(frame.planes[0].data.len(), 128);
        assert_eq!(frame.planes[1].data.len(), 32);
        let cap = frame.planes[0].data.capacity();

        frame.prepare_planes(PixelLayout::Nv12, 16, 8);
        assert_eq!(frame.planes.len(), 2);
        assert_eq!(frame.planes[1].stride, 16);
        assert!(frame.planes[0].data.capacity() >= cap);
        assert_eq!(frame.payload_bytes(), 128 + 64);
    }

    #[test]
    fn test_seeking_state_exposes_prior_media_info() {
        let info = MediaInfo {
            source: "a.mp4".into(),
            format_name: "mp4".into(),
            duration: 1000,
            video: None,
            audio: None,
            has_subtitle: false,
        };
        let state = PlayerState::Seeking {
            prior: Box::new(PlayerState::Paused(info.clone())),
            target_ms: 500,
        };
        assert_eq!(state.media_info(), Some(&info));
        assert_eq!(state.to_string(), "Seeking(Paused → 500ms)");
    }

    #[test]
    fn test_audio_samples_per_channel() {
        let frame = AudioFrame {
            channels: 2,
            format: SampleFormat::F32,
            pcm: vec![0; 960 * 2 * 4],
            ..Default::default()
        };
        assert_eq!(frame.samples_per_channel(), 960);
    }
}
