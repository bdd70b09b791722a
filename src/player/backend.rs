use crate::core::{AudioFrame, MediaInfo, Packet, Result, VideoFrame};
use std::sync::Arc;

/// `read_packet` 的结果：读到的包属于哪条流
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPacketResult {
    Video,
    /// 封面图：整条视频流只有这一个包
    VideoAttachment,
    Audio,
    Subtitle,
    Eof,
    Fail,
    /// 不关心的流（数据流等）
    Unknown,
}

/// 解码一次的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    /// 得到一帧，包已用完
    Success,
    /// 得到一帧，解码器里还有输出：下一轮不要读新包
    SuccessAndSkipNextPkt,
    /// 解码出错，丢弃这个包
    Fail,
    /// 需要更多数据
    FailAndNeedMorePkt,
    /// 解码器已排空
    DecodeEnd,
}

/// 媒体后端（解封装 + 解码）
///
/// 这个 trait 定义了管线对后端的全部要求；所有方法都是 `&self`，
/// 实现需要自行加锁：读包线程和两个解码线程会并发调用。
pub trait MediaBackend: Send + Sync {
    /// 打开媒体并探测流信息
    fn prepare(&self, source: &str) -> Result<MediaInfo>;

    /// 读取下一个包，只报告类型；包内容通过 `move_packet_into` 取走
    fn read_packet(&self) -> ReadPacketResult;

    /// 把最近一次读到的包移动到 `packet`（复用其缓冲）；没有待取的包时返回 false
    fn move_packet_into(&self, packet: &mut Packet) -> bool;

    /// 丢弃最近一次读到的包
    fn discard_packet(&self) {
        let mut scratch = Packet::default();
        self.move_packet_into(&mut scratch);
    }

    /// Seek 到指定位置（毫秒）
    fn seek(&self, position_ms: i64) -> Result<()>;

    /// 解码视频：`packet` 为 None 时只取解码器中剩余的输出
    ///
    /// 收到 EOF 标记包（`is_eof`）时进入排空：每次交出一帧缓存的输出，
    /// 没有可交出的帧时返回 `DecodeEnd`（或 `Fail`）。
    fn decode_video(&self, packet: Option<&Packet>, frame: &mut VideoFrame) -> DecodeResult;

    /// 解码音频
    fn decode_audio(&self, packet: Option<&Packet>, frame: &mut AudioFrame) -> DecodeResult;

    fn flush_video_codec(&self);

    fn flush_audio_codec(&self);

    /// 关闭所有资源；之后的调用都应失败或返回空结果
    fn release(&self);

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}

/// 每次 prepare 创建一个新的后端
pub type BackendFactory = Arc<dyn Fn() -> Arc<dyn MediaBackend> + Send + Sync>;
