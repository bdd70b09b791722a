use crate::core::{
    AudioFrame, AudioStreamInfo, MediaInfo, Packet, PixelLayout, PlayerError, Result,
    SampleFormat, VideoFrame, VideoStreamInfo,
};
use crate::player::backend::{DecodeResult, MediaBackend, ReadPacketResult};
use anyhow::{anyhow, bail, Context};
use log::{debug, info, warn};
use parking_lot::Mutex;

/// 合成媒体源描述符前缀，例如 `synthetic:duration=3000,video=1,audio=1`
pub const SYNTHETIC_PREFIX: &str = "synthetic:";

const VIDEO_STREAM: usize = 0;
const AUDIO_STREAM: usize = 1;
const SUBTITLE_STREAM: usize = 2;

const VIDEO_PACKET_BYTES: usize = 512;
const AUDIO_PACKET_BYTES: usize = 128;

/// 合成媒体参数
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticMedia {
    pub duration_ms: i64,
    pub video: bool,
    pub audio: bool,
    pub subtitle: bool,
    /// 视频流是封面图（只有一个附加图片包）
    pub cover_art: bool,
    pub video_interval_ms: i64,
    /// 每个音频包的时长；一个包解出两帧
    pub audio_packet_ms: i64,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub fail_prepare: bool,
    pub fail_seek: bool,
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self {
            duration_ms: 3000,
            video: true,
            audio: true,
            subtitle: false,
            cover_art: false,
            video_interval_ms: 40,
            audio_packet_ms: 40,
            width: 64,
            height: 36,
            sample_rate: 48_000,
            channels: 2,
            fail_prepare: false,
            fail_seek: false,
        }
    }
}

impl SyntheticMedia {
    pub fn is_synthetic(source: &str) -> bool {
        source.starts_with(SYNTHETIC_PREFIX)
    }

    /// 解析 `synthetic:key=value,...` 描述符，未写的键取默认值
    pub fn parse(descriptor: &str) -> anyhow::Result<Self> {
        let body = descriptor
            .strip_prefix(SYNTHETIC_PREFIX)
            .ok_or_else(|| anyhow!("不是合成媒体描述符: {}", descriptor))?;

        let mut media = SyntheticMedia::default();
        for pair in body.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("缺少 '=': {}", pair))?;
            let number = || -> anyhow::Result<i64> {
                value
                    .parse::<i64>()
                    .with_context(|| format!("{} 的值不是整数: {}", key, value))
            };
            let unsigned = || -> anyhow::Result<u32> {
                let n = number()?;
                u32::try_from(n).with_context(|| format!("{} 超出范围: {}", key, value))
            };
            let flag = || -> anyhow::Result<bool> {
                match value {
                    "1" | "true" | "yes" => Ok(true),
                    "0" | "false" | "no" => Ok(false),
                    other => bail!("{} 的值不是布尔: {}", key, other),
                }
            };
            match key {
                "duration" => media.duration_ms = number()?,
                "video" => media.video = flag()?,
                "audio" => media.audio = flag()?,
                "subtitle" => media.subtitle = flag()?,
                "cover" => media.cover_art = flag()?,
                "fps" => {
                    let fps = number()?;
                    if fps <= 0 {
                        bail!("fps 必须大于 0");
                    }
                    media.video_interval_ms = (1000 / fps).max(1);
                }
                "audio_packet" => media.audio_packet_ms = number()?.max(1),
                "width" => media.width = unsigned()?,
                "height" => media.height = unsigned()?,
                "rate" => media.sample_rate = unsigned()?,
                "channels" => {
                    media.channels = u16::try_from(unsigned()?)
                        .with_context(|| format!("channels 超出范围: {}", value))?
                }
                "fail_prepare" => media.fail_prepare = flag()?,
                "fail_seek" => media.fail_seek = flag()?,
                other => bail!("未知参数: {}", other),
            }
        }
        if media.duration_ms < 0 {
            bail!("duration 不能为负");
        }
        Ok(media)
    }

    fn media_info(&self, source: &str) -> MediaInfo {
        MediaInfo {
            source: source.to_string(),
            format_name: "synthetic".to_string(),
            duration: self.duration_ms,
            video: self.video.then(|| VideoStreamInfo {
                stream_index: VIDEO_STREAM,
                codec: "synthetic-yuv".to_string(),
                width: self.width,
                height: self.height,
                fps: if self.cover_art {
                    0.0
                } else {
                    1000.0 / self.video_interval_ms as f64
                },
                layout: PixelLayout::Yuv420p,
                is_attachment: self.cover_art,
            }),
            audio: self.audio.then(|| AudioStreamInfo {
                stream_index: AUDIO_STREAM,
                codec: "synthetic-pcm".to_string(),
                sample_rate: self.sample_rate,
                channels: self.channels,
                format: SampleFormat::F32,
            }),
            has_subtitle: self.subtitle,
        }
    }
}

struct DemuxState {
    media: Option<SyntheticMedia>,
    next_video: i64,
    next_audio: i64,
    next_subtitle: i64,
    attachment_pending: bool,
    pending: Option<Packet>,
    released: bool,
    packets_read: u64,
}

/// 确定性的合成媒体后端
///
/// 不依赖任何编解码库：包和帧的时间戳按固定间隔生成，按 pts 交错输出。
/// 音频每个包解出两帧（第一帧返回 `SuccessAndSkipNextPkt`），用来覆盖解码器的排空路径。
pub struct SyntheticBackend {
    defaults: SyntheticMedia,
    demux: Mutex<DemuxState>,
    /// 音频解码器中尚未输出的半个包 (pts, duration)
    audio_leftover: Mutex<Option<(i64, i64)>>,
}

impl SyntheticBackend {
    /// `defaults` 用于非 `synthetic:` 开头的源
    pub fn new(defaults: SyntheticMedia) -> Self {
        Self {
            defaults,
            demux: Mutex::new(DemuxState {
                media: None,
                next_video: 0,
                next_audio: 0,
                next_subtitle: 0,
                attachment_pending: false,
                pending: None,
                released: false,
                packets_read: 0,
            }),
            audio_leftover: Mutex::new(None),
        }
    }

    fn media(&self) -> Option<SyntheticMedia> {
        self.demux.lock().media.clone()
    }

    fn fill_audio(&self, frame: &mut AudioFrame, pts: i64, duration: i64) {
        let media = self.media().unwrap_or_else(|| self.defaults.clone());
        let samples = (media.sample_rate as i64 * duration / 1000).max(0) as usize;
        frame.pts = pts;
        frame.duration = duration;
        frame.sample_rate = media.sample_rate;
        frame.channels = media.channels;
        frame.format = SampleFormat::F32;
        frame.pcm.clear();
        frame
            .pcm
            .resize(samples * media.channels as usize * SampleFormat::F32.bytes_per_sample(), 0);
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(SyntheticMedia::default())
    }
}

fn make_packet(stream_index: usize, pts: i64, duration: i64, payload: usize) -> Packet {
    let mut data = pts.to_le_bytes().to_vec();
    data.resize(payload.max(8), 0xAB);
    Packet {
        stream_index,
        pts,
        duration,
        is_key: true,
        raw_pts: Some(pts),
        raw_dts: Some(pts),
        data,
        ..Default::default()
    }
}

impl MediaBackend for SyntheticBackend {
    fn prepare(&self, source: &str) -> Result<MediaInfo> {
        let media = if SyntheticMedia::is_synthetic(source) {
            SyntheticMedia::parse(source).map_err(|e| PlayerError::OpenError(format!("{:#}", e)))?
        } else {
            self.defaults.clone()
        };
        if media.fail_prepare {
            return Err(PlayerError::OpenError(format!("合成媒体拒绝打开: {}", source)));
        }
        if !media.video && !media.audio {
            return Err(PlayerError::NoPlayableStream(source.to_string()));
        }

        let info = media.media_info(source);
        info!(
            "🎞️ 合成媒体: 时长 {}ms, 视频 {}, 音频 {}, 封面 {}",
            media.duration_ms, media.video, media.audio, media.cover_art
        );
        let mut st = self.demux.lock();
        st.attachment_pending = media.video && media.cover_art;
        st.media = Some(media);
        st.next_video = 0;
        st.next_audio = 0;
        st.next_subtitle = 0;
        st.pending = None;
        st.released = false;
        Ok(info)
    }

    fn read_packet(&self) -> ReadPacketResult {
        let mut st = self.demux.lock();
        if st.released {
            return ReadPacketResult::Fail;
        }
        let Some(media) = st.media.clone() else {
            return ReadPacketResult::Fail;
        };

        if st.attachment_pending {
            st.attachment_pending = false;
            st.pending = Some(make_packet(VIDEO_STREAM, 0, 0, VIDEO_PACKET_BYTES));
            st.packets_read += 1;
            return ReadPacketResult::VideoAttachment;
        }

        let end = media.duration_ms;
        let video = (media.video && !media.cover_art && st.next_video < end).then_some(st.next_video);
        let audio = (media.audio && st.next_audio < end).then_some(st.next_audio);
        let subtitle = (media.subtitle && st.next_subtitle < end).then_some(st.next_subtitle);

        // 按 pts 交错；相同 pts 时视频优先
        let next = [
            (video, ReadPacketResult::Video),
            (audio, ReadPacketResult::Audio),
            (subtitle, ReadPacketResult::Subtitle),
        ]
        .into_iter()
        .filter_map(|(pts, kind)| pts.map(|p| (p, kind)))
        .min_by_key(|(pts, _)| *pts);

        let Some((pts, kind)) = next else {
            return ReadPacketResult::Eof;
        };

        let packet = match kind {
            ReadPacketResult::Video => {
                let duration = media.video_interval_ms.min(end - pts);
                st.next_video += media.video_interval_ms;
                make_packet(VIDEO_STREAM, pts, duration, VIDEO_PACKET_BYTES)
            }
            ReadPacketResult::Audio => {
                let duration = media.audio_packet_ms.min(end - pts);
                st.next_audio += media.audio_packet_ms;
                make_packet(AUDIO_STREAM, pts, duration, AUDIO_PACKET_BYTES)
            }
            _ => {
                st.next_subtitle += 1000;
                let mut p = make_packet(SUBTITLE_STREAM, pts, 1000.min(end - pts), 0);
                p.data = format!("字幕 {}ms", pts).into_bytes();
                p
            }
        };
        st.pending = Some(packet);
        st.packets_read += 1;
        kind
    }

    fn move_packet_into(&self, packet: &mut Packet) -> bool {
        let Some(pending) = self.demux.lock().pending.take() else {
            return false;
        };
        packet.stream_index = pending.stream_index;
        packet.pts = pending.pts;
        packet.duration = pending.duration;
        packet.is_key = pending.is_key;
        packet.is_eof = false;
        packet.raw_pts = pending.raw_pts;
        packet.raw_dts = pending.raw_dts;
        packet.data.clear();
        packet.data.extend_from_slice(&pending.data);
        true
    }

    fn seek(&self, position_ms: i64) -> Result<()> {
        let mut st = self.demux.lock();
        let Some(media) = st.media.clone() else {
            return Err(PlayerError::SeekError("媒体未打开".into()));
        };
        if media.fail_seek {
            warn!("⚠️ 合成媒体拒绝 seek 到 {}ms", position_ms);
            return Err(PlayerError::SeekError(format!("无法 seek 到 {}ms", position_ms)));
        }
        let target = position_ms.clamp(0, media.duration_ms);
        // 落到目标之前最近的包边界
        st.next_video = target / media.video_interval_ms * media.video_interval_ms;
        st.next_audio = target / media.audio_packet_ms * media.audio_packet_ms;
        st.next_subtitle = (target + 999) / 1000 * 1000;
        st.attachment_pending = media.video && media.cover_art;
        st.pending = None;
        debug!(
            "⏩ 合成媒体 seek {}ms → 视频 {}ms, 音频 {}ms",
            target, st.next_video, st.next_audio
        );
        Ok(())
    }

    fn decode_video(&self, packet: Option<&Packet>, frame: &mut VideoFrame) -> DecodeResult {
        let Some(packet) = packet else {
            return DecodeResult::FailAndNeedMorePkt;
        };
        if packet.data.is_empty() {
            return DecodeResult::Fail;
        }
        let Some(media) = self.media() else {
            return DecodeResult::Fail;
        };

        frame.pts = packet.pts;
        frame.duration = packet.duration;
        let luma = ((packet.pts / media.video_interval_ms.max(1)) % 256) as u8;
        let planes = frame.prepare_planes(PixelLayout::Yuv420p, media.width, media.height);
        planes[0].data.fill(luma);
        for chroma in planes.iter_mut().skip(1) {
            chroma.data.fill(128);
        }
        DecodeResult::Success
    }

    fn decode_audio(&self, packet: Option<&Packet>, frame: &mut AudioFrame) -> DecodeResult {
        let Some(packet) = packet else {
            let leftover = self.audio_leftover.lock().take();
            return match leftover {
                Some((pts, duration)) => {
                    self.fill_audio(frame, pts, duration);
                    DecodeResult::Success
                }
                None => DecodeResult::FailAndNeedMorePkt,
            };
        };
        if packet.data.is_empty() {
            return DecodeResult::Fail;
        }

        let half = packet.duration / 2;
        if half > 0 {
            *self.audio_leftover.lock() = Some((packet.pts + half, packet.duration - half));
            self.fill_audio(frame, packet.pts, half);
            DecodeResult::SuccessAndSkipNextPkt
        } else {
            self.fill_audio(frame, packet.pts, packet.duration);
            DecodeResult::Success
        }
    }

    fn flush_video_codec(&self) {}

    fn flush_audio_codec(&self) {
        *self.audio_leftover.lock() = None;
    }

    fn release(&self) {
        let mut st = self.demux.lock();
        if !st.released {
            info!("🗑️ 合成媒体后端释放（共读取 {} 个包）", st.packets_read);
        }
        st.released = true;
        st.media = None;
        st.pending = None;
        *self.audio_leftover.lock() = None;
    }

    fn description(&self) -> String {
        match self.media() {
            Some(media) => format!("SyntheticBackend({}ms)", media.duration_ms),
            None => "SyntheticBackend(未打开)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(backend: &SyntheticBackend) -> Vec<(ReadPacketResult, i64)> {
        let mut out = Vec::new();
        loop {
            let kind = backend.read_packet();
            if kind == ReadPacketResult::Eof {
                break;
            }
            let mut p = Packet::default();
            assert!(backend.move_packet_into(&mut p));
            out.push((kind, p.pts));
        }
        out
    }

    #[test]
    fn test_parse_descriptor() {
        let media = SyntheticMedia::parse("synthetic:duration=1200,audio=0,fps=50,cover=1").unwrap();
        assert_eq!(media.duration_ms, 1200);
        assert!(!media.audio);
        assert!(media.video);
        assert!(media.cover_art);
        assert_eq!(media.video_interval_ms, 20);

        assert!(SyntheticMedia::parse("synthetic:bogus=1").is_err());
        assert!(SyntheticMedia::parse("synthetic:duration=abc").is_err());
        assert!(SyntheticMedia::parse("file.mp4").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_values() {
        assert!(SyntheticMedia::parse("synthetic:width=-1").is_err());
        assert!(SyntheticMedia::parse("synthetic:rate=4294967296").is_err());
        assert!(SyntheticMedia::parse("synthetic:channels=70000").is_err());

        let media = SyntheticMedia::parse("synthetic:width=320,height=180,rate=44100,channels=1").unwrap();
        assert_eq!((media.width, media.height), (320, 180));
        assert_eq!((media.sample_rate, media.channels), (44_100, 1));
    }

    #[test]
    fn test_prepare_reports_streams() {
        let backend = SyntheticBackend::default();
        let info = backend.prepare("synthetic:duration=500,video=1,audio=1").unwrap();
        assert_eq!(info.duration, 500);
        assert!(info.has_video() && info.has_audio());

        let err = backend.prepare("synthetic:video=0,audio=0");
        assert!(matches!(err, Err(PlayerError::NoPlayableStream(_))));
        let err = backend.prepare("synthetic:fail_prepare=1");
        assert!(matches!(err, Err(PlayerError::OpenError(_))));
    }

    #[test]
    fn test_packets_interleaved_until_eof() {
        let backend = SyntheticBackend::default();
        backend.prepare("synthetic:duration=200").unwrap();
        let packets = drain(&backend);

        let video: Vec<i64> = packets
            .iter()
            .filter(|(k, _)| *k == ReadPacketResult::Video)
            .map(|(_, pts)| *pts)
            .collect();
        assert_eq!(video, vec![0, 40, 80, 120, 160]);
        assert_eq!(
            packets.iter().filter(|(k, _)| *k == ReadPacketResult::Audio).count(),
            5
        );
        // 交错输出时 pts 不减
        assert!(packets.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(backend.read_packet(), ReadPacketResult::Eof);
    }

    #[test]
    fn test_audio_packet_decodes_into_two_frames() {
        let backend = SyntheticBackend::default();
        backend.prepare("synthetic:duration=1000,video=0").unwrap();
        assert_eq!(backend.read_packet(), ReadPacketResult::Audio);
        let mut packet = Packet::default();
        backend.move_packet_into(&mut packet);

        let mut frame = AudioFrame::default();
        assert_eq!(
            backend.decode_audio(Some(&packet), &mut frame),
            DecodeResult::SuccessAndSkipNextPkt
        );
        assert_eq!((frame.pts, frame.duration), (0, 20));
        assert_eq!(frame.samples_per_channel(), 960);

        assert_eq!(backend.decode_audio(None, &mut frame), DecodeResult::Success);
        assert_eq!((frame.pts, frame.duration), (20, 20));
        assert_eq!(
            backend.decode_audio(None, &mut frame),
            DecodeResult::FailAndNeedMorePkt
        );
    }

    #[test]
    fn test_seek_aligns_to_packet_boundary() {
        let backend = SyntheticBackend::default();
        backend.prepare("synthetic:duration=3000").unwrap();
        backend.seek(1010).unwrap();
        let first = drain(&backend);
        assert_eq!(first[0], (ReadPacketResult::Video, 1000));
        assert_eq!(first[1], (ReadPacketResult::Audio, 1000));

        let failing = SyntheticBackend::default();
        failing.prepare("synthetic:fail_seek=1").unwrap();
        assert!(failing.seek(100).is_err());
    }

    #[test]
    fn test_cover_art_resent_after_seek() {
        let backend = SyntheticBackend::default();
        backend.prepare("synthetic:duration=100,cover=1").unwrap();
        assert_eq!(backend.read_packet(), ReadPacketResult::VideoAttachment);
        backend.discard_packet();
        let rest = drain(&backend);
        assert!(rest.iter().all(|(k, _)| *k == ReadPacketResult::Audio));

        backend.seek(50).unwrap();
        assert_eq!(backend.read_packet(), ReadPacketResult::VideoAttachment);
    }

    #[test]
    fn test_release_fails_reads() {
        let backend = SyntheticBackend::default();
        backend.prepare("synthetic:duration=100").unwrap();
        backend.release();
        assert_eq!(backend.read_packet(), ReadPacketResult::Fail);
    }
}
