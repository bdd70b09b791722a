use crate::core::{
    AudioFrame, AudioStreamInfo, MediaInfo, Packet, PixelLayout, PlayerError, Result, SampleFormat, VideoFrame,
    VideoStreamInfo,
};
use crate::player::backend::{DecodeResult, MediaBackend, ReadPacketResult};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media, software, util};
use log::{debug, info, warn};
use parking_lot::Mutex;

/// 流时间基下的时间戳转毫秒
fn to_ms(ts: i64, time_base: f64) -> i64 {
    (ts as f64 * time_base * 1000.0) as i64
}

fn rational(r: util::rational::Rational) -> f64 {
    if r.denominator() == 0 {
        0.0
    } else {
        r.numerator() as f64 / r.denominator() as f64
    }
}

fn layout_of(format: util::format::Pixel) -> PixelLayout {
    match format {
        util::format::Pixel::YUV420P => PixelLayout::Yuv420p,
        util::format::Pixel::NV12 => PixelLayout::Nv12,
        _ => PixelLayout::Rgba,
    }
}

struct DemuxState {
    input: Option<format::context::Input>,
    source: String,
    video_index: Option<usize>,
    audio_index: Option<usize>,
    subtitle_index: Option<usize>,
    video_is_attachment: bool,
    /// 各流时间基（秒），按流索引
    time_bases: Vec<f64>,
    pending: Option<ffmpeg::Packet>,
    released: bool,
}

// FFmpeg 上下文只在持有外层 Mutex 时访问
unsafe impl Send for DemuxState {}

struct VideoCodec {
    decoder: codec::decoder::Video,
    scaler: Option<(software::scaling::Context, util::format::Pixel, u32, u32)>,
    time_base: f64,
    frame_duration_ms: i64,
}

unsafe impl Send for VideoCodec {}

struct AudioCodec {
    decoder: codec::decoder::Audio,
    resampler: Option<software::resampling::Context>,
    time_base: f64,
    target_rate: u32,
    target_channels: u16,
}

unsafe impl Send for AudioCodec {}

/// 基于 FFmpeg 的媒体后端（`ffmpeg` 特性）
///
/// 解封装和两个解码器各自一把锁：读包线程和两个解码线程可以并发工作。
/// 视频 YUV420P / NV12 直接拷贝平面，其它像素格式转换成 RGBA；
/// 音频统一重采样成交错 f32。
pub struct FfmpegBackend {
    demux: Mutex<DemuxState>,
    video: Mutex<Option<VideoCodec>>,
    audio: Mutex<Option<AudioCodec>>,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegBackend {
    pub fn new() -> Self {
        Self {
            demux: Mutex::new(DemuxState {
                input: None,
                source: String::new(),
                video_index: None,
                audio_index: None,
                subtitle_index: None,
                video_is_attachment: false,
                time_bases: Vec::new(),
                pending: None,
                released: false,
            }),
            video: Mutex::new(None),
            audio: Mutex::new(None),
        }
    }

    fn open_video(stream: &format::stream::Stream) -> Result<(VideoCodec, VideoStreamInfo)> {
        let parameters = stream.parameters();
        let codec_name = parameters.id().name().to_string();
        let context = codec::context::Context::from_parameters(parameters)?;
        let decoder = context.decoder().video()?;

        let fps = rational(stream.avg_frame_rate());
        let is_attachment = stream
            .disposition()
            .contains(format::stream::Disposition::ATTACHED_PIC);
        let info = VideoStreamInfo {
            stream_index: stream.index(),
            codec: codec_name,
            width: decoder.width(),
            height: decoder.height(),
            fps,
            layout: layout_of(decoder.format()),
            is_attachment,
        };
        debug!(
            "视频解码器: {}x{}, 格式: {:?}, {:.2}fps",
            decoder.width(),
            decoder.height(),
            decoder.format(),
            fps
        );
        let codec = VideoCodec {
            decoder,
            scaler: None,
            time_base: rational(stream.time_base()),
            frame_duration_ms: if fps > 0.0 { (1000.0 / fps) as i64 } else { 40 },
        };
        Ok((codec, info))
    }

    fn open_audio(stream: &format::stream::Stream) -> Result<(AudioCodec, AudioStreamInfo)> {
        let parameters = stream.parameters();
        let codec_name = parameters.id().name().to_string();
        let context = codec::context::Context::from_parameters(parameters)?;
        let decoder = context.decoder().audio()?;

        // 单声道保持单声道，其余全部下混成立体声
        let target_channels = if decoder.channels() == 1 { 1 } else { 2 };
        let target_rate = decoder.rate();
        debug!(
            "音频解码器: {} Hz, {} 声道, 格式: {:?} → {} 声道 f32",
            decoder.rate(),
            decoder.channels(),
            decoder.format(),
            target_channels
        );
        let info = AudioStreamInfo {
            stream_index: stream.index(),
            codec: codec_name,
            sample_rate: target_rate,
            channels: target_channels,
            format: SampleFormat::F32,
        };
        let codec = AudioCodec {
            decoder,
            resampler: None,
            time_base: rational(stream.time_base()),
            target_rate,
            target_channels,
        };
        Ok((codec, info))
    }

    /// 还原成 FFmpeg 包（字节 + 原始时间戳）
    fn to_av_packet(packet: &Packet) -> ffmpeg::Packet {
        let mut av = ffmpeg::Packet::copy(&packet.data);
        av.set_pts(packet.raw_pts);
        av.set_dts(packet.raw_dts);
        av.set_stream(packet.stream_index);
        if packet.is_key {
            av.set_flags(ffmpeg::packet::Flags::KEY);
        }
        av
    }
}

impl VideoCodec {
    fn convert(&mut self, decoded: &util::frame::Video, out: &mut VideoFrame) -> Result<()> {
        let (width, height) = (decoded.width(), decoded.height());
        out.pts = decoded.timestamp().map_or(0, |ts| to_ms(ts, self.time_base));
        out.duration = self.frame_duration_ms;

        let layout = layout_of(decoded.format());
        if layout != PixelLayout::Rgba {
            let planes = out.prepare_planes(layout, width, height);
            for (index, plane) in planes.iter_mut().enumerate() {
                let (row_bytes, rows) = layout.plane_size(index, width, height);
                let src = decoded.data(index);
                let src_stride = decoded.stride(index);
                for y in 0..rows {
                    plane.data[y * row_bytes..(y + 1) * row_bytes]
                        .copy_from_slice(&src[y * src_stride..y * src_stride + row_bytes]);
                }
            }
            return Ok(());
        }

        // 其它格式：转换成 RGBA（尺寸或格式变化时重建 scaler）
        let rebuild = !matches!(
            &self.scaler,
            Some((_, format, w, h)) if *format == decoded.format() && *w == width && *h == height
        );
        if rebuild {
            let scaler = software::scaling::Context::get(
                decoded.format(),
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?;
            self.scaler = Some((scaler, decoded.format(), width, height));
        }
        let mut rgba = util::frame::Video::empty();
        if let Some((scaler, ..)) = self.scaler.as_mut() {
            scaler.run(decoded, &mut rgba)?;
        }

        let planes = out.prepare_planes(PixelLayout::Rgba, width, height);
        let row_bytes = width as usize * 4;
        let src = rgba.data(0);
        let src_stride = rgba.stride(0);
        for y in 0..height as usize {
            planes[0].data[y * row_bytes..(y + 1) * row_bytes]
                .copy_from_slice(&src[y * src_stride..y * src_stride + row_bytes]);
        }
        Ok(())
    }
}

impl AudioCodec {
    fn convert(&mut self, decoded: &util::frame::Audio, out: &mut AudioFrame) -> Result<bool> {
        if self.resampler.is_none() {
            let target_layout = match self.target_channels {
                1 => util::channel_layout::ChannelLayout::MONO,
                _ => util::channel_layout::ChannelLayout::STEREO,
            };
            debug!(
                "🔧 初始化音频重采样器: {}Hz/{}ch → {}Hz/{}ch",
                decoded.rate(),
                decoded.channels(),
                self.target_rate,
                self.target_channels
            );
            self.resampler = Some(software::resampling::Context::get(
                decoded.format(),
                decoded.channel_layout(),
                decoded.rate(),
                util::format::Sample::F32(util::format::sample::Type::Packed),
                target_layout,
                self.target_rate,
            )?);
        }

        let mut resampled = util::frame::Audio::empty();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.run(decoded, &mut resampled)?;
        }
        let samples = resampled.samples();
        if samples == 0 {
            return Ok(false);
        }

        let bytes = samples * self.target_channels as usize * SampleFormat::F32.bytes_per_sample();
        out.pcm.clear();
        out.pcm.extend_from_slice(&resampled.data(0)[..bytes]);
        out.pts = decoded.timestamp().map_or(0, |ts| to_ms(ts, self.time_base));
        out.duration = (samples as i64 * 1000) / self.target_rate.max(1) as i64;
        out.sample_rate = self.target_rate;
        out.channels = self.target_channels;
        out.format = SampleFormat::F32;
        Ok(true)
    }
}

/// send_packet 的结果映射；Ok(None) 表示已送入
fn send(decoder: &mut codec::decoder::Opened, packet: Option<&Packet>) -> Option<DecodeResult> {
    let packet = packet?;
    if packet.is_eof {
        // 进入排空模式；重复送 EOF 会返回 Eof 错误，忽略即可
        if let Err(e) = decoder.send_eof() {
            if e != ffmpeg::Error::Eof {
                debug!("send_eof 失败: {}", e);
            }
        }
        return None;
    }
    match decoder.send_packet(&FfmpegBackend::to_av_packet(packet)) {
        Ok(()) => None,
        Err(ffmpeg::Error::Eof) => {
            debug!("解码器收到 EOF（send_packet），执行 flush 并忽略本次包");
            decoder.flush();
            Some(DecodeResult::DecodeEnd)
        }
        Err(e) => {
            warn!("送包失败（已跳过）: {}", e);
            Some(DecodeResult::Fail)
        }
    }
}

impl MediaBackend for FfmpegBackend {
    fn prepare(&self, source: &str) -> Result<MediaInfo> {
        info!("正在打开文件: {}", source);
        let input = format::input(&source).map_err(|e| PlayerError::OpenError(format!("无法打开文件: {}", e)))?;

        let video_stream = input.streams().best(media::Type::Video);
        let audio_stream = input.streams().best(media::Type::Audio);
        let subtitle_index = input
            .streams()
            .find(|s| s.parameters().medium() == media::Type::Subtitle)
            .map(|s| s.index());

        let (video_codec, video_info) = match &video_stream {
            Some(stream) => {
                let (codec, info) = Self::open_video(stream)?;
                (Some(codec), Some(info))
            }
            None => (None, None),
        };
        let (audio_codec, audio_info) = match &audio_stream {
            Some(stream) => {
                let (codec, info) = Self::open_audio(stream)?;
                (Some(codec), Some(info))
            }
            None => (None, None),
        };
        if video_info.is_none() && audio_info.is_none() {
            return Err(PlayerError::NoPlayableStream(source.to_string()));
        }

        let time_bases = input.streams().map(|s| rational(s.time_base())).collect();
        let media_info = MediaInfo {
            source: source.to_string(),
            format_name: input.format().name().to_string(),
            duration: (input.duration() / 1000).max(0), // 微秒转毫秒
            video: video_info,
            audio: audio_info,
            has_subtitle: subtitle_index.is_some(),
        };
        debug!("视频流索引: {:?}", media_info.video.as_ref().map(|v| v.stream_index));
        debug!("音频流索引: {:?}", media_info.audio.as_ref().map(|a| a.stream_index));
        debug!("字幕流索引: {:?}", subtitle_index);

        {
            let mut st = self.demux.lock();
            st.video_index = media_info.video.as_ref().map(|v| v.stream_index);
            st.audio_index = media_info.audio.as_ref().map(|a| a.stream_index);
            st.subtitle_index = subtitle_index;
            st.video_is_attachment = media_info.video.as_ref().map_or(false, |v| v.is_attachment);
            st.time_bases = time_bases;
            st.pending = None;
            st.released = false;
            st.source = source.to_string();
            st.input = Some(input);
        }
        *self.video.lock() = video_codec;
        *self.audio.lock() = audio_codec;
        Ok(media_info)
    }

    fn read_packet(&self) -> ReadPacketResult {
        let mut st = self.demux.lock();
        if st.released {
            return ReadPacketResult::Fail;
        }
        let Some(input) = st.input.as_mut() else {
            return ReadPacketResult::Fail;
        };
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return ReadPacketResult::Eof,
            Err(e) => {
                debug!("读包失败: {}", e);
                return ReadPacketResult::Fail;
            }
        }

        let index = packet.stream();
        let kind = if Some(index) == st.video_index {
            // 封面流的包就是附加图片（打开和 seek 之后由 libavformat 重新排入）
            if st.video_is_attachment {
                ReadPacketResult::VideoAttachment
            } else {
                ReadPacketResult::Video
            }
        } else if Some(index) == st.audio_index {
            ReadPacketResult::Audio
        } else if Some(index) == st.subtitle_index {
            ReadPacketResult::Subtitle
        } else {
            ReadPacketResult::Unknown
        };
        st.pending = Some(packet);
        kind
    }

    fn move_packet_into(&self, packet: &mut Packet) -> bool {
        let mut st = self.demux.lock();
        let Some(pending) = st.pending.take() else {
            return false;
        };
        let time_base = st.time_bases.get(pending.stream()).copied().unwrap_or(0.0);
        packet.stream_index = pending.stream();
        packet.raw_pts = pending.pts();
        packet.raw_dts = pending.dts();
        packet.pts = pending.pts().or(pending.dts()).map_or(0, |ts| to_ms(ts, time_base));
        packet.duration = to_ms(pending.duration(), time_base);
        packet.is_key = pending.is_key();
        packet.is_eof = false;
        packet.data.clear();
        if let Some(data) = pending.data() {
            packet.data.extend_from_slice(data);
        }
        true
    }

    fn seek(&self, position_ms: i64) -> Result<()> {
        let mut st = self.demux.lock();
        st.pending = None;
        let Some(input) = st.input.as_mut() else {
            return Err(PlayerError::SeekError("媒体未打开".into()));
        };
        let timestamp = position_ms * 1000; // 毫秒转微秒
        input
            .seek(timestamp, ..timestamp)
            .map_err(|e| PlayerError::SeekError(format!("seek 到 {}ms 失败: {}", position_ms, e)))
    }

    fn decode_video(&self, packet: Option<&Packet>, frame: &mut VideoFrame) -> DecodeResult {
        let mut guard = self.video.lock();
        let Some(codec) = guard.as_mut() else {
            return DecodeResult::Fail;
        };
        if let Some(result) = send(&mut codec.decoder, packet) {
            return result;
        }

        let mut decoded = util::frame::Video::empty();
        match codec.decoder.receive_frame(&mut decoded) {
            // 解码器里可能还有帧：下一轮先取剩余输出
            Ok(()) => match codec.convert(&decoded, frame) {
                Ok(()) => DecodeResult::SuccessAndSkipNextPkt,
                Err(e) => {
                    warn!("视频帧转换失败: {}", e);
                    DecodeResult::Fail
                }
            },
            Err(ffmpeg::Error::Other { errno: 11 }) => DecodeResult::FailAndNeedMorePkt, // EAGAIN
            Err(ffmpeg::Error::Eof) => DecodeResult::DecodeEnd,
            Err(e) => {
                warn!("解码错误（已跳过）: {}", e);
                DecodeResult::Fail
            }
        }
    }

    fn decode_audio(&self, packet: Option<&Packet>, frame: &mut AudioFrame) -> DecodeResult {
        let mut guard = self.audio.lock();
        let Some(codec) = guard.as_mut() else {
            return DecodeResult::Fail;
        };
        if let Some(result) = send(&mut codec.decoder, packet) {
            return result;
        }

        loop {
            let mut decoded = util::frame::Audio::empty();
            match codec.decoder.receive_frame(&mut decoded) {
                Ok(()) => match codec.convert(&decoded, frame) {
                    Ok(true) => return DecodeResult::SuccessAndSkipNextPkt,
                    // 重采样器还在攒数据，继续取下一帧
                    Ok(false) => continue,
                    Err(e) => {
                        warn!("音频重采样失败: {}", e);
                        return DecodeResult::Fail;
                    }
                },
                Err(ffmpeg::Error::Other { errno: 11 }) => return DecodeResult::FailAndNeedMorePkt, // EAGAIN
                Err(ffmpeg::Error::Eof) => return DecodeResult::DecodeEnd,
                Err(e) => {
                    warn!("音频解码错误（已跳过）: {}", e);
                    return DecodeResult::Fail;
                }
            }
        }
    }

    fn flush_video_codec(&self) {
        if let Some(codec) = self.video.lock().as_mut() {
            codec.decoder.flush();
        }
    }

    fn flush_audio_codec(&self) {
        if let Some(codec) = self.audio.lock().as_mut() {
            codec.decoder.flush();
            // 重采样器里的残余样本属于 seek 之前
            codec.resampler = None;
        }
    }

    fn release(&self) {
        {
            let mut st = self.demux.lock();
            st.released = true;
            st.pending = None;
            st.input = None;
        }
        *self.video.lock() = None;
        *self.audio.lock() = None;
        debug!("FFmpeg 后端已释放");
    }

    fn description(&self) -> String {
        format!("FFmpeg Demuxer: {}", self.demux.lock().source)
    }
}
