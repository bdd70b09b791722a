use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Sender};
use log::{info, warn};
use myy_pipeline::core::PlayerConfig;
use myy_pipeline::player::{
    AudioOutput, AudioOutputFactory, BackendFactory, Collaborators, MediaBackend, NullVideoSink, Player,
    PlayerListener, SimulatedAudioOutput, SyntheticBackend, SyntheticMedia,
};
use myy_pipeline::PlayerState;
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "用法: myy_pipeline [--config <config.json>] [--volume <0.0-1.0>] [--seek <ms>] <文件路径 | synthetic:...>";

struct CliArgs {
    source: String,
    config: Option<String>,
    volume: Option<f32>,
    seek_ms: Option<i64>,
}

fn parse_args() -> Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut source = None;
    let mut config = None;
    let mut volume = None;
    let mut seek_ms = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(args.next().ok_or_else(|| anyhow!("--config 缺少参数"))?),
            "--volume" => {
                let value = args.next().ok_or_else(|| anyhow!("--volume 缺少参数"))?;
                volume = Some(value.parse().with_context(|| format!("无效的音量: {}", value))?);
            }
            "--seek" => {
                let value = args.next().ok_or_else(|| anyhow!("--seek 缺少参数"))?;
                seek_ms = Some(value.parse().with_context(|| format!("无效的 seek 位置: {}", value))?);
            }
            "-h" | "--help" => bail!("{}", USAGE),
            _ if source.is_none() => source = Some(arg),
            _ => bail!("多余的参数: {}\n{}", arg, USAGE),
        }
    }
    Ok(CliArgs {
        source: source.ok_or_else(|| anyhow!("{}", USAGE))?,
        config,
        volume,
        seek_ms,
    })
}

/// 把播放器回调转发到主线程
struct ChannelListener {
    tx: Sender<PlayerState>,
}

impl PlayerListener for ChannelListener {
    fn on_player_state(&self, state: &PlayerState) {
        info!("📣 状态: {}", state);
        let _ = self.tx.send(state.clone());
    }

    fn on_progress(&self, progress_ms: i64, duration_ms: i64) {
        if progress_ms / 1000 != (progress_ms - 40).max(0) / 1000 || progress_ms == duration_ms {
            info!("⏱ 进度: {:.1}s / {:.1}s", progress_ms as f64 / 1000.0, duration_ms as f64 / 1000.0);
        }
    }
}

fn backend_factory(source: &str) -> Result<BackendFactory> {
    if SyntheticMedia::is_synthetic(source) {
        return Ok(Arc::new(|| Arc::new(SyntheticBackend::default()) as Arc<dyn MediaBackend>));
    }
    #[cfg(feature = "ffmpeg")]
    {
        ffmpeg_next::init().map_err(|e| anyhow!("FFmpeg 初始化失败: {}", e))?;
        info!("✅ FFmpeg 初始化成功");
        Ok(Arc::new(|| {
            Arc::new(myy_pipeline::player::FfmpegBackend::new()) as Arc<dyn MediaBackend>
        }))
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        bail!("未启用 ffmpeg 特性，只能播放 synthetic: 源（{}）", source)
    }
}

fn audio_output_factory(config: &PlayerConfig) -> AudioOutputFactory {
    let capacity = config.audio_max_queued_buffers;
    Arc::new(move || -> Arc<dyn AudioOutput> {
        #[cfg(feature = "cpal")]
        {
            match myy_pipeline::player::CpalAudioOutput::new(capacity) {
                Ok(output) => return Arc::new(output),
                Err(e) => warn!("⚠️ 无法打开音频设备，改用模拟输出: {}", e),
            }
        }
        match SimulatedAudioOutput::new(capacity) {
            Ok(output) => Arc::new(output),
            Err(e) => {
                warn!("⚠️ 模拟音频输出创建失败: {}", e);
                Arc::new(MutedOutput)
            }
        }
    })
}

/// 连模拟设备都起不来时的兜底输出：直接以"已播放"完成每一帧
struct MutedOutput;

impl AudioOutput for MutedOutput {
    fn open(&self, _: u32, _: u16, _: myy_pipeline::core::SampleFormat) -> myy_pipeline::Result<()> {
        Ok(())
    }

    fn enqueue(
        &self,
        frame: myy_pipeline::player::FrameLease<myy_pipeline::core::AudioFrame>,
    ) -> std::result::Result<(), myy_pipeline::player::FrameLease<myy_pipeline::core::AudioFrame>> {
        frame.finish(true);
        Ok(())
    }

    fn queued_count(&self) -> usize {
        0
    }

    fn play(&self) {}

    fn pause(&self) {}

    fn flush(&self) {}

    fn release(&self) {}
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = parse_args()?;
    info!("🎬 MYY Pipeline 启动: {}", args.source);

    let config = match &args.config {
        Some(path) => PlayerConfig::from_file(path).with_context(|| format!("加载配置失败: {}", path))?,
        None => PlayerConfig::default(),
    };

    let collaborators = Collaborators {
        backend_factory: backend_factory(&args.source)?,
        video_sink: Arc::new(NullVideoSink::default()),
        audio_output_factory: audio_output_factory(&config),
        subtitle_sink: None,
    };
    let player = Player::new(config, collaborators)?;
    let (tx, rx) = unbounded();
    player.set_listener(Arc::new(ChannelListener { tx }));
    if let Some(volume) = args.volume {
        player.set_volume(volume);
    }

    player.prepare(&args.source)?;
    if let Some(info) = player.media_info() {
        info!(
            "📋 媒体信息: {} 时长 {:.1}s 视频 {} 音频 {} 字幕 {}",
            info.format_name,
            info.duration as f64 / 1000.0,
            info.has_video(),
            info.has_audio(),
            info.has_subtitle
        );
    }
    match args.seek_ms {
        Some(ms) => {
            // seek 完成后进入 Paused，再开始播放
            player.seek_to(ms)?;
        }
        None => player.play()?,
    }

    loop {
        let state = match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(state) => state,
            Err(_) => {
                let status = player.buffer_status();
                info!(
                    "📊 缓冲: 视频包 {} 音频包 {} 视频帧 {} 音频帧 {} 丢帧 {}",
                    status.video_packets,
                    status.audio_packets,
                    status.video_frames,
                    status.audio_frames,
                    status.dropped_video_frames
                );
                continue;
            }
        };
        match state {
            PlayerState::Paused(_) if args.seek_ms.is_some() => player.play()?,
            PlayerState::PlayEnd(_) => {
                info!("🏁 播放完成");
                break;
            }
            PlayerState::Error(message) => {
                player.release()?;
                bail!("播放失败: {}", message);
            }
            _ => {}
        }
    }

    player.release()?;
    Ok(())
}
