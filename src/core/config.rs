use crate::core::clock::SyncMaster;
use crate::core::error::{PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 音视频同步阈值（毫秒）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 同步阈值下限
    pub min_threshold_ms: f64,
    /// 同步阈值上限；帧定时器落后超过该值时重新对齐到当前时间
    pub max_threshold_ms: f64,
    /// 帧时长超过该值时不再通过"加倍延迟"来等待主时钟
    pub framedup_threshold_ms: f64,
    /// 偏差超过该值时认为时钟不连续，不做同步修正
    pub nosync_threshold_ms: f64,
    /// 两帧之间允许的最大时长，超过视为时间戳跳变
    pub max_frame_duration_ms: f64,
    /// 渲染轮询间隔
    pub refresh_interval_ms: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_threshold_ms: 40.0,
            max_threshold_ms: 100.0,
            framedup_threshold_ms: 100.0,
            nosync_threshold_ms: 10_000.0,
            max_frame_duration_ms: 10_000.0,
            refresh_interval_ms: 10.0,
        }
    }
}

impl SyncConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(self.refresh_interval_ms.max(1.0) / 1000.0)
    }
}

/// 播放器配置
///
/// 所有字段都有默认值，JSON 中只需要写要覆盖的部分。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// 首选主时钟（流缺失时自动回退）
    pub sync_master: SyncMaster,
    pub sync: SyncConfig,

    /// 数据包队列容量（None = 不限数量，由字节/时长阈值限流）
    pub packet_queue_capacity: Option<usize>,
    /// 视频帧队列容量
    pub video_frame_queue_capacity: usize,
    /// 音频帧队列容量
    pub audio_frame_queue_capacity: usize,

    /// 两个数据包队列合计字节上限
    pub max_packet_queue_bytes: usize,
    /// 单个队列"足够"的最少包数
    pub min_queue_packets: usize,
    /// 单个队列"足够"的最少累计时长（毫秒）
    pub min_queue_duration_ms: i64,

    /// 音频设备拒收时的重试次数与间隔
    pub audio_write_retries: u32,
    pub audio_write_retry_sleep_ms: u64,
    /// 音频设备中最多排队的缓冲数
    pub audio_max_queued_buffers: usize,

    /// prepare 完成后立即渲染首帧
    pub render_first_frame_on_prepare: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sync_master: SyncMaster::Audio,
            sync: SyncConfig::default(),
            packet_queue_capacity: None,
            video_frame_queue_capacity: 4,
            audio_frame_queue_capacity: 12,
            max_packet_queue_bytes: 15 * 1024 * 1024,
            min_queue_packets: 25,
            min_queue_duration_ms: 1000,
            audio_write_retries: 5,
            audio_write_retry_sleep_ms: 5,
            audio_max_queued_buffers: 3,
            render_first_frame_on_prepare: true,
        }
    }
}

impl PlayerConfig {
    /// 从 JSON 字符串加载配置
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PlayerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.video_frame_queue_capacity == 0 || self.audio_frame_queue_capacity == 0 {
            return Err(PlayerError::InvalidConfig("帧队列容量必须大于 0".into()));
        }
        if self.packet_queue_capacity == Some(0) {
            return Err(PlayerError::InvalidConfig("数据包队列容量必须大于 0".into()));
        }
        if self.audio_max_queued_buffers == 0 {
            return Err(PlayerError::InvalidConfig("音频设备排队数必须大于 0".into()));
        }
        if self.sync.min_threshold_ms > self.sync.max_threshold_ms {
            return Err(PlayerError::InvalidConfig(format!(
                "同步阈值下限 {} 大于上限 {}",
                self.sync.min_threshold_ms, self.sync.max_threshold_ms
            )));
        }
        Ok(())
    }

    pub fn audio_write_retry_sleep(&self) -> Duration {
        Duration::from_millis(self.audio_write_retry_sleep_ms)
    }
}
