use crate::core::SyncConfig;
use crate::player::buffer_queue::BufferItem;
use std::time::Duration;

/// 渲染线程状态（音视频渲染共用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererState {
    NotInit,
    /// 帧队列为空，等待解码
    WaitingReadableFrameBuffer,
    Playing,
    Paused,
    /// 已消费 EOF 帧；只有 seek 能离开
    Eof,
    Released,
}

/// 一帧的时间信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    pub pts: i64,
    pub duration: i64,
    pub serial: u64,
}

impl FrameTiming {
    pub fn of<T: BufferItem>(item: &T) -> Self {
        Self {
            pts: item.pts(),
            duration: item.duration(),
            serial: item.serial(),
        }
    }
}

/// 上一帧应该显示多久（毫秒）
///
/// 同一 serial 内用两帧 pts 之差；差值异常（非正或超过最大帧时长）或跨 serial 时退回上一帧自带的时长。
pub fn frame_duration(last: Option<&FrameTiming>, next: &FrameTiming, sync: &SyncConfig) -> f64 {
    let Some(last) = last else {
        return 0.0;
    };
    let fallback = last.duration.max(0) as f64;
    if last.serial != next.serial {
        return fallback;
    }
    let diff = (next.pts - last.pts) as f64;
    if diff <= 0.0 || diff > sync.max_frame_duration_ms {
        fallback
    } else {
        diff
    }
}

/// 按与主时钟的偏差修正帧延迟
///
/// `diff` = 本流时钟 − 主时钟（毫秒）；None 表示本流就是主时钟或某个时钟无效。
/// - 落后超过阈值：缩短延迟（最小为 0）
/// - 超前超过阈值：长帧直接加上偏差，短帧延迟加倍
pub fn compute_target_delay(delay: f64, diff: Option<f64>, sync: &SyncConfig) -> f64 {
    let Some(diff) = diff else {
        return delay;
    };
    if diff.is_nan() || diff.abs() >= sync.max_frame_duration_ms {
        return delay;
    }
    let threshold = delay.clamp(sync.min_threshold_ms, sync.max_threshold_ms);
    if diff <= -threshold {
        (delay + diff).max(0.0)
    } else if diff >= threshold && delay > sync.framedup_threshold_ms {
        delay + diff
    } else if diff >= threshold {
        2.0 * delay
    } else {
        delay
    }
}

/// 毫秒（可为小数，负数按 0）转 Duration
pub fn ms_to_duration(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1000.0)
    } else {
        Duration::ZERO
    }
}
