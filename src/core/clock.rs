use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// 播放时钟 - 用于音视频同步
///
/// 记录 "pts 在某一时刻被设置" 这一事实，读取时按经过的时间和速率外推。
/// 可绑定一个数据包队列的 serial：队列 seek 后 serial 变化，时钟在被重新设置前视为无效。
pub struct Clock {
    name: &'static str,
    inner: Mutex<ClockInner>,
}

struct ClockInner {
    pts: f64,                   // 最近一次设置的 pts（毫秒）
    last_updated: Instant,      // 设置时刻
    speed: f64,                 // 播放速率（1.0 = 正常）
    serial: Option<u64>,        // 设置时的 serial（None = 从未设置）
    paused: bool,
    queue_serial: Option<Arc<AtomicU64>>,
}

impl ClockInner {
    fn value_at(&self, now: Instant) -> f64 {
        if self.paused {
            self.pts
        } else {
            let elapsed = now.saturating_duration_since(self.last_updated).as_secs_f64() * 1000.0;
            self.pts + elapsed * self.speed
        }
    }

    fn is_valid(&self) -> bool {
        match (self.serial, &self.queue_serial) {
            (None, _) => false,
            (Some(serial), Some(queue)) => serial == queue.load(Ordering::Acquire),
            (Some(_), None) => true,
        }
    }
}

impl Clock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(ClockInner {
                pts: 0.0,
                last_updated: Instant::now(),
                speed: 1.0,
                serial: None,
                paused: true,
                queue_serial: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 初始化时钟：清除已设置的值，并绑定（或解绑）队列 serial
    pub fn init_clock(&self, queue_serial: Option<Arc<AtomicU64>>) {
        let mut inner = self.inner.lock();
        inner.pts = 0.0;
        inner.last_updated = Instant::now();
        inner.serial = None;
        inner.queue_serial = queue_serial;
    }

    /// 获取当前时钟值（毫秒），无效时返回 None
    pub fn get(&self) -> Option<f64> {
        self.get_at(Instant::now())
    }

    pub fn get_at(&self, now: Instant) -> Option<f64> {
        let inner = self.inner.lock();
        if inner.is_valid() {
            Some(inner.value_at(now))
        } else {
            None
        }
    }

    /// 设置时钟
    pub fn set(&self, pts: f64, serial: u64) {
        self.set_at(pts, serial, Instant::now());
    }

    pub fn set_at(&self, pts: f64, serial: u64, now: Instant) {
        let mut inner = self.inner.lock();
        inner.pts = pts;
        inner.serial = Some(serial);
        inner.last_updated = now;
    }

    pub fn serial(&self) -> Option<u64> {
        self.inner.lock().serial
    }

    /// 暂停时冻结当前值，恢复时从冻结值继续走
    pub fn set_paused(&self, paused: bool) {
        let mut inner = self.inner.lock();
        if inner.paused == paused {
            return;
        }
        let now = Instant::now();
        inner.pts = inner.value_at(now);
        inner.last_updated = now;
        inner.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// 设置播放速率（先按旧速率结算当前值）
    pub fn set_speed(&self, speed: f64) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.pts = inner.value_at(now);
        inner.last_updated = now;
        inner.speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().speed
    }

    /// 向另一个时钟靠拢：自身无效或偏差超过阈值时直接对齐
    pub fn sync_to(&self, other: &Clock, nosync_threshold_ms: f64) {
        let now = Instant::now();
        let Some(target) = other.get_at(now) else {
            return;
        };
        let target_serial = other.serial().unwrap_or(0);

        let mut inner = self.inner.lock();
        let drift = if inner.is_valid() {
            Some((inner.value_at(now) - target).abs())
        } else {
            None
        };
        if drift.map_or(true, |d| d > nosync_threshold_ms) {
            inner.pts = target;
            inner.serial = Some(target_serial);
            inner.last_updated = now;
        }
    }
}

/// 主时钟来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMaster {
    #[default]
    Audio,
    Video,
    External,
}

impl SyncMaster {
    /// 按实际存在的流解析主时钟：优先所选，缺失时依次退到音频、视频、外部时钟
    pub fn resolve(preferred: SyncMaster, has_audio: bool, has_video: bool) -> SyncMaster {
        match preferred {
            SyncMaster::Audio if has_audio => SyncMaster::Audio,
            SyncMaster::Video if has_video => SyncMaster::Video,
            SyncMaster::External => SyncMaster::External,
            _ if has_audio => SyncMaster::Audio,
            _ if has_video => SyncMaster::Video,
            _ => SyncMaster::External,
        }
    }
}

/// 一条管线的三个时钟
pub struct SyncClocks {
    pub audio: Clock,
    pub video: Clock,
    pub external: Clock,
    master: SyncMaster,
}

impl SyncClocks {
    pub fn new(master: SyncMaster) -> Self {
        Self {
            audio: Clock::new("audio"),
            video: Clock::new("video"),
            external: Clock::new("external"),
            master,
        }
    }

    pub fn master(&self) -> SyncMaster {
        self.master
    }

    pub fn master_clock(&self) -> &Clock {
        match self.master {
            SyncMaster::Audio => &self.audio,
            SyncMaster::Video => &self.video,
            SyncMaster::External => &self.external,
        }
    }

    /// 主时钟当前值
    pub fn master_time(&self) -> Option<f64> {
        self.master_clock().get()
    }

    pub fn set_paused(&self, paused: bool) {
        self.audio.set_paused(paused);
        self.video.set_paused(paused);
        self.external.set_paused(paused);
    }
}
