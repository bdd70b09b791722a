use crate::core::{AudioFrame, PlayerError, Result, SampleFormat};
use crate::player::buffer_queue::FrameLease;
use crate::player::sink::AudioOutput;
use crossbeam::queue::ArrayQueue;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

const DEVICE_TICK: Duration = Duration::from_millis(2);
const DEVICE_IDLE: Duration = Duration::from_millis(20);

/// 按帧内容计算播放时长
fn playback_duration(frame: &AudioFrame) -> Duration {
    if frame.duration > 0 {
        return Duration::from_millis(frame.duration as u64);
    }
    if frame.sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frame.samples_per_channel() as f64 / frame.sample_rate as f64)
}

struct SimulatedShared {
    queue: ArrayQueue<FrameLease<AudioFrame>>,
    /// 正在"播放"的帧
    current: Mutex<Option<FrameLease<AudioFrame>>>,
    playing: AtomicBool,
    released: AtomicBool,
    volume: Mutex<f32>,
    played: AtomicU64,
    format: Mutex<Option<(u32, u16, SampleFormat)>>,
}

/// 模拟音频设备
///
/// 不接真实硬件：独立线程按每帧的时长实时"播放"，播放完成后以 `presented = true` 完成租约。
/// 用于无声卡环境和集成测试，节奏与真实设备一致。
pub struct SimulatedAudioOutput {
    shared: Arc<SimulatedShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Thread,
}

impl SimulatedAudioOutput {
    /// `capacity`：设备内部最多排队的帧数
    pub fn new(capacity: usize) -> Result<Self> {
        let shared = Arc::new(SimulatedShared {
            queue: ArrayQueue::new(capacity.max(1)),
            current: Mutex::new(None),
            playing: AtomicBool::new(false),
            released: AtomicBool::new(false),
            volume: Mutex::new(1.0),
            played: AtomicU64::new(0),
            format: Mutex::new(None),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("simulated-audio".into())
            .spawn(move || Self::device_loop(worker_shared))?;
        let worker_thread = worker.thread().clone();
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            worker_thread,
        })
    }

    fn device_loop(shared: Arc<SimulatedShared>) {
        debug!("🔈 模拟音频设备线程启动");
        while !shared.released.load(Ordering::Acquire) {
            if !shared.playing.load(Ordering::Acquire) {
                thread::park_timeout(DEVICE_IDLE);
                continue;
            }
            let Some(lease) = shared.queue.pop() else {
                thread::park_timeout(DEVICE_IDLE);
                continue;
            };

            let length = playback_duration(&lease);
            *shared.current.lock() = Some(lease);

            // 只在播放状态下计时；flush 会把 current 取走
            let mut played = Duration::ZERO;
            let mut last = Instant::now();
            loop {
                if shared.released.load(Ordering::Acquire) || shared.current.lock().is_none() {
                    break;
                }
                let now = Instant::now();
                let playing = shared.playing.load(Ordering::Acquire);
                if playing {
                    played += now.duration_since(last);
                }
                last = now;
                if played >= length {
                    break;
                }
                if playing {
                    thread::sleep((length - played).min(DEVICE_TICK));
                } else {
                    thread::park_timeout(DEVICE_TICK);
                }
            }

            let finished = shared.current.lock().take();
            if let Some(lease) = finished {
                shared.played.fetch_add(1, Ordering::Relaxed);
                lease.finish(true);
            }
        }
        debug!("🔈 模拟音频设备线程退出");
    }

    /// 已播放完成的帧数
    pub fn played_frames(&self) -> u64 {
        self.shared.played.load(Ordering::Relaxed)
    }

    pub fn volume(&self) -> f32 {
        *self.shared.volume.lock()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }
}

impl AudioOutput for SimulatedAudioOutput {
    fn open(&self, sample_rate: u32, channels: u16, format: SampleFormat) -> Result<()> {
        if sample_rate == 0 || channels == 0 {
            return Err(PlayerError::AudioError(format!(
                "无效的音频参数: {} Hz, {} 声道",
                sample_rate, channels
            )));
        }
        info!("🔈 模拟音频输出: {} Hz, {} 声道, {:?}", sample_rate, channels, format);
        *self.shared.format.lock() = Some((sample_rate, channels, format));
        Ok(())
    }

    fn enqueue(&self, frame: FrameLease<AudioFrame>) -> std::result::Result<(), FrameLease<AudioFrame>> {
        if self.shared.released.load(Ordering::Acquire) {
            return Err(frame);
        }
        self.shared.queue.push(frame)?;
        self.worker_thread.unpark();
        Ok(())
    }

    fn queued_count(&self) -> usize {
        self.shared.queue.len() + usize::from(self.shared.current.lock().is_some())
    }

    fn play(&self) {
        self.shared.playing.store(true, Ordering::Release);
        self.worker_thread.unpark();
    }

    fn pause(&self) {
        self.shared.playing.store(false, Ordering::Release);
    }

    fn flush(&self) {
        let current = self.shared.current.lock().take();
        let mut dropped = usize::from(current.is_some());
        drop(current);
        while let Some(lease) = self.shared.queue.pop() {
            dropped += 1;
            drop(lease);
        }
        if dropped > 0 {
            debug!("🧹 模拟音频设备丢弃 {} 帧", dropped);
        }
        self.worker_thread.unpark();
    }

    fn release(&self) {
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush();
        self.worker_thread.unpark();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("⚠️ 模拟音频设备线程异常退出");
            }
        }
        info!("🔇 模拟音频输出已释放（共播放 {} 帧）", self.played_frames());
    }

    fn set_volume(&self, volume: f32) {
        *self.shared.volume.lock() = volume.clamp(0.0, 1.0);
    }
}

impl Drop for SimulatedAudioOutput {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(feature = "cpal")]
pub use self::device::CpalAudioOutput;

#[cfg(feature = "cpal")]
mod device {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
    use std::collections::VecDeque;

    /// 正在被设备回调读取的帧
    struct PendingBuffer {
        lease: FrameLease<AudioFrame>,
        offset: usize, // 已读取的字节数
    }

    struct CpalShared {
        pending: Mutex<VecDeque<PendingBuffer>>,
        capacity: usize,
        playing: AtomicBool,
        volume: Mutex<f32>,
    }

    struct StreamHolder(Stream);

    // cpal::Stream 本身不是 Send；只在持有锁时创建、播放、暂停和销毁，不会并发访问
    unsafe impl Send for StreamHolder {}

    struct DeviceHolder(Device);

    // Device 在部分平台上不是 Send；只在 open() 里持锁访问
    unsafe impl Send for DeviceHolder {}

    /// 音频输出 - 使用 cpal 播放音频
    pub struct CpalAudioOutput {
        device: Mutex<DeviceHolder>,
        stream: Mutex<Option<StreamHolder>>,
        shared: Arc<CpalShared>,
    }

    impl CpalAudioOutput {
        pub fn new(capacity: usize) -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
            debug!("使用音频设备: {}", device.name().unwrap_or_default());
            Ok(Self {
                device: Mutex::new(DeviceHolder(device)),
                stream: Mutex::new(None),
                shared: Arc::new(CpalShared {
                    pending: Mutex::new(VecDeque::new()),
                    capacity: capacity.max(1),
                    playing: AtomicBool::new(false),
                    volume: Mutex::new(1.0),
                }),
            })
        }

        /// 检查配置是否兼容
        fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
            let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
                && config.sample_rate.0 <= supported.max_sample_rate().0;
            rate_in_range && config.channels == supported.channels()
        }

        /// 设备回调：从排队的帧中取样本
        fn fill(shared: &CpalShared, data: &mut [f32]) {
            let mut finished = Vec::new();
            {
                let volume = *shared.volume.lock();
                let playing = shared.playing.load(Ordering::Acquire);
                let mut pending = shared.pending.lock();
                for sample in data.iter_mut() {
                    *sample = 0.0;
                    if !playing {
                        continue;
                    }
                    let Some(front) = pending.front_mut() else {
                        continue;
                    };
                    let bytes = front.lease.format.bytes_per_sample();
                    let pcm = &front.lease.pcm;
                    if front.offset + bytes <= pcm.len() {
                        let raw = &pcm[front.offset..front.offset + bytes];
                        let value = match front.lease.format {
                            SampleFormat::F32 => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                            SampleFormat::I16 => i16::from_le_bytes([raw[0], raw[1]]) as f32 / 32768.0,
                        };
                        *sample = value * volume;
                        front.offset += bytes;
                    }
                    if front.offset + bytes > front.lease.pcm.len() {
                        if let Some(done) = pending.pop_front() {
                            finished.push(done.lease);
                        }
                    }
                }
            }
            // 在锁外完成租约
            for lease in finished {
                lease.finish(true);
            }
        }
    }

    impl AudioOutput for CpalAudioOutput {
        fn open(&self, sample_rate: u32, channels: u16, format: SampleFormat) -> Result<()> {
            info!("初始化音频输出: {} Hz, {} 声道, {:?}", sample_rate, channels, format);
            let config = StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let device = self.device.lock();
            let supported = device
                .0
                .supported_output_configs()
                .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?
                .any(|range| Self::is_config_compatible(&config, &range));
            if !supported {
                return Err(PlayerError::AudioError(format!(
                    "音频设备不支持 {} Hz, {} 声道",
                    sample_rate, channels
                )));
            }

            let shared = self.shared.clone();
            let stream = device
                .0
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| Self::fill(&shared, data),
                    move |err| warn!("⚠️ 音频流错误: {}", err),
                    None,
                )
                .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;
            stream
                .play()
                .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;
            *self.stream.lock() = Some(StreamHolder(stream));
            info!("音频输出已启动");
            Ok(())
        }

        fn enqueue(&self, frame: FrameLease<AudioFrame>) -> std::result::Result<(), FrameLease<AudioFrame>> {
            let mut pending = self.shared.pending.lock();
            if pending.len() >= self.shared.capacity || self.stream.lock().is_none() {
                return Err(frame);
            }
            pending.push_back(PendingBuffer { lease: frame, offset: 0 });
            Ok(())
        }

        fn queued_count(&self) -> usize {
            self.shared.pending.lock().len()
        }

        fn play(&self) {
            self.shared.playing.store(true, Ordering::Release);
        }

        fn pause(&self) {
            self.shared.playing.store(false, Ordering::Release);
        }

        fn flush(&self) {
            let drained: Vec<PendingBuffer> = self.shared.pending.lock().drain(..).collect();
            drop(drained);
        }

        fn release(&self) {
            self.shared.playing.store(false, Ordering::Release);
            if let Some(StreamHolder(stream)) = self.stream.lock().take() {
                let _ = stream.pause();
                drop(stream);
                info!("音频输出已停止");
            }
            self.flush();
        }

        fn set_volume(&self, volume: f32) {
            *self.shared.volume.lock() = volume.clamp(0.0, 1.0);
        }
    }

    impl Drop for CpalAudioOutput {
        fn drop(&mut self) {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::buffer_queue::{AudioFrameQueue, BufferQueue, QueueCapacity};
    use crossbeam_channel::unbounded;

    fn lease(
        queue: &Arc<AudioFrameQueue>,
        pts: i64,
        tx: crossbeam_channel::Sender<(i64, bool)>,
    ) -> FrameLease<AudioFrame> {
        let mut buf = queue.dequeue_writable_force().unwrap();
        buf.pts = pts;
        buf.duration = 10;
        buf.sample_rate = 48_000;
        buf.channels = 2;
        FrameLease::new(
            buf,
            queue.clone(),
            Box::new(move |frame, presented| {
                let _ = tx.send((frame.pts, presented));
            }),
        )
    }

    #[test]
    fn test_frames_consumed_in_order() {
        let queue = Arc::new(BufferQueue::new("test-audio", QueueCapacity::Fixed(4)));
        let output = SimulatedAudioOutput::new(4).unwrap();
        output.open(48_000, 2, SampleFormat::F32).unwrap();
        let (tx, rx) = unbounded();

        for pts in [0, 10, 20] {
            assert!(output.enqueue(lease(&queue, pts, tx.clone())).is_ok());
        }
        let start = Instant::now();
        output.play();
        for expected in [0, 10, 20] {
            let (pts, presented) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(pts, expected);
            assert!(presented);
        }
        // 三帧各 10ms，实时播放
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert_eq!(output.played_frames(), 3);
        output.release();
    }

    #[test]
    fn test_full_device_rejects() {
        let queue = Arc::new(BufferQueue::new("test-audio", QueueCapacity::Fixed(4)));
        let output = SimulatedAudioOutput::new(1).unwrap();
        let (tx, _rx) = unbounded();
        assert!(output.enqueue(lease(&queue, 0, tx.clone())).is_ok());
        let rejected = output.enqueue(lease(&queue, 10, tx));
        assert!(rejected.is_err());
        assert_eq!(output.queued_count(), 1);
    }

    #[test]
    fn test_flush_completes_unplayed() {
        let queue = Arc::new(BufferQueue::new("test-audio", QueueCapacity::Fixed(4)));
        let output = SimulatedAudioOutput::new(4).unwrap();
        let (tx, rx) = unbounded();
        output.enqueue(lease(&queue, 0, tx.clone())).ok();
        output.enqueue(lease(&queue, 10, tx)).ok();

        output.flush();
        let results: Vec<(i64, bool)> = rx.try_iter().collect();
        assert_eq!(results, vec![(0, false), (10, false)]);
        assert_eq!(output.queued_count(), 0);
        assert_eq!(queue.writable_len(), 2);
    }

    #[cfg(feature = "cpal")]
    #[test]
    fn test_cpal_output_is_thread_safe() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CpalAudioOutput>();
    }
}
